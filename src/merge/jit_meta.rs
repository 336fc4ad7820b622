//! Distinct versions of one method across merge inputs
//!
//! Record indices here are normalized: every blob-local metadata slot is
//! replaced by a group-wide id of its (name, identity, loader) key, so
//! versions from different files compare directly.

use crate::config::MergePolicyKind;
use crate::records::{DependencyRecord, OptRecord};
use std::cmp::Ordering;
use tracing::trace;
use typed_arena::Arena;

/// Where a version's bytes live in the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub file: usize,
    pub container: usize,
    /// Blob offset in that container's code space
    pub offset: u32,
    pub size: u32,
}

/// Scratch storage for the records of one container group
#[derive(Default)]
pub struct GroupArena {
    opts: Arena<OptRecord>,
    deps: Arena<DependencyRecord>,
}

impl GroupArena {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One distinct version and how often it was seen
#[derive(Debug)]
pub struct JitVersion<'a> {
    /// Order of first appearance
    pub id: u32,
    pub count: u32,
    pub candidate: Candidate,
    opts: &'a [OptRecord],
    /// Sorted
    deps: &'a [DependencyRecord],
}

fn compare_deps(a: &DependencyRecord, b: &DependencyRecord) -> Ordering {
    a.compare_by(b, &|i| i)
}

/// Multiset equality under [`OptRecord::equivalent`]: each record of `a`
/// consumes its own equivalent in `b`
fn same_opts(a: &[OptRecord], b: &[OptRecord]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut taken = vec![false; b.len()];
    a.iter().all(|x| {
        match (0..b.len()).find(|&j| !taken[j] && x.equivalent(&b[j])) {
            Some(j) => {
                taken[j] = true;
                true
            }
            None => false,
        }
    })
}

impl<'a> JitVersion<'a> {
    pub fn opts(&self) -> &'a [OptRecord] {
        self.opts
    }

    pub fn deps(&self) -> &'a [DependencyRecord] {
        self.deps
    }

    fn equal(&self, opts: &[OptRecord], deps: &[DependencyRecord]) -> bool {
        same_opts(self.opts, opts)
            && self.deps.len() == deps.len()
            && self
                .deps
                .iter()
                .zip(deps)
                .all(|(a, b)| compare_deps(a, b) == Ordering::Equal)
    }

    fn opts_of(&self, method: u32) -> impl Iterator<Item = &'a OptRecord> {
        self.opts.iter().filter(move |r| r.belongs_to_method(method))
    }

    fn next_inlined(&self, visited: &[u32]) -> Option<u32> {
        self.opts.iter().find_map(|r| match r {
            OptRecord::Inline { callee, .. } if !visited.contains(callee) => Some(*callee),
            _ => None,
        })
    }

    /// Whether every decision this version made in `method` and in the
    /// methods it inlined was also made by `other`.
    ///
    /// A version with fewer speculations runs wherever a more speculative
    /// one does, so it can stand in for it.
    pub fn can_cover(&self, method: u32, other: &JitVersion<'_>) -> bool {
        let mut visited = Vec::new();
        let mut current = Some(method);
        while let Some(m) = current {
            visited.push(m);
            let mut mine = self.opts_of(m).peekable();
            if mine.peek().is_some() {
                let theirs: Vec<&OptRecord> = other.opts_of(m).collect();
                if theirs.is_empty() || !mine.all(|r| theirs.iter().any(|o| o.equivalent(r))) {
                    return false;
                }
            }
            current = self.next_inlined(&visited);
        }
        true
    }
}

/// All versions of one method seen in a container group
#[derive(Debug)]
pub struct JitMetaInfo<'a> {
    /// Group-wide id of the method key
    pub method: u32,
    /// Number of candidate blobs added
    pub count: u32,
    pub versions: Vec<JitVersion<'a>>,
}

impl<'a> JitMetaInfo<'a> {
    pub fn new(method: u32) -> Self {
        Self {
            method,
            count: 0,
            versions: Vec::new(),
        }
    }

    /// Count a candidate; equal record sets fold into one version
    pub fn add(
        &mut self,
        opts: Vec<OptRecord>,
        mut deps: Vec<DependencyRecord>,
        candidate: Candidate,
        arena: &'a GroupArena,
    ) {
        self.count += 1;
        deps.sort_by(compare_deps);
        if let Some(version) = self.versions.iter_mut().find(|v| v.equal(&opts, &deps)) {
            version.count += 1;
            return;
        }
        let id = self.versions.len() as u32;
        self.versions.push(JitVersion {
            id,
            count: 1,
            candidate,
            opts: arena.opts.alloc_extend(opts),
            deps: arena.deps.alloc_extend(deps),
        });
    }

    /// Most frequent first; ties keep first-seen order
    fn sort(&mut self) {
        self.versions.sort_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));
    }

    /// Fold covered versions into a version covering them while there
    /// are more than `max_versions`
    fn combine_versions(&mut self, max_versions: usize) {
        self.sort();
        let mut i = self.versions.len();
        while i > 1 {
            i -= 1;
            if self.versions.len() <= max_versions {
                break;
            }
            for j in 0..i {
                if self.versions[j].can_cover(self.method, &self.versions[i]) {
                    let covered = self.versions.remove(i);
                    trace!(target: crate::logging::MERGE, cover = self.versions[j].id, covered = covered.id, "combined versions");
                    self.versions[j].count += covered.count;
                    break;
                }
                if self.versions[i].can_cover(self.method, &self.versions[j]) {
                    let mut cover = self.versions.remove(i);
                    trace!(target: crate::logging::MERGE, cover = cover.id, covered = self.versions[j].id, "combined versions");
                    cover.count += self.versions[j].count;
                    self.versions[j] = cover;
                    break;
                }
            }
        }
    }

    /// Reduce to at most `max_versions` versions
    pub fn select_best_versions(&mut self, policy: MergePolicyKind, max_versions: usize) {
        if policy == MergePolicyKind::Coverage {
            self.combine_versions(max_versions);
        }
        self.sort();
        self.versions.truncate(max_versions);
    }

    /// Occurrences represented by the kept versions
    pub fn kept_count(&self) -> u32 {
        self.versions.iter().map(|v| v.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DepType;
    use pretty_assertions::assert_eq;

    fn candidate(file: usize) -> Candidate {
        Candidate {
            file,
            container: 0,
            offset: 0,
            size: 96,
        }
    }

    fn receiver(bci: i32, klass: u32) -> OptRecord {
        OptRecord::ProfiledReceiver { method: 0, bci, klass }
    }

    #[test]
    fn test_equal_sets_fold_regardless_of_order() {
        let arena = GroupArena::new();
        let mut info = JitMetaInfo::new(0);
        let deps = vec![
            DependencyRecord::new(DepType::LeafType, vec![5]),
            DependencyRecord::new(DepType::EvolMethod, vec![0]),
        ];
        info.add(vec![receiver(1, 5), receiver(2, 6)], deps.clone(), candidate(0), &arena);
        info.add(
            vec![receiver(2, 6), receiver(1, 5)],
            deps.into_iter().rev().collect(),
            candidate(1),
            &arena,
        );
        info.add(vec![receiver(1, 5)], Vec::new(), candidate(2), &arena);
        assert_eq!(info.count, 3);
        assert_eq!(info.versions.len(), 2);
        assert_eq!(info.versions[0].count, 2);
        assert_eq!(info.versions[0].candidate.file, 0);
        assert_eq!(info.versions[1].count, 1);
    }

    #[test]
    fn test_repeated_records_count_as_multisets() {
        let arena = GroupArena::new();
        let mut info = JitMetaInfo::new(0);
        let (a, b) = (receiver(1, 5), receiver(2, 6));
        info.add(vec![a.clone(), a.clone(), b.clone()], Vec::new(), candidate(0), &arena);
        info.add(vec![a.clone(), b.clone(), b.clone()], Vec::new(), candidate(1), &arena);
        info.add(vec![b.clone(), a.clone(), a], Vec::new(), candidate(2), &arena);
        let counts: Vec<u32> = info.versions.iter().map(|v| v.count).collect();
        assert_eq!(counts, vec![2, 1]);
        assert!(!same_opts(&[b], &[]));
        assert!(same_opts(&[], &[]));
    }

    #[test]
    fn test_simple_policy_keeps_most_frequent() {
        let arena = GroupArena::new();
        let mut info = JitMetaInfo::new(0);
        info.add(vec![receiver(1, 5)], Vec::new(), candidate(0), &arena);
        for file in 1..4 {
            info.add(vec![receiver(1, 6)], Vec::new(), candidate(file), &arena);
        }
        info.add(vec![receiver(1, 7)], Vec::new(), candidate(4), &arena);
        info.select_best_versions(MergePolicyKind::Simple, 2);
        let kept: Vec<(u32, u32)> = info.versions.iter().map(|v| (v.id, v.count)).collect();
        assert_eq!(kept, vec![(1, 3), (0, 1)]);
    }

    #[test]
    fn test_cover_through_inlined_callee() {
        let arena = GroupArena::new();
        let mut info = JitMetaInfo::new(0);
        let inline = OptRecord::Inline {
            caller: 0,
            callee: 9,
            bci: 4,
        };
        let callee_if = OptRecord::ProfiledUnstableIf {
            method: 9,
            bci: 1,
            taken_trap: true,
        };
        info.add(vec![inline.clone()], Vec::new(), candidate(0), &arena);
        info.add(vec![inline.clone(), callee_if], Vec::new(), candidate(1), &arena);
        info.add(vec![inline, receiver(3, 5)], Vec::new(), candidate(2), &arena);
        let (a, b, c) = (&info.versions[0], &info.versions[1], &info.versions[2]);
        assert!(a.can_cover(0, b));
        assert!(a.can_cover(0, c));
        assert!(!b.can_cover(0, a));
        assert!(!b.can_cover(0, c));
    }

    #[test]
    fn test_coverage_policy_sums_covered_counts() {
        let arena = GroupArena::new();
        let mut info = JitMetaInfo::new(0);
        for file in 0..3 {
            info.add(vec![receiver(1, 5), receiver(2, 6)], Vec::new(), candidate(file), &arena);
        }
        info.add(vec![receiver(1, 5)], Vec::new(), candidate(3), &arena);
        info.add(vec![receiver(1, 7)], Vec::new(), candidate(4), &arena);
        let before = info.count;

        info.select_best_versions(MergePolicyKind::Coverage, 2);
        assert_eq!(info.versions.len(), 2);
        // The single-record version covers the two-record one
        assert_eq!(info.versions[0].id, 1);
        assert_eq!(info.versions[0].count, 4);
        assert_eq!(info.kept_count(), before);
    }
}
