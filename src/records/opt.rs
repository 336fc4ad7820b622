//! Recorded speculative optimizations and their replay scoring
//!
//! Each record names the methods and classes it talks about by 1-based
//! index into the metadata array of its code blob. During merge the indices
//! are rewritten to merged metaspace indices with [`OptRecord::remap`].
//!
//! Scoring estimates, in heuristic instruction costs, how much cheaper the
//! recorded code is than a generic path under the *current* profile.
//! Negative is better. A contradicted record rejects the whole version.

use crate::config::OptCosts;
use crate::vm::{BasicType, ClassResolver, KlassHandle, MetaRef, MethodHandle, ProfileData, ProfileSource, RuntimeEnv};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One recorded optimization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptRecord {
    /// Virtual call at `bci` compiled as type checks against one or two receivers
    DeVirtual {
        method: u32,
        bci: i32,
        klass1: u32,
        klass2: Option<u32>,
        morphism: i32,
        /// A receiver miss traps instead of falling back to a virtual call
        miss_is_trap: bool,
    },
    /// `callee` inlined into `caller` at `bci`
    Inline { caller: u32, callee: u32, bci: i32 },
    /// Receiver type speculated from a monomorphic profile
    ProfiledReceiver { method: u32, bci: i32, klass: u32 },
    /// Branch compiled with one edge replaced by an uncommon trap
    ProfiledUnstableIf { method: u32, bci: i32, taken_trap: bool },
    /// Static final field folded into the code
    ConstantReplace {
        klass: u32,
        field_offset: u32,
        field_type: BasicType,
        field_val: i64,
    },
}

/// Resolved state a record is scored against
pub struct ScoreContext<'a> {
    /// Resolved metadata array of the version, indexed from 1
    pub metas: &'a [Option<MetaRef>],
    pub env: &'a dyn RuntimeEnv,
    pub costs: &'a OptCosts,
}

impl ScoreContext<'_> {
    fn meta(&self, index: u32) -> Result<MetaRef> {
        index
            .checked_sub(1)
            .and_then(|i| self.metas.get(i as usize))
            .copied()
            .flatten()
            .ok_or_else(|| Error::corruption(format!("opt record meta index {} has no entry", index)))
    }

    fn method(&self, index: u32) -> Result<MethodHandle> {
        self.meta(index)?
            .as_method()
            .ok_or_else(|| Error::corruption(format!("opt record meta index {} is not a method", index)))
    }

    fn klass(&self, index: u32) -> Result<KlassHandle> {
        self.meta(index)?
            .as_klass()
            .ok_or_else(|| Error::corruption(format!("opt record meta index {} is not a class", index)))
    }
}

impl OptRecord {
    /// Ordinal used for ordering records by kind
    pub fn type_ordinal(&self) -> u8 {
        match self {
            OptRecord::DeVirtual { .. } => 0,
            OptRecord::Inline { .. } => 1,
            OptRecord::ProfiledReceiver { .. } => 2,
            OptRecord::ProfiledUnstableIf { .. } => 3,
            OptRecord::ConstantReplace { .. } => 4,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OptRecord::DeVirtual { .. } => "DeVirtual",
            OptRecord::Inline { .. } => "Inline",
            OptRecord::ProfiledReceiver { .. } => "ProfiledReceiver",
            OptRecord::ProfiledUnstableIf { .. } => "ProfiledUnstableIf",
            OptRecord::ConstantReplace { .. } => "ConstantReplace",
        }
    }

    /// Method the decision was made in; constant folding has none
    pub fn owner_method(&self) -> Option<u32> {
        match self {
            OptRecord::DeVirtual { method, .. }
            | OptRecord::ProfiledReceiver { method, .. }
            | OptRecord::ProfiledUnstableIf { method, .. } => Some(*method),
            OptRecord::Inline { caller, .. } => Some(*caller),
            OptRecord::ConstantReplace { .. } => None,
        }
    }

    pub fn belongs_to_method(&self, method: u32) -> bool {
        self.owner_method() == Some(method)
    }

    fn bci(&self) -> i32 {
        match self {
            OptRecord::DeVirtual { bci, .. }
            | OptRecord::Inline { bci, .. }
            | OptRecord::ProfiledReceiver { bci, .. }
            | OptRecord::ProfiledUnstableIf { bci, .. } => *bci,
            OptRecord::ConstantReplace { .. } => -1,
        }
    }

    /// Whether two records describe the same decision.
    ///
    /// The two receivers of a bimorphic de-virtualization may appear in
    /// either order, and a folded constant is identified by value only.
    pub fn equivalent(&self, other: &OptRecord) -> bool {
        match (self, other) {
            (
                OptRecord::DeVirtual {
                    method: m1,
                    bci: b1,
                    klass1: a1,
                    klass2: a2,
                    morphism: p1,
                    miss_is_trap: t1,
                },
                OptRecord::DeVirtual {
                    method: m2,
                    bci: b2,
                    klass1: c1,
                    klass2: c2,
                    morphism: p2,
                    miss_is_trap: t2,
                },
            ) => {
                m1 == m2
                    && b1 == b2
                    && p1 == p2
                    && t1 == t2
                    && ((a1 == c1 && a2 == c2) || (Some(*a1) == *c2 && *a2 == Some(*c1)))
            }
            (
                OptRecord::ConstantReplace {
                    klass: k1,
                    field_offset: o1,
                    field_val: v1,
                    ..
                },
                OptRecord::ConstantReplace {
                    klass: k2,
                    field_offset: o2,
                    field_val: v2,
                    ..
                },
            ) => k1 == k2 && o1 == o2 && v1 == v2,
            _ => self == other,
        }
    }

    /// All metadata indices the record refers to
    pub fn meta_indices(&self) -> Vec<u32> {
        match self {
            OptRecord::DeVirtual {
                method, klass1, klass2, ..
            } => {
                let mut v = vec![*method, *klass1];
                v.extend(klass2.iter().copied());
                v
            }
            OptRecord::Inline { caller, callee, .. } => vec![*caller, *callee],
            OptRecord::ProfiledReceiver { method, klass, .. } => vec![*method, *klass],
            OptRecord::ProfiledUnstableIf { method, .. } => vec![*method],
            OptRecord::ConstantReplace { klass, .. } => vec![*klass],
        }
    }

    /// Rewrite 1-based blob indices through `dest` (blob slot → new index)
    pub fn remap(&self, dest: &[u32]) -> Result<OptRecord> {
        let map = |idx: u32| -> Result<u32> {
            idx.checked_sub(1)
                .and_then(|i| dest.get(i as usize))
                .copied()
                .ok_or_else(|| {
                    Error::corruption(format!(
                        "opt record index {} outside metadata array of {}",
                        idx,
                        dest.len()
                    ))
                })
        };
        Ok(match self {
            OptRecord::DeVirtual {
                method,
                bci,
                klass1,
                klass2,
                morphism,
                miss_is_trap,
            } => OptRecord::DeVirtual {
                method: map(*method)?,
                bci: *bci,
                klass1: map(*klass1)?,
                klass2: klass2.map(map).transpose()?,
                morphism: *morphism,
                miss_is_trap: *miss_is_trap,
            },
            OptRecord::Inline { caller, callee, bci } => OptRecord::Inline {
                caller: map(*caller)?,
                callee: map(*callee)?,
                bci: *bci,
            },
            OptRecord::ProfiledReceiver { method, bci, klass } => OptRecord::ProfiledReceiver {
                method: map(*method)?,
                bci: *bci,
                klass: map(*klass)?,
            },
            OptRecord::ProfiledUnstableIf {
                method,
                bci,
                taken_trap,
            } => OptRecord::ProfiledUnstableIf {
                method: map(*method)?,
                bci: *bci,
                taken_trap: *taken_trap,
            },
            OptRecord::ConstantReplace {
                klass,
                field_offset,
                field_type,
                field_val,
            } => OptRecord::ConstantReplace {
                klass: map(*klass)?,
                field_offset: *field_offset,
                field_type: *field_type,
                field_val: *field_val,
            },
        })
    }

    /// Cost delta of this record under the current profile.
    ///
    /// Returns [`Error::OptRejected`] when the profile contradicts the
    /// recorded decision so that installing the code would deoptimize.
    pub fn score(&self, ctx: &ScoreContext<'_>) -> Result<i64> {
        let costs = ctx.costs;
        match self {
            OptRecord::DeVirtual {
                method,
                bci,
                klass1,
                klass2,
                miss_is_trap,
                ..
            } => {
                let caller = ctx.method(*method)?;
                let profile = ctx.env.call_profile(caller, *bci);
                if profile.count <= 0 {
                    return Ok(0);
                }
                let k1 = ctx.klass(*klass1)?;
                let k2 = klass2.map(|k| ctx.klass(k)).transpose()?;
                let test_count = if k2.is_some() { 2 } else { 1 };

                let mut total = 0i64;
                let mut other = profile.count;
                for row in &profile.receivers {
                    if row.klass == k1 {
                        total += (costs.test_jmp - costs.virtual_call) * row.count;
                    } else if Some(row.klass) == k2 {
                        total += (costs.test_jmp * 2 - costs.virtual_call) * row.count;
                    } else if *miss_is_trap {
                        return Err(Error::OptRejected(format!(
                            "devirtualized call at bci {} traps on receiver {}",
                            bci,
                            ctx.env.class_name(row.klass)
                        )));
                    } else {
                        total += test_count * row.count * costs.test_jmp;
                    }
                    other -= row.count;
                }
                if other > 0 {
                    if *miss_is_trap {
                        return Err(Error::OptRejected(format!(
                            "devirtualized call at bci {} traps on {} unprofiled receivers",
                            bci, other
                        )));
                    }
                    total += test_count * other * costs.test_jmp;
                }
                Ok(total)
            }
            OptRecord::Inline { caller, callee, bci } => {
                let caller = ctx.method(*caller)?;
                if !ctx.env.has_method_data(caller) {
                    return Ok(0);
                }
                match ctx.env.profile_at(caller, *bci) {
                    Some(ProfileData::Counter { count }) => Ok(-count * costs.not_inline),
                    Some(ProfileData::VirtualCall { receivers, .. }) => {
                        let holder = ctx.env.method_holder(ctx.method(*callee)?);
                        Ok(receivers
                            .iter()
                            .find(|row| row.klass == holder)
                            .map(|row| -row.count * costs.not_inline)
                            .unwrap_or(0))
                    }
                    Some(ProfileData::Branch { .. }) | None => Ok(0),
                }
            }
            OptRecord::ProfiledReceiver { method, bci, klass } => {
                let m = ctx.method(*method)?;
                let expected = ctx.klass(*klass)?;
                let profile = ctx.env.call_profile(m, *bci);
                if profile.count < 0 {
                    return Err(Error::OptRejected(format!(
                        "negative receiver count at bci {}",
                        bci
                    )));
                }
                match profile.receivers.first() {
                    Some(row) if profile.morphism() == 1 => {
                        if row.klass == expected {
                            Ok((costs.test_jmp - costs.receiver_check) * row.count)
                        } else {
                            Err(Error::OptRejected(format!(
                                "profiled receiver at bci {} is now {}",
                                bci,
                                ctx.env.class_name(row.klass)
                            )))
                        }
                    }
                    _ => Ok(0),
                }
            }
            OptRecord::ProfiledUnstableIf {
                method,
                bci,
                taken_trap,
            } => {
                let m = ctx.method(*method)?;
                if !(ctx.env.has_method_data(m) && ctx.env.is_mature(m)) {
                    return Ok(0);
                }
                match ctx.env.profile_at(m, *bci) {
                    Some(ProfileData::Branch { taken, not_taken })
                        if taken >= 0 && not_taken >= 0 && taken + not_taken > 40 =>
                    {
                        let trapped_edge_unused =
                            (*taken_trap && taken == 0) || (!*taken_trap && not_taken == 0);
                        if trapped_edge_unused {
                            Ok(-costs.cutted_if * (taken + not_taken))
                        } else {
                            Err(Error::OptRejected(format!(
                                "trapped branch at bci {} taken {} not taken {}",
                                bci, taken, not_taken
                            )))
                        }
                    }
                    _ => Ok(0),
                }
            }
            OptRecord::ConstantReplace {
                klass,
                field_offset,
                field_type,
                field_val,
            } => {
                let k = ctx.klass(*klass)?;
                let current = ctx
                    .env
                    .constant_field(k, *field_offset)
                    .filter(|c| c.is_primitive())
                    .ok_or_else(|| {
                        Error::OptRejected(format!("field at offset {} is not a primitive constant", field_offset))
                    })?;
                if current.basic_type == *field_type && current.bits == *field_val {
                    Ok(-1)
                } else {
                    Err(Error::OptRejected(format!(
                        "constant at offset {} changed from {} to {}",
                        field_offset, field_val, current.bits
                    )))
                }
            }
        }
    }

    /// Deterministic order by kind, then by the names behind the indices
    pub fn compare_by_type_name(&self, other: &OptRecord, name: &dyn Fn(u32) -> String) -> Ordering {
        let by_type = self.type_ordinal().cmp(&other.type_ordinal());
        if by_type != Ordering::Equal {
            return by_type;
        }
        match (self, other) {
            (
                OptRecord::ConstantReplace {
                    klass: k1,
                    field_offset: o1,
                    field_type: t1,
                    field_val: v1,
                },
                OptRecord::ConstantReplace {
                    klass: k2,
                    field_offset: o2,
                    field_type: t2,
                    field_val: v2,
                },
            ) => o1
                .cmp(o2)
                .then(t1.cmp(t2))
                .then(v1.cmp(v2))
                .then_with(|| name(*k1).cmp(&name(*k2))),
            _ => {
                let owner = |r: &OptRecord| r.owner_method().map(name).unwrap_or_default();
                owner(self)
                    .cmp(&owner(other))
                    .then(self.bci().cmp(&other.bci()))
                    .then_with(|| match (self, other) {
                        (
                            OptRecord::DeVirtual {
                                morphism: p1,
                                miss_is_trap: t1,
                                ..
                            },
                            OptRecord::DeVirtual {
                                morphism: p2,
                                miss_is_trap: t2,
                                ..
                            },
                        ) => p1.cmp(p2).then(t2.cmp(t1)),
                        (OptRecord::Inline { callee: c1, .. }, OptRecord::Inline { callee: c2, .. }) => {
                            name(*c1).cmp(&name(*c2))
                        }
                        _ => Ordering::Equal,
                    })
            }
        }
    }

    /// One-line description with indices replaced by names
    pub fn describe(&self, name: &dyn Fn(u32) -> String) -> String {
        match self {
            OptRecord::DeVirtual {
                method,
                bci,
                klass1,
                klass2,
                morphism,
                miss_is_trap,
            } => {
                let mut s = format!(
                    "DeVirtual at method={} bci={} morphism={}  klass1: {}",
                    name(*method),
                    bci,
                    morphism,
                    name(*klass1)
                );
                if let Some(k2) = klass2 {
                    s.push_str(&format!("  klass2: {}", name(*k2)));
                }
                s.push_str(if *miss_is_trap {
                    "  default: trap"
                } else {
                    "  default: virtual call"
                });
                s
            }
            OptRecord::Inline { caller, callee, bci } => format!(
                "Inline at method={} bci={} callee: {}",
                name(*caller),
                bci,
                name(*callee)
            ),
            OptRecord::ProfiledReceiver { method, bci, klass } => format!(
                "ProfiledReceiver at method={} bci={} klass: {}",
                name(*method),
                bci,
                name(*klass)
            ),
            OptRecord::ProfiledUnstableIf {
                method,
                bci,
                taken_trap,
            } => format!(
                "ProfiledUnstableIf at method={} bci={} uncommon trap: {} edge",
                name(*method),
                bci,
                if *taken_trap { "taken" } else { "untaken" }
            ),
            OptRecord::ConstantReplace {
                klass, field_offset, ..
            } => format!(
                "ConstantReplace at klass: {} field offset: {}",
                name(*klass),
                field_offset
            ),
        }
    }
}

/// Append `record` unless an equivalent one is already present
pub fn insert_unique(records: &mut Vec<OptRecord>, record: OptRecord) -> bool {
    if records.iter().any(|r| r.equivalent(&record)) {
        return false;
    }
    records.push(record);
    true
}

/// Sum of the scores of `records`, or the first rejection
pub fn total_score(records: &[OptRecord], ctx: &ScoreContext<'_>) -> Result<i64> {
    let mut total = 0i64;
    for record in records {
        total = total.saturating_add(record.score(ctx)?);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{CallProfile, ClassSpec, FieldConstant, InMemoryVm, LoaderType, ReceiverRow};

    struct Fixture {
        vm: InMemoryVm,
        metas: Vec<Option<MetaRef>>,
        caller: MethodHandle,
        a: KlassHandle,
        b: KlassHandle,
        c: KlassHandle,
    }

    fn fixture() -> Fixture {
        let mut vm = InMemoryVm::new();
        let holder = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let a = vm.define_class(ClassSpec::new("app/A", LoaderType::App));
        let b = vm.define_class(ClassSpec::new("app/B", LoaderType::App));
        let c = vm.define_class(ClassSpec::new("app/C", LoaderType::App));
        let caller = vm.define_method(holder, "run", "()V");
        let metas = vec![
            Some(MetaRef::Method(caller)),
            Some(MetaRef::Klass(a)),
            Some(MetaRef::Klass(b)),
        ];
        Fixture {
            vm,
            metas,
            caller,
            a,
            b,
            c,
        }
    }

    fn score(f: &Fixture, record: &OptRecord) -> Result<i64> {
        let costs = OptCosts::default();
        let ctx = ScoreContext {
            metas: &f.metas,
            env: &f.vm,
            costs: &costs,
        };
        record.score(&ctx)
    }

    fn devirtual(klass2: Option<u32>, miss_is_trap: bool) -> OptRecord {
        OptRecord::DeVirtual {
            method: 1,
            bci: 7,
            klass1: 2,
            klass2,
            morphism: if klass2.is_some() { 2 } else { 1 },
            miss_is_trap,
        }
    }

    #[test]
    fn test_devirtual_without_profile_is_neutral() {
        let f = fixture();
        assert_eq!(score(&f, &devirtual(None, true)).unwrap(), 0);
    }

    #[test]
    fn test_devirtual_bimorphic_hits() {
        let mut f = fixture();
        f.vm.set_call_profile(
            f.caller,
            7,
            CallProfile {
                count: 30,
                receivers: vec![
                    ReceiverRow { klass: f.a, count: 20 },
                    ReceiverRow { klass: f.b, count: 10 },
                ],
            },
        );
        // (1 - 10) * 20 + (2 - 10) * 10
        assert_eq!(score(&f, &devirtual(Some(3), true)).unwrap(), -260);
    }

    #[test]
    fn test_devirtual_miss_with_trap_rejects() {
        let mut f = fixture();
        f.vm.set_call_profile(
            f.caller,
            7,
            CallProfile {
                count: 5,
                receivers: vec![ReceiverRow { klass: f.c, count: 5 }],
            },
        );
        let err = score(&f, &devirtual(None, true)).unwrap_err();
        assert!(matches!(err, Error::OptRejected(_)));
        // Without the trap the miss only costs the failed tests
        assert_eq!(score(&f, &devirtual(None, false)).unwrap(), 5);
    }

    #[test]
    fn test_devirtual_unprofiled_remainder() {
        let mut f = fixture();
        f.vm.set_call_profile(
            f.caller,
            7,
            CallProfile {
                count: 12,
                receivers: vec![ReceiverRow { klass: f.a, count: 10 }],
            },
        );
        assert_eq!(score(&f, &devirtual(None, false)).unwrap(), -90 + 2);
        assert!(score(&f, &devirtual(None, true)).is_err());
    }

    #[test]
    fn test_profiled_receiver() {
        let mut f = fixture();
        let record = OptRecord::ProfiledReceiver {
            method: 1,
            bci: 3,
            klass: 2,
        };
        assert_eq!(score(&f, &record).unwrap(), 0);

        f.vm.set_call_profile(
            f.caller,
            3,
            CallProfile {
                count: 4,
                receivers: vec![ReceiverRow { klass: f.a, count: 4 }],
            },
        );
        assert_eq!(score(&f, &record).unwrap(), -36);

        f.vm.set_call_profile(
            f.caller,
            3,
            CallProfile {
                count: 4,
                receivers: vec![ReceiverRow { klass: f.b, count: 4 }],
            },
        );
        assert!(score(&f, &record).is_err());

        f.vm.set_call_profile(
            f.caller,
            3,
            CallProfile {
                count: -1,
                receivers: vec![],
            },
        );
        assert!(score(&f, &record).is_err());
    }

    #[test]
    fn test_unstable_if() {
        let mut f = fixture();
        let record = OptRecord::ProfiledUnstableIf {
            method: 1,
            bci: 11,
            taken_trap: true,
        };
        f.vm.set_profile_data(f.caller, 11, ProfileData::Branch { taken: 0, not_taken: 100 });
        // Immature data is never judged
        assert_eq!(score(&f, &record).unwrap(), 0);

        f.vm.set_mature(f.caller, true);
        assert_eq!(score(&f, &record).unwrap(), -1000);

        f.vm.set_profile_data(f.caller, 11, ProfileData::Branch { taken: 3, not_taken: 100 });
        assert!(score(&f, &record).is_err());

        f.vm.set_profile_data(f.caller, 11, ProfileData::Branch { taken: 3, not_taken: 10 });
        assert_eq!(score(&f, &record).unwrap(), 0);
    }

    #[test]
    fn test_inline_scores() {
        let mut f = fixture();
        let callee = f.vm.define_method(f.a, "get", "()I");
        f.metas.push(Some(MetaRef::Method(callee)));
        let record = OptRecord::Inline {
            caller: 1,
            callee: 4,
            bci: 2,
        };
        assert_eq!(score(&f, &record).unwrap(), 0);

        f.vm.set_profile_data(f.caller, 2, ProfileData::Counter { count: 6 });
        assert_eq!(score(&f, &record).unwrap(), -60);

        f.vm.set_profile_data(
            f.caller,
            2,
            ProfileData::VirtualCall {
                count: 9,
                receivers: vec![
                    ReceiverRow { klass: f.b, count: 2 },
                    ReceiverRow { klass: f.a, count: 7 },
                ],
            },
        );
        assert_eq!(score(&f, &record).unwrap(), -70);
    }

    #[test]
    fn test_constant_replace() {
        let mut f = fixture();
        let record = OptRecord::ConstantReplace {
            klass: 2,
            field_offset: 16,
            field_type: BasicType::Int,
            field_val: 42,
        };
        assert!(score(&f, &record).is_err());
        f.vm.set_constant(f.a, 16, FieldConstant::int(42));
        assert_eq!(score(&f, &record).unwrap(), -1);
        f.vm.set_constant(f.a, 16, FieldConstant::int(43));
        assert!(score(&f, &record).is_err());
    }

    #[test]
    fn test_bad_index_is_corruption() {
        let f = fixture();
        let record = OptRecord::ProfiledUnstableIf {
            method: 9,
            bci: 0,
            taken_trap: false,
        };
        assert!(score(&f, &record).unwrap_err().is_corruption());
    }

    #[test]
    fn test_equivalence_and_dedup() {
        let a = devirtual(Some(3), false);
        let swapped = OptRecord::DeVirtual {
            method: 1,
            bci: 7,
            klass1: 3,
            klass2: Some(2),
            morphism: 2,
            miss_is_trap: false,
        };
        assert!(a.equivalent(&swapped));
        assert!(!a.equivalent(&devirtual(Some(3), true)));

        let mut records = Vec::new();
        assert!(insert_unique(&mut records, a));
        assert!(!insert_unique(&mut records, swapped));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_remap() {
        let record = devirtual(Some(3), true);
        let remapped = record.remap(&[40, 50, 60]).unwrap();
        assert_eq!(remapped.meta_indices(), vec![40, 50, 60]);
        assert!(record.remap(&[40, 50]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_sort_by_type_name() {
        let names = ["m/Z.run()V", "m/A.run()V", "k/K"];
        let name = |i: u32| names[(i - 1) as usize].to_string();
        let mut records = vec![
            OptRecord::ProfiledReceiver {
                method: 1,
                bci: 0,
                klass: 3,
            },
            OptRecord::ProfiledReceiver {
                method: 2,
                bci: 0,
                klass: 3,
            },
            OptRecord::Inline {
                caller: 1,
                callee: 2,
                bci: 5,
            },
        ];
        records.sort_by(|a, b| a.compare_by_type_name(b, &name));
        assert_eq!(records[0].type_name(), "Inline");
        assert_eq!(records[1].owner_method(), Some(2));
        assert_eq!(records[2].owner_method(), Some(1));
        assert!(records[0].describe(&name).contains("callee: m/A.run()V"));
    }
}
