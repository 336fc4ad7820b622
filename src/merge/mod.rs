//! Offline merge of many cache files into one
//!
//! Containers with identical fingerprints across the inputs form a group.
//! Within a group every version of every method is normalized to group-wide
//! metadata ids, equal versions are counted together, and the merge policy
//! picks which ones survive. The surviving blobs are copied into a fresh
//! container with their metaspace indices rewritten to the merged metaspace.

mod input;
mod jit_meta;

pub use input::collect_input_files;
pub use jit_meta::{Candidate, GroupArena, JitMetaInfo, JitVersion};

use crate::code_blob::aux_info::{decode_stream, AuxRecord};
use crate::code_blob::passes::{check_meta_resolve, collect_meta_indexes, rewrite_meta_indexes};
use crate::code_blob::{CodeBlob, NEXT_VERSION_FIELD};
use crate::config::Config;
use crate::container::Container;
use crate::file::CacheFile;
use crate::fingerprint::Fingerprint;
use crate::format::align_up;
use crate::meta_space::{MetaKey, MetaSpace};
use crate::records::{DependencyRecord, OptRecord};
use crate::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const METHOD_INDEX_FIELD: usize = NEXT_VERSION_FIELD + 4;

/// One kept version in a [`MergeReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedVersion {
    pub id: u32,
    pub count: u32,
    pub opt_records: usize,
    pub dependencies: usize,
}

/// One merged method in a [`MergeReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedMethod {
    pub name: String,
    /// Candidate blobs seen across the inputs
    pub count: u32,
    pub versions: Vec<MergedVersion>,
}

/// What a merge did
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub input_files: usize,
    pub valid_files: usize,
    pub groups: usize,
    pub kept_groups: usize,
    /// Methods of each output container
    pub containers: Vec<Vec<MergedMethod>>,
    pub file_size: usize,
}

impl MergeReport {
    pub fn methods(&self) -> impl Iterator<Item = &MergedMethod> {
        self.containers.iter().flatten()
    }

    pub fn method(&self, name: &str) -> Option<&MergedMethod> {
        self.methods().find(|m| m.name == name)
    }
}

struct Input {
    path: PathBuf,
    file: CacheFile,
}

/// Containers sharing one fingerprint
struct Group {
    fingerprint: Fingerprint,
    /// (input, container) pairs
    members: Vec<(usize, usize)>,
}

impl Group {
    fn file_count(&self) -> usize {
        let mut files: Vec<usize> = self.members.iter().map(|(f, _)| *f).collect();
        files.dedup();
        files.len()
    }
}

/// Group-wide ids for metadata keys
#[derive(Default)]
struct KeyIds {
    ids: HashMap<MetaKey, u32>,
    keys: Vec<MetaKey>,
}

impl KeyIds {
    fn id(&mut self, key: &MetaKey) -> u32 {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        let id = self.keys.len() as u32;
        self.keys.push(key.clone());
        self.ids.insert(key.clone(), id);
        id
    }
}

/// Versions kept for one method
struct Kept {
    method: MetaKey,
    candidates: Vec<Candidate>,
    report: MergedMethod,
}

fn load_inputs(paths: &[PathBuf], expected_identity: Option<&str>, validate: bool) -> Vec<Input> {
    let mut identity = expected_identity.map(str::to_owned);
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        let expected = if validate { identity.as_deref() } else { None };
        match CacheFile::load(path, expected) {
            Ok(file) => {
                if identity.is_none() {
                    identity = Some(file.build_identity().to_owned());
                }
                debug!(target: crate::logging::MERGE, path = %path.display(), containers = file.containers().len(), "loaded input");
                inputs.push(Input {
                    path: path.clone(),
                    file,
                });
            }
            Err(e) => {
                warn!(target: crate::logging::MERGE, path = %path.display(), error = %e, "skipping input");
            }
        }
    }
    inputs
}

fn group_by_fingerprint(inputs: &[Input]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for (f, input) in inputs.iter().enumerate() {
        for (c, container) in input.file.containers().iter().enumerate() {
            match groups
                .iter_mut()
                .find(|g| g.fingerprint.identical(container.fingerprint()))
            {
                Some(group) => group.members.push((f, c)),
                None => groups.push(Group {
                    fingerprint: container.fingerprint().clone(),
                    members: vec![(f, c)],
                }),
            }
        }
    }
    groups
}

/// Keep the most shared groups until `coverage` percent of the valid
/// files is covered or `max_container_count` groups are kept
fn remove_groups(groups: &mut Vec<Group>, valid_files: usize, config: &Config) {
    groups.sort_by_key(|g| std::cmp::Reverse(g.file_count()));
    let mut covered = 0usize;
    let mut kept = 0usize;
    for group in groups.iter() {
        if kept >= config.max_container_count as usize || covered * 100 >= config.coverage as usize * valid_files {
            break;
        }
        covered += group.file_count();
        kept += 1;
    }
    for dropped in &groups[kept..] {
        info!(
            target: crate::logging::MERGE,
            files = dropped.file_count(),
            "dropping container group"
        );
    }
    groups.truncate(kept);
}

/// Opt records and dependencies of `blob` in group-wide ids
fn normalize(
    blob: &CodeBlob<'_>,
    meta: &MetaSpace,
    method: u32,
    ids: &mut KeyIds,
) -> Result<(Vec<OptRecord>, Vec<DependencyRecord>)> {
    for stream in [blob.aux_meta(), blob.aux_oop(), blob.aux_reloc()] {
        check_meta_resolve(stream, meta.len())?;
    }
    let dest = decode_stream(blob.aux_meta())?
        .iter()
        .map(|record| match record {
            AuxRecord::SelfMethod => Ok(method),
            AuxRecord::NonOop => Ok(u32::MAX),
            AuxRecord::KlassByName { meta_index, .. } | AuxRecord::MethodByName { meta_index, .. } => {
                Ok(ids.id(meta.key(*meta_index)?))
            }
            other => Err(Error::corruption(format!("{} in a metadata position", other))),
        })
        .collect::<Result<Vec<u32>>>()?;
    let opts = blob
        .opt_records()?
        .iter()
        .map(|r| r.remap(&dest))
        .collect::<Result<Vec<_>>>()?;
    let deps = blob
        .dependencies()?
        .iter()
        .map(|d| d.remap(&dest))
        .collect::<Result<Vec<_>>>()?;
    Ok((opts, deps))
}

/// Select the versions to keep for every method of `group`
fn select_group(group: &Group, inputs: &[Input], config: &Config) -> Vec<Kept> {
    let arena = GroupArena::new();
    let mut ids = KeyIds::default();
    let mut infos: Vec<JitMetaInfo<'_>> = Vec::new();
    let mut by_method: HashMap<u32, usize> = HashMap::default();

    for &(f, c) in &group.members {
        let file = &inputs[f].file;
        let container = &file.containers()[c];
        for (meta_index, head) in container.methods() {
            let key = match file.meta().key(meta_index) {
                Ok(key) => key,
                Err(e) => {
                    warn!(target: crate::logging::MERGE, path = %inputs[f].path.display(), error = %e, "skipping method");
                    continue;
                }
            };
            let method = ids.id(key);
            for blob in container.versions(head) {
                let blob = match blob {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!(target: crate::logging::MERGE, method = %key.name, error = %e, "broken version chain");
                        break;
                    }
                };
                let (opts, deps) = match normalize(&blob, file.meta(), method, &mut ids) {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(target: crate::logging::MERGE, method = %key.name, offset = blob.offset(), error = %e, "skipping version");
                        continue;
                    }
                };
                let slot = *by_method.entry(method).or_insert_with(|| {
                    infos.push(JitMetaInfo::new(method));
                    infos.len() - 1
                });
                let candidate = Candidate {
                    file: f,
                    container: c,
                    offset: blob.offset(),
                    size: blob.size() as u32,
                };
                infos[slot].add(opts, deps, candidate, &arena);
            }
        }
    }

    let kept = infos
        .into_iter()
        .map(|mut info| {
            let count = info.count;
            info.select_best_versions(config.merge_policy, config.max_versions.max(1) as usize);
            let method = ids.keys[info.method as usize].clone();
            let report = MergedMethod {
                name: method.name.to_string(),
                count,
                versions: info
                    .versions
                    .iter()
                    .map(|v| MergedVersion {
                        id: v.id,
                        count: v.count,
                        opt_records: v.opts().len(),
                        dependencies: v.deps().len(),
                    })
                    .collect(),
            };
            debug!(
                target: crate::logging::MERGE,
                method = %report.name,
                seen = count,
                distinct = report.versions.len(),
                "selected versions"
            );
            Kept {
                method,
                candidates: info.versions.iter().map(|v| v.candidate).collect(),
                report,
            }
        })
        .collect();
    kept
}

/// Copy of the blob at `candidate` re-indexed into `merged`
fn copy_blob(candidate: &Candidate, input: &CacheFile, merged_index: u32, merged: &mut MetaSpace) -> Result<Vec<u8>> {
    let container = input
        .containers()
        .get(candidate.container)
        .ok_or_else(|| Error::internal(format!("container {} vanished", candidate.container)))?;
    let blob = container.code_space().blob(candidate.offset)?;
    let header = *blob.header();
    let sections = [
        (header.aux_meta_begin, header.aux_meta_size),
        (header.aux_oop_begin, header.aux_oop_size),
        (header.aux_reloc_begin, header.aux_reloc_size),
    ];

    let mut remap: HashMap<u32, u32> = HashMap::default();
    for (begin, size) in sections {
        let stream = &blob.as_bytes()[begin as usize..(begin + size) as usize];
        for index in collect_meta_indexes(stream)? {
            if let std::collections::hash_map::Entry::Vacant(slot) = remap.entry(index) {
                slot.insert(merged.intern_key(input.meta().key(index)?.clone()));
            }
        }
    }
    let map = |index: u32| {
        remap
            .get(&index)
            .copied()
            .ok_or_else(|| Error::internal(format!("meta index {} was not collected", index)))
    };

    let mut bytes = blob.as_bytes().to_vec();
    bytes[NEXT_VERSION_FIELD..NEXT_VERSION_FIELD + 4].copy_from_slice(&(-1i32).to_le_bytes());
    bytes[METHOD_INDEX_FIELD..METHOD_INDEX_FIELD + 4].copy_from_slice(&merged_index.to_le_bytes());
    for (begin, size) in sections {
        let (begin, size) = (begin as usize, size as usize);
        let rewritten = rewrite_meta_indexes(&bytes[begin..begin + size], &map)?;
        if rewritten.len() > size {
            return Err(Error::corruption(format!(
                "rewritten aux stream of {} bytes does not fit {} bytes",
                rewritten.len(),
                size
            )));
        }
        bytes[begin..begin + rewritten.len()].copy_from_slice(&rewritten);
    }
    Ok(bytes)
}

fn build_container(
    fingerprint: &Fingerprint,
    kept: &[Kept],
    inputs: &[Input],
    merged: &mut MetaSpace,
) -> Result<Container> {
    let mut container = Container::new(fingerprint.clone(), kept.len());
    for method in kept {
        let merged_index = merged.intern_key(method.method.clone());
        let name = method.method.name.to_string();
        for candidate in &method.candidates {
            let bytes = copy_blob(candidate, &inputs[candidate.file].file, merged_index, merged)?;
            container.add_version(merged_index, &name, &bytes)?;
        }
    }
    Ok(container)
}

/// Merge the inputs named by `config` into `config.file`.
///
/// `expected_identity` is the build identity inputs must carry; without
/// one the first readable input decides.
pub fn merge(config: &Config, expected_identity: Option<&str>) -> Result<MergeReport> {
    let output: &Path = config
        .file
        .as_deref()
        .ok_or_else(|| Error::config("merge needs file= for the output"))?;
    let paths = collect_input_files(config)?;
    let inputs = load_inputs(&paths, expected_identity, config.validate_check);
    let identity = match inputs.first() {
        Some(first) => first.file.build_identity().to_owned(),
        None => return Err(Error::config("no readable input cache files")),
    };
    info!(
        target: crate::logging::MERGE,
        inputs = paths.len(),
        valid = inputs.len(),
        "merging cache files"
    );

    let mut groups = group_by_fingerprint(&inputs);
    let group_count = groups.len();
    remove_groups(&mut groups, inputs.len(), config);

    let selected: Vec<Vec<Kept>> = groups.iter().map(|g| select_group(g, &inputs, config)).collect();
    let blob_bytes: usize = selected
        .iter()
        .flatten()
        .flat_map(|k| &k.candidates)
        .map(|c| align_up(c.size as usize))
        .sum();
    if blob_bytes > config.max_file_size {
        return Err(Error::FileTooLarge {
            size: blob_bytes,
            limit: config.max_file_size,
        });
    }

    let mut merged = MetaSpace::new();
    let mut containers = Vec::with_capacity(groups.len());
    for (group, kept) in groups.iter().zip(&selected) {
        containers.push(build_container(&group.fingerprint, kept, &inputs, &mut merged)?);
    }
    let file = CacheFile::from_parts(identity, merged, containers);
    let file_size = file.write(output, config.max_file_size)?;

    Ok(MergeReport {
        output: output.to_path_buf(),
        input_files: paths.len(),
        valid_files: inputs.len(),
        groups: group_count,
        kept_groups: groups.len(),
        containers: selected
            .into_iter()
            .map(|kept| kept.into_iter().map(|k| k.report).collect())
            .collect(),
        file_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_blob::emit;
    use crate::container::ReviveStatus;
    use crate::vm::{
        ClassResolver, ClassSpec, CodeAssembler, InMemoryVm, KlassHandle, LoaderType, MetaRef, MethodHandle,
        RuntimeEnv, VmSettings,
    };
    use pretty_assertions::assert_eq;

    struct World {
        vm: InMemoryVm,
        method: MethodHandle,
        receivers: Vec<KlassHandle>,
    }

    fn world() -> World {
        let mut vm = InMemoryVm::new();
        let main = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let method = vm.define_method(main, "run", "()V");
        let receivers = (0..3)
            .map(|i| vm.define_class(ClassSpec::new(format!("app/Impl{}", i), LoaderType::App)))
            .collect();
        World { vm, method, receivers }
    }

    /// Write a file holding one version that speculated on `receiver`
    fn write_input(w: &World, settings: &VmSettings, receiver: usize, path: &Path) {
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(16);
        let method = asm.meta_index(MetaRef::Method(w.method));
        let klass = asm.meta_index(MetaRef::Klass(w.receivers[receiver]));
        asm.opt(OptRecord::ProfiledReceiver { method, bci: 3, klass });
        let nm = asm.finish();

        let mut file = CacheFile::new(w.vm.build_identity());
        let blob = emit(&nm, &w.vm, file.meta_mut()).unwrap();
        let name = file.meta().name(blob.method_index);
        file.container_for(&Fingerprint::capture(settings))
            .add_version(blob.method_index, &name, &blob.bytes)
            .unwrap();
        file.write(path, 1 << 20).unwrap();
    }

    fn method_name(w: &World) -> String {
        w.vm.method_display_name(w.method)
    }

    #[test]
    fn test_identical_versions_are_counted() {
        let w = world();
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("in");
        std::fs::create_dir(&inputs).unwrap();
        for i in 0..3 {
            write_input(&w, &w.vm.settings(), 0, &inputs.join(format!("{}.csa", i)));
        }
        let output = dir.path().join("merged.csa");
        let config = Config::for_merge(&output).with_input_files(&inputs);

        let report = merge(&config, None).unwrap();
        assert_eq!(report.valid_files, 3);
        assert_eq!(report.kept_groups, 1);
        let method = report.method(&method_name(&w)).unwrap();
        assert_eq!(method.count, 3);
        assert_eq!(method.versions.len(), 1);
        assert_eq!(method.versions[0].count, 3);

        let merged = CacheFile::load(&output, Some(&w.vm.build_identity())).unwrap();
        let container = merged.select_container(&w.vm.settings()).unwrap();
        let key = MetaKey::of(&w.vm, MetaRef::Method(w.method)).unwrap();
        let (status, head) = container.find(&key, merged.meta()).unwrap();
        assert_eq!(status, ReviveStatus::Success);
        let versions: Vec<_> = container.versions(head.unwrap()).collect::<Result<_>>().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(merged.meta().key(versions[0].method_index()).unwrap(), &key);
        assert_eq!(versions[0].next_version(), None);
    }

    #[test]
    fn test_distinct_versions_most_frequent_first() {
        let w = world();
        let dir = tempfile::tempdir().unwrap();
        for (i, receiver) in [1, 0, 1, 2].iter().enumerate() {
            write_input(&w, &w.vm.settings(), *receiver, &dir.path().join(format!("{}.csa", i)));
        }
        let output = dir.path().join("out").with_extension("bin");
        let config = Config::for_merge(&output)
            .with_input_files(dir.path())
            .with_max_versions(2);

        let report = merge(&config, None).unwrap();
        let method = report.method(&method_name(&w)).unwrap();
        assert_eq!(method.count, 4);
        let kept: Vec<(u32, u32)> = method.versions.iter().map(|v| (v.id, v.count)).collect();
        assert_eq!(kept, vec![(0, 2), (1, 1)]);

        let merged = CacheFile::load(&output, None).unwrap();
        let container = &merged.containers()[0];
        let (_, head) = container.methods().next().unwrap();
        assert_eq!(container.code_space().version_count(head).unwrap(), 2);
    }

    #[test]
    fn test_coverage_drops_rare_fingerprints() {
        let w = world();
        let dir = tempfile::tempdir().unwrap();
        let mut rare = w.vm.settings();
        rare.object_alignment = 16;
        write_input(&w, &w.vm.settings(), 0, &dir.path().join("a.csa"));
        write_input(&w, &w.vm.settings(), 0, &dir.path().join("b.csa"));
        write_input(&w, &rare, 0, &dir.path().join("c.csa"));
        let output = dir.path().join("merged.out");

        let config = Config::for_merge(&output).with_input_files(dir.path()).with_coverage(50);
        let report = merge(&config, None).unwrap();
        assert_eq!(report.groups, 2);
        assert_eq!(report.kept_groups, 1);

        let config = Config::for_merge(&output).with_input_files(dir.path());
        let report = merge(&config, None).unwrap();
        assert_eq!(report.kept_groups, 2);
        let merged = CacheFile::load(&output, None).unwrap();
        assert_eq!(merged.containers().len(), 2);
        assert_eq!(merged.containers()[0].fingerprint(), &Fingerprint::capture(&w.vm.settings()));
    }

    #[test]
    fn test_foreign_identity_is_skipped() {
        let mut w = world();
        let dir = tempfile::tempdir().unwrap();
        write_input(&w, &w.vm.settings(), 0, &dir.path().join("a.csa"));
        w.vm.set_build_identity("other build");
        write_input(&w, &w.vm.settings(), 1, &dir.path().join("b.csa"));
        let output = dir.path().join("merged.out");

        let report = merge(&Config::for_merge(&output).with_input_files(dir.path()), None).unwrap();
        assert_eq!(report.input_files, 2);
        assert_eq!(report.valid_files, 1);

        let config = Config::for_merge(&output)
            .with_input_files(dir.path())
            .with_validate_check(false);
        let report = merge(&config, None).unwrap();
        assert_eq!(report.valid_files, 2);
    }

    #[test]
    fn test_size_limit() {
        let w = world();
        let dir = tempfile::tempdir().unwrap();
        write_input(&w, &w.vm.settings(), 0, &dir.path().join("a.csa"));
        let output = dir.path().join("merged.out");
        let config = Config::for_merge(&output)
            .with_input_files(dir.path())
            .with_max_file_size(64);
        assert!(matches!(merge(&config, None), Err(Error::FileTooLarge { limit: 64, .. })));
        assert!(!output.exists());
    }
}
