//! Process-facing entry point: save, load, find and revive
//!
//! A [`CodeRevive`] borrows the immutable [`Config`] and the runtime it
//! serves. Compiler threads share it; the only mutable state is the set of
//! methods bypassing the cache, the per-method versions ruled out for good,
//! and the redefinition epoch.

use crate::code_blob::{emit, revive, ReviveContext};
use crate::config::Config;
use crate::container::{Container, ReviveStatus};
use crate::file::CacheFile;
use crate::fingerprint::Fingerprint;
use crate::merge::{self, MergeReport};
use crate::meta_space::MetaKey;
use crate::redefine::RedefineEpoch;
use crate::select::{check_version, select_version, ReviveResult};
use crate::stats::{SizeKind, Statistics, TimerKind};
use crate::vm::{ClassResolver, CompiledMethod, KlassHandle, LoaderType, MetaRef, MethodHandle, RuntimeEnv, OPTIMIZING_LEVEL};
use crate::{Error, Result};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, trace, warn};

/// What a save wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    /// Methods with at least one version
    pub methods: usize,
    pub versions: usize,
    /// Methods passed in that were not eligible or failed to encode
    pub skipped: usize,
    /// Bytes written; 0 when this process was not sampled
    pub bytes: usize,
}

pub struct CodeRevive<'a> {
    config: &'a Config,
    env: &'a dyn RuntimeEnv,
    /// Outcome of the `percent` dice for this process
    sampled: bool,
    file: Option<CacheFile>,
    /// Index of the container whose fingerprint matches this process
    container: Option<usize>,
    epoch: RedefineEpoch,
    stats: Statistics,
    disabled: Mutex<HashSet<MethodHandle>>,
    unusable: Mutex<HashMap<MethodHandle, Vec<u32>>>,
    install: Mutex<()>,
}

impl<'a> CodeRevive<'a> {
    pub fn new(config: &'a Config, env: &'a dyn RuntimeEnv) -> Self {
        let sampled = config.sample_enabled();
        if !sampled {
            info!(target: crate::logging::ARCHIVE, percent = config.percent, "process not sampled, cache inactive");
        }
        Self {
            config,
            env,
            sampled,
            file: None,
            container: None,
            epoch: RedefineEpoch::new(),
            stats: Statistics::new(config.perf),
            disabled: Mutex::new(HashSet::default()),
            unusable: Mutex::new(HashMap::default()),
            install: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn epoch(&self) -> &RedefineEpoch {
        &self.epoch
    }

    pub fn file(&self) -> Option<&CacheFile> {
        self.file.as_ref()
    }

    /// A file is loaded and one of its containers fits this process
    pub fn is_usable(&self) -> bool {
        self.active().is_some()
    }

    fn output_path(&self) -> Result<&'a Path> {
        self.config
            .file
            .as_deref()
            .ok_or_else(|| Error::config("no file specified"))
    }

    fn active(&self) -> Option<(&CacheFile, &Container)> {
        let file = self.file.as_ref()?;
        let container = file.containers().get(self.container?)?;
        Some((file, container))
    }

    /// Why `nm` cannot be saved, if it cannot
    fn save_ineligibility(&self, nm: &CompiledMethod) -> Option<&'static str> {
        let holder = self.env.method_holder(nm.method);
        if nm.comp_level != OPTIMIZING_LEVEL {
            Some("not compiled by the optimizing tier")
        } else if nm.is_osr {
            Some("on-stack replacement code")
        } else if nm.has_call_site_target {
            Some("depends on a call site target")
        } else if self.env.class_loader(holder) == LoaderType::Custom {
            Some("holder defined by a custom loader")
        } else if self.env.is_anonymous(holder) {
            Some("anonymous holder")
        } else {
            None
        }
    }

    /// Encode the eligible methods of `methods` and write the cache file.
    ///
    /// Several entries for the same method become its versions, in order,
    /// up to `max_versions`. On a write failure the partial file is removed.
    pub fn save(&self, methods: &[CompiledMethod]) -> Result<SaveReport> {
        if !self.config.save {
            return Err(Error::config("save is not enabled"));
        }
        let path = self.output_path()?;
        let mut report = SaveReport::default();
        if !self.sampled {
            return Ok(report);
        }
        let timer = self.stats.start();
        let fingerprint = Fingerprint::capture(&self.env.settings());
        let mut file = CacheFile::new(self.env.build_identity());
        let mut versions: HashMap<MetaKey, u32> = HashMap::default();

        for nm in methods {
            let name = self.env.method_display_name(nm.method);
            if let Some(reason) = self.save_ineligibility(nm) {
                trace!(target: crate::logging::SAVE, method = %name, reason, "not saved");
                report.skipped += 1;
                continue;
            }
            // The cap is checked before emitting so dropped versions intern nothing
            let emitted = MetaKey::of(self.env, MetaRef::Method(nm.method)).and_then(|key| {
                if versions.get(&key).is_some_and(|&n| n >= self.config.max_versions) {
                    return Ok(None);
                }
                emit(nm, self.env, file.meta_mut()).map(|blob| Some((key, blob)))
            });
            let (key, blob) = match emitted {
                Ok(Some(emitted)) => emitted,
                Ok(None) => {
                    debug!(target: crate::logging::SAVE, method = %name, "version limit reached");
                    report.skipped += 1;
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    debug!(target: crate::logging::SAVE, method = %name, error = %e, "not saved");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            *versions.entry(key).or_insert(0) += 1;
            let key_name = file.meta().name(blob.method_index);
            file.container_for(&fingerprint)
                .add_version(blob.method_index, &key_name, &blob.bytes)?;
            self.stats.add_blob_sizes(&blob.sizes);
            report.versions += 1;
            trace!(target: crate::logging::SAVE, method = %name, size = blob.bytes.len(), "saved version");
        }

        report.methods = versions.len();
        for container in file.containers() {
            self.stats.add_size(SizeKind::LookupTable, container.table().encoded_size());
        }
        self.stats
            .add_size(SizeKind::FileHeader, file.encoded_size().saturating_sub(file.containers().iter().map(Container::encoded_size).sum()));
        report.bytes = file.write(path, self.config.max_file_size)?;
        timer.stop(TimerKind::Save);
        info!(
            target: crate::logging::SAVE,
            methods = report.methods,
            versions = report.versions,
            skipped = report.skipped,
            bytes = report.bytes,
            "saved code cache"
        );
        Ok(report)
    }

    /// Map the configured file and pick the container for this process.
    ///
    /// A format error disables the cache for the process. A file without a
    /// matching container loads, but nothing in it can be revived.
    pub fn load(&mut self) -> Result<()> {
        let path = self.output_path()?;
        let expected = self.config.validate_check.then(|| self.env.build_identity());
        let file = match CacheFile::load(path, expected.as_deref()) {
            Ok(file) => file,
            Err(e) => {
                warn!(target: crate::logging::RESTORE, path = %path.display(), error = %e, "cannot load cache file, cache disabled");
                return Err(e);
            }
        };

        let settings = self.env.settings();
        self.container = None;
        for (i, container) in file.containers().iter().enumerate() {
            match container.fingerprint().matches(&settings) {
                Ok(()) => {
                    self.container = Some(i);
                    break;
                }
                Err(e) => debug!(target: crate::logging::RESTORE, container = i, error = %e, "container does not fit"),
            }
        }
        match self.container {
            Some(i) => info!(
                target: crate::logging::RESTORE,
                path = %path.display(),
                container = i,
                methods = file.containers()[i].method_count(),
                "loaded code cache"
            ),
            None => warn!(target: crate::logging::RESTORE, path = %path.display(), "no container matches this process"),
        }
        if self.config.print_opt {
            info!(target: crate::logging::OPT, "\n{}", file.print_opt()?);
        }
        self.file = Some(file);
        Ok(())
    }

    pub fn is_method_disabled(&self, method: MethodHandle) -> bool {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&method)
    }

    /// Make `method` bypass the cache from now on; in-flight revives of it
    /// give up before installing
    pub fn disable_method(&self, method: MethodHandle) {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method);
    }

    fn unusable_versions(&self, method: MethodHandle) -> Vec<u32> {
        self.unusable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned()
            .unwrap_or_default()
    }

    fn mark_unusable(&self, method: MethodHandle, versions: &[u32]) {
        if versions.is_empty() {
            return;
        }
        let mut unusable = self.unusable.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = unusable.entry(method).or_default();
        for v in versions {
            if !entry.contains(v) {
                entry.push(*v);
            }
        }
    }

    /// Whether a compile of `method` at `comp_level` should consult the cache
    pub fn is_revive_candidate(&self, method: MethodHandle, comp_level: u32) -> bool {
        self.config.restore
            && self.sampled
            && self.file.is_some()
            && comp_level == OPTIMIZING_LEVEL
            && self.env.class_loader(self.env.method_holder(method)) != LoaderType::Custom
            && !self.is_method_disabled(method)
    }

    /// Look `method` up; on success also returns the offset of its first
    /// version
    pub fn find(&self, method: MethodHandle) -> Result<(ReviveStatus, Option<u32>)> {
        let Some((file, container)) = self.active() else {
            return Ok((ReviveStatus::NotInCache, None));
        };
        let key = match MetaKey::of(self.env, MetaRef::Method(method)) {
            Ok(key) => key,
            Err(e) if e.is_recoverable() => return Ok((ReviveStatus::NotInCache, None)),
            Err(e) => return Err(e),
        };
        container.find(&key, file.meta())
    }

    /// Number of cached versions of `method`
    pub fn version_count(&self, method: MethodHandle) -> Result<usize> {
        match (self.find(method)?, self.active()) {
            ((_, Some(head)), Some((_, container))) => container.code_space().version_count(head),
            _ => Ok(0),
        }
    }

    /// Revive the best version of `method`, or `None` if the compile has to
    /// run normally.
    ///
    /// Stale or contradicted versions are absorbed here. An error is only
    /// returned when `fatal_on_fail` is set.
    pub fn revive(&self, method: MethodHandle, comp_level: u32) -> Result<Option<CompiledMethod>> {
        if !self.is_revive_candidate(method, comp_level) {
            return Ok(None);
        }
        let timer = self.stats.start();
        let outcome = self.revive_method(method);
        let status = match &outcome {
            Ok((status, _)) => *status,
            Err(_) => ReviveStatus::Fail,
        };
        self.stats.record_revive(status);
        timer.stop(if status == ReviveStatus::Success {
            TimerKind::RestoreSuccess
        } else {
            TimerKind::RestoreFail
        });

        let name = self.env.method_display_name(method);
        match outcome {
            Ok((ReviveStatus::Fail, _)) if self.config.fatal_on_fail => {
                Err(Error::internal(format!("revive of {} failed", name)))
            }
            Ok((status, nm)) => {
                debug!(target: crate::logging::RESTORE, method = %name, %status, "revive");
                Ok(nm)
            }
            Err(e) => {
                if e.is_corruption() {
                    error!(target: crate::logging::RESTORE, method = %name, error = %e, "corrupt cache entry");
                } else {
                    warn!(target: crate::logging::RESTORE, method = %name, error = %e, "revive failed");
                }
                if self.config.fatal_on_fail {
                    Err(e)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn revive_method(&self, method: MethodHandle) -> Result<(ReviveStatus, Option<CompiledMethod>)> {
        let (status, head) = self.find(method)?;
        let (Some(head), Some((file, container))) = (head, self.active()) else {
            return Ok((status, None));
        };
        let ctx = ReviveContext {
            env: self.env,
            meta: file.meta(),
            epoch: &self.epoch,
            method,
        };
        let unusable = self.unusable_versions(method);
        let selection = select_version(container.code_space(), head, &ctx, self.config, &|v| !unusable.contains(&v))?;
        self.mark_unusable(method, &selection.unusable);
        if selection.disable_method {
            self.disable_method(method);
        }
        let Some(state) = selection.selected else {
            return Ok((ReviveStatus::Fail, None));
        };
        let blob = container.code_space().blob(state.offset)?;

        let _install = self.install.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_method_disabled(method) {
            debug!(target: crate::logging::RESTORE, version = state.version, "method disabled during revive");
            return Ok((ReviveStatus::Fail, None));
        }
        if self.config.verify_redefined_identity {
            let current = MetaKey::of(self.env, MetaRef::Method(method))?;
            if file.meta().key(blob.method_index())? != &current {
                warn!(target: crate::logging::RESTORE, method = %current.name, "identity changed before install");
                return Ok((ReviveStatus::Fail, None));
            }
        }
        if self.config.make_revive_fail_at_nmethod {
            return Ok((ReviveStatus::Fail, None));
        }
        let nm = revive(&blob, &ctx, &state.pre)?;
        trace!(target: crate::logging::RESTORE, version = state.version, score = state.score, "revived");
        Ok((ReviveStatus::Success, Some(nm)))
    }

    /// Revive version `version` of `method` exactly, failing with the
    /// reason it cannot be used
    pub fn revive_version(&self, method: MethodHandle, version: u32) -> Result<CompiledMethod> {
        let name = self.env.method_display_name(method);
        let (_, head) = self.find(method)?;
        let (Some(head), Some((file, container))) = (head, self.active()) else {
            return Err(Error::unresolved(format!("{} is not in the cache", name)));
        };
        let offset = match container.versions(head).nth(version as usize) {
            Some(blob) => blob?.offset(),
            None => return Err(Error::unresolved(format!("{} has no version {}", name, version))),
        };
        let ctx = ReviveContext {
            env: self.env,
            meta: file.meta(),
            epoch: &self.epoch,
            method,
        };
        let state = check_version(container.code_space(), offset, version, &ctx, self.config)?;
        if !state.is_valid() {
            let message = format!("version {} of {}: {}", version, name, state.result);
            return Err(match state.result {
                ReviveResult::FailedOnOptRecord => Error::OptRejected(message),
                ReviveResult::FailedOnDependency => Error::DependencyViolated(message),
                _ => Error::Unresolved(message),
            });
        }
        revive(&container.code_space().blob(offset)?, &ctx, &state.pre)
    }

    /// Note that `klass` was redefined; cached metadata is re-validated
    /// against live identities on next use
    pub fn process_redefined_class(&self, klass: KlassHandle) -> u64 {
        let epoch = self.epoch.advance();
        debug!(target: crate::logging::RESTORE, class = %self.env.class_name(klass), epoch, "class redefined");
        epoch
    }

    /// Merge the configured inputs into the configured output file
    pub fn merge(&self) -> Result<MergeReport> {
        if !self.config.merge {
            return Err(Error::config("merge is not enabled"));
        }
        let timer = self.stats.start();
        let expected = self.config.validate_check.then(|| self.env.build_identity());
        let report = merge::merge(self.config, expected.as_deref())?;
        timer.stop(TimerKind::Merge);
        Ok(report)
    }
}
