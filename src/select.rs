//! Choosing which cached version of a method to revive
//!
//! Every version in the chain goes through two checks. The light check
//! resolves the metadata array and scores the opt records; the preprocess
//! checks dependencies and resolves the oop array and the relocation
//! values. The policy decides after each version whether to look at the
//! next one, then picks among the versions that passed both.

use crate::code_blob::{
    passes::collect_global_oops, pre_revive_relocs, revive_meta_array, revive_oop_array, CodeBlob, PreRevived,
    ReviveContext,
};
use crate::code_space::CodeSpace;
use crate::config::{Config, RevivePolicyKind};
use crate::records::{check_all, total_score, OptRecord, ScoreContext};
use crate::vm::{ClassResolver, KnownObject};
use crate::{Error, Result};
use bitflags::bitflags;
use rand::Rng;
use std::fmt;
use tracing::{debug, error, trace, warn};

bitflags! {
    /// Checks a version has passed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CheckResults: u8 {
        const CHECK_PASSED = 1;
        const PREPROCESS_PASSED = 1 << 1;
    }
}

/// Outcome of checking one version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveResult {
    Ok,
    FailedOnMetaArray,
    FailedOnOopArray,
    FailedOnRelocInfo,
    FailedOnOptRecord,
    FailedOnDependency,
}

impl ReviveResult {
    pub fn name(self) -> &'static str {
        match self {
            ReviveResult::Ok => "ok",
            ReviveResult::FailedOnMetaArray => "failed on meta array",
            ReviveResult::FailedOnOopArray => "failed on oop array",
            ReviveResult::FailedOnRelocInfo => "failed on reloc info",
            ReviveResult::FailedOnOptRecord => "failed on opt record",
            ReviveResult::FailedOnDependency => "failed on dependency",
        }
    }

    /// Whether the failure holds for the rest of the process.
    ///
    /// A contradicted profile or a broken class hierarchy does not heal;
    /// a class that is not initialized yet may be later.
    pub fn is_permanent(self) -> bool {
        matches!(self, ReviveResult::FailedOnOptRecord | ReviveResult::FailedOnDependency)
    }
}

impl fmt::Display for ReviveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything learned about one version while checking it
#[derive(Debug, Clone)]
pub struct JitVersionReviveState {
    /// Position in the version chain, from 0
    pub version: u32,
    /// Offset of the blob in the code space
    pub offset: u32,
    pub check_results: CheckResults,
    pub result: ReviveResult,
    /// Summed opt record score; lower is better
    pub score: i64,
    pub pre: PreRevived,
    pub global_oops: Vec<KnownObject>,
}

impl JitVersionReviveState {
    fn new(version: u32, offset: u32) -> Self {
        Self {
            version,
            offset,
            check_results: CheckResults::empty(),
            result: ReviveResult::Ok,
            score: 0,
            pre: PreRevived::default(),
            global_oops: Vec::new(),
        }
    }

    /// Passed both the light check and the preprocess
    pub fn is_valid(&self) -> bool {
        self.check_results
            .contains(CheckResults::CHECK_PASSED | CheckResults::PREPROCESS_PASSED)
    }

    fn fail(&mut self, result: ReviveResult, e: &Error) -> bool {
        self.result = result;
        if e.is_corruption() {
            error!(target: crate::logging::RESTORE, version = self.version, offset = self.offset, error = %e, "{}", result);
        } else {
            debug!(target: crate::logging::RESTORE, version = self.version, error = %e, "{}", result);
        }
        false
    }
}

/// Result of running the selection over a chain
#[derive(Debug, Default)]
pub struct Selection {
    pub selected: Option<JitVersionReviveState>,
    /// Versions that failed for good and should be skipped from now on
    pub unusable: Vec<u32>,
    /// Every version is unusable; the method should bypass the cache
    pub disable_method: bool,
    /// Versions looked at, usable or not
    pub checked: u32,
}

/// Resolve the metadata array and score the opt records
fn light_check(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>, config: &Config, state: &mut JitVersionReviveState) -> bool {
    let meta_array = match revive_meta_array(blob, ctx) {
        Ok(array) => array,
        Err(e) => return state.fail(ReviveResult::FailedOnMetaArray, &e),
    };
    let score = blob.opt_records().and_then(|opts| {
        if config.disable_constant_opt && opts.iter().any(|r| matches!(r, OptRecord::ConstantReplace { .. })) {
            return Err(Error::OptRejected("constant replacement is disabled".into()));
        }
        let score_ctx = ScoreContext {
            metas: &meta_array,
            env: ctx.env,
            costs: &config.opt_costs,
        };
        total_score(&opts, &score_ctx)
    });
    state.pre.meta_array = meta_array;
    match score {
        Ok(score) => {
            state.score = score;
            state.check_results |= CheckResults::CHECK_PASSED;
            trace!(target: crate::logging::OPT, version = state.version, score, "opt records accepted");
            true
        }
        Err(e) if e.is_corruption() => state.fail(ReviveResult::FailedOnMetaArray, &e),
        Err(e) => state.fail(ReviveResult::FailedOnOptRecord, &e),
    }
}

/// Check dependencies and resolve everything the install needs
fn preprocess(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>, state: &mut JitVersionReviveState) -> bool {
    if let Err(e) = blob
        .dependencies()
        .and_then(|deps| check_all(&deps, &state.pre.meta_array, ctx.env))
    {
        return state.fail(ReviveResult::FailedOnDependency, &e);
    }
    state.pre.oop_array = match revive_oop_array(blob, ctx) {
        Ok(array) => array,
        Err(e) => return state.fail(ReviveResult::FailedOnOopArray, &e),
    };
    state.pre.reloc_values = match pre_revive_relocs(blob, ctx) {
        Ok(values) => values,
        Err(e) => return state.fail(ReviveResult::FailedOnRelocInfo, &e),
    };
    let globals = collect_global_oops(blob.aux_oop()).and_then(|mut oops| {
        oops.extend(collect_global_oops(blob.aux_reloc())?);
        Ok(oops)
    });
    match globals {
        Ok(oops) => state.global_oops = oops,
        Err(e) => return state.fail(ReviveResult::FailedOnRelocInfo, &e),
    }
    state.check_results |= CheckResults::PREPROCESS_PASSED;
    true
}

/// Run both checks on the blob at `offset`
pub fn check_version(
    space: &CodeSpace,
    offset: u32,
    version: u32,
    ctx: &ReviveContext<'_>,
    config: &Config,
) -> Result<JitVersionReviveState> {
    let blob = space.blob(offset)?;
    let mut state = JitVersionReviveState::new(version, offset);
    let _ = light_check(&blob, ctx, config, &mut state) && preprocess(&blob, ctx, &mut state);
    Ok(state)
}

/// Policy hooks: when to stop scanning and which candidate to take
trait SelectPolicy {
    fn check_next_version(&self, version: u32, candidates: usize) -> bool;
    fn select_version(&self, candidates: &[JitVersionReviveState]) -> Option<usize>;
}

struct FirstUsable;

impl SelectPolicy for FirstUsable {
    fn check_next_version(&self, _version: u32, candidates: usize) -> bool {
        candidates == 0
    }

    fn select_version(&self, candidates: &[JitVersionReviveState]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }
}

struct RandomUsable;

impl SelectPolicy for RandomUsable {
    fn check_next_version(&self, _version: u32, _candidates: usize) -> bool {
        true
    }

    fn select_version(&self, candidates: &[JitVersionReviveState]) -> Option<usize> {
        (!candidates.is_empty()).then(|| rand::thread_rng().gen_range(0..candidates.len()))
    }
}

struct AppointedUsable(u32);

impl SelectPolicy for AppointedUsable {
    fn check_next_version(&self, version: u32, candidates: usize) -> bool {
        version < self.0 || candidates == 0
    }

    fn select_version(&self, candidates: &[JitVersionReviveState]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(candidates.iter().position(|c| c.version == self.0).unwrap_or(0))
    }
}

fn policy(kind: RevivePolicyKind) -> Box<dyn SelectPolicy> {
    match kind {
        RevivePolicyKind::First => Box::new(FirstUsable),
        RevivePolicyKind::Random => Box::new(RandomUsable),
        RevivePolicyKind::Appointed(n) => Box::new(AppointedUsable(n)),
    }
}

/// Walk the chain from `head` and pick a version.
///
/// `usable` says whether a version has not yet been ruled out for good.
/// Only a broken chain is an error; failing versions are reported in the
/// returned [`Selection`].
pub fn select_version(
    space: &CodeSpace,
    head: u32,
    ctx: &ReviveContext<'_>,
    config: &Config,
    usable: &dyn Fn(u32) -> bool,
) -> Result<Selection> {
    let policy = policy(config.revive_policy);
    let name = ctx.env.method_display_name(ctx.method);
    let mut selection = Selection::default();
    let mut candidates = Vec::new();
    let mut all_unusable = true;
    let mut scanned_all = true;

    let mut versions = space.versions(head).peekable();
    let mut version = 0u32;
    while let Some(blob) = versions.next() {
        let offset = blob?.offset();
        selection.checked += 1;
        let mut checked = false;
        if usable(version) {
            checked = true;
            let state = check_version(space, offset, version, ctx, config)?;
            if state.is_valid() {
                trace!(target: crate::logging::RESTORE, method = %name, version, score = state.score, "candidate version");
                candidates.push(state);
                all_unusable = false;
            } else if state.result.is_permanent() {
                warn!(target: crate::logging::RESTORE, method = %name, version, "version set unusable, {}", state.result);
                selection.unusable.push(version);
            } else {
                all_unusable = false;
            }
        } else {
            trace!(target: crate::logging::RESTORE, method = %name, version, "skipping unusable version");
        }
        if checked && !policy.check_next_version(version, candidates.len()) {
            scanned_all = versions.peek().is_none();
            break;
        }
        version += 1;
    }

    if all_unusable && scanned_all {
        error!(target: crate::logging::RESTORE, method = %name, "all versions are unusable, cache disabled for method");
        selection.disable_method = true;
        return Ok(selection);
    }
    let Some(index) = policy.select_version(&candidates) else {
        debug!(target: crate::logging::RESTORE, method = %name, "no usable version");
        return Ok(selection);
    };
    let selected = candidates.swap_remove(index);
    trace!(target: crate::logging::RESTORE, method = %name, version = selected.version, "selected version");
    selection.selected = Some(selected);
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_blob::emit;
    use crate::meta_space::MetaSpace;
    use crate::records::DepType;
    use crate::redefine::RedefineEpoch;
    use crate::vm::{
        CallProfile, ClassSpec, CodeAssembler, CompiledMethod, InMemoryVm, KlassHandle, LoaderType, MetaRef,
        MethodHandle, ReceiverRow,
    };

    struct World {
        vm: InMemoryVm,
        method: MethodHandle,
        a: KlassHandle,
        b: KlassHandle,
    }

    fn world() -> World {
        let mut vm = InMemoryVm::new();
        let holder = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let a = vm.define_class(ClassSpec::new("app/A", LoaderType::App));
        let b = vm.define_class(ClassSpec::new("app/B", LoaderType::App));
        let method = vm.define_method(holder, "run", "()V");
        World { vm, method, a, b }
    }

    /// Version speculating that the receiver at bci 3 is `klass`
    fn speculating(w: &World, klass: KlassHandle) -> CompiledMethod {
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(8);
        let method = asm.meta_index(MetaRef::Method(w.method));
        let klass = asm.meta_index(MetaRef::Klass(klass));
        asm.opt(OptRecord::ProfiledReceiver { method, bci: 3, klass });
        asm.finish()
    }

    fn plain(w: &World) -> CompiledMethod {
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(8);
        asm.finish()
    }

    fn space_of(w: &World, versions: &[CompiledMethod]) -> (CodeSpace, MetaSpace) {
        let mut meta = MetaSpace::new();
        let mut space = CodeSpace::new();
        let mut head = None;
        for nm in versions {
            let blob = emit(nm, &w.vm, &mut meta).unwrap();
            let offset = space.append_version(head, &blob.bytes).unwrap();
            head.get_or_insert(offset);
        }
        (space, meta)
    }

    fn run(w: &World, versions: &[CompiledMethod], config: &Config, usable: &dyn Fn(u32) -> bool) -> Selection {
        let (space, meta) = space_of(w, versions);
        let epoch = RedefineEpoch::new();
        let ctx = ReviveContext {
            env: &w.vm,
            meta: &meta,
            epoch: &epoch,
            method: w.method,
        };
        select_version(&space, 0, &ctx, config, usable).unwrap()
    }

    fn profile(w: &mut World, klass: KlassHandle) {
        w.vm.set_call_profile(
            w.method,
            3,
            CallProfile {
                count: 10,
                receivers: vec![ReceiverRow { klass, count: 10 }],
            },
        );
    }

    #[test]
    fn test_first_usable_skips_contradicted_version() {
        let mut w = world();
        let b = w.b;
        profile(&mut w, b);
        let versions = [speculating(&w, w.a), speculating(&w, w.b)];
        let selection = run(&w, &versions, &Config::default(), &|_| true);
        let selected = selection.selected.unwrap();
        assert_eq!(selected.version, 1);
        assert!(selected.is_valid());
        assert_eq!(selected.score, -90);
        assert_eq!(selection.unusable, vec![0]);
        assert!(!selection.disable_method);
    }

    #[test]
    fn test_first_usable_stops_early() {
        let w = world();
        let versions = [plain(&w), plain(&w), plain(&w)];
        let selection = run(&w, &versions, &Config::default(), &|_| true);
        assert_eq!(selection.selected.unwrap().version, 0);
        assert_eq!(selection.checked, 1);
    }

    #[test]
    fn test_all_rejected_disables_method() {
        let mut w = world();
        let c = w.vm.define_class(ClassSpec::new("app/C", LoaderType::App));
        profile(&mut w, c);
        let versions = [speculating(&w, w.a), speculating(&w, w.b)];
        let selection = run(&w, &versions, &Config::default(), &|_| true);
        assert!(selection.selected.is_none());
        assert!(selection.disable_method);
        assert_eq!(selection.unusable, vec![0, 1]);
    }

    #[test]
    fn test_unusable_versions_are_not_checked() {
        let w = world();
        let versions = [plain(&w), plain(&w)];
        let selection = run(&w, &versions, &Config::default(), &|v| v != 0);
        assert_eq!(selection.selected.unwrap().version, 1);

        let selection = run(&w, &versions, &Config::default(), &|_| false);
        assert!(selection.disable_method);
    }

    #[test]
    fn test_violated_dependency_falls_through() {
        let mut w = world();
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(8).dependency(DepType::LeafType, &[MetaRef::Klass(w.a)]);
        let leaf = asm.finish();
        let versions = [leaf.clone(), plain(&w)];
        w.vm.define_class(ClassSpec::new("app/ASub", LoaderType::App).extends(w.a));

        let selection = run(&w, &versions, &Config::default(), &|_| true);
        assert_eq!(selection.selected.unwrap().version, 1);
        assert_eq!(selection.unusable, vec![0]);

        let selection = run(&w, &[leaf], &Config::default(), &|_| true);
        assert!(selection.selected.is_none());
    }

    #[test]
    fn test_uninitialized_class_is_transient() {
        let mut w = world();
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(8).metadata(MetaRef::Klass(w.a), false);
        let (space, meta) = space_of(&w, &[asm.finish()]);
        // Saved fully initialized, revived before the class finished initializing
        w.vm.set_init_state(w.a, crate::vm::InitState::Loaded);
        let epoch = RedefineEpoch::new();
        let ctx = ReviveContext {
            env: &w.vm,
            meta: &meta,
            epoch: &epoch,
            method: w.method,
        };
        let selection = select_version(&space, 0, &ctx, &Config::default(), &|_| true).unwrap();
        assert!(selection.selected.is_none());
        assert!(selection.unusable.is_empty());
        assert!(!selection.disable_method);
    }

    #[test]
    fn test_appointed_policy() {
        let w = world();
        let versions = [plain(&w), plain(&w), plain(&w)];
        let config = Config::default().with_revive_policy(RevivePolicyKind::Appointed(2));
        let selection = run(&w, &versions, &config, &|_| true);
        assert_eq!(selection.selected.unwrap().version, 2);

        // Appointed version unusable: first candidate found on the way
        let selection = run(&w, &versions, &config, &|v| v != 2);
        assert_eq!(selection.selected.unwrap().version, 0);

        let config = Config::default().with_revive_policy(RevivePolicyKind::Appointed(7));
        let selection = run(&w, &versions, &config, &|_| true);
        assert_eq!(selection.selected.unwrap().version, 0);
    }

    #[test]
    fn test_random_policy_checks_everything() {
        let w = world();
        let versions = [plain(&w), plain(&w), plain(&w)];
        let config = Config::default().with_revive_policy(RevivePolicyKind::Random);
        let selection = run(&w, &versions, &config, &|_| true);
        assert_eq!(selection.checked, 3);
        assert!(selection.selected.unwrap().version < 3);
    }

    #[test]
    fn test_constant_opt_can_be_disabled() {
        let mut w = world();
        w.vm.set_constant(w.a, 8, crate::vm::FieldConstant::int(1));
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(8);
        let klass = asm.meta_index(MetaRef::Klass(w.a));
        asm.opt(OptRecord::ConstantReplace {
            klass,
            field_offset: 8,
            field_type: crate::vm::BasicType::Int,
            field_val: 1,
        });
        let versions = [asm.finish()];
        assert!(run(&w, &versions, &Config::default(), &|_| true).selected.is_some());

        let config = Config {
            disable_constant_opt: true,
            ..Config::default()
        };
        let selection = run(&w, &versions, &config, &|_| true);
        assert!(selection.selected.is_none());
        assert!(selection.disable_method);
    }
}
