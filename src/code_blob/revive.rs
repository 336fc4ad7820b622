//! Rebuilding a compiled method from a code blob
//!
//! Reviving happens in two phases. [`pre_revive`] resolves every name-based
//! reference; this may load classes and must run without the installation
//! lock. [`revive`] then replays the relocation stream against the values
//! collected in the first phase and only performs table lookups.

use super::aux_info::{AuxReader, AuxRecord};
use super::CodeBlob;
use crate::format::write_slot;
use crate::meta_space::MetaSpace;
use crate::redefine::RedefineEpoch;
use crate::vm::{
    ClassResolver, CompiledMethod, InitState, KlassHandle, LoaderType, MetaRef, MethodHandle, ObjectRef, RelocKind,
    RuntimeEnv, VmGlobalKind, NON_OOP_WORD, OPTIMIZING_LEVEL,
};
use crate::{Error, Result};
use std::fmt;
use tracing::trace;

/// One pre-resolved value of the relocation stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviveValue {
    Null,
    Oop(ObjectRef),
    Meta(MetaRef),
}

/// Stage of pre-revive, used to label failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveStage {
    MetaArray,
    OopArray,
    RelocInfo,
}

impl fmt::Display for ReviveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReviveStage::MetaArray => "meta array",
            ReviveStage::OopArray => "oop array",
            ReviveStage::RelocInfo => "reloc info",
        })
    }
}

/// Everything a revive needs from the running process
#[derive(Clone, Copy)]
pub struct ReviveContext<'a> {
    pub env: &'a dyn RuntimeEnv,
    pub meta: &'a MetaSpace,
    pub epoch: &'a RedefineEpoch,
    /// Method the blob is revived for
    pub method: MethodHandle,
}

/// Output of the first phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreRevived {
    pub meta_array: Vec<Option<MetaRef>>,
    pub oop_array: Vec<Option<ObjectRef>>,
    /// Name-based values of the relocation stream, in stream order
    pub reloc_values: Vec<ReviveValue>,
}

fn klass_ready(env: &dyn RuntimeEnv, k: KlassHandle, min_state: InitState) -> Result<()> {
    let state = env.init_state(k);
    let ready = state != InitState::InitializationError
        && (state >= min_state || (env.is_pure_interface(k) && state >= InitState::Linked));
    if ready {
        Ok(())
    } else {
        Err(Error::unresolved(format!(
            "{} is {}, code needs {}",
            env.class_name(k),
            state.name(),
            min_state.name()
        )))
    }
}

impl ReviveContext<'_> {
    fn klass(&self, meta_index: u32, min_state: InitState) -> Result<KlassHandle> {
        let k = self
            .meta
            .resolve(meta_index, self.env, self.epoch)?
            .as_klass()
            .ok_or_else(|| Error::corruption(format!("meta index {} names a method, expected a class", meta_index)))?;
        klass_ready(self.env, k, min_state)?;
        Ok(k)
    }

    fn method_by_index(&self, meta_index: u32) -> Result<MethodHandle> {
        let m = self
            .meta
            .resolve(meta_index, self.env, self.epoch)?
            .as_method()
            .ok_or_else(|| Error::corruption(format!("meta index {} names a class, expected a method", meta_index)))?;
        klass_ready(self.env, self.env.method_holder(m), InitState::Loaded)?;
        Ok(m)
    }

    fn holder_loader(&self) -> LoaderType {
        self.env.class_loader(self.env.method_holder(self.method))
    }

    /// Value of a record naming class metadata
    fn meta_value(&self, record: &AuxRecord) -> Result<Option<MetaRef>> {
        Ok(match record {
            AuxRecord::NonOop => None,
            AuxRecord::SelfMethod => Some(MetaRef::Method(self.method)),
            AuxRecord::KlassByName {
                meta_index, min_state, ..
            } => Some(MetaRef::Klass(self.klass(*meta_index, *min_state)?)),
            AuxRecord::MethodByName { meta_index, .. } => Some(MetaRef::Method(self.method_by_index(*meta_index)?)),
            other => return Err(Error::corruption(format!("{} in a metadata position", other))),
        })
    }

    /// Value of a record naming a heap object
    fn oop_value(&self, record: &AuxRecord) -> Result<Option<ObjectRef>> {
        Ok(match record {
            AuxRecord::NonOop => None,
            AuxRecord::OopStr(s) => Some(ObjectRef::Str(s.clone())),
            AuxRecord::GlobalOop(known) => Some(ObjectRef::Known(*known)),
            AuxRecord::MirrorByName {
                meta_index, min_state, ..
            } => Some(ObjectRef::Mirror(self.klass(*meta_index, *min_state)?)),
            AuxRecord::OopClassloader {
                loader: LoaderType::MethodHolder,
            } => Some(ObjectRef::Loader(self.holder_loader())),
            other => return Err(Error::corruption(format!("{} in an oop position", other))),
        })
    }
}

/// Resolve the metadata array of `blob`
pub fn revive_meta_array(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>) -> Result<Vec<Option<MetaRef>>> {
    let mut reader = AuxReader::new(blob.aux_meta());
    let count = blob.header().meta_count as usize;
    let mut out = Vec::with_capacity(count.min(blob.aux_meta().len() / 8));
    for _ in 0..count {
        out.push(ctx.meta_value(&reader.next_record()?)?);
    }
    reader.expect_end()?;
    Ok(out)
}

/// Resolve the oop array of `blob`
pub fn revive_oop_array(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>) -> Result<Vec<Option<ObjectRef>>> {
    let mut reader = AuxReader::new(blob.aux_oop());
    let count = blob.header().oop_count as usize;
    let mut out = Vec::with_capacity(count.min(blob.aux_oop().len() / 8));
    for _ in 0..count {
        out.push(ctx.oop_value(&reader.next_record()?)?);
    }
    reader.expect_end()?;
    Ok(out)
}

/// Resolve the name-based records of the relocation stream into a side list
pub fn pre_revive_relocs(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>) -> Result<Vec<ReviveValue>> {
    let mut reader = AuxReader::new(blob.aux_reloc());
    let mut values = Vec::new();
    loop {
        let record = reader.next_record()?;
        let value = match &record {
            AuxRecord::End => break,
            AuxRecord::VmGlobal { .. } | AuxRecord::InternalWord { .. } | AuxRecord::Skip => continue,
            // Resolved from the holder at replay time
            AuxRecord::OopClassloader { .. } => continue,
            AuxRecord::NonOop => ReviveValue::Null,
            AuxRecord::SelfMethod | AuxRecord::KlassByName { .. } | AuxRecord::MethodByName { .. } => {
                ctx.meta_value(&record)?.map_or(ReviveValue::Null, ReviveValue::Meta)
            }
            AuxRecord::OopStr(_) | AuxRecord::GlobalOop(_) | AuxRecord::MirrorByName { .. } => {
                ctx.oop_value(&record)?.map_or(ReviveValue::Null, ReviveValue::Oop)
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// First phase: resolve all three streams
pub fn pre_revive(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>) -> Result<PreRevived> {
    let stage = |stage: ReviveStage| {
        move |e: Error| {
            trace!(target: crate::logging::RESTORE, %stage, error = %e, "pre-revive failed");
            e
        }
    };
    Ok(PreRevived {
        meta_array: revive_meta_array(blob, ctx).map_err(stage(ReviveStage::MetaArray))?,
        oop_array: revive_oop_array(blob, ctx).map_err(stage(ReviveStage::OopArray))?,
        reloc_values: pre_revive_relocs(blob, ctx).map_err(stage(ReviveStage::RelocInfo))?,
    })
}

struct Replay<'a, 'b> {
    ctx: &'a ReviveContext<'b>,
    pre: &'a PreRevived,
    reader: AuxReader<'a>,
    next_value: usize,
}

impl Replay<'_, '_> {
    fn record(&mut self, reloc_offset: u32) -> Result<AuxRecord> {
        match self.reader.next_record()? {
            AuxRecord::End => Err(Error::corruption(format!(
                "relocation stream ends before the site at {}",
                reloc_offset
            ))),
            record => Ok(record),
        }
    }

    fn value(&mut self) -> Result<&ReviveValue> {
        let value = self
            .pre
            .reloc_values
            .get(self.next_value)
            .ok_or_else(|| Error::corruption("relocation stream has more values than were pre-revived"))?;
        self.next_value += 1;
        Ok(value)
    }

    fn global(&mut self, reloc_offset: u32) -> Result<u64> {
        match self.record(reloc_offset)? {
            AuxRecord::VmGlobal { kind, offset } => self.ctx.env.globals().address_of(kind, offset),
            other => Err(Error::corruption(format!("{} at site {}, expected vm_global", other, reloc_offset))),
        }
    }

    fn oop_address(&mut self, reloc_offset: u32) -> Result<u64> {
        let env = self.ctx.env;
        match self.record(reloc_offset)? {
            AuxRecord::OopClassloader { .. } => Ok(env.object_address(&ObjectRef::Loader(self.ctx.holder_loader()))),
            AuxRecord::NonOop | AuxRecord::OopStr(_) | AuxRecord::GlobalOop(_) | AuxRecord::MirrorByName { .. } => {
                match self.value()? {
                    ReviveValue::Null => Ok(0),
                    ReviveValue::Oop(obj) => Ok(env.object_address(obj)),
                    ReviveValue::Meta(_) => Err(Error::corruption(format!(
                        "pre-revived metadata consumed by the oop site at {}",
                        reloc_offset
                    ))),
                }
            }
            other => Err(Error::corruption(format!("{} at oop site {}", other, reloc_offset))),
        }
    }

    fn meta_address(&mut self, reloc_offset: u32) -> Result<u64> {
        let env = self.ctx.env;
        match self.record(reloc_offset)? {
            AuxRecord::NonOop
            | AuxRecord::SelfMethod
            | AuxRecord::KlassByName { .. }
            | AuxRecord::MethodByName { .. } => match self.value()? {
                ReviveValue::Null => Ok(0),
                ReviveValue::Meta(meta) => Ok(env.metadata_address(*meta)),
                ReviveValue::Oop(_) => Err(Error::corruption(format!(
                    "pre-revived object consumed by the metadata site at {}",
                    reloc_offset
                ))),
            },
            other => Err(Error::corruption(format!("{} at metadata site {}", other, reloc_offset))),
        }
    }
}

fn array_entry<T: Clone>(array: &[Option<T>], index: u32, what: &str) -> Result<Option<T>> {
    index
        .checked_sub(1)
        .and_then(|i| array.get(i as usize))
        .cloned()
        .ok_or_else(|| Error::corruption(format!("{} index {} outside array of {}", what, index, array.len())))
}

/// Second phase: build the installable method.
///
/// Only table lookups happen here; every name was resolved by
/// [`pre_revive`].
pub fn revive(blob: &CodeBlob<'_>, ctx: &ReviveContext<'_>, pre: &PreRevived) -> Result<CompiledMethod> {
    let env = ctx.env;
    let header = blob.header();
    let base = env.install_address(ctx.method);
    let mut nm = CompiledMethod::new(ctx.method, base);
    nm.code = blob.code().to_vec();
    nm.entry_offset = header.entry_offset;
    nm.verified_entry_offset = header.verified_entry_offset;
    nm.relocations = blob.relocations()?;
    nm.comp_level = OPTIMIZING_LEVEL;

    let resolve_stub = |kind: VmGlobalKind| env.globals().address_of(kind, 0);
    let mut replay = Replay {
        ctx,
        pre,
        reader: AuxReader::new(blob.aux_reloc()),
        next_value: 0,
    };
    for reloc in &nm.relocations {
        let at = reloc.offset as usize;
        let value = match reloc.kind {
            RelocKind::None => continue,
            RelocKind::Oop { index, immediate: false } => match array_entry(&pre.oop_array, index, "oop")? {
                Some(obj) => env.object_address(&obj),
                None => 0,
            },
            RelocKind::Oop { immediate: true, .. } => replay.oop_address(reloc.offset)?,
            RelocKind::Metadata { index, immediate: false } => {
                match array_entry(&pre.meta_array, index, "metadata")? {
                    Some(meta) => env.metadata_address(meta),
                    None => 0,
                }
            }
            RelocKind::Metadata { immediate: true, .. } => replay.meta_address(reloc.offset)?,
            RelocKind::ExternalWord | RelocKind::RuntimeCall => replay.global(reloc.offset)?,
            RelocKind::Poll { .. } | RelocKind::PollReturn { .. } => match replay.record(reloc.offset)? {
                AuxRecord::Skip => continue,
                AuxRecord::VmGlobal { kind, offset } => env.globals().address_of(kind, offset)?,
                other => return Err(Error::corruption(format!("{} at poll site {}", other, reloc.offset))),
            },
            RelocKind::VirtualCall { cached_value_offset } => {
                write_slot(&mut nm.code, cached_value_offset as usize, NON_OOP_WORD)?;
                resolve_stub(VmGlobalKind::ResolveVirtualCall)?
            }
            RelocKind::OptVirtualCall => resolve_stub(VmGlobalKind::ResolveOptVirtualCall)?,
            RelocKind::StaticCall => resolve_stub(VmGlobalKind::ResolveStaticCall)?,
            RelocKind::StaticStub {
                metadata_offset,
                jump_offset,
            } => {
                write_slot(&mut nm.code, metadata_offset as usize, 0)?;
                write_slot(&mut nm.code, jump_offset as usize, base + jump_offset as u64)?;
                continue;
            }
            RelocKind::InternalWord | RelocKind::SectionWord => match replay.record(reloc.offset)? {
                AuxRecord::InternalWord { offset } if offset <= header.code_size => base + offset as u64,
                other => {
                    return Err(Error::corruption(format!(
                        "{} at internal site {} of {} code bytes",
                        other, reloc.offset, header.code_size
                    )))
                }
            },
        };
        write_slot(&mut nm.code, at, value)?;
    }
    replay.reader.expect_end()?;
    if replay.next_value != pre.reloc_values.len() {
        return Err(Error::corruption(format!(
            "{} pre-revived values left unused",
            pre.reloc_values.len() - replay.next_value
        )));
    }

    nm.oops = pre.oop_array.clone();
    nm.metadata = pre.meta_array.clone();
    nm.oop_maps = blob.oop_maps()?;
    nm.dependencies = blob.dependencies()?;
    nm.opt_records = blob.opt_records()?;
    trace!(
        target: crate::logging::RESTORE,
        method = %env.method_display_name(ctx.method),
        base = format_args!("{:#x}", base),
        "revived code blob"
    );
    Ok(nm)
}

#[cfg(test)]
mod tests {
    use super::super::emit;
    use super::*;
    use crate::records::DepType;
    use crate::vm::{ClassSpec, CodeAssembler, InMemoryVm, KnownObject};
    use pretty_assertions::assert_eq;

    struct World {
        vm: InMemoryVm,
        point: KlassHandle,
        method: MethodHandle,
        callee: MethodHandle,
    }

    fn world(shift: u64) -> World {
        let mut vm = InMemoryVm::with_address_shift(shift);
        let holder = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let point = vm.define_class(ClassSpec::new("app/Point", LoaderType::App));
        let method = vm.define_method(holder, "run", "()V");
        let callee = vm.define_method(point, "norm", "()D");
        World {
            vm,
            point,
            method,
            callee,
        }
    }

    fn assemble(w: &World) -> CompiledMethod {
        let mut asm = CodeAssembler::new(&w.vm, w.method);
        asm.nops(8)
            .set_entries(0, 4)
            .oop(ObjectRef::Str("hello".into()), true)
            .oop(ObjectRef::Mirror(w.point), false)
            .oop(ObjectRef::Known(KnownObject::TheNullString), true)
            .oop(ObjectRef::Loader(LoaderType::App), true)
            .metadata(MetaRef::Klass(w.point), true)
            .metadata(MetaRef::Method(w.callee), false)
            .metadata(MetaRef::Method(w.method), true)
            .internal_word(4)
            .static_stub();
        asm.external_word(VmGlobalKind::CardTableBase, 16).unwrap();
        asm.runtime_call(VmGlobalKind::UncommonTrapBlob).unwrap();
        asm.poll(true).unwrap().poll_return(false).unwrap();
        asm.virtual_call().unwrap().opt_virtual_call().unwrap().static_call().unwrap();
        asm.dependency(DepType::LeafType, &[MetaRef::Klass(w.point)]);
        asm.oop_map(1, &[7, 7]);
        asm.finish()
    }

    fn round_trip(saved: &World, live: &World) -> Result<CompiledMethod> {
        let nm = assemble(saved);
        let mut meta = MetaSpace::new();
        let blob = emit(&nm, &saved.vm, &mut meta)?;
        let parsed = CodeBlob::parse(&blob.bytes, 0)?;
        let epoch = RedefineEpoch::new();
        let ctx = ReviveContext {
            env: &live.vm,
            meta: &meta,
            epoch: &epoch,
            method: live.method,
        };
        let pre = pre_revive(&parsed, &ctx)?;
        revive(&parsed, &ctx, &pre)
    }

    #[test]
    fn test_round_trip_same_process() {
        let w = world(0);
        let revived = round_trip(&w, &w).unwrap();
        let original = assemble(&w);
        assert_eq!(revived.code, original.code);
        assert_eq!(revived.oops, original.oops);
        assert_eq!(revived.metadata, original.metadata);
        assert_eq!(revived.dependencies, original.dependencies);
        assert_eq!(revived.oop_maps, original.oop_maps);
    }

    #[test]
    fn test_round_trip_relocates_to_new_addresses() {
        let saved = world(0);
        let live = world(0x1000_0000);
        let revived = round_trip(&saved, &live).unwrap();
        // What the live process would have generated itself
        let expected = assemble(&live);
        assert_eq!(revived.base_address, expected.base_address);
        assert_eq!(revived.code, expected.code);
        assert_ne!(revived.code, assemble(&saved).code);
    }

    #[test]
    fn test_string_constants_with_nul() {
        let saved = world(0);
        let live = world(0x2000);
        let strings = ["a\0b", "tail", "a\0bcdefghijkl"];
        let assemble_strings = |w: &World| {
            let mut asm = CodeAssembler::new(&w.vm, w.method);
            asm.nops(8);
            for (i, s) in strings.iter().enumerate() {
                asm.oop(ObjectRef::Str(s.to_string()), i % 2 == 0);
            }
            asm.finish()
        };

        let nm = assemble_strings(&saved);
        let mut meta = MetaSpace::new();
        let blob = emit(&nm, &saved.vm, &mut meta).unwrap();
        let parsed = CodeBlob::parse(&blob.bytes, 0).unwrap();
        let epoch = RedefineEpoch::new();
        let ctx = ReviveContext {
            env: &live.vm,
            meta: &meta,
            epoch: &epoch,
            method: live.method,
        };
        let pre = pre_revive(&parsed, &ctx).unwrap();
        let revived = revive(&parsed, &ctx, &pre).unwrap();

        let expected = assemble_strings(&live);
        assert_eq!(revived.oops, expected.oops);
        assert_eq!(revived.code, expected.code);
    }

    #[test]
    fn test_uninitialized_class_fails_pre_revive() {
        let saved = world(0);
        let mut live = world(0);
        live.vm.set_init_state(live.point, InitState::Loaded);
        let err = round_trip(&saved, &live).unwrap_err();
        assert!(matches!(err, Error::Unresolved(_)), "{:?}", err);
    }

    #[test]
    fn test_missing_class_fails_pre_revive() {
        let saved = world(0);
        let mut live = InMemoryVm::new();
        let holder = live.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let method = live.define_method(holder, "run", "()V");
        let live = World {
            vm: live,
            point: holder,
            method,
            callee: method,
        };
        assert!(matches!(round_trip(&saved, &live), Err(Error::Unresolved(_))));
    }

    #[test]
    fn test_leftover_values_are_corruption() {
        let w = world(0);
        let nm = assemble(&w);
        let mut meta = MetaSpace::new();
        let blob = emit(&nm, &w.vm, &mut meta).unwrap();
        let parsed = CodeBlob::parse(&blob.bytes, 0).unwrap();
        let epoch = RedefineEpoch::new();
        let ctx = ReviveContext {
            env: &w.vm,
            meta: &meta,
            epoch: &epoch,
            method: w.method,
        };
        let mut pre = pre_revive(&parsed, &ctx).unwrap();
        pre.reloc_values.push(ReviveValue::Null);
        assert!(revive(&parsed, &ctx, &pre).unwrap_err().is_corruption());
        pre.reloc_values.clear();
        assert!(revive(&parsed, &ctx, &pre).unwrap_err().is_corruption());
    }
}
