//! Encoding a compiled method into a code blob

use super::aux_info::{encode_stream, AuxRecord};
use super::{oop_map, BlobHeader, HEADER_SIZE};
use crate::format::{read_slot, ByteWriter};
use crate::meta_space::MetaSpace;
use crate::records::encode_records;
use crate::vm::{
    ClassResolver, CompiledMethod, InitState, LoaderType, MetaRef, ObjectRef, RelocKind, RuntimeEnv,
    VmGlobalKind,
};
use crate::{Error, Result};
use tracing::trace;

/// Byte counts of the parts of one emitted blob
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobSizes {
    pub header: usize,
    /// Code, relocations and record sections
    pub body: usize,
    pub aux_info: usize,
    pub oop_maps: usize,
}

#[derive(Debug, Clone)]
pub struct EmittedBlob {
    pub bytes: Vec<u8>,
    pub method_index: u32,
    pub sizes: BlobSizes,
}

/// Upper bound of the three tag streams of `nm`
pub fn estimate_aux_size(nm: &CompiledMethod) -> usize {
    let data = (nm.oops.len() + nm.metadata.len()) * 24;
    let relocs: usize = nm
        .relocations
        .iter()
        .map(|r| match r.kind {
            RelocKind::Oop { immediate: true, .. } | RelocKind::Metadata { immediate: true, .. } => 24,
            RelocKind::ExternalWord
            | RelocKind::RuntimeCall
            | RelocKind::Poll { .. }
            | RelocKind::PollReturn { .. }
            | RelocKind::InternalWord
            | RelocKind::SectionWord => 8,
            _ => 0,
        })
        .sum();
    // String payloads can appear in both the oop stream and immediate relocations
    let strings: usize = nm
        .oops
        .iter()
        .flatten()
        .map(|o| match o {
            ObjectRef::Str(s) => 2 * s.len(),
            _ => 0,
        })
        .sum();
    data + relocs + strings + 3 * 8
}

struct Emitter<'a> {
    env: &'a dyn RuntimeEnv,
    meta: &'a mut MetaSpace,
    nm: &'a CompiledMethod,
}

impl Emitter<'_> {
    fn klass_state(&self, k: crate::vm::KlassHandle) -> InitState {
        if self.env.is_instance_class(k) {
            self.env.init_state(k)
        } else {
            InitState::Allocated
        }
    }

    fn meta_record(&mut self, meta: MetaRef) -> Result<AuxRecord> {
        match meta {
            MetaRef::Method(m) if m == self.nm.method => Ok(AuxRecord::SelfMethod),
            MetaRef::Method(_) => {
                let meta_index = self.meta.intern(self.env, meta)?;
                Ok(AuxRecord::MethodByName {
                    loader: self.env.meta_loader(meta),
                    meta_index,
                })
            }
            MetaRef::Klass(k) => {
                let meta_index = self.meta.intern(self.env, meta)?;
                Ok(AuxRecord::KlassByName {
                    loader: self.env.class_loader(k),
                    meta_index,
                    min_state: self.klass_state(k),
                })
            }
        }
    }

    fn oop_record(&mut self, obj: &ObjectRef) -> Result<AuxRecord> {
        if let Some(known) = self.env.known_object(obj) {
            return Ok(AuxRecord::GlobalOop(known));
        }
        match obj {
            ObjectRef::Str(s) => Ok(AuxRecord::OopStr(s.clone())),
            ObjectRef::Mirror(k) => {
                let meta_index = self.meta.intern(self.env, MetaRef::Klass(*k))?;
                Ok(AuxRecord::MirrorByName {
                    loader: self.env.class_loader(*k),
                    meta_index,
                    min_state: self.klass_state(*k),
                })
            }
            ObjectRef::Loader(l) if *l == self.env.class_loader(self.env.method_holder(self.nm.method)) => {
                Ok(AuxRecord::OopClassloader {
                    loader: LoaderType::MethodHolder,
                })
            }
            other => Err(Error::unresolved(format!("object {:?} cannot be named", other))),
        }
    }

    fn data_stream(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut metas = Vec::with_capacity(self.nm.metadata.len());
        for meta in &self.nm.metadata {
            metas.push(match meta {
                Some(m) => self.meta_record(*m)?,
                None => AuxRecord::NonOop,
            });
        }
        let mut oops = Vec::with_capacity(self.nm.oops.len());
        for obj in &self.nm.oops {
            oops.push(match obj {
                Some(o) => self.oop_record(o)?,
                None => AuxRecord::NonOop,
            });
        }
        Ok((encode_stream(&metas), encode_stream(&oops)))
    }

    fn slot(&self, offset: u32) -> Result<u64> {
        read_slot(&self.nm.code, offset as usize)
    }

    fn global_record(&self, offset: u32, what: &str) -> Result<AuxRecord> {
        let addr = self.slot(offset)?;
        let (kind, delta) = self.env.globals().find_by_address(addr).ok_or_else(|| {
            Error::unresolved(format!("{} at {} targets unknown address {:#x}", what, offset, addr))
        })?;
        Ok(AuxRecord::VmGlobal { kind, offset: delta })
    }

    fn reloc_stream(&mut self) -> Result<Vec<u8>> {
        let mut records = Vec::new();
        for reloc in &self.nm.relocations {
            match reloc.kind {
                RelocKind::Oop { index, immediate: true } => {
                    let obj = index
                        .checked_sub(1)
                        .and_then(|i| self.nm.oops.get(i as usize))
                        .ok_or_else(|| Error::unresolved(format!("oop index {} outside oop array", index)))?;
                    records.push(match obj {
                        Some(o) => self.oop_record(o)?,
                        None => AuxRecord::NonOop,
                    });
                }
                RelocKind::Metadata { index, immediate: true } => {
                    let meta = index
                        .checked_sub(1)
                        .and_then(|i| self.nm.metadata.get(i as usize))
                        .copied()
                        .ok_or_else(|| Error::unresolved(format!("metadata index {} outside array", index)))?;
                    records.push(match meta {
                        Some(m) => self.meta_record(m)?,
                        None => AuxRecord::NonOop,
                    });
                }
                RelocKind::ExternalWord => records.push(self.global_record(reloc.offset, "external word")?),
                RelocKind::RuntimeCall => records.push(self.global_record(reloc.offset, "runtime call")?),
                RelocKind::Poll { uses_page } | RelocKind::PollReturn { uses_page } => {
                    records.push(if uses_page {
                        AuxRecord::VmGlobal {
                            kind: VmGlobalKind::PollingPage,
                            offset: 0,
                        }
                    } else {
                        AuxRecord::Skip
                    });
                }
                RelocKind::InternalWord | RelocKind::SectionWord => {
                    let addr = self.slot(reloc.offset)?;
                    let base = self.nm.base_address;
                    let end = base + self.nm.code.len() as u64;
                    if addr < base || addr > end {
                        return Err(Error::unresolved(format!(
                            "internal word at {} targets {:#x} outside [{:#x}, {:#x}]",
                            reloc.offset, addr, base, end
                        )));
                    }
                    records.push(AuxRecord::InternalWord {
                        offset: (addr - base) as u32,
                    });
                }
                // Values come from the data arrays or are rebuilt from the kind
                RelocKind::Oop { .. }
                | RelocKind::Metadata { .. }
                | RelocKind::VirtualCall { .. }
                | RelocKind::OptVirtualCall
                | RelocKind::StaticCall
                | RelocKind::StaticStub { .. }
                | RelocKind::None => {}
            }
        }
        Ok(encode_stream(&records))
    }
}

fn section(w: &mut ByteWriter, bytes: &[u8]) -> (u32, u32) {
    w.align();
    let begin = w.len() as u32;
    w.put_bytes(bytes);
    (begin, bytes.len() as u32)
}

/// Serialize `nm`, interning every class and method it names into `meta`.
///
/// Fails with [`Error::Unresolved`] when some reference cannot be expressed
/// by name; the method is then simply not cached.
pub fn emit(nm: &CompiledMethod, env: &dyn RuntimeEnv, meta: &mut MetaSpace) -> Result<EmittedBlob> {
    let method_index = meta.intern(env, MetaRef::Method(nm.method))?;
    let mut emitter = Emitter { env, meta, nm };
    let (aux_meta, aux_oop) = emitter.data_stream()?;
    let aux_reloc = emitter.reloc_stream()?;

    let deps = encode_records(&nm.dependencies)?;
    let opts = encode_records(&nm.opt_records)?;
    let mut relocs = ByteWriter::with_capacity(nm.relocations.len() * crate::vm::RELOCATION_SIZE);
    for r in &nm.relocations {
        r.encode(&mut relocs);
    }
    let mut maps = ByteWriter::with_capacity(oop_map::encoded_size(&nm.oop_maps));
    oop_map::encode(&nm.oop_maps, &mut maps);

    let mut w = ByteWriter::with_capacity(
        HEADER_SIZE + nm.code.len() + relocs.len() + deps.len() + opts.len() + estimate_aux_size(nm) + maps.len() + 64,
    );
    w.reserve(HEADER_SIZE);
    w.put_bytes(&nm.code);
    let (reloc_begin, _) = section(&mut w, relocs.as_slice());
    let (deps_begin, deps_size) = section(&mut w, &deps);
    let (opts_begin, opts_size) = section(&mut w, &opts);
    let body_end = w.len();
    let (aux_meta_begin, aux_meta_size) = section(&mut w, &aux_meta);
    let (aux_oop_begin, aux_oop_size) = section(&mut w, &aux_oop);
    let (aux_reloc_begin, aux_reloc_size) = section(&mut w, &aux_reloc);
    let aux_end = w.len();
    let (oop_map_begin, oop_map_size) = section(&mut w, maps.as_slice());
    w.align();

    let header = BlobHeader {
        size: w.len() as u32,
        code_size: nm.code.len() as u32,
        entry_offset: nm.entry_offset,
        verified_entry_offset: nm.verified_entry_offset,
        reloc_begin,
        reloc_count: nm.relocations.len() as u32,
        deps_begin,
        deps_size,
        opts_begin,
        opts_size,
        oop_count: nm.oops.len() as u32,
        meta_count: nm.metadata.len() as u32,
        aux_meta_begin,
        aux_meta_size,
        aux_oop_begin,
        aux_oop_size,
        aux_reloc_begin,
        aux_reloc_size,
        oop_map_begin,
        oop_map_size,
        next_version_offset: -1,
        method_index,
    };
    let mut bytes = w.into_inner();
    bytes[..HEADER_SIZE].copy_from_slice(&header.encode());

    trace!(
        target: crate::logging::SAVE,
        method = %env.method_display_name(nm.method),
        size = bytes.len(),
        "emitted code blob"
    );
    let sizes = BlobSizes {
        header: HEADER_SIZE,
        body: body_end - HEADER_SIZE,
        aux_info: aux_end - body_end,
        oop_maps: bytes.len() - aux_end,
    };
    Ok(EmittedBlob {
        bytes,
        method_index,
        sizes,
    })
}
