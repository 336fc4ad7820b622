//! Compiled methods as handed over by the compiler and handed back on revive

use super::{MetaRef, MethodHandle, ObjectRef, RuntimeEnv, VmGlobalKind, NON_OOP_WORD};
use crate::format::{write_slot, ByteReader, ByteWriter};
use crate::records::{DependencyRecord, OptRecord};
use crate::{Error, Result};

/// Compile level of the optimizing tier; only its output is cached
pub const OPTIMIZING_LEVEL: u32 = 4;

/// Encoded size of one relocation
pub const RELOCATION_SIZE: usize = 16;

/// What a patch site in the code refers to.
///
/// Every site is an 8-byte slot at the relocation offset; the kinds that
/// own additional slots carry their offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    None,
    /// Object reference; `index` is 1-based into the oop array
    Oop { index: u32, immediate: bool },
    /// Class or method reference; `index` is 1-based into the metadata array
    Metadata { index: u32, immediate: bool },
    ExternalWord,
    RuntimeCall,
    Poll { uses_page: bool },
    PollReturn { uses_page: bool },
    VirtualCall { cached_value_offset: u32 },
    OptVirtualCall,
    StaticCall,
    /// Out-of-line stub of a static call with its metadata and jump slots
    StaticStub { metadata_offset: u32, jump_offset: u32 },
    InternalWord,
    SectionWord,
}

impl RelocKind {
    fn code(self) -> u16 {
        match self {
            RelocKind::None => 0,
            RelocKind::Oop { .. } => 1,
            RelocKind::Metadata { .. } => 2,
            RelocKind::ExternalWord => 3,
            RelocKind::RuntimeCall => 4,
            RelocKind::Poll { .. } => 5,
            RelocKind::PollReturn { .. } => 6,
            RelocKind::VirtualCall { .. } => 7,
            RelocKind::OptVirtualCall => 8,
            RelocKind::StaticCall => 9,
            RelocKind::StaticStub { .. } => 10,
            RelocKind::InternalWord => 11,
            RelocKind::SectionWord => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RelocKind::None => "none",
            RelocKind::Oop { .. } => "oop",
            RelocKind::Metadata { .. } => "metadata",
            RelocKind::ExternalWord => "external_word",
            RelocKind::RuntimeCall => "runtime_call",
            RelocKind::Poll { .. } => "poll",
            RelocKind::PollReturn { .. } => "poll_return",
            RelocKind::VirtualCall { .. } => "virtual_call",
            RelocKind::OptVirtualCall => "opt_virtual_call",
            RelocKind::StaticCall => "static_call",
            RelocKind::StaticStub { .. } => "static_stub",
            RelocKind::InternalWord => "internal_word",
            RelocKind::SectionWord => "section_word",
        }
    }
}

/// One patch site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the slot from the start of the code
    pub offset: u32,
    pub kind: RelocKind,
}

impl Relocation {
    pub fn new(offset: u32, kind: RelocKind) -> Self {
        Self { offset, kind }
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        let (flags, a, b) = match self.kind {
            RelocKind::Oop { index, immediate } | RelocKind::Metadata { index, immediate } => {
                (immediate as u16, index, 0)
            }
            RelocKind::Poll { uses_page } | RelocKind::PollReturn { uses_page } => (uses_page as u16, 0, 0),
            RelocKind::VirtualCall { cached_value_offset } => (0, cached_value_offset, 0),
            RelocKind::StaticStub {
                metadata_offset,
                jump_offset,
            } => (0, metadata_offset, jump_offset),
            _ => (0, 0, 0),
        };
        w.put_u32(self.offset);
        w.put_u16(self.kind.code());
        w.put_u16(flags);
        w.put_u32(a);
        w.put_u32(b);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let offset = r.u32()?;
        let code = r.u16()?;
        let flags = r.u16()?;
        let a = r.u32()?;
        let b = r.u32()?;
        let flag = flags != 0;
        let kind = match code {
            0 => RelocKind::None,
            1 => RelocKind::Oop {
                index: a,
                immediate: flag,
            },
            2 => RelocKind::Metadata {
                index: a,
                immediate: flag,
            },
            3 => RelocKind::ExternalWord,
            4 => RelocKind::RuntimeCall,
            5 => RelocKind::Poll { uses_page: flag },
            6 => RelocKind::PollReturn { uses_page: flag },
            7 => RelocKind::VirtualCall {
                cached_value_offset: a,
            },
            8 => RelocKind::OptVirtualCall,
            9 => RelocKind::StaticCall,
            10 => RelocKind::StaticStub {
                metadata_offset: a,
                jump_offset: b,
            },
            11 => RelocKind::InternalWord,
            12 => RelocKind::SectionWord,
            other => {
                return Err(Error::corruption(format!(
                    "relocation kind {} at offset {} out of range",
                    other, offset
                )))
            }
        };
        Ok(Self { offset, kind })
    }
}

/// GC stack map at one safepoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    pub pc_offset: u32,
    pub omv_count: u32,
    /// Compressed oop-map values, opaque to the cache
    pub data: Vec<u8>,
}

/// One compiled method
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMethod {
    pub method: MethodHandle,
    pub code: Vec<u8>,
    /// Address the code is (or will be) installed at
    pub base_address: u64,
    pub entry_offset: u32,
    pub verified_entry_offset: u32,
    pub relocations: Vec<Relocation>,
    /// Oop array; `None` is a null entry
    pub oops: Vec<Option<ObjectRef>>,
    /// Metadata array; `None` is a null entry
    pub metadata: Vec<Option<MetaRef>>,
    pub oop_maps: Vec<OopMap>,
    pub dependencies: Vec<DependencyRecord>,
    pub opt_records: Vec<OptRecord>,
    pub comp_level: u32,
    pub is_osr: bool,
    /// Compiled against a mutable call site target
    pub has_call_site_target: bool,
}

impl CompiledMethod {
    pub fn new(method: MethodHandle, base_address: u64) -> Self {
        Self {
            method,
            code: Vec::new(),
            base_address,
            entry_offset: 0,
            verified_entry_offset: 0,
            relocations: Vec::new(),
            oops: Vec::new(),
            metadata: Vec::new(),
            oop_maps: Vec::new(),
            dependencies: Vec::new(),
            opt_records: Vec::new(),
            comp_level: OPTIMIZING_LEVEL,
            is_osr: false,
            has_call_site_target: false,
        }
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }
}

/// Builds a [`CompiledMethod`] whose patch slots hold the addresses the
/// given environment reports, the way a code generator would.
pub struct CodeAssembler<'a> {
    env: &'a dyn RuntimeEnv,
    nm: CompiledMethod,
}

impl<'a> CodeAssembler<'a> {
    pub fn new(env: &'a dyn RuntimeEnv, method: MethodHandle) -> Self {
        let base = env.install_address(method);
        Self {
            env,
            nm: CompiledMethod::new(method, base),
        }
    }

    pub fn offset(&self) -> u32 {
        self.nm.code.len() as u32
    }

    /// Append plain instruction bytes
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.nm.code.extend_from_slice(bytes);
        self
    }

    pub fn nops(&mut self, count: usize) -> &mut Self {
        self.nm.code.resize(self.nm.code.len() + count, 0x90);
        self
    }

    pub fn set_entries(&mut self, entry: u32, verified_entry: u32) -> &mut Self {
        self.nm.entry_offset = entry;
        self.nm.verified_entry_offset = verified_entry;
        self
    }

    fn slot(&mut self, value: u64) -> u32 {
        let at = self.offset();
        self.nm.code.extend_from_slice(&value.to_le_bytes());
        at
    }

    fn reloc(&mut self, value: u64, kind: RelocKind) -> u32 {
        let at = self.slot(value);
        self.nm.relocations.push(Relocation::new(at, kind));
        at
    }

    /// Add an oop array entry without a patch site; returns its 1-based index
    pub fn add_oop(&mut self, obj: Option<ObjectRef>) -> u32 {
        self.nm.oops.push(obj);
        self.nm.oops.len() as u32
    }

    /// Add a metadata array entry without a patch site; returns its 1-based index
    pub fn add_metadata(&mut self, meta: Option<MetaRef>) -> u32 {
        if let Some(existing) = self.nm.metadata.iter().position(|m| *m == meta) {
            return existing as u32 + 1;
        }
        self.nm.metadata.push(meta);
        self.nm.metadata.len() as u32
    }

    pub fn oop(&mut self, obj: ObjectRef, immediate: bool) -> &mut Self {
        let addr = self.env.object_address(&obj);
        let index = self.add_oop(Some(obj));
        self.reloc(addr, RelocKind::Oop { index, immediate });
        self
    }

    pub fn metadata(&mut self, meta: MetaRef, immediate: bool) -> &mut Self {
        let addr = self.env.metadata_address(meta);
        let index = self.add_metadata(Some(meta));
        self.reloc(addr, RelocKind::Metadata { index, immediate });
        self
    }

    pub fn runtime_call(&mut self, kind: VmGlobalKind) -> Result<&mut Self> {
        let addr = self.env.globals().address_of(kind, 0)?;
        self.reloc(addr, RelocKind::RuntimeCall);
        Ok(self)
    }

    /// Runtime call to an arbitrary address
    pub fn runtime_call_to(&mut self, addr: u64) -> &mut Self {
        self.reloc(addr, RelocKind::RuntimeCall);
        self
    }

    pub fn external_word(&mut self, kind: VmGlobalKind, offset: u32) -> Result<&mut Self> {
        let addr = self.env.globals().address_of(kind, offset)?;
        self.reloc(addr, RelocKind::ExternalWord);
        Ok(self)
    }

    pub fn poll(&mut self, uses_page: bool) -> Result<&mut Self> {
        let addr = self.poll_value(uses_page)?;
        self.reloc(addr, RelocKind::Poll { uses_page });
        Ok(self)
    }

    pub fn poll_return(&mut self, uses_page: bool) -> Result<&mut Self> {
        let addr = self.poll_value(uses_page)?;
        self.reloc(addr, RelocKind::PollReturn { uses_page });
        Ok(self)
    }

    fn poll_value(&self, uses_page: bool) -> Result<u64> {
        if uses_page {
            self.env.globals().address_of(VmGlobalKind::PollingPage, 0)
        } else {
            Ok(0)
        }
    }

    /// Inline-cached virtual call: a cached-value slot followed by the call
    pub fn virtual_call(&mut self) -> Result<&mut Self> {
        let target = self.env.globals().address_of(VmGlobalKind::ResolveVirtualCall, 0)?;
        let cached_value_offset = self.slot(NON_OOP_WORD);
        self.reloc(target, RelocKind::VirtualCall { cached_value_offset });
        Ok(self)
    }

    pub fn opt_virtual_call(&mut self) -> Result<&mut Self> {
        let target = self.env.globals().address_of(VmGlobalKind::ResolveOptVirtualCall, 0)?;
        self.reloc(target, RelocKind::OptVirtualCall);
        Ok(self)
    }

    pub fn static_call(&mut self) -> Result<&mut Self> {
        let target = self.env.globals().address_of(VmGlobalKind::ResolveStaticCall, 0)?;
        self.reloc(target, RelocKind::StaticCall);
        Ok(self)
    }

    /// Unresolved static call stub; its jump slot points at itself
    pub fn static_stub(&mut self) -> &mut Self {
        let at = self.offset();
        let metadata_offset = self.slot(0);
        let jump_offset = self.slot(self.nm.base_address + at as u64 + 8);
        self.nm.relocations.push(Relocation::new(
            at,
            RelocKind::StaticStub {
                metadata_offset,
                jump_offset,
            },
        ));
        self
    }

    /// Absolute address of `target` within this method's code
    pub fn internal_word(&mut self, target: u32) -> &mut Self {
        let addr = self.nm.base_address + target as u64;
        self.reloc(addr, RelocKind::InternalWord);
        self
    }

    pub fn section_word(&mut self, target: u32) -> &mut Self {
        let addr = self.nm.base_address + target as u64;
        self.reloc(addr, RelocKind::SectionWord);
        self
    }

    pub fn oop_map(&mut self, omv_count: u32, data: &[u8]) -> &mut Self {
        let pc_offset = self.offset();
        self.nm.oop_maps.push(OopMap {
            pc_offset,
            omv_count,
            data: data.to_vec(),
        });
        self
    }

    /// Record a dependency over live metadata; arguments are added to the
    /// metadata array
    pub fn dependency(&mut self, dep_type: crate::records::DepType, args: &[MetaRef]) -> &mut Self {
        let args = args.iter().map(|m| self.add_metadata(Some(*m))).collect();
        self.nm.dependencies.push(DependencyRecord::new(dep_type, args));
        self
    }

    /// Record an opt record whose indices were obtained from [`Self::meta_index`]
    pub fn opt(&mut self, record: OptRecord) -> &mut Self {
        crate::records::insert_unique(&mut self.nm.opt_records, record);
        self
    }

    /// 1-based metadata index of `meta`, adding it if needed
    pub fn meta_index(&mut self, meta: MetaRef) -> u32 {
        self.add_metadata(Some(meta))
    }

    pub fn osr(&mut self, is_osr: bool) -> &mut Self {
        self.nm.is_osr = is_osr;
        self
    }

    pub fn comp_level(&mut self, level: u32) -> &mut Self {
        self.nm.comp_level = level;
        self
    }

    pub fn call_site_target(&mut self, value: bool) -> &mut Self {
        self.nm.has_call_site_target = value;
        self
    }

    pub fn finish(self) -> CompiledMethod {
        self.nm
    }
}

/// Patch a slot of a compiled method; used by revive and by tests that
/// perturb code
pub fn patch_slot(nm: &mut CompiledMethod, offset: u32, value: u64) -> Result<()> {
    write_slot(&mut nm.code, offset as usize, value)
}
