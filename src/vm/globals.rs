//! Table of runtime addresses that compiled code may reference
//!
//! Saved code never stores a raw address of a runtime routine or global.
//! Instead the emitter asks [`VmGlobals::find_by_address`] for the
//! `(kind, offset)` pair covering the address, and the reviver asks
//! [`VmGlobals::address_of`] to turn it back into an address of the
//! current process.

use crate::{Error, Result};
use std::fmt;

macro_rules! vm_global_kinds {
    ($($variant:ident => $name:literal,)*) => {
        /// One registered runtime address
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum VmGlobalKind {
            $($variant,)*
        }

        impl VmGlobalKind {
            pub const ALL: &'static [VmGlobalKind] = &[$(VmGlobalKind::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(VmGlobalKind::$variant => $name,)*
                }
            }
        }
    };
}

vm_global_kinds! {
    // os
    PollingPage => "os::polling_page",
    JavaTimeMillis => "os::javaTimeMillis",
    JavaTimeNanos => "os::javaTimeNanos",
    BreakPoint => "os::break_point",
    // heap
    CardTableBase => "heap::card_table_base",
    HeapTopAddr => "heap::top_addr",
    HeapEndAddr => "heap::end_addr",
    // universe
    NarrowPtrsBaseAddr => "universe::narrow_ptrs_base_addr",
    // optimizing compiler runtime
    ExceptionBlob => "opto::exception_blob",
    NewInstance => "opto::new_instance_Java",
    NewArray => "opto::new_array_Java",
    NewArrayNozero => "opto::new_array_nozero_Java",
    MultiANewArray2 => "opto::multianewarray2_Java",
    MultiANewArray3 => "opto::multianewarray3_Java",
    MultiANewArray4 => "opto::multianewarray4_Java",
    MultiANewArray5 => "opto::multianewarray5_Java",
    MultiANewArrayN => "opto::multianewarrayN_Java",
    G1WbPre => "opto::g1_wb_pre_Java",
    G1WbPost => "opto::g1_wb_post_Java",
    CompleteMonitorLocking => "opto::complete_monitor_locking_Java",
    Rethrow => "opto::rethrow_Java",
    SlowArraycopy => "opto::slow_arraycopy_Java",
    RegisterFinalizer => "opto::register_finalizer_Java",
    // shared runtime
    SharedG1WbPre => "sr::g1_wb_pre",
    SharedG1WbPost => "sr::g1_wb_post",
    DeoptBlobUnpack => "sr::deopt_blob_unpack",
    IcMissBlob => "sr::ic_miss_blob",
    UncommonTrapBlob => "sr::uncommon_trap_blob",
    CompleteMonitorUnlocking => "sr::complete_monitor_unlocking_C",
    Dsin => "sr::dsin",
    Dcos => "sr::dcos",
    Dtan => "sr::dtan",
    Dlog => "sr::dlog",
    Dlog10 => "sr::dlog10",
    Dexp => "sr::dexp",
    Dpow => "sr::dpow",
    ResolveVirtualCall => "sr::resolve_virtual_call_stub",
    ResolveOptVirtualCall => "sr::resolve_opt_virtual_call_stub",
    ResolveStaticCall => "sr::resolve_static_call_stub",
    // stub routines
    ForwardExceptionEntry => "stub::forward_exception_entry",
    CatchExceptionEntry => "stub::catch_exception_entry",
    ThrowAbstractMethodError => "stub::throw_AbstractMethodError_entry",
    ThrowIncompatibleClassChangeError => "stub::throw_IncompatibleClassChangeError_entry",
    ThrowNullPointerExceptionAtCall => "stub::throw_NullPointerException_at_call_entry",
    ThrowStackOverflowError => "stub::throw_StackOverflowError_entry",
    AtomicXchg => "stub::atomic_xchg_entry",
    AtomicCmpxchg => "stub::atomic_cmpxchg_entry",
    AtomicCmpxchgLong => "stub::atomic_cmpxchg_long_entry",
    AtomicAdd => "stub::atomic_add_entry",
    Fence => "stub::fence_entry",
    JbyteArraycopy => "stub::jbyte_arraycopy",
    JshortArraycopy => "stub::jshort_arraycopy",
    JintArraycopy => "stub::jint_arraycopy",
    JlongArraycopy => "stub::jlong_arraycopy",
    OopArraycopy => "stub::oop_arraycopy",
    JbyteDisjointArraycopy => "stub::jbyte_disjoint_arraycopy",
    JintDisjointArraycopy => "stub::jint_disjoint_arraycopy",
    JlongDisjointArraycopy => "stub::jlong_disjoint_arraycopy",
    OopDisjointArraycopy => "stub::oop_disjoint_arraycopy",
    CheckcastArraycopy => "stub::checkcast_arraycopy",
    UnsafeArraycopy => "stub::unsafe_arraycopy",
    GenericArraycopy => "stub::generic_arraycopy",
    JbyteFill => "stub::jbyte_fill",
    JshortFill => "stub::jshort_fill",
    JintFill => "stub::jint_fill",
    ZeroAlignedWords => "stub::zero_aligned_words",
    AesEncryptBlock => "stub::aescrypt_encryptBlock",
    AesDecryptBlock => "stub::aescrypt_decryptBlock",
    GhashProcessBlocks => "stub::ghash_processBlocks",
    Sha1ImplCompress => "stub::sha1_implCompress",
    Sha256ImplCompress => "stub::sha256_implCompress",
    Sha512ImplCompress => "stub::sha512_implCompress",
    UpdateBytesCrc32 => "stub::updateBytesCRC32",
    CrcTableAddr => "stub::crc_table_addr",
    MultiplyToLen => "stub::multiplyToLen",
    SquareToLen => "stub::squareToLen",
    MulAdd => "stub::mulAdd",
    MontgomeryMultiply => "stub::montgomeryMultiply",
    MontgomerySquare => "stub::montgomerySquare",
}

impl VmGlobalKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for VmGlobalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: u64,
    end: u64,
}

/// Per-process table of registered runtime addresses
#[derive(Debug, Clone)]
pub struct VmGlobals {
    table: Vec<Option<Entry>>,
}

impl Default for VmGlobals {
    fn default() -> Self {
        Self::new()
    }
}

impl VmGlobals {
    pub fn new() -> Self {
        Self {
            table: vec![None; VmGlobalKind::ALL.len()],
        }
    }

    /// Register a single-word global
    pub fn register(&mut self, kind: VmGlobalKind, addr: u64) {
        self.register_range(kind, addr, 8);
    }

    /// Register a global spanning `size` bytes (tables, arrays)
    pub fn register_range(&mut self, kind: VmGlobalKind, addr: u64, size: u64) {
        self.table[kind as usize] = Some(Entry {
            addr,
            end: addr.saturating_add(size.max(1)),
        });
    }

    pub fn is_registered(&self, kind: VmGlobalKind) -> bool {
        self.table[kind as usize].is_some()
    }

    /// Kind and offset of the registered range containing `addr`
    pub fn find_by_address(&self, addr: u64) -> Option<(VmGlobalKind, u32)> {
        self.table.iter().enumerate().find_map(|(i, e)| {
            let e = e.as_ref()?;
            if addr >= e.addr && addr < e.end {
                Some((VmGlobalKind::ALL[i], (addr - e.addr) as u32))
            } else {
                None
            }
        })
    }

    /// Current address for `kind` plus `offset`
    pub fn address_of(&self, kind: VmGlobalKind, offset: u32) -> Result<u64> {
        let entry = self.table[kind as usize]
            .ok_or_else(|| Error::unresolved(format!("vm global {} not registered", kind)))?;
        let addr = entry.addr + offset as u64;
        if addr >= entry.end {
            return Err(Error::corruption(format!(
                "offset {} outside vm global {}",
                offset, kind
            )));
        }
        Ok(addr)
    }

    pub fn name(kind: VmGlobalKind) -> &'static str {
        kind.name()
    }

    /// Human readable listing of all registered entries
    pub fn print(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.table.iter().enumerate() {
            if let Some(e) = entry {
                out.push_str(&format!(
                    "{:4} {:<48} [{:#x}, {:#x})\n",
                    i,
                    VmGlobalKind::ALL[i].name(),
                    e.addr,
                    e.end
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_through_u16() {
        for kind in VmGlobalKind::ALL {
            assert_eq!(VmGlobalKind::from_u16(kind.as_u16()), Some(*kind));
        }
        assert_eq!(VmGlobalKind::from_u16(u16::MAX), None);
        assert_eq!(VmGlobalKind::PollingPage.as_u16(), 0);
    }

    #[test]
    fn test_find_with_offset() {
        let mut globals = VmGlobals::new();
        globals.register(VmGlobalKind::PollingPage, 0x7000);
        globals.register_range(VmGlobalKind::CrcTableAddr, 0x9000, 1024);

        assert_eq!(globals.find_by_address(0x7000), Some((VmGlobalKind::PollingPage, 0)));
        assert_eq!(globals.find_by_address(0x9010), Some((VmGlobalKind::CrcTableAddr, 0x10)));
        assert_eq!(globals.find_by_address(0x9400), None);
        assert_eq!(globals.address_of(VmGlobalKind::CrcTableAddr, 0x10).unwrap(), 0x9010);
    }

    #[test]
    fn test_unregistered_kind() {
        let globals = VmGlobals::new();
        assert!(globals.address_of(VmGlobalKind::Dsin, 0).unwrap_err().is_recoverable());
        assert!(globals.print().is_empty());
    }
}
