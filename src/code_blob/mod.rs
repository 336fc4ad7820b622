//! Serialized form of one compiled method
//!
//! | Section | Contents |
//! |---------|----------|
//! | header | [`BlobHeader`], 88 bytes |
//! | code | raw instruction bytes as saved |
//! | relocations | 16 bytes per patch site |
//! | deps / opts | bincode record lists |
//! | aux meta / aux oop | tag streams rebuilding the data arrays |
//! | aux reloc | tag stream rebuilding the patch sites |
//! | oop maps | stack map set |
//!
//! All section offsets are relative to the start of the blob and aligned
//! to 8. Versions of the same method are chained through
//! `next_version_offset`, an offset into the code space (-1 ends the chain).

pub mod aux_info;
mod emit;
pub mod oop_map;
pub mod passes;
mod revive;

pub use aux_info::{AuxReader, AuxRecord, AuxTag};
pub use emit::{emit, estimate_aux_size, BlobSizes, EmittedBlob};
pub use revive::{
    pre_revive, pre_revive_relocs, revive, revive_meta_array, revive_oop_array, PreRevived, ReviveContext, ReviveStage,
    ReviveValue,
};

use crate::format::{is_aligned, read_i32, read_u32, slice_at, ByteReader};
use crate::records::{decode_records, DependencyRecord, OptRecord};
use crate::vm::{OopMap, Relocation, RELOCATION_SIZE};
use crate::{Error, Result};
use std::fmt::Write as _;

/// Size of the encoded header
pub const HEADER_SIZE: usize = 88;

/// Byte offset of `next_version_offset` inside the header
pub const NEXT_VERSION_FIELD: usize = 80;

/// Fixed header in front of every blob
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobHeader {
    pub size: u32,
    pub code_size: u32,
    pub entry_offset: u32,
    pub verified_entry_offset: u32,
    pub reloc_begin: u32,
    pub reloc_count: u32,
    pub deps_begin: u32,
    pub deps_size: u32,
    pub opts_begin: u32,
    pub opts_size: u32,
    pub oop_count: u32,
    pub meta_count: u32,
    pub aux_meta_begin: u32,
    pub aux_meta_size: u32,
    pub aux_oop_begin: u32,
    pub aux_oop_size: u32,
    pub aux_reloc_begin: u32,
    pub aux_reloc_size: u32,
    pub oop_map_begin: u32,
    pub oop_map_size: u32,
    pub next_version_offset: i32,
    /// Metaspace index of the compiled method
    pub method_index: u32,
}

impl BlobHeader {
    fn fields(&self) -> [u32; 20] {
        [
            self.size,
            self.code_size,
            self.entry_offset,
            self.verified_entry_offset,
            self.reloc_begin,
            self.reloc_count,
            self.deps_begin,
            self.deps_size,
            self.opts_begin,
            self.opts_size,
            self.oop_count,
            self.meta_count,
            self.aux_meta_begin,
            self.aux_meta_size,
            self.aux_oop_begin,
            self.aux_oop_size,
            self.aux_reloc_begin,
            self.aux_reloc_size,
            self.oop_map_begin,
            self.oop_map_size,
        ]
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        for (i, v) in self.fields().iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out[NEXT_VERSION_FIELD..NEXT_VERSION_FIELD + 4].copy_from_slice(&self.next_version_offset.to_le_bytes());
        out[84..88].copy_from_slice(&self.method_index.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let mut f = [0u32; 20];
        for v in f.iter_mut() {
            *v = r.u32()?;
        }
        Ok(Self {
            size: f[0],
            code_size: f[1],
            entry_offset: f[2],
            verified_entry_offset: f[3],
            reloc_begin: f[4],
            reloc_count: f[5],
            deps_begin: f[6],
            deps_size: f[7],
            opts_begin: f[8],
            opts_size: f[9],
            oop_count: f[10],
            meta_count: f[11],
            aux_meta_begin: f[12],
            aux_meta_size: f[13],
            aux_oop_begin: f[14],
            aux_oop_size: f[15],
            aux_reloc_begin: f[16],
            aux_reloc_size: f[17],
            oop_map_begin: f[18],
            oop_map_size: f[19],
            next_version_offset: r.i32()?,
            method_index: r.u32()?,
        })
    }

    fn sections(&self) -> [(&'static str, u32, u32); 8] {
        [
            ("code", HEADER_SIZE as u32, self.code_size),
            ("relocations", self.reloc_begin, self.reloc_count.saturating_mul(RELOCATION_SIZE as u32)),
            ("dependencies", self.deps_begin, self.deps_size),
            ("opt records", self.opts_begin, self.opts_size),
            ("aux meta", self.aux_meta_begin, self.aux_meta_size),
            ("aux oop", self.aux_oop_begin, self.aux_oop_size),
            ("aux reloc", self.aux_reloc_begin, self.aux_reloc_size),
            ("oop maps", self.oop_map_begin, self.oop_map_size),
        ]
    }
}

/// Bounds-checked view of one blob inside a code space
#[derive(Debug, Clone, Copy)]
pub struct CodeBlob<'a> {
    bytes: &'a [u8],
    header: BlobHeader,
    offset: u32,
}

impl<'a> CodeBlob<'a> {
    /// View the blob starting at `offset` of `space`
    pub fn parse(space: &'a [u8], offset: u32) -> Result<Self> {
        let at = offset as usize;
        if !is_aligned(at) {
            return Err(Error::corruption(format!("code blob offset {} is misaligned", at)));
        }
        let head = slice_at(space, at, HEADER_SIZE)
            .map_err(|_| Error::corruption(format!("code blob header at {} runs past the code space", at)))?;
        let header = BlobHeader::decode(head)?;
        let size = header.size as usize;
        let bytes = slice_at(space, at, size).map_err(|_| {
            Error::corruption(format!("code blob at {} with size {} runs past the code space", at, size))
        })?;
        if size < HEADER_SIZE {
            return Err(Error::corruption(format!("code blob at {} has size {}", at, size)));
        }
        for (name, begin, len) in header.sections() {
            let end = begin as u64 + len as u64;
            if (begin as usize) < HEADER_SIZE || end > size as u64 || !is_aligned(begin as usize) {
                return Err(Error::corruption(format!(
                    "{} section [{}, {}) of code blob at {} is outside [{}, {})",
                    name, begin, end, at, HEADER_SIZE, size
                )));
            }
        }
        Ok(Self {
            bytes,
            header,
            offset,
        })
    }

    pub fn header(&self) -> &BlobHeader {
        &self.header
    }

    /// Offset of the blob in its code space
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn method_index(&self) -> u32 {
        self.header.method_index
    }

    pub fn next_version(&self) -> Option<u32> {
        let next = self.header.next_version_offset;
        (next >= 0).then_some(next as u32)
    }

    fn section(&self, begin: u32, len: u32) -> &'a [u8] {
        // Bounds were checked in parse
        &self.bytes[begin as usize..(begin + len) as usize]
    }

    pub fn code(&self) -> &'a [u8] {
        self.section(HEADER_SIZE as u32, self.header.code_size)
    }

    pub fn relocations(&self) -> Result<Vec<Relocation>> {
        let bytes = self.section(
            self.header.reloc_begin,
            self.header.reloc_count * RELOCATION_SIZE as u32,
        );
        let mut r = ByteReader::new(bytes);
        (0..self.header.reloc_count)
            .map(|_| Relocation::decode(&mut r))
            .collect()
    }

    pub fn dependencies(&self) -> Result<Vec<DependencyRecord>> {
        decode_records(self.section(self.header.deps_begin, self.header.deps_size))
    }

    pub fn opt_records(&self) -> Result<Vec<OptRecord>> {
        decode_records(self.section(self.header.opts_begin, self.header.opts_size))
    }

    pub fn aux_meta(&self) -> &'a [u8] {
        self.section(self.header.aux_meta_begin, self.header.aux_meta_size)
    }

    pub fn aux_oop(&self) -> &'a [u8] {
        self.section(self.header.aux_oop_begin, self.header.aux_oop_size)
    }

    pub fn aux_reloc(&self) -> &'a [u8] {
        self.section(self.header.aux_reloc_begin, self.header.aux_reloc_size)
    }

    pub fn oop_maps(&self) -> Result<Vec<OopMap>> {
        oop_map::decode(self.section(self.header.oop_map_begin, self.header.oop_map_size))
    }

    /// Listing of the header and all tag streams
    pub fn print(&self, name: &dyn Fn(u32) -> String) -> String {
        let h = &self.header;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "    CodeBlob @{} {} size={} code={} relocs={} oops={} metas={} next={}",
            self.offset,
            name(h.method_index),
            h.size,
            h.code_size,
            h.reloc_count,
            h.oop_count,
            h.meta_count,
            h.next_version_offset
        );
        for (label, stream) in [
            ("meta array", self.aux_meta()),
            ("oop array", self.aux_oop()),
            ("relocations", self.aux_reloc()),
        ] {
            let _ = writeln!(out, "      {}:", label);
            out.push_str(&passes::print_stream(stream, name, "        "));
        }
        out
    }
}

/// Read the chain link stored in the header of the blob at `offset`
pub fn next_version_at(space: &[u8], offset: u32) -> Result<Option<u32>> {
    let next = read_i32(space, offset as usize + NEXT_VERSION_FIELD)?;
    Ok((next >= 0).then_some(next as u32))
}

/// Size field of the blob at `offset`
pub fn size_at(space: &[u8], offset: u32) -> Result<u32> {
    read_u32(space, offset as usize)
}
