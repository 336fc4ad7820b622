//! Byte-level building blocks for the cache file format
//!
//! Everything on disk is little-endian and 8-byte aligned. Readers never see
//! raw pointers: a [`ByteView`] owns (or maps) the bytes, and every typed
//! access goes through a bounds-checked accessor that returns
//! [`Error::Format`](crate::Error::Format) on a short read.

mod hash;

pub use hash::stable_hash32;

use crate::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;

/// Alignment of every section and record in a cache file
pub const ALIGNMENT: usize = 8;

/// Round `value` up to the next multiple of [`ALIGNMENT`]
pub const fn align_up(value: usize) -> usize {
    (value + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

pub const fn is_aligned(value: usize) -> bool {
    value & (ALIGNMENT - 1) == 0
}

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

/// Read-only bytes of a cache file, either owned or memory-mapped
pub struct ByteView {
    backing: Backing,
}

impl ByteView {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(bytes),
        }
    }

    /// Map a file read-only
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::InternalError(format!("Failed to open cache file {}: {}", path.display(), e))
        })?;
        // SAFETY: the map is read-only and cache files are never rewritten in place.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            Error::InternalError(format!("Failed to map cache file {}: {}", path.display(), e))
        })?;
        Ok(Self {
            backing: Backing::Mapped(map),
        })
    }

    /// Read a whole file into memory
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::InternalError(format!("Failed to read cache file {}: {}", path.display(), e))
        })?;
        Ok(Self::from_vec(bytes))
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }
}

impl Deref for ByteView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteView")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Bounds-checked sub-slice
pub fn slice_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::truncated(offset, len, buf.len()))?;
    buf.get(offset..end)
        .ok_or_else(|| Error::truncated(offset, len, buf.len()))
}

fn array_at<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let bytes = slice_at(buf, offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

pub fn read_u8(buf: &[u8], offset: usize) -> Result<u8> {
    Ok(array_at::<1>(buf, offset)?[0])
}

pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    array_at(buf, offset).map(u16::from_le_bytes)
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    array_at(buf, offset).map(u32::from_le_bytes)
}

pub fn read_i32(buf: &[u8], offset: usize) -> Result<i32> {
    array_at(buf, offset).map(i32::from_le_bytes)
}

pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    array_at(buf, offset).map(u64::from_le_bytes)
}

pub fn read_i64(buf: &[u8], offset: usize) -> Result<i64> {
    array_at(buf, offset).map(i64::from_le_bytes)
}

/// Read a NUL-terminated UTF-8 string; returns the string and the number of
/// bytes consumed including the terminator
pub fn read_cstr(buf: &[u8], offset: usize) -> Result<(&str, usize)> {
    let rest = buf
        .get(offset..)
        .ok_or_else(|| Error::truncated(offset, 1, buf.len()))?;
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::truncated(offset, rest.len() + 1, buf.len()))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|e| Error::corruption(format!("invalid string at offset {}: {}", offset, e)))?;
    Ok((s, nul + 1))
}

/// Sequential reader over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn u16(&mut self) -> Result<u16> {
        let v = read_u16(self.buf, self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let v = read_u32(self.buf, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub fn i32(&mut self) -> Result<i32> {
        let v = read_i32(self.buf, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let v = read_u64(self.buf, self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn i64(&mut self) -> Result<i64> {
        let v = read_i64(self.buf, self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let v = slice_at(self.buf, self.pos, len)?;
        self.pos += len;
        Ok(v)
    }

    pub fn cstr(&mut self) -> Result<&'a str> {
        let (s, used) = read_cstr(self.buf, self.pos)?;
        self.pos += used;
        Ok(s)
    }

    /// Skip padding up to the next aligned position
    pub fn align(&mut self) {
        self.pos = align_up(self.pos);
    }
}

/// Growable little-endian output buffer
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a string followed by a NUL terminator
    pub fn put_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Zero-pad to the next aligned length
    pub fn align(&mut self) {
        let aligned = align_up(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Reserve `len` zero bytes and return their offset
    pub fn reserve(&mut self, len: usize) -> usize {
        let at = self.buf.len();
        self.buf.resize(at + len, 0);
        at
    }

    pub fn patch_u32(&mut self, offset: usize, v: u32) -> Result<()> {
        self.patch(offset, &v.to_le_bytes())
    }

    pub fn patch_i32(&mut self, offset: usize, v: i32) -> Result<()> {
        self.patch(offset, &v.to_le_bytes())
    }

    pub fn patch_u64(&mut self, offset: usize, v: u64) -> Result<()> {
        self.patch(offset, &v.to_le_bytes())
    }

    fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let len = self.buf.len();
        let dst = self
            .buf
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| Error::internal(format!("patch at {} past end {}", offset, len)))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

/// Read the 8-byte patch slot at `offset` in `code`
pub fn read_slot(code: &[u8], offset: usize) -> Result<u64> {
    read_u64(code, offset)
        .map_err(|_| Error::corruption(format!("patch slot {} outside code of {} bytes", offset, code.len())))
}

/// Overwrite the 8-byte patch slot at `offset` in `code`
pub fn write_slot(code: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let len = code.len();
    let slot = code
        .get_mut(offset..offset + 8)
        .ok_or_else(|| Error::corruption(format!("patch slot {} outside code of {} bytes", offset, len)))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}
