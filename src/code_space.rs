//! Append-only store of code blobs
//!
//! Blobs are laid out back to back, each aligned to 8. Versions of one
//! method form a singly linked chain through the blob headers; the lookup
//! table points at the head.

use crate::code_blob::{next_version_at, CodeBlob, HEADER_SIZE, NEXT_VERSION_FIELD};
use crate::format::{align_up, ByteView};
use crate::{Error, Result};
use std::sync::Arc;

/// Window into a loaded cache file
#[derive(Debug, Clone)]
struct Window {
    view: Arc<ByteView>,
    start: usize,
    len: usize,
}

impl Window {
    fn bytes(&self) -> &[u8] {
        &self.view[self.start..self.start + self.len]
    }
}

/// Blobs are read from `window` until the first append copies them into
/// `owned`
#[derive(Debug, Clone, Default)]
pub struct CodeSpace {
    owned: Vec<u8>,
    window: Option<Window>,
}

impl CodeSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code space backed by `len` bytes of `view` starting at `start`
    pub fn shared(view: Arc<ByteView>, start: usize, len: usize) -> Result<Self> {
        crate::format::slice_at(&view, start, len)?;
        Ok(Self {
            owned: Vec::new(),
            window: Some(Window { view, start, len }),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.window {
            Some(window) => window.bytes(),
            None => &self.owned,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes_mut(&mut self) -> &mut Vec<u8> {
        if let Some(window) = self.window.take() {
            self.owned = window.bytes().to_vec();
        }
        &mut self.owned
    }

    /// Append one encoded blob; returns its offset
    pub fn append(&mut self, blob: &[u8]) -> Result<u32> {
        let offset = align_up(self.len());
        let end = offset + align_up(blob.len());
        if end > i32::MAX as usize {
            return Err(Error::internal(format!("code space would grow to {} bytes", end)));
        }
        let bytes = self.bytes_mut();
        bytes.resize(offset, 0);
        bytes.extend_from_slice(blob);
        bytes.resize(end, 0);
        Ok(offset as u32)
    }

    /// Append `blob` as the last version of the chain starting at `head`
    pub fn append_version(&mut self, head: Option<u32>, blob: &[u8]) -> Result<u32> {
        let tail = match head {
            Some(head) => Some(self.last_version(head)?),
            None => None,
        };
        let offset = self.append(blob)?;
        if let Some(tail) = tail {
            let at = tail as usize + NEXT_VERSION_FIELD;
            self.bytes_mut()[at..at + 4].copy_from_slice(&(offset as i32).to_le_bytes());
        }
        Ok(offset)
    }

    fn last_version(&self, head: u32) -> Result<u32> {
        let mut last = head;
        for blob in self.versions(head) {
            last = blob?.offset();
        }
        Ok(last)
    }

    pub fn blob(&self, offset: u32) -> Result<CodeBlob<'_>> {
        CodeBlob::parse(self.as_bytes(), offset)
    }

    /// All versions chained from `head`, in insertion order
    pub fn versions(&self, head: u32) -> Versions<'_> {
        Versions {
            space: self,
            next: Some(head),
            remaining: self.len() / HEADER_SIZE + 1,
        }
    }

    pub fn version_count(&self, head: u32) -> Result<usize> {
        self.versions(head).try_fold(0, |n, blob| blob.map(|_| n + 1))
    }

    /// Offset of the version following the one at `offset`
    pub fn next_version(&self, offset: u32) -> Result<Option<u32>> {
        next_version_at(self.as_bytes(), offset)
    }
}

/// Iterator over a version chain; a cycle or a bad link is corruption
pub struct Versions<'a> {
    space: &'a CodeSpace,
    next: Option<u32>,
    remaining: usize,
}

impl<'a> Iterator for Versions<'a> {
    type Item = Result<CodeBlob<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        if self.remaining == 0 {
            return Some(Err(Error::corruption(format!(
                "version chain through {} does not terminate",
                offset
            ))));
        }
        self.remaining -= 1;
        let blob = match self.space.blob(offset) {
            Ok(blob) => blob,
            Err(e) => return Some(Err(e)),
        };
        self.next = blob.next_version();
        Some(Ok(blob))
    }
}
