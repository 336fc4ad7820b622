//! Code captured under one fingerprint
//!
//! Layout, offsets relative to the container start:
//!
//! | Field | Size |
//! |-------|------|
//! | fingerprint offset, size | 2 × u32 |
//! | lookup table offset, size | 2 × u32 |
//! | code space offset, size | 2 × u32 |
//! | next container offset (absolute, 0 = none) | u64 |
//!
//! followed by the three sections, each aligned to 8.

use crate::code_space::{CodeSpace, Versions};
use crate::fingerprint::Fingerprint;
use crate::format::{align_up, slice_at, ByteView, ByteWriter};
use crate::lookup_table::{KeyMatch, Lookup, LookupTable};
use crate::meta_space::{MetaKey, MetaSpace};
use crate::vm::VmSettings;
use crate::{Error, Result};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

const HEADER_SIZE: usize = 32;

/// Outcome of looking a method up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviveStatus {
    Success,
    /// Present, but no version could be revived
    Fail,
    NotInCache,
    /// A method of the same name exists with another identity or loader
    FoundWithName,
}

impl ReviveStatus {
    pub const ALL: [ReviveStatus; 4] = [
        ReviveStatus::Success,
        ReviveStatus::Fail,
        ReviveStatus::NotInCache,
        ReviveStatus::FoundWithName,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReviveStatus::Success => "success",
            ReviveStatus::Fail => "fail",
            ReviveStatus::NotInCache => "not in cache",
            ReviveStatus::FoundWithName => "found with name",
        }
    }
}

impl fmt::Display for ReviveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct Container {
    fingerprint: Fingerprint,
    table: LookupTable,
    code: CodeSpace,
}

impl Container {
    /// Empty container sized for `expected` methods
    pub fn new(fingerprint: Fingerprint, expected: usize) -> Self {
        Self {
            fingerprint,
            table: LookupTable::new(expected),
            code: CodeSpace::new(),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    pub fn code_space(&self) -> &CodeSpace {
        &self.code
    }

    /// Number of methods with code
    pub fn method_count(&self) -> usize {
        self.table.len()
    }

    /// Append a version of the method at `meta_index` named `name`;
    /// returns the blob offset
    pub fn add_version(&mut self, meta_index: u32, name: &str, blob: &[u8]) -> Result<u32> {
        let entry = self.table.insert(meta_index, name)?;
        let head = self.table.code_offset(entry);
        let offset = self.code.append_version(head, blob)?;
        if head.is_none() {
            self.table.set_code_offset(entry, offset);
        }
        Ok(offset)
    }

    /// Find the method with `key`; on success also returns the offset of
    /// its first version
    pub fn find(&self, key: &MetaKey, meta: &MetaSpace) -> Result<(ReviveStatus, Option<u32>)> {
        let name = key.name.to_string();
        let compare = |index: u32| match meta.key(index) {
            Ok(candidate) if candidate == key => KeyMatch::Exact,
            Ok(candidate) if candidate.name == key.name => KeyMatch::NameOnly,
            _ => KeyMatch::Different,
        };
        Ok(match self.table.find(&name, &compare)? {
            Lookup::Found(entry) => match self.table.code_offset(entry) {
                Some(head) => (ReviveStatus::Success, Some(head)),
                None => (ReviveStatus::NotInCache, None),
            },
            Lookup::FoundWithName => (ReviveStatus::FoundWithName, None),
            Lookup::NotFound => (ReviveStatus::NotInCache, None),
        })
    }

    pub fn versions(&self, head: u32) -> Versions<'_> {
        self.code.versions(head)
    }

    /// (metaspace index, first version) of every method with code
    pub fn methods(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.table
            .iter()
            .filter_map(|(entry, index)| self.table.code_offset(entry).map(|head| (index, head)))
    }

    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE
            + align_up(self.fingerprint.encoded_size())
            + align_up(self.table.encoded_size())
            + align_up(self.code.len())
    }

    /// Append the container to `w`; `next` is the absolute offset of the
    /// following container, 0 for the last one
    pub fn encode(&self, w: &mut ByteWriter, next: u64) -> Result<()> {
        w.align();
        let start = w.len();
        let header = w.reserve(HEADER_SIZE);
        let section = |w: &mut ByteWriter, f: &dyn Fn(&mut ByteWriter)| {
            w.align();
            let begin = w.len();
            f(w);
            ((begin - start) as u32, (w.len() - begin) as u32)
        };
        let fp = section(w, &|w| self.fingerprint.encode(w));
        let table = section(w, &|w| self.table.encode(w));
        let code = section(w, &|w| w.put_bytes(self.code.as_bytes()));
        w.align();
        for (i, v) in [fp.0, fp.1, table.0, table.1, code.0, code.1].iter().enumerate() {
            w.patch_u32(header + i * 4, *v)?;
        }
        w.patch_u64(header + 24, next)
    }

    /// Decode the container at `offset` of `view`; returns it with the
    /// offset of the next container
    pub fn decode(view: &Arc<ByteView>, offset: usize) -> Result<(Self, Option<u64>)> {
        let head = slice_at(view, offset, HEADER_SIZE)?;
        let mut r = crate::format::ByteReader::new(head);
        let mut fields = [0u32; 6];
        for f in fields.iter_mut() {
            *f = r.u32()?;
        }
        let next = r.u64()?;
        let section = |begin: u32, len: u32| -> Result<(usize, usize)> {
            if (begin as usize) < HEADER_SIZE {
                return Err(Error::corruption(format!(
                    "container section at {} overlaps the container header",
                    begin
                )));
            }
            let start = offset + begin as usize;
            slice_at(view, start, len as usize)?;
            Ok((start, len as usize))
        };
        let (fp_at, fp_len) = section(fields[0], fields[1])?;
        let (table_at, table_len) = section(fields[2], fields[3])?;
        let (code_at, code_len) = section(fields[4], fields[5])?;
        let fingerprint = Fingerprint::decode(&view[fp_at..fp_at + fp_len])?;
        let table = LookupTable::decode(&view[table_at..table_at + table_len])?;
        let code = CodeSpace::shared(view.clone(), code_at, code_len)?;
        let next = match next {
            0 => None,
            n if n as usize <= offset => {
                return Err(Error::corruption(format!(
                    "container at {} links back to {}",
                    offset, n
                )))
            }
            n => Some(n),
        };
        Ok((
            Self {
                fingerprint,
                table,
                code,
            },
            next,
        ))
    }

    /// Listing of the fingerprint, the table and every version
    pub fn print(&self, meta: &MetaSpace, settings: Option<&VmSettings>) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "  Container: {} methods, {} bytes of code",
            self.method_count(),
            self.code.len()
        );
        let _ = writeln!(out, "  Fingerprint:");
        out.push_str(&self.fingerprint.print(settings));
        let name = |index: u32| meta.name(index);
        out.push_str(&self.table.print(&name));
        for (_, head) in self.methods() {
            for blob in self.versions(head) {
                match blob {
                    Ok(blob) => out.push_str(&blob.print(&name)),
                    Err(e) => {
                        let _ = writeln!(out, "    <{}>", e);
                        break;
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_blob::emit;
    use crate::vm::{ClassSpec, CodeAssembler, InMemoryVm, LoaderType, RuntimeEnv};

    fn sample() -> (InMemoryVm, MetaSpace, Container, MetaKey) {
        let mut vm = InMemoryVm::new();
        let k = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let m = vm.define_method(k, "run", "()V");
        let mut asm = CodeAssembler::new(&vm, m);
        asm.nops(16);
        let nm = asm.finish();

        let mut meta = MetaSpace::new();
        let blob = emit(&nm, &vm, &mut meta).unwrap();
        let key = meta.key(blob.method_index).unwrap().clone();
        let mut container = Container::new(Fingerprint::capture(&vm.settings()), 4);
        container
            .add_version(blob.method_index, &key.name.to_string(), &blob.bytes)
            .unwrap();
        container
            .add_version(blob.method_index, &key.name.to_string(), &blob.bytes)
            .unwrap();
        (vm, meta, container, key)
    }

    #[test]
    fn test_find_and_versions() {
        let (_vm, meta, container, key) = sample();
        let (status, head) = container.find(&key, &meta).unwrap();
        assert_eq!(status, ReviveStatus::Success);
        assert_eq!(container.code_space().version_count(head.unwrap()).unwrap(), 2);

        let other = MetaKey {
            identity: key.identity ^ 1,
            ..key.clone()
        };
        assert_eq!(container.find(&other, &meta).unwrap(), (ReviveStatus::FoundWithName, None));
    }

    #[test]
    fn test_encode_decode() {
        let (_vm, meta, container, key) = sample();
        let mut w = ByteWriter::new();
        w.put_u64(0);
        container.encode(&mut w, 0).unwrap();
        assert_eq!(w.len(), 8 + container.encoded_size());
        let view = Arc::new(ByteView::from_vec(w.into_inner()));
        let (loaded, next) = Container::decode(&view, 8).unwrap();
        assert_eq!(next, None);
        assert!(loaded.fingerprint().identical(container.fingerprint()));
        let (status, head) = loaded.find(&key, &meta).unwrap();
        assert_eq!(status, ReviveStatus::Success);
        assert_eq!(loaded.code_space().version_count(head.unwrap()).unwrap(), 2);
        assert!(loaded.print(&meta, None).contains("app/Main.run()V"));
    }
}
