//! Passes over a tag stream
//!
//! A pass sees every record of a stream in order through [`AuxPass::visit`];
//! [`walk`] drives it and stops at the terminator.

use super::aux_info::{AuxReader, AuxRecord};
use crate::format::ByteWriter;
use crate::meta_space::MetaSpace;
use crate::vm::KnownObject;
use crate::{Error, Result};
use std::fmt::Write as _;

pub trait AuxPass {
    /// Called for each record; `at` is its byte position in the stream
    fn visit(&mut self, at: usize, record: &AuxRecord) -> Result<()>;
}

/// Run `pass` over every record before the terminator
pub fn walk(bytes: &[u8], pass: &mut dyn AuxPass) -> Result<()> {
    let mut reader = AuxReader::new(bytes);
    loop {
        let at = reader.position();
        match reader.next_record()? {
            AuxRecord::End => return Ok(()),
            record => pass.visit(at, &record)?,
        }
    }
}

struct Print<'a> {
    out: String,
    name: &'a dyn Fn(u32) -> String,
    indent: &'a str,
}

impl AuxPass for Print<'_> {
    fn visit(&mut self, at: usize, record: &AuxRecord) -> Result<()> {
        let _ = write!(self.out, "{}{:5}: {}", self.indent, at, record);
        if let Some(index) = record.meta_index() {
            let _ = write!(self.out, " ({})", (self.name)(index));
        }
        self.out.push('\n');
        Ok(())
    }
}

/// Listing of a stream, one record per line.
///
/// A malformed stream is listed up to the bad record, followed by the error.
pub fn print_stream(bytes: &[u8], name: &dyn Fn(u32) -> String, indent: &str) -> String {
    let mut pass = Print {
        out: String::new(),
        name,
        indent,
    };
    if let Err(e) = walk(bytes, &mut pass) {
        let _ = writeln!(pass.out, "{}<{}>", indent, e);
    }
    pass.out
}

#[derive(Default)]
struct MetaIndexes(Vec<u32>);

impl AuxPass for MetaIndexes {
    fn visit(&mut self, _at: usize, record: &AuxRecord) -> Result<()> {
        self.0.extend(record.meta_index());
        Ok(())
    }
}

/// Metaspace indices referenced by a stream, in stream order
pub fn collect_meta_indexes(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut pass = MetaIndexes::default();
    walk(bytes, &mut pass)?;
    Ok(pass.0)
}

#[derive(Default)]
struct GlobalOops(Vec<KnownObject>);

impl AuxPass for GlobalOops {
    fn visit(&mut self, _at: usize, record: &AuxRecord) -> Result<()> {
        if let AuxRecord::GlobalOop(known) = record {
            self.0.push(*known);
        }
        Ok(())
    }
}

/// Preallocated objects referenced by a stream
pub fn collect_global_oops(bytes: &[u8]) -> Result<Vec<KnownObject>> {
    let mut pass = GlobalOops::default();
    walk(bytes, &mut pass)?;
    Ok(pass.0)
}

struct Names<'a> {
    meta: &'a MetaSpace,
    out: Vec<String>,
}

impl AuxPass for Names<'_> {
    fn visit(&mut self, _at: usize, record: &AuxRecord) -> Result<()> {
        match record {
            AuxRecord::OopStr(s) => self.out.push(format!("{:?}", s)),
            AuxRecord::GlobalOop(known) => self.out.push(known.name().to_string()),
            AuxRecord::VmGlobal { kind, .. } => self.out.push(kind.name().to_string()),
            other => {
                if let Some(index) = other.meta_index() {
                    self.out.push(self.meta.key(index)?.name.to_string());
                }
            }
        }
        Ok(())
    }
}

/// Every named entity a stream refers to
pub fn collect_names(bytes: &[u8], meta: &MetaSpace) -> Result<Vec<String>> {
    let mut pass = Names { meta, out: Vec::new() };
    walk(bytes, &mut pass)?;
    Ok(pass.out)
}

struct CheckMetaResolve {
    meta_len: usize,
}

impl AuxPass for CheckMetaResolve {
    fn visit(&mut self, at: usize, record: &AuxRecord) -> Result<()> {
        match record.meta_index() {
            Some(index) if index as usize >= self.meta_len => Err(Error::corruption(format!(
                "{} at {} outside metaspace of {}",
                record, at, self.meta_len
            ))),
            _ => Ok(()),
        }
    }
}

/// Check that every metaspace index of a stream is in range
pub fn check_meta_resolve(bytes: &[u8], meta_len: usize) -> Result<()> {
    walk(bytes, &mut CheckMetaResolve { meta_len })
}

struct Rewrite<'a> {
    map: &'a dyn Fn(u32) -> Result<u32>,
    out: ByteWriter,
}

impl AuxPass for Rewrite<'_> {
    fn visit(&mut self, _at: usize, record: &AuxRecord) -> Result<()> {
        let mut record = record.clone();
        match &mut record {
            AuxRecord::KlassByName { meta_index, .. }
            | AuxRecord::MirrorByName { meta_index, .. }
            | AuxRecord::MethodByName { meta_index, .. } => *meta_index = (self.map)(*meta_index)?,
            _ => {}
        }
        record.encode(&mut self.out);
        Ok(())
    }
}

/// Copy of a stream with every metaspace index passed through `map`.
///
/// Record sizes do not depend on the index, so the copy has the same
/// length as the input.
pub fn rewrite_meta_indexes(bytes: &[u8], map: &dyn Fn(u32) -> Result<u32>) -> Result<Vec<u8>> {
    let mut pass = Rewrite {
        map,
        out: ByteWriter::with_capacity(bytes.len()),
    };
    walk(bytes, &mut pass)?;
    AuxRecord::End.encode(&mut pass.out);
    Ok(pass.out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::super::aux_info::{decode_stream, encode_stream};
    use super::*;
    use crate::vm::{InitState, LoaderType, VmGlobalKind};

    fn stream() -> Vec<u8> {
        encode_stream(&[
            AuxRecord::KlassByName {
                loader: LoaderType::App,
                meta_index: 0,
                min_state: InitState::FullyInitialized,
            },
            AuxRecord::GlobalOop(KnownObject::TheNullString),
            AuxRecord::OopStr("x".into()),
            AuxRecord::MethodByName {
                loader: LoaderType::Boot,
                meta_index: 2,
            },
            AuxRecord::VmGlobal {
                kind: VmGlobalKind::PollingPage,
                offset: 0,
            },
        ])
    }

    #[test]
    fn test_collect_passes() {
        let bytes = stream();
        assert_eq!(collect_meta_indexes(&bytes).unwrap(), vec![0, 2]);
        assert_eq!(collect_global_oops(&bytes).unwrap(), vec![KnownObject::TheNullString]);
    }

    #[test]
    fn test_check_meta_resolve() {
        let bytes = stream();
        assert!(check_meta_resolve(&bytes, 3).is_ok());
        assert!(check_meta_resolve(&bytes, 2).unwrap_err().is_corruption());
    }

    #[test]
    fn test_rewrite_keeps_layout() {
        let bytes = stream();
        let rewritten = rewrite_meta_indexes(&bytes, &|i| Ok(i + 10)).unwrap();
        assert_eq!(rewritten.len(), bytes.len());
        assert_eq!(collect_meta_indexes(&rewritten).unwrap(), vec![10, 12]);
        let records = decode_stream(&rewritten).unwrap();
        assert_eq!(records[2], AuxRecord::OopStr("x".into()));
    }

    #[test]
    fn test_print_lists_every_record() {
        let listing = print_stream(&stream(), &|i| format!("meta{}", i), "  ");
        assert_eq!(listing.lines().count(), 5);
        assert!(listing.contains("klass_by_name #0 app fully_initialized (meta0)"));
        assert!(listing.contains("vm_global os::polling_page+0"));
    }

    #[test]
    fn test_print_reports_bad_stream() {
        let listing = print_stream(&[1, 2, 3], &|i| i.to_string(), "");
        assert!(listing.contains("CorruptionError"), "{}", listing);
    }
}
