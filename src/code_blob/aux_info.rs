//! Tag stream describing how to rebuild each patch site
//!
//! A record is a `u16` tag, a `u16` loader (or padding), zero or more
//! `u32` operands and, for strings, a `u32` byte length followed by the
//! bytes. Every record starts and ends on an 8-byte boundary.

use crate::format::{align_up, is_aligned, ByteReader, ByteWriter};
use crate::vm::{InitState, KnownObject, LoaderType, VmGlobalKind};
use crate::{Error, Result};
use std::fmt;

/// On-disk tag values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AuxTag {
    Invalid = 0,
    VmGlobal = 1,
    OopStr = 2,
    OopClassloader = 3,
    GlobalOop = 4,
    /// Reserved; never written
    MetaMethodData = 5,
    MetaSelfMethod = 6,
    InternalWord = 7,
    KlassByName = 8,
    MirrorByName = 9,
    MethodByName = 10,
    Skip = 11,
    NonOop = 12,
    End = 13,
}

impl AuxTag {
    fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => AuxTag::Invalid,
            1 => AuxTag::VmGlobal,
            2 => AuxTag::OopStr,
            3 => AuxTag::OopClassloader,
            4 => AuxTag::GlobalOop,
            5 => AuxTag::MetaMethodData,
            6 => AuxTag::MetaSelfMethod,
            7 => AuxTag::InternalWord,
            8 => AuxTag::KlassByName,
            9 => AuxTag::MirrorByName,
            10 => AuxTag::MethodByName,
            11 => AuxTag::Skip,
            12 => AuxTag::NonOop,
            13 => AuxTag::End,
            _ => return None,
        })
    }
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxRecord {
    /// Runtime global plus byte offset into it
    VmGlobal { kind: VmGlobalKind, offset: u32 },
    OopStr(String),
    /// Loader object; only the method holder's loader is encodable
    OopClassloader { loader: LoaderType },
    GlobalOop(KnownObject),
    /// The method the blob belongs to
    SelfMethod,
    /// Offset from the start of the blob's code
    InternalWord { offset: u32 },
    KlassByName {
        loader: LoaderType,
        meta_index: u32,
        min_state: InitState,
    },
    MirrorByName {
        loader: LoaderType,
        meta_index: u32,
        min_state: InitState,
    },
    MethodByName { loader: LoaderType, meta_index: u32 },
    Skip,
    NonOop,
    End,
}

impl AuxRecord {
    pub fn tag(&self) -> AuxTag {
        match self {
            AuxRecord::VmGlobal { .. } => AuxTag::VmGlobal,
            AuxRecord::OopStr(_) => AuxTag::OopStr,
            AuxRecord::OopClassloader { .. } => AuxTag::OopClassloader,
            AuxRecord::GlobalOop(_) => AuxTag::GlobalOop,
            AuxRecord::SelfMethod => AuxTag::MetaSelfMethod,
            AuxRecord::InternalWord { .. } => AuxTag::InternalWord,
            AuxRecord::KlassByName { .. } => AuxTag::KlassByName,
            AuxRecord::MirrorByName { .. } => AuxTag::MirrorByName,
            AuxRecord::MethodByName { .. } => AuxTag::MethodByName,
            AuxRecord::Skip => AuxTag::Skip,
            AuxRecord::NonOop => AuxTag::NonOop,
            AuxRecord::End => AuxTag::End,
        }
    }

    /// Metaspace index carried by the record
    pub fn meta_index(&self) -> Option<u32> {
        match self {
            AuxRecord::KlassByName { meta_index, .. }
            | AuxRecord::MirrorByName { meta_index, .. }
            | AuxRecord::MethodByName { meta_index, .. } => Some(*meta_index),
            _ => None,
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            AuxRecord::KlassByName { .. } | AuxRecord::MirrorByName { .. } => 16,
            AuxRecord::OopStr(s) => align_up(8 + s.len()),
            _ => 8,
        }
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        let start = w.len();
        w.put_u16(self.tag() as u16);
        match self {
            AuxRecord::VmGlobal { kind, offset } => {
                w.put_u16(kind.as_u16());
                w.put_u32(*offset);
            }
            AuxRecord::OopStr(s) => {
                w.put_u16(0);
                w.put_u32(s.len() as u32);
                w.put_bytes(s.as_bytes());
            }
            AuxRecord::OopClassloader { loader } => {
                w.put_u16(loader.as_u16());
            }
            AuxRecord::GlobalOop(known) => {
                w.put_u16(0);
                w.put_u32(known.index());
            }
            AuxRecord::InternalWord { offset } => {
                w.put_u16(0);
                w.put_u32(*offset);
            }
            AuxRecord::KlassByName {
                loader,
                meta_index,
                min_state,
            }
            | AuxRecord::MirrorByName {
                loader,
                meta_index,
                min_state,
            } => {
                w.put_u16(loader.as_u16());
                w.put_u32(*meta_index);
                w.put_u32(*min_state as u32);
            }
            AuxRecord::MethodByName { loader, meta_index } => {
                w.put_u16(loader.as_u16());
                w.put_u32(*meta_index);
            }
            AuxRecord::SelfMethod | AuxRecord::Skip | AuxRecord::NonOop | AuxRecord::End => {
                w.put_u16(0);
            }
        }
        w.align();
        debug_assert_eq!(w.len() - start, self.encoded_size().max(8));
    }
}

impl fmt::Display for AuxRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuxRecord::VmGlobal { kind, offset } => write!(f, "vm_global {}+{}", kind, offset),
            AuxRecord::OopStr(s) => write!(f, "oop_str {:?}", s),
            AuxRecord::OopClassloader { loader } => write!(f, "oop_classloader {}", loader),
            AuxRecord::GlobalOop(known) => write!(f, "global_oop {}", known.name()),
            AuxRecord::SelfMethod => f.write_str("meta_self_method"),
            AuxRecord::InternalWord { offset } => write!(f, "internal_word +{}", offset),
            AuxRecord::KlassByName {
                loader,
                meta_index,
                min_state,
            } => write!(f, "klass_by_name #{} {} {}", meta_index, loader, min_state.name()),
            AuxRecord::MirrorByName {
                loader,
                meta_index,
                min_state,
            } => write!(f, "mirror_by_name #{} {} {}", meta_index, loader, min_state.name()),
            AuxRecord::MethodByName { loader, meta_index } => {
                write!(f, "method_by_name #{} {}", meta_index, loader)
            }
            AuxRecord::Skip => f.write_str("skip"),
            AuxRecord::NonOop => f.write_str("non_oop"),
            AuxRecord::End => f.write_str("end"),
        }
    }
}

/// Sequential decoder over one tag stream
pub struct AuxReader<'a> {
    r: ByteReader<'a>,
}

impl<'a> AuxReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            r: ByteReader::new(bytes),
        }
    }

    pub fn position(&self) -> usize {
        self.r.position()
    }

    fn loader(&self, raw: u16, at: usize) -> Result<LoaderType> {
        LoaderType::from_u16(raw)
            .ok_or_else(|| Error::corruption(format!("aux record at {} has loader {}", at, raw)))
    }

    /// Decode the next record. Any inconsistency is corruption.
    pub fn next_record(&mut self) -> Result<AuxRecord> {
        let at = self.r.position();
        if !is_aligned(at) {
            return Err(Error::corruption(format!("aux cursor {} is misaligned", at)));
        }
        let short = |e: Error| Error::corruption(format!("aux record at {} is truncated: {}", at, e));
        let raw_tag = self.r.u16().map_err(short)?;
        let aux = self.r.u16().map_err(short)?;
        let tag = AuxTag::from_u16(raw_tag)
            .ok_or_else(|| Error::corruption(format!("aux tag {} at {} out of range", raw_tag, at)))?;
        let record = match tag {
            AuxTag::Invalid | AuxTag::MetaMethodData => {
                return Err(Error::corruption(format!("aux tag {:?} at {} is never written", tag, at)))
            }
            AuxTag::VmGlobal => {
                let kind = VmGlobalKind::from_u16(aux)
                    .ok_or_else(|| Error::corruption(format!("vm global kind {} at {} out of range", aux, at)))?;
                AuxRecord::VmGlobal {
                    kind,
                    offset: self.r.u32().map_err(short)?,
                }
            }
            AuxTag::OopStr => {
                // Length-prefixed: string constants may contain NUL
                let len = self.r.u32().map_err(short)? as usize;
                let bytes = self.r.bytes(len).map_err(short)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| Error::corruption(format!("string at {} is not UTF-8: {}", at, e)))?;
                AuxRecord::OopStr(s.to_string())
            }
            AuxTag::OopClassloader => AuxRecord::OopClassloader {
                loader: self.loader(aux, at)?,
            },
            AuxTag::GlobalOop => {
                let index = self.r.u32().map_err(short)?;
                let known = KnownObject::from_index(index)
                    .ok_or_else(|| Error::corruption(format!("known object {} at {} out of range", index, at)))?;
                AuxRecord::GlobalOop(known)
            }
            AuxTag::MetaSelfMethod => AuxRecord::SelfMethod,
            AuxTag::InternalWord => AuxRecord::InternalWord {
                offset: self.r.u32().map_err(short)?,
            },
            AuxTag::KlassByName | AuxTag::MirrorByName => {
                let loader = self.loader(aux, at)?;
                let meta_index = self.r.u32().map_err(short)?;
                let raw_state = self.r.u32().map_err(short)?;
                let min_state = InitState::from_u32(raw_state)
                    .ok_or_else(|| Error::corruption(format!("init state {} at {} out of range", raw_state, at)))?;
                if tag == AuxTag::KlassByName {
                    AuxRecord::KlassByName {
                        loader,
                        meta_index,
                        min_state,
                    }
                } else {
                    AuxRecord::MirrorByName {
                        loader,
                        meta_index,
                        min_state,
                    }
                }
            }
            AuxTag::MethodByName => AuxRecord::MethodByName {
                loader: self.loader(aux, at)?,
                meta_index: self.r.u32().map_err(short)?,
            },
            AuxTag::Skip => AuxRecord::Skip,
            AuxTag::NonOop => AuxRecord::NonOop,
            AuxTag::End => AuxRecord::End,
        };
        self.r.align();
        Ok(record)
    }

    /// Read a record that must be the stream terminator
    pub fn expect_end(&mut self) -> Result<()> {
        match self.next_record()? {
            AuxRecord::End => Ok(()),
            other => Err(Error::corruption(format!(
                "expected end of aux stream at {}, found {}",
                self.position(),
                other
            ))),
        }
    }
}

/// Encode a complete stream (the terminator is appended)
pub fn encode_stream(records: &[AuxRecord]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(records.iter().map(|r| r.encoded_size()).sum::<usize>() + 8);
    for record in records {
        record.encode(&mut w);
    }
    AuxRecord::End.encode(&mut w);
    w.into_inner()
}

/// Decode a complete stream up to, not including, its terminator
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<AuxRecord>> {
    let mut reader = AuxReader::new(bytes);
    let mut out = Vec::new();
    loop {
        match reader.next_record()? {
            AuxRecord::End => return Ok(out),
            record => out.push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<AuxRecord> {
        vec![
            AuxRecord::VmGlobal {
                kind: VmGlobalKind::PollingPage,
                offset: 0,
            },
            AuxRecord::OopStr("hello world".into()),
            AuxRecord::OopClassloader {
                loader: LoaderType::MethodHolder,
            },
            AuxRecord::GlobalOop(KnownObject::TheNullString),
            AuxRecord::SelfMethod,
            AuxRecord::InternalWord { offset: 24 },
            AuxRecord::KlassByName {
                loader: LoaderType::App,
                meta_index: 7,
                min_state: InitState::FullyInitialized,
            },
            AuxRecord::MirrorByName {
                loader: LoaderType::Boot,
                meta_index: 2,
                min_state: InitState::Allocated,
            },
            AuxRecord::MethodByName {
                loader: LoaderType::Ext,
                meta_index: 9,
            },
            AuxRecord::Skip,
            AuxRecord::NonOop,
        ]
    }

    #[test]
    fn test_stream_codec() {
        let records = sample();
        let bytes = encode_stream(&records);
        let expected: usize = records.iter().map(|r| r.encoded_size()).sum::<usize>() + 8;
        assert_eq!(bytes.len(), expected);
        assert_eq!(decode_stream(&bytes).unwrap(), records);
    }

    #[test]
    fn test_string_record_padding() {
        // 8 header bytes then the characters, rounded up to 8
        assert_eq!(AuxRecord::OopStr(String::new()).encoded_size(), 8);
        assert_eq!(AuxRecord::OopStr("abcd".into()).encoded_size(), 16);
        assert_eq!(AuxRecord::OopStr("abcdefgh".into()).encoded_size(), 16);
        assert_eq!(AuxRecord::OopStr("abcdefghi".into()).encoded_size(), 24);
    }

    #[test]
    fn test_strings_with_nul_survive() {
        let records = vec![
            AuxRecord::OopStr("a\0b".into()),
            AuxRecord::OopStr("tail".into()),
            AuxRecord::OopStr("a\0bcdefghijkl".into()),
            AuxRecord::OopStr("\0".into()),
            AuxRecord::SelfMethod,
        ];
        let bytes = encode_stream(&records);
        assert_eq!(decode_stream(&bytes).unwrap(), records);
        assert_eq!(AuxRecord::OopStr("a\0b".into()).to_string(), "oop_str \"a\\0b\"");
    }

    #[test]
    fn test_string_longer_than_stream_is_corruption() {
        let mut w = ByteWriter::new();
        w.put_u16(AuxTag::OopStr as u16);
        w.put_u16(0);
        w.put_u32(64);
        w.put_bytes(b"short\0\0\0");
        assert!(decode_stream(w.as_slice()).unwrap_err().is_corruption());
    }

    #[test]
    fn test_reserved_and_unknown_tags_are_corruption() {
        for raw in [0u16, 5, 14, 200] {
            let mut w = ByteWriter::new();
            w.put_u16(raw);
            w.put_u16(0);
            w.put_u32(0);
            let err = decode_stream(w.as_slice()).unwrap_err();
            assert!(err.is_corruption(), "tag {} gave {:?}", raw, err);
        }
    }

    #[test]
    fn test_missing_end_is_corruption() {
        let mut w = ByteWriter::new();
        AuxRecord::Skip.encode(&mut w);
        assert!(decode_stream(w.as_slice()).unwrap_err().is_corruption());
    }

    #[test]
    fn test_bad_operands_are_corruption() {
        let mut w = ByteWriter::new();
        w.put_u16(AuxTag::KlassByName as u16);
        w.put_u16(3);
        w.put_u32(1);
        w.put_u32(0);
        w.put_u32(0);
        assert!(decode_stream(w.as_slice()).unwrap_err().is_corruption());

        let mut w = ByteWriter::new();
        w.put_u16(AuxTag::GlobalOop as u16);
        w.put_u16(0);
        w.put_u32(0);
        assert!(decode_stream(w.as_slice()).unwrap_err().is_corruption());
    }
}
