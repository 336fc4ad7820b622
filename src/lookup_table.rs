//! Hash index from method to the offset of its first code blob
//!
//! The table is a flat array of fixed-size entries. The first
//! `bucket_count` entries are bucket heads; colliding entries are appended
//! after them and chained through byte offsets, so the encoded table can be
//! read straight out of a mapped file. Names are hashed with the seedless
//! [`stable_hash32`] so every process computes the same bucket.

use crate::format::{stable_hash32, ByteReader, ByteWriter};
use crate::{Error, Result};
use std::fmt::Write as _;

/// Minimum number of buckets
pub const MIN_BUCKETS: usize = 10;

const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 16;

/// Hash of a method display name
pub fn name_hash(name: &str) -> u32 {
    stable_hash32(0, name.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    /// Metaspace index of the method, -1 for an empty bucket
    meta_index: i32,
    hash: u32,
    /// Byte offset of the next entry in the chain from the table start, 0 for none
    next_offset: i32,
    /// Offset of the first code blob in the code space, -1 for none
    code_offset: i32,
}

impl Entry {
    const EMPTY: Entry = Entry {
        meta_index: -1,
        hash: 0,
        next_offset: 0,
        code_offset: -1,
    };

    fn is_empty(&self) -> bool {
        self.meta_index < 0
    }
}

/// Handle of one table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(usize);

/// Outcome of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(EntryHandle),
    /// An entry with the same name exists but identity or loader differ
    FoundWithName,
    NotFound,
}

/// How a candidate entry compares with the key being looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    Exact,
    NameOnly,
    Different,
}

#[derive(Debug, Clone)]
pub struct LookupTable {
    bucket_count: usize,
    entries: Vec<Entry>,
}

fn entry_offset(index: usize) -> i32 {
    (HEADER_SIZE + index * ENTRY_SIZE) as i32
}

fn entry_index(offset: i32) -> Result<usize> {
    let offset = offset as usize;
    if offset < HEADER_SIZE || (offset - HEADER_SIZE) % ENTRY_SIZE != 0 {
        return Err(Error::corruption(format!("lookup chain offset {} is misaligned", offset)));
    }
    Ok((offset - HEADER_SIZE) / ENTRY_SIZE)
}

impl LookupTable {
    /// Table sized for `expected` methods
    pub fn new(expected: usize) -> Self {
        let bucket_count = expected.max(MIN_BUCKETS);
        Self {
            bucket_count,
            entries: vec![Entry::EMPTY; bucket_count],
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of occupied entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, hash: u32) -> usize {
        hash as usize % self.bucket_count
    }

    fn chain(&self, hash: u32) -> ChainIter<'_> {
        ChainIter {
            table: self,
            next: Some(self.bucket(hash)),
            steps: 0,
        }
    }

    /// Entry for `meta_index`, creating it if absent
    pub fn insert(&mut self, meta_index: u32, name: &str) -> Result<EntryHandle> {
        let hash = name_hash(name);
        let head = self.bucket(hash);
        if self.entries[head].is_empty() {
            self.entries[head] = Entry {
                meta_index: meta_index as i32,
                hash,
                next_offset: 0,
                code_offset: -1,
            };
            return Ok(EntryHandle(head));
        }
        for index in self.chain(hash) {
            let index = index?;
            if self.entries[index].meta_index == meta_index as i32 {
                return Ok(EntryHandle(index));
            }
        }
        let index = self.entries.len();
        self.entries.push(Entry {
            meta_index: meta_index as i32,
            hash,
            next_offset: self.entries[head].next_offset,
            code_offset: -1,
        });
        self.entries[head].next_offset = entry_offset(index);
        Ok(EntryHandle(index))
    }

    /// Look up `name`; `compare` decides how a candidate's metaspace index
    /// relates to the wanted key
    pub fn find(&self, name: &str, compare: &dyn Fn(u32) -> KeyMatch) -> Result<Lookup> {
        let hash = name_hash(name);
        let mut name_seen = false;
        for index in self.chain(hash) {
            let index = index?;
            let entry = &self.entries[index];
            if entry.is_empty() || entry.hash != hash {
                continue;
            }
            match compare(entry.meta_index as u32) {
                KeyMatch::Exact => return Ok(Lookup::Found(EntryHandle(index))),
                KeyMatch::NameOnly => name_seen = true,
                KeyMatch::Different => {}
            }
        }
        Ok(if name_seen { Lookup::FoundWithName } else { Lookup::NotFound })
    }

    pub fn meta_index(&self, handle: EntryHandle) -> u32 {
        self.entries[handle.0].meta_index as u32
    }

    /// Offset of the first code blob, if the method has code
    pub fn code_offset(&self, handle: EntryHandle) -> Option<u32> {
        let off = self.entries[handle.0].code_offset;
        (off >= 0).then_some(off as u32)
    }

    pub fn set_code_offset(&mut self, handle: EntryHandle, offset: u32) {
        self.entries[handle.0].code_offset = offset as i32;
    }

    /// Occupied entries as (handle, metaspace index)
    pub fn iter(&self) -> impl Iterator<Item = (EntryHandle, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(i, e)| (EntryHandle(i), e.meta_index as u32))
    }

    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.entries.len() * ENTRY_SIZE
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.bucket_count as u32);
        w.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            w.put_i32(e.meta_index);
            w.put_u32(e.hash);
            w.put_i32(e.next_offset);
            w.put_i32(e.code_offset);
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let bucket_count = r.u32()? as usize;
        let count = r.u32()? as usize;
        if bucket_count == 0 || count < bucket_count || count > r.remaining() / ENTRY_SIZE {
            return Err(Error::corruption(format!(
                "lookup table with {} buckets and {} entries in {} bytes",
                bucket_count,
                count,
                bytes.len()
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(Entry {
                meta_index: r.i32()?,
                hash: r.u32()?,
                next_offset: r.i32()?,
                code_offset: r.i32()?,
            });
        }
        Ok(Self { bucket_count, entries })
    }

    pub fn print(&self, name: &dyn Fn(u32) -> String) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "  LookupTable: {} buckets, {} entries",
            self.bucket_count,
            self.len()
        );
        for (i, e) in self.entries.iter().enumerate().filter(|(_, e)| !e.is_empty()) {
            let _ = writeln!(
                out,
                "    [{:4}] hash={:#010x} code={:>8} next={:>6} {}",
                i,
                e.hash,
                e.code_offset,
                e.next_offset,
                name(e.meta_index as u32)
            );
        }
        out
    }
}

struct ChainIter<'a> {
    table: &'a LookupTable,
    next: Option<usize>,
    steps: usize,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;
        self.steps += 1;
        let Some(entry) = self.table.entries.get(index) else {
            return Some(Err(Error::corruption(format!("lookup chain entry {} out of range", index))));
        };
        if self.steps > self.table.entries.len() {
            return Some(Err(Error::corruption("lookup chain does not terminate")));
        }
        if entry.next_offset != 0 {
            match entry_index(entry.next_offset) {
                Ok(next) => self.next = Some(next),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(wanted: u32) -> impl Fn(u32) -> KeyMatch {
        move |idx| if idx == wanted { KeyMatch::Exact } else { KeyMatch::Different }
    }

    #[test]
    fn test_insert_and_find() {
        let mut table = LookupTable::new(2);
        assert_eq!(table.bucket_count(), MIN_BUCKETS);
        let h = table.insert(3, "a/B.c()V").unwrap();
        table.set_code_offset(h, 64);
        assert_eq!(table.insert(3, "a/B.c()V").unwrap(), h);

        match table.find("a/B.c()V", &exact(3)).unwrap() {
            Lookup::Found(found) => assert_eq!(table.code_offset(found), Some(64)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.find("a/B.d()V", &exact(3)).unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_collisions_chain() {
        let mut table = LookupTable::new(0);
        // Far more entries than buckets forces chaining
        let names: Vec<String> = (0..50).map(|i| format!("p/K{}.m()V", i)).collect();
        for (i, n) in names.iter().enumerate() {
            let h = table.insert(i as u32, n).unwrap();
            table.set_code_offset(h, i as u32 * 8);
        }
        assert_eq!(table.len(), 50);

        let mut w = ByteWriter::new();
        table.encode(&mut w);
        assert_eq!(w.len(), table.encoded_size());
        let loaded = LookupTable::decode(w.as_slice()).unwrap();
        for (i, n) in names.iter().enumerate() {
            match loaded.find(n, &exact(i as u32)).unwrap() {
                Lookup::Found(h) => assert_eq!(loaded.code_offset(h), Some(i as u32 * 8)),
                other => panic!("{} not found: {:?}", n, other),
            }
        }
    }

    #[test]
    fn test_found_with_name() {
        let mut table = LookupTable::new(4);
        table.insert(1, "x/Y.z()V").unwrap();
        let r = table
            .find("x/Y.z()V", &|_| KeyMatch::NameOnly)
            .unwrap();
        assert_eq!(r, Lookup::FoundWithName);
    }

    #[test]
    fn test_cyclic_chain_is_corruption() {
        let mut table = LookupTable::new(1);
        let name = "q/Q.q()V";
        table.insert(1, name).unwrap();
        table.insert(2, name).unwrap();
        let head = table.bucket(name_hash(name));
        // Point the overflow entry back at the head
        let tail = table.entries.len() - 1;
        table.entries[tail].next_offset = entry_offset(head);
        assert!(table.find(name, &exact(99)).unwrap_err().is_corruption());
    }

    #[test]
    fn test_decode_rejects_short_table() {
        let mut w = ByteWriter::new();
        w.put_u32(10);
        w.put_u32(10);
        assert!(LookupTable::decode(w.as_slice()).is_err());
    }
}
