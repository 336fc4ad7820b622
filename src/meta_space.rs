//! Interned class and method metadata
//!
//! Code blobs never store class or method pointers. They store indices into
//! a [`MetaSpace`], whose entries carry the name, the content identity and
//! the loader category of the class or method. On load an entry is resolved
//! lazily back to a live handle, and only if the live entity still has the
//! recorded identity.

use crate::format::{ByteReader, ByteWriter};
use crate::redefine::{EpochCell, RedefineEpoch};
use crate::vm::{ClassResolver, KlassHandle, LoaderType, MetaRef, MethodHandle, RuntimeEnv};
use crate::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

const KIND_KLASS: u16 = 1;
const KIND_METHOD: u16 = 2;

/// Name of an interned entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetaName {
    Klass(String),
    Method {
        holder: String,
        name: String,
        signature: String,
    },
}

impl MetaName {
    pub fn is_method(&self) -> bool {
        matches!(self, MetaName::Method { .. })
    }
}

impl fmt::Display for MetaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaName::Klass(name) => f.write_str(name),
            MetaName::Method {
                holder,
                name,
                signature,
            } => write!(f, "{}.{}{}", holder, name, signature),
        }
    }
}

/// (name, identity, loader) triple identifying an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetaKey {
    pub name: MetaName,
    pub identity: u64,
    pub loader: LoaderType,
}

impl MetaKey {
    /// Key of a live class or method; custom-loader entities have none
    pub fn of(env: &dyn RuntimeEnv, meta: MetaRef) -> Result<Self> {
        let loader = env.meta_loader(meta);
        if loader == LoaderType::Custom {
            return Err(Error::unresolved(format!(
                "{} is defined by a custom loader",
                env.meta_name(meta)
            )));
        }
        let name = match meta {
            MetaRef::Klass(k) => MetaName::Klass(env.class_name(k)),
            MetaRef::Method(m) => MetaName::Method {
                holder: env.class_name(env.method_holder(m)),
                name: env.method_name(m),
                signature: env.method_signature(m),
            },
        };
        Ok(Self {
            name,
            identity: env.meta_identity(meta),
            loader,
        })
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#018x} {}]", self.name, self.identity, self.loader)
    }
}

/// Live handle packed into one word: kind in the high half, 0 when unresolved
const UNRESOLVED: u64 = 0;
const SLOT_KLASS: u64 = 1 << 32;
const SLOT_METHOD: u64 = 2 << 32;

fn pack(meta: MetaRef) -> u64 {
    match meta {
        MetaRef::Klass(k) => SLOT_KLASS | k.0 as u64,
        MetaRef::Method(m) => SLOT_METHOD | m.0 as u64,
    }
}

fn unpack(slot: u64) -> Option<MetaRef> {
    let handle = slot as u32;
    match slot & !(u32::MAX as u64) {
        SLOT_KLASS => Some(MetaRef::Klass(KlassHandle(handle))),
        SLOT_METHOD => Some(MetaRef::Method(MethodHandle(handle))),
        _ => None,
    }
}

#[derive(Debug)]
struct MetaEntry {
    key: MetaKey,
    live: AtomicU64,
    validated: EpochCell,
    /// Serializes re-validation and resolution; readers of a current entry never take it
    resolving: Mutex<()>,
}

impl MetaEntry {
    fn new(key: MetaKey) -> Self {
        Self {
            key,
            live: AtomicU64::new(UNRESOLVED),
            validated: EpochCell::new(),
            resolving: Mutex::new(()),
        }
    }

    fn current(&self, epoch: &RedefineEpoch) -> Option<MetaRef> {
        if !self.validated.is_current(epoch) {
            return None;
        }
        unpack(self.live.load(Ordering::Acquire))
    }

    /// Whether `live` is still the entity this entry names
    fn still_matches(&self, env: &dyn RuntimeEnv, live: MetaRef) -> bool {
        env.meta_identity(live) == self.key.identity && env.meta_loader(live) == self.key.loader
    }
}

/// Global metadata table of a cache file
#[derive(Debug, Default)]
pub struct MetaSpace {
    entries: Vec<MetaEntry>,
    by_key: HashMap<MetaKey, u32>,
    by_live: HashMap<MetaRef, u32>,
}

impl MetaSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of `key`, appending an unresolved entry if it is new
    pub fn intern_key(&mut self, key: MetaKey) -> u32 {
        if let Some(&index) = self.by_key.get(&key) {
            return index;
        }
        let index = self.entries.len() as u32;
        trace!(target: crate::logging::ARCHIVE, index, key = %key, "interned metadata");
        self.by_key.insert(key.clone(), index);
        self.entries.push(MetaEntry::new(key));
        index
    }

    /// Index of a live class or method, interning it on first use
    pub fn intern(&mut self, env: &dyn RuntimeEnv, meta: MetaRef) -> Result<u32> {
        if let Some(&index) = self.by_live.get(&meta) {
            return Ok(index);
        }
        let key = MetaKey::of(env, meta)?;
        let index = self.intern_key(key);
        self.by_live.insert(meta, index);
        if let Some(entry) = self.entries.get(index as usize) {
            entry.live.store(pack(meta), Ordering::Release);
        }
        Ok(index)
    }

    pub fn find(&self, key: &MetaKey) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    pub fn key(&self, index: u32) -> Result<&MetaKey> {
        self.entries
            .get(index as usize)
            .map(|e| &e.key)
            .ok_or_else(|| Error::corruption(format!("metaspace index {} out of {}", index, self.entries.len())))
    }

    pub fn keys(&self) -> impl Iterator<Item = &MetaKey> {
        self.entries.iter().map(|e| &e.key)
    }

    /// Display name of an entry, for listings
    pub fn name(&self, index: u32) -> String {
        self.key(index)
            .map(|k| k.name.to_string())
            .unwrap_or_else(|_| format!("<bad meta index {}>", index))
    }

    /// Resolve an entry to its live counterpart.
    ///
    /// A resolved entry is trusted without locking until the redefinition
    /// epoch moves; then its identity and loader are compared again. An
    /// entry that no longer matches is cleared and the call fails with
    /// [`Error::Unresolved`].
    pub fn resolve(&self, index: u32, env: &dyn RuntimeEnv, epoch: &RedefineEpoch) -> Result<MetaRef> {
        let entry = self
            .entries
            .get(index as usize)
            .ok_or_else(|| Error::corruption(format!("metaspace index {} out of {}", index, self.entries.len())))?;
        if let Some(live) = entry.current(epoch) {
            return Ok(live);
        }

        let _guard = entry.resolving.lock().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have validated while this one waited
        if let Some(live) = entry.current(epoch) {
            return Ok(live);
        }
        let now = epoch.current();
        if let Some(live) = unpack(entry.live.load(Ordering::Acquire)) {
            if entry.still_matches(env, live) {
                entry.validated.mark_validated(now);
                return Ok(live);
            }
            debug!(target: crate::logging::RESTORE, key = %entry.key, "identity or loader changed, clearing entry");
            entry.validated.invalidate();
            entry.live.store(UNRESOLVED, Ordering::Release);
        }

        let live = lookup(env, &entry.key).ok_or_else(|| {
            Error::unresolved(format!("{} not found in {} loader", entry.key.name, entry.key.loader))
        })?;
        let loader = env.meta_loader(live);
        if loader != entry.key.loader {
            return Err(Error::unresolved(format!(
                "{} is defined by the {} loader, cached {}",
                entry.key.name, loader, entry.key.loader
            )));
        }
        let identity = env.meta_identity(live);
        if identity != entry.key.identity {
            return Err(Error::unresolved(format!(
                "{} has identity {:#x}, cached {:#x}",
                entry.key.name, identity, entry.key.identity
            )));
        }
        entry.live.store(pack(live), Ordering::Release);
        entry.validated.mark_validated(now);
        Ok(live)
    }

    /// Live handle of an entry if it is resolved and still current
    pub fn resolved(&self, index: u32, epoch: &RedefineEpoch) -> Option<MetaRef> {
        self.entries.get(index as usize)?.current(epoch)
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.entries.len() as u32);
        w.put_u32(0);
        for entry in &self.entries {
            let key = &entry.key;
            let kind = if key.name.is_method() { KIND_METHOD } else { KIND_KLASS };
            w.put_u16(kind);
            w.put_u16(key.loader.as_u16());
            w.put_u32(0);
            w.put_u64(key.identity);
            match &key.name {
                MetaName::Klass(name) => w.put_cstr(name),
                MetaName::Method {
                    holder,
                    name,
                    signature,
                } => {
                    w.put_cstr(holder);
                    w.put_cstr(name);
                    w.put_cstr(signature);
                }
            }
            w.align();
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let count = r.u32()? as usize;
        r.u32()?;
        if count > r.remaining() / 16 {
            return Err(Error::corruption(format!(
                "metaspace declares {} entries in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut space = MetaSpace::new();
        for i in 0..count {
            let kind = r.u16()?;
            let loader = LoaderType::from_u16(r.u16()?)
                .ok_or_else(|| Error::corruption(format!("metaspace entry {} has a bad loader", i)))?;
            r.u32()?;
            let identity = r.u64()?;
            let name = match kind {
                KIND_KLASS => MetaName::Klass(r.cstr()?.to_string()),
                KIND_METHOD => MetaName::Method {
                    holder: r.cstr()?.to_string(),
                    name: r.cstr()?.to_string(),
                    signature: r.cstr()?.to_string(),
                },
                other => {
                    return Err(Error::corruption(format!(
                        "metaspace entry {} has kind {}",
                        i, other
                    )))
                }
            };
            r.align();
            let index = space.intern_key(MetaKey {
                name,
                identity,
                loader,
            });
            if index as usize != i {
                return Err(Error::corruption(format!("metaspace entry {} duplicates entry {}", i, index)));
            }
        }
        Ok(space)
    }

    pub fn print(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "  MetaSpace: {} entries", self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let _ = writeln!(out, "    {:5} {}", i, entry.key);
        }
        out
    }
}

fn lookup(env: &dyn RuntimeEnv, key: &MetaKey) -> Option<MetaRef> {
    match &key.name {
        MetaName::Klass(name) => env.find_class(name, key.loader).map(MetaRef::Klass),
        MetaName::Method {
            holder,
            name,
            signature,
        } => {
            let holder = env.find_class(holder, key.loader)?;
            env.find_method(holder, name, signature).map(MetaRef::Method)
        }
    }
}
