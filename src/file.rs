//! Cache file: header, chained containers and the global metaspace
//!
//! ```text
//! +--------------------------+ 0
//! | header                   |
//! +--------------------------+ container_offset
//! | container 0 ──next──┐    |
//! | container 1 <───────┘    |
//! | ...                      |
//! +--------------------------+ metaspace_offset
//! | metaspace                |
//! +--------------------------+ file_size
//! ```
//!
//! A file is accepted only if the magic matches, the declared size equals
//! the real size and, when validation is on, the build identity matches
//! the running process exactly.

use crate::code_blob::aux_info::{decode_stream, AuxRecord};
use crate::code_blob::CodeBlob;
use crate::container::Container;
use crate::error::FormatErrorKind;
use crate::fingerprint::Fingerprint;
use crate::format::{align_up, ByteReader, ByteView, ByteWriter};
use crate::meta_space::MetaSpace;
use crate::vm::VmSettings;
use crate::{Error, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MAGIC: u32 = 0xf00b_aba1;

/// Extension of cache files picked up by merge input directories
pub const FILE_EXTENSION: &str = "csa";

const FIXED_HEADER_SIZE: usize = 56;

/// Upper bound on containers in one file
const MAX_CONTAINERS: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub magic: u32,
    pub header_size: u32,
    pub file_size: u64,
    pub container_offset: u64,
    pub container_size: u64,
    pub metaspace_offset: u64,
    pub metaspace_size: u64,
    pub container_count: u32,
    pub build_identity: String,
}

impl FileHeader {
    fn encoded_size(build_identity: &str) -> usize {
        align_up(FIXED_HEADER_SIZE + build_identity.len() + 1)
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.magic);
        w.put_u32(self.header_size);
        w.put_u64(self.file_size);
        w.put_u64(self.container_offset);
        w.put_u64(self.container_size);
        w.put_u64(self.metaspace_offset);
        w.put_u64(self.metaspace_size);
        w.put_u32(self.container_count);
        w.put_u32(0);
        w.put_cstr(&self.build_identity);
        w.align();
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(Error::format(
                FormatErrorKind::BadMagic,
                format!("expected {:#x}, got {:#x}", MAGIC, magic),
            ));
        }
        let header_size = r.u32()?;
        let file_size = r.u64()?;
        let container_offset = r.u64()?;
        let container_size = r.u64()?;
        let metaspace_offset = r.u64()?;
        let metaspace_size = r.u64()?;
        let container_count = r.u32()?;
        r.u32()?;
        let build_identity = r
            .cstr()
            .map_err(|e| Error::format(FormatErrorKind::BadHeader, format!("build identity: {}", e)))?
            .to_string();
        Ok(Self {
            magic,
            header_size,
            file_size,
            container_offset,
            container_size,
            metaspace_offset,
            metaspace_size,
            container_count,
            build_identity,
        })
    }

    fn check_bounds(&self, len: usize) -> Result<()> {
        if self.file_size != len as u64 {
            return Err(Error::format(
                FormatErrorKind::SizeMismatch,
                format!("header declares {} bytes, file has {}", self.file_size, len),
            ));
        }
        let in_file = |offset: u64, size: u64| {
            offset >= self.header_size as u64 && offset.checked_add(size).is_some_and(|end| end <= self.file_size)
        };
        if !in_file(self.container_offset, self.container_size) || !in_file(self.metaspace_offset, self.metaspace_size)
        {
            return Err(Error::format(
                FormatErrorKind::BadHeader,
                "container or metaspace section outside the file",
            ));
        }
        if self.container_count as usize > MAX_CONTAINERS {
            return Err(Error::format(
                FormatErrorKind::BadHeader,
                format!("{} containers", self.container_count),
            ));
        }
        Ok(())
    }
}

/// A cache file, loaded or being built
#[derive(Debug)]
pub struct CacheFile {
    path: Option<PathBuf>,
    build_identity: String,
    meta: MetaSpace,
    containers: Vec<Container>,
}

impl CacheFile {
    /// Empty file for a process with `build_identity`
    pub fn new(build_identity: impl Into<String>) -> Self {
        Self {
            path: None,
            build_identity: build_identity.into(),
            meta: MetaSpace::new(),
            containers: Vec::new(),
        }
    }

    /// Assemble a file from parts
    pub fn from_parts(build_identity: impl Into<String>, meta: MetaSpace, containers: Vec<Container>) -> Self {
        Self {
            path: None,
            build_identity: build_identity.into(),
            meta,
            containers,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn build_identity(&self) -> &str {
        &self.build_identity
    }

    pub fn meta(&self) -> &MetaSpace {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaSpace {
        &mut self.meta
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn containers_mut(&mut self) -> &mut Vec<Container> {
        &mut self.containers
    }

    /// Split into metaspace and containers
    pub fn into_parts(self) -> (MetaSpace, Vec<Container>) {
        (self.meta, self.containers)
    }

    /// Map and validate the file at `path`.
    ///
    /// `expected_identity` is the build identity of the running process;
    /// `None` skips the identity check.
    pub fn load(path: &Path, expected_identity: Option<&str>) -> Result<Self> {
        let view = Arc::new(ByteView::map(path)?);
        let mut file = Self::from_view(view, expected_identity)?;
        file.path = Some(path.to_path_buf());
        info!(
            target: crate::logging::ARCHIVE,
            path = %path.display(),
            containers = file.containers.len(),
            metas = file.meta.len(),
            "loaded cache file"
        );
        Ok(file)
    }

    /// Validate and decode a file image
    pub fn from_view(view: Arc<ByteView>, expected_identity: Option<&str>) -> Result<Self> {
        if view.len() < FIXED_HEADER_SIZE {
            return Err(Error::format(
                FormatErrorKind::Truncated,
                format!("{} bytes is no cache file", view.len()),
            ));
        }
        let header = FileHeader::decode(&view)?;
        header.check_bounds(view.len())?;
        if let Some(expected) = expected_identity {
            if header.build_identity != expected {
                return Err(Error::format(
                    FormatErrorKind::BuildIdentity,
                    format!("file built by '{}', running '{}'", header.build_identity, expected),
                ));
            }
        }

        let meta_at = header.metaspace_offset as usize;
        let meta = MetaSpace::decode(&view[meta_at..meta_at + header.metaspace_size as usize])?;

        let containers_end = header.container_offset + header.container_size;
        let mut containers = Vec::with_capacity(header.container_count as usize);
        let mut next = Some(header.container_offset);
        while let Some(offset) = next {
            if offset >= containers_end || containers.len() >= header.container_count as usize {
                return Err(Error::corruption(format!(
                    "container chain reaches {} after {} containers",
                    offset,
                    containers.len()
                )));
            }
            let (container, following) = Container::decode(&view, offset as usize)?;
            for (index, _) in container.methods() {
                meta.key(index)?;
            }
            containers.push(container);
            next = following;
        }
        if containers.len() != header.container_count as usize {
            return Err(Error::corruption(format!(
                "header declares {} containers, chain holds {}",
                header.container_count,
                containers.len()
            )));
        }
        Ok(Self {
            path: None,
            build_identity: header.build_identity,
            meta,
            containers,
        })
    }

    /// First container whose fingerprint accepts `settings`
    pub fn select_container(&self, settings: &VmSettings) -> Option<&Container> {
        for (i, container) in self.containers.iter().enumerate() {
            match container.fingerprint().matches(settings) {
                Ok(()) => {
                    debug!(target: crate::logging::ARCHIVE, container = i, "fingerprint matches");
                    return Some(container);
                }
                Err(e) => debug!(target: crate::logging::ARCHIVE, container = i, error = %e, "skipping container"),
            }
        }
        warn!(
            target: crate::logging::ARCHIVE,
            containers = self.containers.len(),
            "no container matches the current settings"
        );
        None
    }

    /// Container whose fingerprint is identical to `fingerprint`
    pub fn container_for(&mut self, fingerprint: &Fingerprint) -> &mut Container {
        let found = self
            .containers
            .iter()
            .position(|c| c.fingerprint().identical(fingerprint));
        let index = match found {
            Some(index) => index,
            None => {
                self.containers.push(Container::new(fingerprint.clone(), 0));
                self.containers.len() - 1
            }
        };
        &mut self.containers[index]
    }

    fn metaspace_size(&self) -> usize {
        let mut w = ByteWriter::new();
        self.meta.encode(&mut w);
        w.len()
    }

    /// Exact size of the encoded file
    pub fn encoded_size(&self) -> usize {
        FileHeader::encoded_size(&self.build_identity)
            + self.containers.iter().map(Container::encoded_size).sum::<usize>()
            + align_up(self.metaspace_size())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header_size = FileHeader::encoded_size(&self.build_identity);
        let mut w = ByteWriter::with_capacity(self.encoded_size());
        w.reserve(header_size);

        let container_offset = w.len() as u64;
        let mut next = container_offset;
        for (i, container) in self.containers.iter().enumerate() {
            next += container.encoded_size() as u64;
            let link = if i + 1 == self.containers.len() { 0 } else { next };
            container.encode(&mut w, link)?;
        }
        w.align();
        let container_size = w.len() as u64 - container_offset;
        let metaspace_offset = w.len() as u64;
        self.meta.encode(&mut w);
        w.align();

        let header = FileHeader {
            magic: MAGIC,
            header_size: header_size as u32,
            file_size: w.len() as u64,
            container_offset,
            container_size,
            metaspace_offset,
            metaspace_size: w.len() as u64 - metaspace_offset,
            container_count: self.containers.len() as u32,
            build_identity: self.build_identity.clone(),
        };
        let mut head = ByteWriter::with_capacity(header_size);
        header.encode(&mut head);
        let mut bytes = w.into_inner();
        bytes[..header_size].copy_from_slice(head.as_slice());
        Ok(bytes)
    }

    /// Write the file to `path`; returns the number of bytes written.
    ///
    /// Nothing is written when the file would exceed `max_file_size`. A
    /// partially written file is removed.
    pub fn write(&self, path: &Path, max_file_size: usize) -> Result<usize> {
        let size = self.encoded_size();
        if size > max_file_size {
            return Err(Error::FileTooLarge {
                size,
                limit: max_file_size,
            });
        }
        let bytes = self.encode()?;
        if let Err(e) = std::fs::write(path, &bytes) {
            warn!(target: crate::logging::SAVE, path = %path.display(), error = %e, "write failed, removing file");
            let _ = std::fs::remove_file(path);
            return Err(e.into());
        }
        info!(
            target: crate::logging::SAVE,
            path = %path.display(),
            bytes = bytes.len(),
            containers = self.containers.len(),
            "wrote cache file"
        );
        Ok(bytes.len())
    }

    /// Full listing of the file
    pub fn print(&self, settings: Option<&VmSettings>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "CacheFile: {}", self.path.as_deref().map_or("<memory>".into(), |p| p.display().to_string()));
        let _ = writeln!(out, "  build identity: {}", self.build_identity);
        let _ = writeln!(out, "  containers: {}", self.containers.len());
        for (i, container) in self.containers.iter().enumerate() {
            let _ = writeln!(out, "Container #{}", i);
            out.push_str(&container.print(&self.meta, settings));
        }
        out.push_str(&self.meta.print());
        out
    }

    /// Every version of every method with its dependencies and opt
    /// records, each list sorted
    pub fn print_opt(&self) -> Result<String> {
        let mut out = String::new();
        for (i, container) in self.containers.iter().enumerate() {
            let _ = writeln!(out, "Container #{}", i);
            for (meta_index, head) in container.methods() {
                let method = self.meta.name(meta_index);
                let _ = writeln!(out, "  {}", method);
                for (version, blob) in container.versions(head).enumerate() {
                    let blob = blob?;
                    let slots = slot_names(&blob, &self.meta, &method)?;
                    let name = |index: u32| {
                        index
                            .checked_sub(1)
                            .and_then(|i| slots.get(i as usize))
                            .cloned()
                            .unwrap_or_else(|| format!("#{}", index))
                    };
                    let mut deps = blob.dependencies()?;
                    deps.sort_by(|a, b| a.compare_by(b, &name));
                    let mut opts = blob.opt_records()?;
                    opts.sort_by(|a, b| a.compare_by_type_name(b, &name));
                    let _ = writeln!(
                        out,
                        "    version {} @{}: {} dependencies, {} opt records",
                        version,
                        blob.offset(),
                        deps.len(),
                        opts.len()
                    );
                    for dep in &deps {
                        let _ = writeln!(out, "      dep {}", dep.describe(&name));
                    }
                    for opt in &opts {
                        let _ = writeln!(out, "      opt {}", opt.describe(&name));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Machine-readable overview
    pub fn summary(&self) -> serde_json::Value {
        let containers: Vec<serde_json::Value> = self
            .containers
            .iter()
            .map(|c| {
                let versions: usize = c
                    .methods()
                    .map(|(_, head)| c.code_space().version_count(head).unwrap_or(0))
                    .sum();
                serde_json::json!({
                    "methods": c.method_count(),
                    "versions": versions,
                    "code_bytes": c.code_space().len(),
                })
            })
            .collect();
        serde_json::json!({
            "path": self.path.as_ref().map(|p| p.display().to_string()),
            "build_identity": self.build_identity,
            "metaspace_entries": self.meta.len(),
            "containers": containers,
        })
    }
}

/// Display name of every metadata slot of `blob`
fn slot_names(blob: &CodeBlob<'_>, meta: &MetaSpace, method: &str) -> Result<Vec<String>> {
    Ok(decode_stream(blob.aux_meta())?
        .iter()
        .map(|record| match record {
            AuxRecord::SelfMethod => method.to_string(),
            AuxRecord::NonOop => "null".to_string(),
            other => match other.meta_index() {
                Some(index) => meta.name(index),
                None => other.to_string(),
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_blob::emit;
    use crate::vm::{ClassSpec, CodeAssembler, InMemoryVm, LoaderType, RuntimeEnv};

    fn sample(vm: &mut InMemoryVm) -> CacheFile {
        let k = vm.define_class(ClassSpec::new("app/Main", LoaderType::App));
        let m = vm.define_method(k, "run", "()V");
        let mut asm = CodeAssembler::new(&*vm, m);
        asm.nops(24);
        let nm = asm.finish();

        let mut file = CacheFile::new(vm.build_identity());
        let blob = emit(&nm, &*vm, file.meta_mut()).unwrap();
        let name = file.meta().name(blob.method_index);
        let fingerprint = Fingerprint::capture(&vm.settings());
        file.container_for(&fingerprint)
            .add_version(blob.method_index, &name, &blob.bytes)
            .unwrap();
        file
    }

    #[test]
    fn test_write_and_load() {
        let mut vm = InMemoryVm::new();
        let file = sample(&mut vm);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.csa");
        let written = file.write(&path, 1 << 20).unwrap();
        assert_eq!(written, file.encoded_size());

        let loaded = CacheFile::load(&path, Some(&vm.build_identity())).unwrap();
        assert_eq!(loaded.containers().len(), 1);
        assert_eq!(loaded.meta().len(), 1);
        assert!(loaded.select_container(&vm.settings()).is_some());
        assert_eq!(loaded.summary()["containers"][0]["versions"], 1);
    }

    #[test]
    fn test_header_size_matches_encoding() {
        for identity in ["", "b", "build-1234567", "a build identity longer than one word"] {
            let header = FileHeader {
                magic: MAGIC,
                header_size: 0,
                file_size: 0,
                container_offset: 0,
                container_size: 0,
                metaspace_offset: 0,
                metaspace_size: 0,
                container_count: 0,
                build_identity: identity.to_string(),
            };
            let mut w = ByteWriter::new();
            header.encode(&mut w);
            assert_eq!(w.len(), FileHeader::encoded_size(identity), "{:?}", identity);
        }

        let mut vm = InMemoryVm::new();
        vm.set_build_identity("x");
        let bytes = sample(&mut vm).encode().unwrap();
        let loaded = CacheFile::from_view(Arc::new(ByteView::from_vec(bytes)), Some("x")).unwrap();
        assert_eq!(loaded.build_identity(), "x");
    }

    #[test]
    fn test_rejects_bad_files() {
        let mut vm = InMemoryVm::new();
        let bytes = sample(&mut vm).encode().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 1;
        let err = CacheFile::from_view(Arc::new(ByteView::from_vec(bad_magic)), None).unwrap_err();
        assert!(matches!(err, Error::Format { kind: FormatErrorKind::BadMagic, .. }));

        let mut short = bytes.clone();
        short.truncate(bytes.len() - 8);
        let err = CacheFile::from_view(Arc::new(ByteView::from_vec(short)), None).unwrap_err();
        assert!(matches!(err, Error::Format { kind: FormatErrorKind::SizeMismatch, .. }));

        let err = CacheFile::from_view(Arc::new(ByteView::from_vec(bytes.clone())), Some("other build")).unwrap_err();
        assert!(matches!(err, Error::Format { kind: FormatErrorKind::BuildIdentity, .. }));

        assert!(CacheFile::from_view(Arc::new(ByteView::from_vec(bytes)), None).is_ok());
    }

    #[test]
    fn test_size_limit() {
        let mut vm = InMemoryVm::new();
        let file = sample(&mut vm);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.csa");
        let err = file.write(&path, 64).unwrap_err();
        assert!(matches!(err, Error::FileTooLarge { limit: 64, .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_chained_containers() {
        let mut vm = InMemoryVm::new();
        let mut file = sample(&mut vm);
        let mut other = vm.settings();
        other.object_alignment = 16;
        file.container_for(&Fingerprint::capture(&other));
        assert_eq!(file.containers().len(), 2);

        let loaded = CacheFile::from_view(Arc::new(ByteView::from_vec(file.encode().unwrap())), None).unwrap();
        assert_eq!(loaded.containers().len(), 2);
        assert!(loaded.containers()[1].fingerprint().identical(&Fingerprint::capture(&other)));
        assert!(loaded.print(None).contains("Container #1"));
    }

    #[test]
    fn test_print_opt_names_records() {
        let mut vm = InMemoryVm::new();
        let k = vm.define_class(ClassSpec::new("app/Shape", LoaderType::App));
        let m = vm.define_method(k, "area", "()D");
        let mut asm = CodeAssembler::new(&vm, m);
        asm.nops(8);
        let method = asm.meta_index(crate::vm::MetaRef::Method(m));
        let klass = asm.meta_index(crate::vm::MetaRef::Klass(k));
        asm.opt(crate::records::OptRecord::ProfiledReceiver { method, bci: 2, klass });
        asm.dependency(crate::records::DepType::LeafType, &[crate::vm::MetaRef::Klass(k)]);
        let nm = asm.finish();

        let mut file = CacheFile::new(vm.build_identity());
        let blob = emit(&nm, &vm, file.meta_mut()).unwrap();
        let name = file.meta().name(blob.method_index);
        file.container_for(&Fingerprint::capture(&vm.settings()))
            .add_version(blob.method_index, &name, &blob.bytes)
            .unwrap();

        let listing = file.print_opt().unwrap();
        assert!(listing.contains("version 0 @0: 1 dependencies, 1 opt records"));
        assert!(listing.contains("ProfiledReceiver at method=app/Shape.area()D bci=2 klass: app/Shape"));
        assert!(listing.contains("dep "));
    }
}
