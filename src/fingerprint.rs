//! VM settings that must agree for cached code to be usable
//!
//! A fingerprint is captured once per save and stored in front of each
//! container. On load every captured value is compared with the running
//! process; during merge two fingerprints are compared with each other.

use crate::format::{ByteReader, ByteWriter};
use crate::vm::{NarrowPtr, VmFlag, VmSettings};
use crate::{Error, Result};
use std::fmt::Write as _;
use tracing::debug;

/// Flag name prefixes that never affect generated code
const IGNORED_FLAG_PREFIXES: &[&str] = &[
    "Print",
    "Trace",
    "Profile",
    "Perf",
    "CI",
    "HeapDump",
    "Unlock",
    "Log",
    "BackgroundCompilation",
    "UseCompressedOops",
    "UseCompressedClassPointers",
    "UseUTF8UTF16Intrinsics",
    "IgnoreUnrecognizedVMOptions",
    "ClassUnloading",
    "CMSClassUnloadingEnabled",
    "DisableExplicitGC",
    "UseSharedSpaces",
    "CMSIgnoreYoungGenPerWorker",
    "CMSScavengeBeforeRemark",
    "FastTLABRefill",
    "UseAdaptiveSizePolicy",
    "UseSHM",
    "CMSCleanOnEnter",
    "ParGCUseLocalOverflow",
    "IgnoreNoShareValue",
    "UseGCOverheadLimit",
    "UseContainerSupport",
    "CMSConcurrentMTEnabled",
];

/// Encoded size of the fixed part
pub const HEADER_SIZE: usize = 48;

fn is_ignored(name: &str) -> bool {
    IGNORED_FLAG_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn flag_enabled(flags: &[VmFlag], name: &str) -> bool {
    flags.iter().any(|f| f.name == name && f.value)
}

/// Flags of a collector that is not in use do not matter
fn is_inactive_gc_flag(flags: &[VmFlag], name: &str) -> bool {
    if !flag_enabled(flags, "UseG1GC") {
        name.starts_with("G1")
    } else if !flag_enabled(flags, "UseConcMarkSweepGC") {
        name.starts_with("CMS") || name.starts_with("UseCMS")
    } else {
        false
    }
}

/// Captured code-generation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub object_alignment: u32,
    pub contended_padding_width: u32,
    pub fields_allocation_style: u32,
    pub narrow_oop: NarrowPtr,
    pub narrow_klass: NarrowPtr,
    /// (index into the settings flag table, value)
    pub bool_flags: Vec<(u32, bool)>,
}

fn same_narrow_ptr(a: &NarrowPtr, b: &NarrowPtr) -> bool {
    (a.base == 0) == (b.base == 0) && a.shift == b.shift && a.implicit_null_checks == b.implicit_null_checks
}

impl Fingerprint {
    /// Read the relevant settings of the running VM
    pub fn capture(settings: &VmSettings) -> Self {
        let bool_flags = settings
            .flags
            .iter()
            .enumerate()
            .filter(|(_, f)| f.product)
            .filter(|(_, f)| !is_inactive_gc_flag(&settings.flags, &f.name) && !is_ignored(&f.name))
            .map(|(i, f)| (i as u32, f.value))
            .collect();
        Self {
            object_alignment: settings.object_alignment,
            contended_padding_width: settings.contended_padding_width,
            fields_allocation_style: settings.fields_allocation_style,
            narrow_oop: settings.narrow_oop,
            narrow_klass: settings.narrow_klass,
            bool_flags,
        }
    }

    /// Whether code captured under `self` is valid under `current`
    pub fn matches(&self, current: &VmSettings) -> Result<()> {
        let mismatch = |what: &str| Err(Error::FingerprintMismatch(format!("different setting of {}", what)));
        if self.object_alignment != current.object_alignment {
            return mismatch("object alignment");
        }
        if self.contended_padding_width != current.contended_padding_width {
            return mismatch("ContendedPaddingWidth");
        }
        if self.fields_allocation_style != current.fields_allocation_style {
            return mismatch("FieldsAllocationStyle");
        }
        for (index, value) in &self.bool_flags {
            match current.flags.get(*index as usize) {
                Some(flag) if flag.value == *value => {}
                Some(flag) => return mismatch(&flag.name),
                None => return mismatch(&format!("flag #{}", index)),
            }
        }
        if !same_narrow_ptr(&self.narrow_oop, &current.narrow_oop)
            || !same_narrow_ptr(&self.narrow_klass, &current.narrow_klass)
        {
            return mismatch("compressed pointers");
        }
        Ok(())
    }

    /// Exact comparison of two captured fingerprints
    pub fn identical(&self, other: &Fingerprint) -> bool {
        same_narrow_ptr(&self.narrow_oop, &other.narrow_oop)
            && same_narrow_ptr(&self.narrow_klass, &other.narrow_klass)
            && self.object_alignment == other.object_alignment
            && self.contended_padding_width == other.contended_padding_width
            && self.fields_allocation_style == other.fields_allocation_style
            && self.flag_bytes() == other.flag_bytes()
    }

    fn flag_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.bool_flags.len() * 8);
        for (index, value) in &self.bool_flags {
            w.put_u32(*index);
            w.put_u32(*value as u32);
        }
        w.into_inner()
    }

    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.bool_flags.len() * 8
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.object_alignment);
        w.put_u32(self.contended_padding_width);
        w.put_u32(self.fields_allocation_style);
        w.put_u32(self.bool_flags.len() as u32);
        for nps in [&self.narrow_oop, &self.narrow_klass] {
            w.put_u64(nps.base);
            w.put_u32(nps.shift);
            w.put_u32(nps.implicit_null_checks as u32);
        }
        w.put_bytes(&self.flag_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let object_alignment = r.u32()?;
        let contended_padding_width = r.u32()?;
        let fields_allocation_style = r.u32()?;
        let count = r.u32()? as usize;
        let mut nps = [NarrowPtr::default(); 2];
        for slot in nps.iter_mut() {
            slot.base = r.u64()?;
            slot.shift = r.u32()?;
            slot.implicit_null_checks = r.u32()? != 0;
        }
        if count > r.remaining() / 8 {
            return Err(Error::corruption(format!(
                "fingerprint declares {} flags in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut bool_flags = Vec::with_capacity(count);
        for _ in 0..count {
            let index = r.u32()?;
            let value = r.u32()? != 0;
            bool_flags.push((index, value));
        }
        debug!(target: crate::logging::ARCHIVE, flags = count, "decoded fingerprint");
        Ok(Self {
            object_alignment,
            contended_padding_width,
            fields_allocation_style,
            narrow_oop: nps[0],
            narrow_klass: nps[1],
            bool_flags,
        })
    }

    /// Listing of the captured values; flag names come from `settings`
    /// when given
    pub fn print(&self, settings: Option<&VmSettings>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "    ObjectAlignmentInBytes = {}", self.object_alignment);
        let _ = writeln!(out, "    ContendedPaddingWidth  = {}", self.contended_padding_width);
        let _ = writeln!(out, "    FieldsAllocationStyle  = {}", self.fields_allocation_style);
        for (label, nps) in [("UseCompressedOops", &self.narrow_oop), ("UseCompressedClassPointers", &self.narrow_klass)] {
            let _ = writeln!(out, "    NarrowPtrStruct for {}", label);
            let _ = writeln!(out, "      base  = {:#x}", nps.base);
            let _ = writeln!(out, "      shift = {}", nps.shift);
        }
        let _ = write!(out, "    Bool options ({}):", self.bool_flags.len());
        for (i, (index, value)) in self.bool_flags.iter().enumerate() {
            if i % 5 == 0 {
                out.push_str("\n      ");
            }
            let name = settings
                .and_then(|s| s.flags.get(*index as usize))
                .map(|f| f.name.clone())
                .unwrap_or_else(|| format!("#{}", index));
            let _ = write!(out, " -XX:{}{}", if *value { '+' } else { '-' }, name);
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VmSettings {
        VmSettings {
            flags: vec![
                VmFlag::product("UseG1GC", true),
                VmFlag::product("UseTLAB", true),
                VmFlag::product("PrintCompilation", false),
                VmFlag::product("G1UseAdaptiveIHOP", true),
                VmFlag::product("CMSPrecleaningEnabled", true),
                VmFlag::product("UseFastLocking", false),
                VmFlag {
                    name: "VerifyOops".into(),
                    value: false,
                    product: false,
                },
            ],
            ..VmSettings::default()
        }
    }

    #[test]
    fn test_capture_filters_flags() {
        let fp = Fingerprint::capture(&settings());
        let indices: Vec<u32> = fp.bool_flags.iter().map(|(i, _)| *i).collect();
        // G1 in use: G1 flags kept, CMS flags dropped, Print* ignored
        assert_eq!(indices, vec![0, 1, 3, 5]);
    }

    #[test]
    fn test_g1_flags_dropped_without_g1() {
        let mut s = settings();
        s.flags[0].value = false;
        let fp = Fingerprint::capture(&s);
        let indices: Vec<u32> = fp.bool_flags.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 4, 5]);
    }

    #[test]
    fn test_matches_is_reflexive_and_detects_perturbation() {
        let s = settings();
        let fp = Fingerprint::capture(&s);
        assert!(fp.matches(&s).is_ok());

        let mut other = s.clone();
        other.object_alignment = 16;
        assert!(fp.matches(&other).is_err());

        let mut other = s.clone();
        other.flags[5].value = true;
        assert!(matches!(fp.matches(&other), Err(Error::FingerprintMismatch(_))));

        let mut other = s.clone();
        other.narrow_oop.shift = 0;
        assert!(fp.matches(&other).is_err());

        // Non-zero bases are interchangeable
        let mut other = s.clone();
        other.narrow_klass.base = 0x8_0000_0000;
        assert!(fp.matches(&other).is_err());
        let mut fp2 = fp.clone();
        fp2.narrow_klass.base = 0x9_0000_0000;
        assert!(fp2.matches(&other).is_ok());
    }

    #[test]
    fn test_encode_decode() {
        let fp = Fingerprint::capture(&settings());
        let mut w = ByteWriter::new();
        fp.encode(&mut w);
        assert_eq!(w.len(), fp.encoded_size());
        let back = Fingerprint::decode(w.as_slice()).unwrap();
        assert_eq!(back, fp);
        assert!(back.identical(&fp));
    }

    #[test]
    fn test_identical_compares_flag_values() {
        let s = settings();
        let a = Fingerprint::capture(&s);
        let mut s2 = s.clone();
        s2.flags[1].value = false;
        let b = Fingerprint::capture(&s2);
        assert!(!a.identical(&b));
    }

    #[test]
    fn test_decode_rejects_oversized_flag_count() {
        let fp = Fingerprint::capture(&settings());
        let mut w = ByteWriter::new();
        fp.encode(&mut w);
        let mut bytes = w.into_inner();
        bytes[12..16].copy_from_slice(&1000u32.to_le_bytes());
        assert!(Fingerprint::decode(&bytes).is_err());
    }

    #[test]
    fn test_print_names_flags() {
        let s = settings();
        let text = Fingerprint::capture(&s).print(Some(&s));
        assert!(text.contains("-XX:+UseTLAB"));
        assert!(text.contains("ObjectAlignmentInBytes = 8"));
    }
}
