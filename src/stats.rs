//! Counters, sizes and timers
//!
//! Revive counters are always kept. Sizes and timers are only recorded
//! when the `perf` option is on.

use crate::code_blob::BlobSizes;
use crate::container::ReviveStatus;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte counters gathered while saving or merging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    FileHeader,
    LookupTable,
    BlobHeader,
    Body,
    AuxInfo,
    OopMaps,
}

impl SizeKind {
    pub const ALL: [SizeKind; 6] = [
        SizeKind::FileHeader,
        SizeKind::LookupTable,
        SizeKind::BlobHeader,
        SizeKind::Body,
        SizeKind::AuxInfo,
        SizeKind::OopMaps,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SizeKind::FileHeader => "file header",
            SizeKind::LookupTable => "lookup table",
            SizeKind::BlobHeader => "code blob header",
            SizeKind::Body => "code body",
            SizeKind::AuxInfo => "aux info",
            SizeKind::OopMaps => "oop map set",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Save,
    RestoreSuccess,
    RestoreFail,
    Merge,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Save,
        TimerKind::RestoreSuccess,
        TimerKind::RestoreFail,
        TimerKind::Merge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TimerKind::Save => "save",
            TimerKind::RestoreSuccess => "restore success",
            TimerKind::RestoreFail => "restore fail",
            TimerKind::Merge => "merge",
        }
    }
}

fn status_slot(status: ReviveStatus) -> usize {
    match status {
        ReviveStatus::Success => 0,
        ReviveStatus::Fail => 1,
        ReviveStatus::NotInCache => 2,
        ReviveStatus::FoundWithName => 3,
    }
}

/// Process-wide statistics, shared by all compiler threads
#[derive(Debug, Default)]
pub struct Statistics {
    perf: bool,
    revive: [AtomicU64; 4],
    sizes: [AtomicU64; 6],
    timer_nanos: [AtomicU64; 4],
    timer_counts: [AtomicU64; 4],
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub success: u64,
    pub fail: u64,
    pub not_in_cache: u64,
    pub found_with_name: u64,
    /// (name, bytes) per size counter
    pub sizes: Vec<(&'static str, u64)>,
    /// (name, count, total microseconds) per timer
    pub timers: Vec<(&'static str, u64, u64)>,
}

impl StatsSnapshot {
    pub fn total_lookups(&self) -> u64 {
        self.success + self.fail + self.not_in_cache + self.found_with_name
    }
}

impl Statistics {
    pub fn new(perf: bool) -> Self {
        Self {
            perf,
            ..Self::default()
        }
    }

    pub fn perf_enabled(&self) -> bool {
        self.perf
    }

    pub fn record_revive(&self, status: ReviveStatus) {
        self.revive[status_slot(status)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn revive_count(&self, status: ReviveStatus) -> u64 {
        self.revive[status_slot(status)].load(Ordering::Relaxed)
    }

    pub fn add_size(&self, kind: SizeKind, bytes: usize) {
        if self.perf {
            self.sizes[kind as usize].fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn add_blob_sizes(&self, sizes: &BlobSizes) {
        self.add_size(SizeKind::BlobHeader, sizes.header);
        self.add_size(SizeKind::Body, sizes.body);
        self.add_size(SizeKind::AuxInfo, sizes.aux_info);
        self.add_size(SizeKind::OopMaps, sizes.oop_maps);
    }

    pub fn size(&self, kind: SizeKind) -> u64 {
        self.sizes[kind as usize].load(Ordering::Relaxed)
    }

    pub fn record_time(&self, kind: TimerKind, elapsed: Duration) {
        if self.perf {
            let slot = kind as usize;
            self.timer_nanos[slot].fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
            self.timer_counts[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Start a timer; elapsed time is recorded under the kind passed to
    /// [`PhaseTimer::stop`]
    pub fn start(&self) -> PhaseTimer<'_> {
        PhaseTimer {
            stats: self,
            start: self.perf.then(Instant::now),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let revive = |status| self.revive_count(status);
        StatsSnapshot {
            success: revive(ReviveStatus::Success),
            fail: revive(ReviveStatus::Fail),
            not_in_cache: revive(ReviveStatus::NotInCache),
            found_with_name: revive(ReviveStatus::FoundWithName),
            sizes: SizeKind::ALL.iter().map(|k| (k.name(), self.size(*k))).collect(),
            timers: TimerKind::ALL
                .iter()
                .map(|k| {
                    let slot = *k as usize;
                    (
                        k.name(),
                        self.timer_counts[slot].load(Ordering::Relaxed),
                        self.timer_nanos[slot].load(Ordering::Relaxed) / 1_000,
                    )
                })
                .collect(),
        }
    }

    /// Human readable report
    pub fn report(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "Code revive statistics:");
        for status in ReviveStatus::ALL {
            let _ = writeln!(out, "  {:<16} {}", status.name(), self.revive_count(status));
        }
        if !self.perf {
            return out;
        }
        let _ = writeln!(out, "Sizes (bytes):");
        for (name, bytes) in &snap.sizes {
            let _ = writeln!(out, "  {:<16} {}", name, bytes);
        }
        let _ = writeln!(out, "Timers:");
        for (name, count, micros) in &snap.timers {
            let _ = writeln!(out, "  {:<16} {} x, {:.3} ms", name, count, *micros as f64 / 1000.0);
        }
        out
    }
}

/// Running timer from [`Statistics::start`]
pub struct PhaseTimer<'a> {
    stats: &'a Statistics,
    start: Option<Instant>,
}

impl PhaseTimer<'_> {
    pub fn stop(self, kind: TimerKind) {
        if let Some(start) = self.start {
            self.stats.record_time(kind, start.elapsed());
        }
    }
}
