//! File-count and byte-count progress as reported by the worker.
//!
//! The two streams are independent: a file-status event replaces the file
//! projection wholesale and never touches the byte projection (and vice
//! versa).

use serde::Serialize;

/// Unit used when byte counts are squeezed into a bounded-width bar
pub const BAR_UNIT_BYTES: u64 = 1024;

/// File-count projection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileProgress {
    pub done: u32,
    pub in_flight: u32,
    pub total: u32,
}

impl FileProgress {
    /// Build from raw worker counters. `done` is clamped to `total`; the
    /// worker's counters are advisory and may race each other.
    pub fn new(done: u32, in_flight: u32, total: u32) -> Self {
        Self {
            done: done.min(total),
            in_flight,
            total,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.done)
    }
}

/// Byte-count projection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteProgress {
    pub done: u64,
    pub in_flight: u64,
    pub total: u64,
}

impl ByteProgress {
    pub fn new(done: u64, in_flight: u64, total: u64) -> Self {
        Self {
            done: done.min(total),
            in_flight,
            total,
        }
    }

    /// Project onto a bar whose range is a signed 32-bit int.
    ///
    /// Multi-gigabyte totals overflow such a bar, so everything is
    /// expressed in KiB. The secondary mark (`done + in_flight`) is
    /// clamped to the scaled maximum.
    pub fn scaled(&self) -> ScaledBar {
        let to_units = |bytes: u64| (bytes / BAR_UNIT_BYTES).min(i32::MAX as u64) as i32;
        let max = to_units(self.total);
        let progress = to_units(self.done).min(max);
        let secondary = progress
            .saturating_add(to_units(self.in_flight))
            .min(max);
        ScaledBar {
            max,
            progress,
            secondary,
        }
    }
}

/// A progress bar in bounded units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScaledBar {
    pub max: i32,
    pub progress: i32,
    pub secondary: i32,
}

/// Combined view handed to observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub files: FileProgress,
    pub bytes: ByteProgress,
}

impl ProgressSnapshot {
    pub fn files_remaining(&self) -> u32 {
        self.files.remaining()
    }

    /// Human-readable remaining-file line
    pub fn remaining_text(&self) -> String {
        format!("Files to upload: {}", self.files_remaining())
    }
}

/// Holds the latest file and byte projections
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    snapshot: ProgressSnapshot,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file_status(&mut self, done: u32, in_flight: u32, total: u32) {
        self.snapshot.files = FileProgress::new(done, in_flight, total);
    }

    pub fn set_byte_status(&mut self, done: u64, in_flight: u64, total: u64) {
        self.snapshot.bytes = ByteProgress::new(done, in_flight, total);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot
    }

    pub fn reset(&mut self) {
        self.snapshot = ProgressSnapshot::default();
    }
}
