use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Instants bracketing the phases of one measurement.
#[derive(Debug, Clone, Copy)]
pub struct TimingMarks {
    /// Before the bitmap is set.
    pub mark_start: Instant,
    /// After the bitmap is set, before sleeping.
    pub mark_end: Instant,
    /// After sleeping, before the snapshot is read.
    pub snapshot_start: Instant,
    /// After the address space walk.
    pub walk_end: Instant,
}

/// Phase durations and the corrected measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub set_time: Duration,
    pub sleep_time: Duration,
    pub read_time: Duration,
    pub total_time: Duration,
    pub estimated_time: Duration,
}

impl Estimate {
    /// The estimated window runs from the middle of the set phase to the
    /// middle of the read phase.
    pub fn from_marks(marks: &TimingMarks) -> Self {
        let set_time = marks.mark_end.saturating_duration_since(marks.mark_start);
        let sleep_time = marks.snapshot_start.saturating_duration_since(marks.mark_end);
        let read_time = marks.walk_end.saturating_duration_since(marks.snapshot_start);
        let total_time = marks.walk_end.saturating_duration_since(marks.mark_start);

        let estimated_time = total_time
            .saturating_sub(set_time / 2)
            .saturating_sub(read_time / 2);

        Estimate {
            set_time,
            sleep_time,
            read_time,
            total_time,
            estimated_time,
        }
    }
}

pub fn referenced_bytes(active_pages: u64, page_size: u64) -> u64 {
    active_pages * page_size
}

/// Binary megabytes.
pub fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}
