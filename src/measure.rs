use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::estimate::{self, Estimate, TimingMarks};
use crate::idlemap::IdleBitmap;
use crate::scanner::ProcFiles;
use crate::walker::{AddressSpaceWalker, PageCounts};

/// Shortest interval worth measuring.
pub const MIN_INTERVAL_SECS: f64 = 0.01;

/// One working set measurement of one process.
pub struct Measurement {
    interval: Duration,
    walker: AddressSpaceWalker,
    page_size: u64,
}

impl Measurement {
    pub fn new(files: ProcFiles, seconds: f64, page_size: u64) -> Result<Self> {
        // Also rejects NaN.
        if !(seconds >= MIN_INTERVAL_SECS) {
            return Err(Error::IntervalTooShort { seconds });
        }
        let interval = Duration::try_from_secs_f64(seconds)
            .map_err(|_| Error::IntervalTooLong { seconds })?;

        Ok(Measurement {
            interval,
            walker: AddressSpaceWalker::new(files, page_size),
            page_size,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sets the bitmap, sleeps, then counts the pages referenced meanwhile.
    pub fn run<B: IdleBitmap + ?Sized>(&self, bitmap: &mut B) -> Result<Report> {
        let mark_start = Instant::now();
        bitmap.mark_all_idle()?;
        let mark_end = Instant::now();

        thread::sleep(self.interval);

        let snapshot_start = Instant::now();
        let snapshot = bitmap.snapshot()?;
        let counts = self.walker.walk(&snapshot)?;
        let walk_end = Instant::now();

        let estimate = Estimate::from_marks(&TimingMarks {
            mark_start,
            mark_end,
            snapshot_start,
            walk_end,
        });

        let report = Report {
            estimate,
            counts,
            page_size: self.page_size,
        };
        report.log_details();
        Ok(report)
    }
}

/// Result of a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub estimate: Estimate,
    pub counts: PageCounts,
    pub page_size: u64,
}

impl Report {
    pub fn referenced_bytes(&self) -> u64 {
        estimate::referenced_bytes(self.counts.active, self.page_size)
    }

    pub fn walked_bytes(&self) -> u64 {
        estimate::referenced_bytes(self.counts.walked, self.page_size)
    }

    pub fn referenced_mb(&self) -> f64 {
        estimate::to_mb(self.referenced_bytes())
    }

    pub fn estimated_secs(&self) -> f64 {
        self.estimate.estimated_time.as_secs_f64()
    }

    fn log_details(&self) {
        let e = &self.estimate;
        debug!("set time  : {:.3} s", e.set_time.as_secs_f64());
        debug!("sleep time: {:.3} s", e.sleep_time.as_secs_f64());
        debug!("read time : {:.3} s", e.read_time.as_secs_f64());
        debug!("dur time  : {:.3} s", e.total_time.as_secs_f64());
        debug!(
            "referenced: {} pages, {} Kbytes",
            self.counts.active,
            self.referenced_bytes() / 1024
        );
        debug!(
            "walked    : {} pages, {} Kbytes",
            self.counts.walked,
            self.walked_bytes() / 1024
        );
    }
}

/// The two-line report, without a trailing newline.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<7} {:>10}", "Est(s)", "Ref(MB)")?;
        write!(f, "{:<7.3} {:>10.2}", self.estimated_secs(), self.referenced_mb())
    }
}
