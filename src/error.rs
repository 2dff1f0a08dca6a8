use std::io;
use std::path::PathBuf;

/// Fatal conditions that abort a measurement.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The idle page bitmap could not be opened. Either the kernel lacks
    /// `CONFIG_IDLE_PAGE_TRACKING` or we are not privileged enough.
    #[error("can't open idle page bitmap {}: {source}", path.display())]
    IdleBitmapUnavailable { path: PathBuf, source: io::Error },

    #[error("can't write idle page bitmap {}: {source}", path.display())]
    IdleBitmapWrite { path: PathBuf, source: io::Error },

    #[error("can't read idle page bitmap {}: {source}", path.display())]
    IdleBitmapRead { path: PathBuf, source: io::Error },

    /// A per-process file could not be opened or read. Usually the process
    /// exited, or the PID was wrong.
    #[error("can't access {}: {source}", path.display())]
    ProcessAccess { path: PathBuf, source: io::Error },

    #[error("malformed maps line: {line:?}")]
    MapsParse { line: String },

    /// The page table named a frame the bitmap snapshot does not cover.
    #[error(
        "bad PFN {pfn:#x} read from pagemap: bitmap offset {offset} is beyond snapshot of {snapshot_len} bytes"
    )]
    BitmapOutOfBounds {
        pfn: u64,
        offset: usize,
        snapshot_len: usize,
    },

    #[error("interval of {seconds} seconds is too short")]
    IntervalTooShort { seconds: f64 },

    #[error("interval of {seconds} seconds is too long")]
    IntervalTooLong { seconds: f64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
