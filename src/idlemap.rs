use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sys;

pub const IDLEMAP_PATH: &str = "/sys/kernel/mm/page_idle/bitmap";

// 8 bytes per chunk (64 bits), see mm/page_idle.c
pub const IDLEMAP_CHUNK_SIZE: usize = 8;

// Buffer size for setting idle map
const IDLEMAP_BUF_SIZE: usize = 4096;

/// The host-wide idle page bitmap.
///
/// There is one bitmap per host and the kernel does no arbitration, so two
/// measurements running at once will clobber each other. Callers that need
/// concurrent measurements must serialize them themselves.
pub trait IdleBitmap {
    /// Marks every resident page idle. Returns the number of bitmap bytes the
    /// kernel accepted.
    fn mark_all_idle(&mut self) -> Result<u64>;

    /// Copies the whole bitmap into memory.
    fn snapshot(&mut self) -> Result<IdleSnapshot>;
}

/// [`IdleBitmap`] backed by the sysfs file.
#[derive(Debug, Clone)]
pub struct KernelIdleBitmap {
    path: PathBuf,
}

impl KernelIdleBitmap {
    pub fn new() -> Self {
        Self::with_path(IDLEMAP_PATH)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        KernelIdleBitmap { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, source: io::Error) -> Error {
        Error::IdleBitmapUnavailable {
            path: self.path.clone(),
            source,
        }
    }
}

impl Default for KernelIdleBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleBitmap for KernelIdleBitmap {
    fn mark_all_idle(&mut self) -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| self.unavailable(e))?;

        let written = fill_idle(&mut file).map_err(|source| Error::IdleBitmapWrite {
            path: self.path.clone(),
            source,
        })?;
        debug!(bytes = written, "Set idle page bitmap.");
        Ok(written)
    }

    fn snapshot(&mut self) -> Result<IdleSnapshot> {
        let file = File::open(&self.path).map_err(|e| self.unavailable(e))?;

        let snapshot =
            read_snapshot(file, capacity_hint()).map_err(|source| Error::IdleBitmapRead {
                path: self.path.clone(),
                source,
            })?;
        if snapshot.is_empty() {
            warn!(path = %self.path.display(), "Idle page bitmap is empty.");
        }
        debug!(bytes = snapshot.len(), "Loaded idle page bitmap.");
        Ok(snapshot)
    }
}

/// Writes all-ones chunks until the writer refuses more.
///
/// Each write idles the frames covered by the bytes written at the current
/// file position, so the whole bitmap is only covered once the kernel runs
/// past the last frame and fails the write. That failure (or a zero-length
/// write) ends the loop.
///
/// A failure on the very first write is returned instead, and fails the run:
/// nothing was idled, so any count taken afterwards would be meaningless.
pub fn fill_idle<W: Write>(writer: &mut W) -> io::Result<u64> {
    let buf = [0xffu8; IDLEMAP_BUF_SIZE];
    let mut written = 0u64;

    loop {
        match writer.write(&buf) {
            Ok(0) => break,
            Ok(n) => written += n as u64,
            Err(e) if written == 0 => return Err(e),
            Err(e) => {
                debug!(error = %e, written, "Idle page bitmap write stopped.");
                break;
            }
        }
    }

    Ok(written)
}

/// Reads a bitmap stream to its end.
pub fn read_snapshot<R: Read>(mut reader: R, capacity_hint: usize) -> io::Result<IdleSnapshot> {
    let mut data = Vec::with_capacity(capacity_hint);
    reader.read_to_end(&mut data)?;
    Ok(IdleSnapshot::new(data))
}

/// One bit per physical page on the host, rounded up to whole chunks. The
/// kernel may expose a few more frames than there is RAM, in which case the
/// buffer just grows.
fn capacity_hint() -> usize {
    sys::phys_pages()
        .map(|pages| pages.div_ceil(64) as usize * IDLEMAP_CHUNK_SIZE)
        .unwrap_or(0)
}

/// An in-memory copy of the idle page bitmap.
///
/// The bitmap is a sequence of 64-bit little-endian chunks; bit `pfn % 64` of
/// chunk `pfn / 64` is set while frame `pfn` is idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleSnapshot {
    data: Vec<u8>,
}

impl IdleSnapshot {
    pub fn new(data: Vec<u8>) -> Self {
        IdleSnapshot { data }
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true when frame `pfn` was referenced after the bitmap was set.
    ///
    /// Fails with [`Error::BitmapOutOfBounds`] when the frame's chunk lies
    /// beyond the bytes actually read.
    pub fn is_page_active(&self, pfn: u64) -> Result<bool> {
        let out_of_bounds = |offset| Error::BitmapOutOfBounds {
            pfn,
            offset,
            snapshot_len: self.data.len(),
        };

        let offset = usize::try_from(pfn / 64)
            .ok()
            .and_then(|chunk| chunk.checked_mul(IDLEMAP_CHUNK_SIZE))
            .ok_or_else(|| out_of_bounds(usize::MAX))?;
        let chunk = offset
            .checked_add(IDLEMAP_CHUNK_SIZE)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| out_of_bounds(offset))?;

        let mut raw = [0u8; IDLEMAP_CHUNK_SIZE];
        raw.copy_from_slice(chunk);
        let idlebits = u64::from_le_bytes(raw);

        // 0 means accessed (active), 1 means idle
        Ok(idlebits & (1 << (pfn % 64)) == 0)
    }
}

/// In-memory bitmap standing in for sysfs in tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct MemoryIdleBitmap {
    pub bits: Vec<u8>,
    pub marks: usize,
    pub snapshots: usize,
}

#[cfg(test)]
impl MemoryIdleBitmap {
    /// A bitmap covering `frames` frames, all of them referenced.
    pub fn new(frames: u64) -> Self {
        let len = frames.div_ceil(64) as usize * IDLEMAP_CHUNK_SIZE;
        MemoryIdleBitmap {
            bits: vec![0; len],
            marks: 0,
            snapshots: 0,
        }
    }

    /// Simulates a hardware access to `pfn`.
    pub fn touch(&mut self, pfn: u64) {
        self.bits[(pfn / 8) as usize] &= !(1 << (pfn % 8));
    }
}

#[cfg(test)]
impl IdleBitmap for MemoryIdleBitmap {
    fn mark_all_idle(&mut self) -> Result<u64> {
        self.marks += 1;
        self.bits.fill(0xff);
        Ok(self.bits.len() as u64)
    }

    fn snapshot(&mut self) -> Result<IdleSnapshot> {
        self.snapshots += 1;
        Ok(IdleSnapshot::new(self.bits.clone()))
    }
}
