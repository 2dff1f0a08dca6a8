use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const PAGEMAP_ENTRY_SIZE: usize = 8;
const PFN_MASK: u64 = (1 << 55) - 1; // Bits 0-54
const PRESENT_MASK: u64 = 1 << 63;

// Upper bound on entries held in memory at once (8 MiB of pagemap). Regions
// this large are rare; everything smaller is read in a single call.
const MAX_ENTRIES_PER_READ: u64 = 1 << 20;

/// Returns the frame backing a pagemap entry, or `None` when the page is not
/// resident.
pub fn entry_pfn(entry: u64) -> Option<u64> {
    // Swapped-out entries carry swap type/offset in the low bits.
    if entry & PRESENT_MASK == 0 {
        return None;
    }

    match entry & PFN_MASK {
        0 => None,
        pfn => Some(pfn),
    }
}

/// Virtual to physical translation through `/proc/<pid>/pagemap`.
pub struct Pagemap {
    file: File,
    path: PathBuf,
    page_size: u64,
}

impl Pagemap {
    pub fn open(path: impl AsRef<Path>, page_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| Error::ProcessAccess {
            path: path.clone(),
            source,
        })?;
        Ok(Pagemap {
            file,
            path,
            page_size,
        })
    }

    /// Calls `f` with the entries for `[start, end)`, a window at a time.
    pub fn for_each_window<F>(&mut self, start: u64, end: u64, mut f: F) -> Result<()>
    where
        F: FnMut(&[u64]) -> Result<()>,
    {
        let first_page = start / self.page_size;
        let num_pages = end.saturating_sub(start) / self.page_size;

        let mut bytes = Vec::new();
        let mut entries = Vec::new();
        let mut done = 0;
        while done < num_pages {
            let count = (num_pages - done).min(MAX_ENTRIES_PER_READ);
            self.read_entries(first_page + done, count, &mut bytes)
                .map_err(|source| Error::ProcessAccess {
                    path: self.path.clone(),
                    source,
                })?;

            entries.clear();
            entries.extend(decode_entries(&bytes));
            f(&entries)?;
            done += count;
        }

        Ok(())
    }

    fn read_entries(&mut self, page: u64, count: u64, bytes: &mut Vec<u8>) -> io::Result<()> {
        let offset = page * PAGEMAP_ENTRY_SIZE as u64;
        bytes.resize(count as usize * PAGEMAP_ENTRY_SIZE, 0);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(bytes)
    }
}

/// Splits raw pagemap bytes into little-endian entries.
pub fn decode_entries(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.chunks_exact(PAGEMAP_ENTRY_SIZE).map(|chunk| {
        let mut raw = [0u8; PAGEMAP_ENTRY_SIZE];
        raw.copy_from_slice(chunk);
        u64::from_le_bytes(raw)
    })
}
