use std::fs::File;
use std::io::{BufRead, BufReader};
#[cfg(test)]
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// Start of the kernel direct map on x86_64. Page idle tracking only covers
// user memory, which ends well below this.
pub const PAGE_OFFSET: u64 = 0xffff_8800_0000_0000;

/// The per-process files the walk reads.
#[derive(Debug, Clone)]
pub struct ProcFiles {
    pub maps: PathBuf,
    pub pagemap: PathBuf,
}

impl ProcFiles {
    pub fn for_pid(pid: i32) -> Self {
        Self::under_root("/proc", pid)
    }

    /// Same layout as procfs, rooted elsewhere.
    pub fn under_root(root: impl AsRef<Path>, pid: i32) -> Self {
        let dir = root.as_ref().join(pid.to_string());
        ProcFiles {
            maps: dir.join("maps"),
            pagemap: dir.join("pagemap"),
        }
    }

    /// A fake `/proc/<pid>` holding `maps` verbatim and a sparse pagemap
    /// with `entries` as `(page, entry)` pairs.
    #[cfg(test)]
    pub(crate) fn fixture(
        maps: impl AsRef<[u8]>,
        entries: &[(u64, u64)],
    ) -> (tempfile::TempDir, ProcFiles) {
        let root = tempfile::tempdir().unwrap();
        let files = ProcFiles::under_root(root.path(), 1234);
        std::fs::create_dir_all(files.maps.parent().unwrap()).unwrap();
        std::fs::write(&files.maps, maps).unwrap();

        let mut pagemap = File::create(&files.pagemap).unwrap();
        for &(page, entry) in entries {
            pagemap.seek(SeekFrom::Start(page * 8)).unwrap();
            pagemap.write_all(&entry.to_le_bytes()).unwrap();
        }
        (root, files)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub perms: Option<String>,
    pub pathname: Option<String>,
}

impl MemoryRegion {
    pub fn is_user_space(&self) -> bool {
        self.start < PAGE_OFFSET
    }

    pub fn pages(&self, page_size: u64) -> u64 {
        (self.end - self.start) / page_size
    }
}

pub struct Scanner {
    maps: PathBuf,
}

impl Scanner {
    pub fn new(maps: impl Into<PathBuf>) -> Self {
        Scanner { maps: maps.into() }
    }

    /// Parses every line of the maps file.
    ///
    /// Nothing is returned unless every line parses. Pathnames are arbitrary
    /// bytes, so lines are read raw and decoded lossily; the range is ASCII.
    pub fn get_maps(&self) -> Result<Vec<MemoryRegion>> {
        let access = |source| Error::ProcessAccess {
            path: self.maps.clone(),
            source,
        };

        let file = File::open(&self.maps).map_err(access)?;
        let mut reader = BufReader::new(file);
        let mut regions = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).map_err(access)? == 0 {
                break;
            }
            let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
            regions.push(parse_map_line(&String::from_utf8_lossy(raw))?);
        }

        Ok(regions)
    }
}

/// Parses one maps line.
///
/// Format: `00400000-0040b000 r-xp 00000000 08:01 123456 /path/to/file`. Only
/// the leading range is required.
pub fn parse_map_line(line: &str) -> Result<MemoryRegion> {
    let malformed = || Error::MapsParse {
        line: line.to_string(),
    };

    let mut parts = line.split_whitespace();
    let range = parts.next().ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;

    let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
    if end < start {
        return Err(malformed());
    }

    let perms = parts.next().map(str::to_string);
    let pathname = parts.nth(3).map(str::to_string);

    Ok(MemoryRegion {
        start,
        end,
        perms,
        pathname,
    })
}
