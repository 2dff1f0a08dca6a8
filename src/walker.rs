use tracing::{debug, trace};

use crate::error::Result;
use crate::idlemap::IdleSnapshot;
use crate::pagemap::{Pagemap, entry_pfn};
use crate::scanner::{ProcFiles, Scanner};

/// Resident pages seen by a walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    /// Every resident page considered.
    pub walked: u64,
    /// Resident pages referenced since the bitmap was set. Never exceeds
    /// `walked`.
    pub active: u64,
}

impl PageCounts {
    /// Counts a batch of pagemap entries against the snapshot.
    ///
    /// On error the counts are left partially updated and should be thrown
    /// away.
    pub fn add_entries(&mut self, entries: &[u64], snapshot: &IdleSnapshot) -> Result<()> {
        for &entry in entries {
            let Some(pfn) = entry_pfn(entry) else {
                continue;
            };

            let active = snapshot.is_page_active(pfn)?;
            trace!(entry = format_args!("{entry:#x}"), pfn = format_args!("{pfn:#x}"), active);

            if active {
                self.active += 1;
            }
            self.walked += 1;
        }
        Ok(())
    }
}

/// Walks a process's user address space and checks every resident page
/// against an idle bitmap snapshot.
pub struct AddressSpaceWalker {
    files: ProcFiles,
    page_size: u64,
}

impl AddressSpaceWalker {
    pub fn new(files: ProcFiles, page_size: u64) -> Self {
        AddressSpaceWalker { files, page_size }
    }

    pub fn walk(&self, snapshot: &IdleSnapshot) -> Result<PageCounts> {
        let regions = Scanner::new(&self.files.maps).get_maps()?;
        let mut pagemap = Pagemap::open(&self.files.pagemap, self.page_size)?;
        let mut counts = PageCounts::default();

        for region in regions {
            if !region.is_user_space() {
                continue;
            }
            debug!(
                start = format_args!("{:#x}", region.start),
                end = format_args!("{:#x}", region.end),
                pages = region.pages(self.page_size),
                perms = region.perms.as_deref().unwrap_or(""),
                pathname = region.pathname.as_deref().unwrap_or(""),
                "Walking region."
            );

            pagemap.for_each_window(region.start, region.end, |entries| {
                counts.add_entries(entries, snapshot)
            })?;
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::Error;
    use crate::idlemap::{IdleBitmap, MemoryIdleBitmap};

    const PRESENT: u64 = 1 << 63;
    const PAGE: u64 = 4096;

    #[test]
    fn counts_active_pages() {
        let (_root, files) = ProcFiles::fixture(
            "1000-5000 rw-p 00000000 00:00 0 [heap]\n",
            &[(1, PRESENT | 3), (2, 0), (3, PRESENT | 70), (4, PRESENT | 71)],
        );
        let mut bitmap = MemoryIdleBitmap::new(128);
        bitmap.mark_all_idle().unwrap();
        bitmap.touch(70);

        let counts = AddressSpaceWalker::new(files, PAGE)
            .walk(&bitmap.snapshot().unwrap())
            .unwrap();
        assert_eq!(counts, PageCounts { walked: 3, active: 1 });
    }

    #[test]
    fn kernel_region_skipped() {
        // The kernel region's pagemap offset lies far past the end of the
        // fixture file, so reading it would fail.
        let (_root, files) = ProcFiles::fixture(
            "ffff880000000000-ffff880000002000 r-xp 00000000 00:00 0\n\
             2000-4000 rw-p 00000000 00:00 0\n",
            &[(2, PRESENT | 1), (3, PRESENT | 2)],
        );
        let mut bitmap = MemoryIdleBitmap::new(64);
        bitmap.mark_all_idle().unwrap();
        bitmap.touch(2);

        let counts = AddressSpaceWalker::new(files, PAGE)
            .walk(&bitmap.snapshot().unwrap())
            .unwrap();
        assert_eq!(counts, PageCounts { walked: 2, active: 1 });
    }

    #[test]
    fn untouched_bitmap_has_no_active_pages() {
        let (_root, files) = ProcFiles::fixture(
            "1000-3000 r--p 00000000 00:00 0\n3000-3000 ---p 00000000 00:00 0\n",
            &[(1, PRESENT | 5), (2, PRESENT | 6)],
        );
        let mut bitmap = MemoryIdleBitmap::new(64);
        bitmap.mark_all_idle().unwrap();

        let counts = AddressSpaceWalker::new(files, PAGE)
            .walk(&bitmap.snapshot().unwrap())
            .unwrap();
        assert_eq!(counts, PageCounts { walked: 2, active: 0 });
    }

    #[test]
    fn frame_beyond_snapshot_aborts() {
        let (_root, files) = ProcFiles::fixture(
            "1000-3000 rw-p 00000000 00:00 0\n",
            &[(1, PRESENT | 1), (2, PRESENT | 64)],
        );
        let mut bitmap = MemoryIdleBitmap::new(64);
        bitmap.mark_all_idle().unwrap();

        let result = AddressSpaceWalker::new(files, PAGE).walk(&bitmap.snapshot().unwrap());
        assert!(matches!(
            result,
            Err(Error::BitmapOutOfBounds { pfn: 64, .. })
        ));
    }

    #[test]
    fn malformed_maps_walks_nothing() {
        // The pagemap is empty, so walking the first region before the bad
        // line was seen would fail with a different error.
        let (_root, files) = ProcFiles::fixture("1000-2000 rw-p 00000000 00:00 0\nbogus\n", &[]);
        let snapshot = IdleSnapshot::new(vec![0xff; 8]);

        let result = AddressSpaceWalker::new(files, PAGE).walk(&snapshot);
        assert!(matches!(result, Err(Error::MapsParse { .. })));
    }

    #[test]
    fn non_utf8_pathname_is_walked() {
        let (_root, files) = ProcFiles::fixture(
            b"1000-3000 r--p 00000000 08:01 42 /tmp/caf\xe9\n",
            &[(1, PRESENT | 9), (2, 0)],
        );
        let mut bitmap = MemoryIdleBitmap::new(64);
        bitmap.mark_all_idle().unwrap();
        bitmap.touch(9);

        let counts = AddressSpaceWalker::new(files, PAGE)
            .walk(&bitmap.snapshot().unwrap())
            .unwrap();
        assert_eq!(counts, PageCounts { walked: 1, active: 1 });
    }

    #[test]
    fn vanished_process() {
        let root = tempfile::tempdir().unwrap();
        let files = ProcFiles::under_root(root.path(), 1234);
        let snapshot = IdleSnapshot::new(vec![0xff; 8]);

        let result = AddressSpaceWalker::new(files, PAGE).walk(&snapshot);
        assert!(matches!(result, Err(Error::ProcessAccess { .. })));
    }

    proptest! {
        #[test]
        fn active_never_exceeds_walked(
            batches in prop::collection::vec(
                prop::collection::vec(
                    prop_oneof![Just(0u64), Just(PRESENT), (0u64..512).prop_map(|pfn| PRESENT | pfn)],
                    0..64,
                ),
                0..8,
            ),
            touched in prop::collection::vec(0u64..512, 0..128),
        ) {
            let mut bitmap = MemoryIdleBitmap::new(512);
            bitmap.mark_all_idle().unwrap();
            for pfn in touched {
                bitmap.touch(pfn);
            }
            let snapshot = bitmap.snapshot().unwrap();

            let mut counts = PageCounts::default();
            for entries in &batches {
                counts.add_entries(entries, &snapshot).unwrap();
                prop_assert!(counts.active <= counts.walked);
            }

            let resident = batches.iter().flatten().filter(|&&e| entry_pfn(e).is_some()).count();
            prop_assert_eq!(counts.walked, resident as u64);
        }
    }
}
