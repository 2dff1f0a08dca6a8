//! Host memory geometry from `sysconf(3)`.

/// Fallback when the kernel won't tell us.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

pub fn page_size() -> u64 {
    sysconf(libc::_SC_PAGESIZE).unwrap_or(DEFAULT_PAGE_SIZE)
}

/// Number of physical pages on this host, if known.
pub fn phys_pages() -> Option<u64> {
    sysconf(libc::_SC_PHYS_PAGES)
}

fn sysconf(name: libc::c_int) -> Option<u64> {
    // SAFETY: sysconf has no memory safety preconditions.
    let value = unsafe { libc::sysconf(name) };
    if value <= 0 { None } else { Some(value as u64) }
}
