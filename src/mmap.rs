use std::ptr::null_mut;

/// Maps an anonymous read-write region. Growth failure means the address
/// space is exhausted, which the collector treats as fatal.
pub(crate) fn map(size: usize) -> *mut u8 {
    unsafe {
        let p = libc::mmap(
            null_mut(),
            size as _,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            panic!("mmap of {} bytes failed", size);
        }
        p as *mut u8
    }
}

pub(crate) unsafe fn unmap(p: *mut u8, size: usize) {
    libc::munmap(p as *mut _, size as _);
}
