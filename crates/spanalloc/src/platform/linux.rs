use core::ptr;

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// The range must lie within a mapping created by `map_anonymous`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Mark memory as inaccessible (guard page).
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
}

/// Advise kernel that pages can be reclaimed.
/// On Linux, MADV_DONTNEED guarantees zero-filled pages on next access.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    let ret = libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
}
