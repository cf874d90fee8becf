use crate::layout::SUPER_PAGE_SIZE;
use crate::util::is_aligned;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod linux;
        pub use linux as sys;
    } else if #[cfg(target_os = "macos")] {
        pub mod macos;
        pub use macos as sys;
    } else {
        compile_error!("unsupported platform");
    }
}

/// Map anonymous read-write memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must lie within a region returned by `map_anonymous` and
/// `ptr`/`size` must be page-aligned.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Protect a memory region as inaccessible (guard page).
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    sys::protect_none(ptr, size);
}

/// Advise the kernel that the memory range is no longer needed.
/// The kernel may reclaim the physical pages; the range stays mapped and
/// reads as zero after reclaim.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    sys::advise_free(ptr, size);
}

/// Map one super page, aligned to `SUPER_PAGE_SIZE`. Returns 0 on failure.
///
/// mmap only guarantees system-page alignment, so we over-map by one
/// alignment unit and trim the misaligned head and tail.
pub unsafe fn map_super_page() -> usize {
    let mapped = sys::map_anonymous(SUPER_PAGE_SIZE * 2);
    if mapped.is_null() {
        return 0;
    }
    let raw = mapped as usize;
    let base = crate::util::align_up(raw, SUPER_PAGE_SIZE);
    debug_assert!(is_aligned(base, SUPER_PAGE_SIZE));
    let head = base - raw;
    if head > 0 {
        sys::unmap(raw as *mut u8, head);
    }
    let tail = SUPER_PAGE_SIZE - head;
    if tail > 0 {
        sys::unmap((base + SUPER_PAGE_SIZE) as *mut u8, tail);
    }
    base
}

/// Get a fast, non-cryptographic random u64.
/// Falls back to address-space randomization if no better source.
pub fn fast_random_u64() -> u64 {
    // Use stack address as a simple entropy source mixed with a counter
    static COUNTER: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    let stack_addr = &count as *const _ as u64;
    // Simple xorshift-style mixing
    let mut x = stack_addr.wrapping_mul(0x517cc1b727220a95).wrapping_add(count);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_page_mapping_is_aligned() {
        let base = unsafe { map_super_page() };
        assert_ne!(base, 0);
        assert!(is_aligned(base, SUPER_PAGE_SIZE));
        // Whole range must be writable.
        unsafe {
            core::ptr::write_bytes(base as *mut u8, 0xA5, SUPER_PAGE_SIZE);
            unmap(base as *mut u8, SUPER_PAGE_SIZE);
        }
    }
}
