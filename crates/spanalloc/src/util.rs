/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Minimum slot size and alignment. Every bucket slot size must be a
/// multiple of this, which keeps freelist entries and the in-slot ref
/// count naturally aligned inside any slot.
pub const MIN_SLOT_SIZE: usize = 16;

/// Byte written over the payload of a slot that was logically freed while
/// raw pointer references to it were still outstanding.
pub const POISON_BYTE: u8 = 0xEF;

/// Abort with a diagnostic message on stderr.
/// Used when unrecoverable metadata corruption or API misuse is detected.
/// Writes straight to fd 2 so the failure path never allocates or locks.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

/// Fill a memory region with poison bytes.
///
/// # Safety
/// `addr` must point to a valid writable region of at least `size` bytes.
#[inline]
pub unsafe fn poison_region(addr: usize, size: usize) {
    core::ptr::write_bytes(addr as *mut u8, POISON_BYTE, size);
}
