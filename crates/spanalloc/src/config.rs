use core::sync::atomic::{AtomicUsize, Ordering};

/// Default and maximum number of empty slot spans kept around before the
/// oldest one is decommitted.
pub const DEFAULT_EMPTY_SPAN_RING_SIZE: usize = 16;
pub const MAX_EMPTY_SPAN_RING_SIZE: usize = 16;

/// Cached ring size; 0 means "not read yet".
static EMPTY_SPAN_RING_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Size of the empty-span ring, read once from
/// `SPANALLOC_EMPTY_SPAN_RING_SIZE` and clamped to
/// `1..=MAX_EMPTY_SPAN_RING_SIZE`.
pub fn empty_span_ring_size() -> usize {
    let cached = EMPTY_SPAN_RING_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let value = unsafe { getenv_usize(b"SPANALLOC_EMPTY_SPAN_RING_SIZE\0") }
        .unwrap_or(DEFAULT_EMPTY_SPAN_RING_SIZE)
        .clamp(1, MAX_EMPTY_SPAN_RING_SIZE);
    // Racing initializers compute the same value.
    EMPTY_SPAN_RING_SIZE.store(value, Ordering::Relaxed);
    value
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None; // Invalid
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    if result == 0 {
        return None;
    }
    Some(result)
}
