//! Backup reference protection, end to end: deferred frees, dangling
//! reports, pointer arithmetic with one-past-the-end poisoning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use spanalloc::{
    dangling_references_outstanding, reset_hooks, set_dangling_detected_hook,
    set_dangling_released_hook, CheckedPtr, DanglingTolerantPtr, Root, RootFlags, SpanState,
};

const POISON_BYTE: u8 = 0xEF;

fn brp_root(slot_sizes: &[usize]) -> &'static Root {
    Root::new(
        slot_sizes,
        RootFlags {
            enable_backup_ref: true,
        },
    )
}

/// The dangling hooks and their counter are process-wide; tests touching
/// them must not interleave.
fn hook_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Wrapping and releasing does not disturb span accounting
// ---------------------------------------------------------------------------

#[test]
fn balanced_wrappers_leave_the_slot_alive() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();

    let ptr = CheckedPtr::<false, true>::wrap(slot);
    let copy = ptr.clone();
    assert_eq!(ptr.get(), slot);
    drop(copy);
    drop(ptr);

    assert_eq!(root.span_info(slot).num_allocated_slots, 1);
    root.free(slot);
    assert_eq!(root.span_info(slot).num_allocated_slots, 0);
}

// ---------------------------------------------------------------------------
// Free while referenced: deferred physical free plus payload poisoning
// ---------------------------------------------------------------------------

#[test]
fn free_with_outstanding_reference_is_deferred() {
    let _guard = hook_lock();
    reset_hooks();

    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    unsafe { std::ptr::write_bytes(slot as *mut u8, 0xAB, 48) };

    let ptr = DanglingTolerantPtr::wrap(slot);
    root.free(slot);

    // The span did not see the free yet.
    let info = root.span_info(slot);
    assert_eq!(info.num_allocated_slots, 1);
    assert_eq!(dangling_references_outstanding(), 1);

    // The payload (everything but the ref count word) is poisoned. The
    // span's pages stay mapped, so reading them back is fine.
    let payload = unsafe { std::slice::from_raw_parts(slot as *const u8, 64 - 8) };
    assert!(payload.iter().all(|&b| b == POISON_BYTE));

    // Dropping the last wrapper runs the deferred physical free.
    drop(ptr);
    assert_eq!(dangling_references_outstanding(), 0);
    let info = root.span_info(slot);
    assert_eq!(info.num_allocated_slots, 0);
    assert_eq!(info.state, SpanState::Empty);
    reset_hooks();
}

// ---------------------------------------------------------------------------
// Duplicated wrappers released before the free never go dangling
// ---------------------------------------------------------------------------

#[test]
fn releases_before_the_free_never_report_dangling() {
    let _guard = hook_lock();
    reset_hooks();

    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();

    let first = CheckedPtr::<false, true>::wrap(slot);
    let second = first.clone();
    drop(first);
    assert_eq!(root.span_info(slot).num_allocated_slots, 1);
    drop(second);
    assert_eq!(root.span_info(slot).num_allocated_slots, 1);

    // No reference is left, so this free is immediate, and nothing ever
    // went dangling.
    root.free(slot);
    assert_eq!(root.span_info(slot).num_allocated_slots, 0);
    assert_eq!(dangling_references_outstanding(), 0);
    reset_hooks();
}

// ---------------------------------------------------------------------------
// Hook firing: detected once at the free, released once at the last drop
// ---------------------------------------------------------------------------

#[test]
fn dangling_hooks_fire_once_with_the_slot_id() {
    let _guard = hook_lock();
    reset_hooks();

    static DETECTED_ID: AtomicUsize = AtomicUsize::new(0);
    static DETECTED_COUNT: AtomicUsize = AtomicUsize::new(0);
    static RELEASED_ID: AtomicUsize = AtomicUsize::new(0);
    DETECTED_ID.store(0, Ordering::Relaxed);
    DETECTED_COUNT.store(0, Ordering::Relaxed);
    RELEASED_ID.store(0, Ordering::Relaxed);

    set_dangling_detected_hook(|id| {
        DETECTED_ID.store(id, Ordering::Relaxed);
        DETECTED_COUNT.fetch_add(1, Ordering::Relaxed);
    });
    set_dangling_released_hook(|id| {
        RELEASED_ID.store(id, Ordering::Relaxed);
    });

    let root = brp_root(&[128]);
    let slot = root.alloc(0, 100).unwrap();

    let first = DanglingTolerantPtr::wrap(slot);
    let second = first.clone();
    root.free(slot);
    assert_eq!(DETECTED_ID.load(Ordering::Relaxed), slot);
    assert_eq!(DETECTED_COUNT.load(Ordering::Relaxed), 1);

    // Reporting the same dangling instance again is a no-op.
    spanalloc::report_if_dangling(slot);
    assert_eq!(DETECTED_COUNT.load(Ordering::Relaxed), 1);

    drop(first);
    assert_eq!(RELEASED_ID.load(Ordering::Relaxed), 0);
    drop(second);
    assert_eq!(RELEASED_ID.load(Ordering::Relaxed), slot);

    reset_hooks();
}

// ---------------------------------------------------------------------------
// Dangling-window reuse: the slot only returns to the freelist after the
// last reference is gone
// ---------------------------------------------------------------------------

#[test]
fn slot_is_not_reused_during_the_dangling_window() {
    let _guard = hook_lock();
    reset_hooks();

    let root = brp_root(&[4096]);
    let slot = root.alloc(0, 1000).unwrap();
    let span_start = root.span_info(slot).slot_span_start;

    let ptr = DanglingTolerantPtr::wrap(slot);
    root.free(slot);

    // The slot is still accounted allocated, so the next allocation from
    // this bucket cannot reuse it.
    let other = root.alloc(0, 1000).unwrap();
    assert_ne!(other, slot);

    drop(ptr);
    // Now the deferred free has run: only `other` is still allocated.
    assert_eq!(root.span_info(span_start).num_allocated_slots, 1);
    root.free(other);
    assert_eq!(root.span_info(span_start).num_allocated_slots, 0);
    reset_hooks();
}

// ---------------------------------------------------------------------------
// Pointer arithmetic: in-slot moves, one-past-the-end poisoning, and the
// poison round trip
// ---------------------------------------------------------------------------

#[test]
fn arithmetic_stays_within_the_slot() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 56).unwrap();

    let mut ptr = CheckedPtr::<false, true>::wrap(slot);
    ptr.advance(16);
    assert_eq!(ptr.get(), slot + 16);
    ptr.retreat(8);
    assert_eq!(ptr.get(), slot + 8);

    let shifted = ptr.offset(24);
    assert_eq!(shifted.get(), slot + 32);

    drop(shifted);
    drop(ptr);
    root.free(slot);
}

#[cfg(feature = "oob-poison")]
#[test]
fn one_past_the_end_round_trips_through_poison() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 56).unwrap();
    // The payload is the slot minus the ref count word.
    let payload = 64 - 8;

    let mut ptr = CheckedPtr::<false, true>::wrap(slot);
    ptr.advance(payload as isize);
    // Comparisons see the plain end address; dereferencing would abort.
    assert_eq!(ptr.address(), slot + payload);

    // Advancing by zero keeps the poison.
    ptr.advance(0);
    assert_eq!(ptr.address(), slot + payload);

    // Stepping back into the slot clears it.
    ptr.retreat(payload as isize);
    assert_eq!(ptr.get(), slot);

    drop(ptr);
    root.free(slot);
}

// ---------------------------------------------------------------------------
// Utilized size excludes the ref count reservation
// ---------------------------------------------------------------------------

#[test]
fn utilized_size_includes_the_ref_count_reservation() {
    let root = brp_root(&[2 * spanalloc::layout::PARTITION_PAGE_SIZE]);
    let slot = root.alloc(0, 1000).unwrap();
    // Raw sizes cover the requested bytes plus the reservation.
    assert_eq!(root.span_info(slot).utilized_slot_size, 1000 + 8);
    root.free(slot);
}
