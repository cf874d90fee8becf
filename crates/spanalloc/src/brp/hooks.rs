//! Process-wide dangling pointer hooks.
//!
//! Embedders install plain function pointers (no state, no allocation) to
//! observe dangling references. The detected hook fires when a slot is
//! logically freed while references are outstanding; the released hook
//! fires when the last reference to such a slot finally goes away. Both
//! receive the slot's start address as an opaque id, so the two sides of
//! one dangling window can be correlated.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Hook signature. The argument is the dangling slot's start address.
pub type DanglingPtrHook = fn(usize);

static DETECTED_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static RELEASED_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Slots currently in a dangling window (freed but still referenced).
static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

/// Install the hook fired when a dangling reference is first detected.
/// The last writer wins.
pub fn set_dangling_detected_hook(hook: DanglingPtrHook) {
    DETECTED_HOOK.store(hook as *mut (), Ordering::Release);
}

/// Install the hook fired when the last dangling reference is released.
/// The last writer wins.
pub fn set_dangling_released_hook(hook: DanglingPtrHook) {
    RELEASED_HOOK.store(hook as *mut (), Ordering::Release);
}

/// Remove both hooks and reset the outstanding counter.
pub fn reset_hooks() {
    DETECTED_HOOK.store(core::ptr::null_mut(), Ordering::Release);
    RELEASED_HOOK.store(core::ptr::null_mut(), Ordering::Release);
    OUTSTANDING.store(0, Ordering::Release);
}

/// Number of slots that were freed while still referenced and whose last
/// reference has not been released yet.
pub fn dangling_references_outstanding() -> usize {
    OUTSTANDING.load(Ordering::Acquire)
}

/// The hooks and their counter are process-wide; tests that touch them
/// serialize on this lock.
#[cfg(test)]
pub(crate) static TEST_HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub(crate) fn dangling_reference_detected(id: usize) {
    OUTSTANDING.fetch_add(1, Ordering::AcqRel);
    let raw = DETECTED_HOOK.load(Ordering::Acquire);
    if !raw.is_null() {
        let hook: DanglingPtrHook = unsafe { core::mem::transmute(raw) };
        hook(id);
    }
}

pub(crate) fn dangling_reference_released(id: usize) {
    // Saturate: reset_hooks may have cleared the counter mid-window.
    let _ = OUTSTANDING.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        n.checked_sub(1)
    });
    let raw = RELEASED_HOOK.load(Ordering::Acquire);
    if !raw.is_null() {
        let hook: DanglingPtrHook = unsafe { core::mem::transmute(raw) };
        hook(id);
    }
}
