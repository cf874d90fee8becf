//! In-slot reference counts.
//!
//! On roots with backup references enabled, the last `REF_COUNT_RESERVED`
//! bytes of every slot hold one atomic word that counts the raw pointer
//! references to the slot and remembers whether the allocator still holds
//! the memory:
//!
//! * bit 0        memory held: the slot has not been logically freed
//! * bits 1..31   reference count, in increments of 2
//! * bit 31       a dangling reference to this slot has been reported
//!
//! The count lives inside the slot it guards, so it dies (and is
//! re-initialized) with each allocation of the slot.

use core::sync::atomic::{AtomicU32, Ordering};

use super::hooks;
use crate::util::abort_with_message;

/// Trailing bytes of a slot reserved for the reference count. Sized and
/// aligned generously so the count never shares its word with payload.
pub const REF_COUNT_RESERVED: usize = 8;

const MEMORY_HELD: u32 = 1;
const DANGLING_REPORTED: u32 = 1 << 31;
const PTR_INCREMENT: u32 = 2;
const COUNT_MASK: u32 = DANGLING_REPORTED - PTR_INCREMENT;

/// The reference count embedded at the end of a slot.
#[repr(transparent)]
pub struct InSlotRefCount(AtomicU32);

impl InSlotRefCount {
    /// Reference count of the slot `[slot_start, slot_start + slot_size)`.
    ///
    /// # Safety
    /// The slot must belong to a backup-ref-enabled root and be either
    /// allocated or in its logically-freed window.
    #[inline]
    pub unsafe fn from_slot(slot_start: usize, slot_size: usize) -> &'static InSlotRefCount {
        let addr = slot_start + slot_size - REF_COUNT_RESERVED;
        &*(addr as *const InSlotRefCount)
    }

    /// Install a fresh count for a newly allocated slot: memory held, no
    /// references.
    ///
    /// # Safety
    /// Same placement rules as `from_slot`; the slot must have just been
    /// handed out by the allocator.
    #[inline]
    pub unsafe fn init_for_new_allocation(slot_start: usize, slot_size: usize) {
        let addr = slot_start + slot_size - REF_COUNT_RESERVED;
        (addr as *mut u32).write(MEMORY_HELD);
    }

    /// Add one reference. Aborts if the slot was already logically freed.
    pub fn acquire(&self) {
        let old = self.0.fetch_add(PTR_INCREMENT, Ordering::Relaxed);
        if old & COUNT_MASK == COUNT_MASK {
            abort_with_message("spanalloc: slot reference count overflow\n");
        }
        if old & MEMORY_HELD == 0 {
            abort_with_message("spanalloc: reference taken to freed memory\n");
        }
    }

    /// Add one reference without requiring the slot to still be held.
    /// Used by dangling-tolerant pointers. Still aborts once the slot is
    /// past its dangling window (no references left and the memory
    /// released): the count no longer exists and the slot may be reused.
    pub fn acquire_allow_dangling(&self) {
        let old = self.0.fetch_add(PTR_INCREMENT, Ordering::Relaxed);
        if old & COUNT_MASK == COUNT_MASK {
            abort_with_message("spanalloc: slot reference count overflow\n");
        }
        if old & (COUNT_MASK | MEMORY_HELD) == 0 {
            abort_with_message("spanalloc: reference taken to freed memory\n");
        }
    }

    /// Drop one reference. Returns true when this was the last reference
    /// to a slot whose memory was already logically freed, i.e. the caller
    /// must now run the deferred physical free.
    pub fn release(&self, slot_start: usize) -> bool {
        let old = self.0.fetch_sub(PTR_INCREMENT, Ordering::AcqRel);
        if old & COUNT_MASK == 0 {
            abort_with_message("spanalloc: slot reference count underflow\n");
        }
        let new = old - PTR_INCREMENT;
        if new & COUNT_MASK != 0 {
            return false;
        }
        if new & DANGLING_REPORTED != 0 {
            hooks::dangling_reference_released(slot_start);
        }
        new & MEMORY_HELD == 0
    }

    /// Logical free by the allocator. Returns true when no references are
    /// outstanding and the physical free can run immediately; otherwise
    /// the slot is now dangling, the detected hook has fired, and the
    /// physical free is deferred to the last `release`.
    pub(crate) fn release_from_allocator(&self, slot_start: usize) -> bool {
        let old = self.0.fetch_and(!MEMORY_HELD, Ordering::AcqRel);
        if old & MEMORY_HELD == 0 {
            abort_with_message("spanalloc: double free detected\n");
        }
        if old & COUNT_MASK == 0 {
            return true;
        }
        self.mark_dangling(slot_start);
        false
    }

    /// Whether the allocator still holds the slot's memory.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Relaxed) & MEMORY_HELD != 0
    }

    /// Fire the detected hook for a slot known to be referenced after its
    /// logical free, at most once per dangling instance.
    pub fn report_if_dangling(&self, slot_start: usize) {
        if self.is_alive() {
            return;
        }
        self.mark_dangling(slot_start);
    }

    fn mark_dangling(&self, slot_start: usize) {
        let old = self.0.fetch_or(DANGLING_REPORTED, Ordering::AcqRel);
        if old & DANGLING_REPORTED == 0 {
            hooks::dangling_reference_detected(slot_start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brp::hooks::TEST_HOOK_LOCK;

    fn fresh_slot(buf: &mut [u8; 64]) -> (&'static InSlotRefCount, usize) {
        let slot_start = buf.as_mut_ptr() as usize;
        unsafe {
            InSlotRefCount::init_for_new_allocation(slot_start, buf.len());
            (InSlotRefCount::from_slot(slot_start, buf.len()), slot_start)
        }
    }

    #[test]
    fn acquire_release_balance() {
        let _guard = TEST_HOOK_LOCK.lock().unwrap();
        let mut buf = [0u8; 64];
        let (rc, slot) = fresh_slot(&mut buf);

        rc.acquire();
        rc.acquire();
        assert!(rc.is_alive());
        assert!(!rc.release(slot));
        // Last reference, but memory still held: no deferred free.
        assert!(!rc.release(slot));
        assert!(rc.is_alive());
    }

    #[test]
    fn last_release_after_free_requests_deferred_free() {
        let _guard = TEST_HOOK_LOCK.lock().unwrap();
        hooks::reset_hooks();
        let mut buf = [0u8; 64];
        let (rc, slot) = fresh_slot(&mut buf);

        rc.acquire();
        // Allocator frees while one reference is out: dangling.
        assert!(!rc.release_from_allocator(slot));
        assert!(!rc.is_alive());
        assert_eq!(hooks::dangling_references_outstanding(), 1);
        // The lone release must request the deferred physical free.
        assert!(rc.release(slot));
        assert_eq!(hooks::dangling_references_outstanding(), 0);
        hooks::reset_hooks();
    }

    #[test]
    fn free_without_references_is_immediate() {
        let _guard = TEST_HOOK_LOCK.lock().unwrap();
        hooks::reset_hooks();
        let mut buf = [0u8; 64];
        let (rc, slot) = fresh_slot(&mut buf);
        assert!(rc.release_from_allocator(slot));
        assert_eq!(hooks::dangling_references_outstanding(), 0);
    }

    #[test]
    fn dangling_hooks_fire_exactly_once() {
        let _guard = TEST_HOOK_LOCK.lock().unwrap();
        hooks::reset_hooks();

        use std::sync::atomic::{AtomicUsize, Ordering};
        static DETECTED: AtomicUsize = AtomicUsize::new(0);
        static RELEASED: AtomicUsize = AtomicUsize::new(0);
        DETECTED.store(0, Ordering::Relaxed);
        RELEASED.store(0, Ordering::Relaxed);
        hooks::set_dangling_detected_hook(|_| {
            DETECTED.fetch_add(1, Ordering::Relaxed);
        });
        hooks::set_dangling_released_hook(|_| {
            RELEASED.fetch_add(1, Ordering::Relaxed);
        });

        let mut buf = [0u8; 64];
        let (rc, slot) = fresh_slot(&mut buf);
        rc.acquire();
        rc.acquire();
        assert!(!rc.release_from_allocator(slot));
        // Reporting again must not re-fire the detected hook.
        rc.report_if_dangling(slot);
        assert_eq!(DETECTED.load(Ordering::Relaxed), 1);

        assert!(!rc.release(slot));
        assert_eq!(RELEASED.load(Ordering::Relaxed), 0);
        assert!(rc.release(slot));
        assert_eq!(RELEASED.load(Ordering::Relaxed), 1);

        hooks::reset_hooks();
    }
}
