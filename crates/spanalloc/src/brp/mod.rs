//! Backup reference protection: in-slot reference counts, checked pointer
//! wrappers and the dangling pointer hooks.

pub mod checked_ptr;
pub mod hooks;
pub mod ref_count;

use crate::address_map;
use crate::slot_span::SlotSpanMetadata;

/// High bit marking a one-past-the-end pointer. User-space addresses never
/// set it, so a poisoned address can always be told apart from a real one.
pub(crate) const OOB_POISON_BIT: usize = 1 << 63;

#[inline]
pub(crate) const fn with_poison(addr: usize) -> usize {
    addr | OOB_POISON_BIT
}

#[inline]
pub(crate) const fn without_poison(addr: usize) -> usize {
    addr & !OOB_POISON_BIT
}

#[inline]
pub(crate) const fn is_poisoned(addr: usize) -> bool {
    addr & OOB_POISON_BIT != 0
}

/// Report the allocation containing `addr` as dangling if it has already
/// been logically freed. Fires the detected hook at most once per dangling
/// instance. A no-op for addresses outside backup-ref-enabled roots.
pub fn report_if_dangling(addr: usize) {
    let effective = without_poison(addr).wrapping_sub(is_poisoned(addr) as usize);
    let root = address_map::lookup_root(effective);
    if root.is_null() {
        return;
    }
    unsafe {
        if !(*root).backup_ref_enabled() {
            return;
        }
        if !crate::layout::is_within_super_page_payload(effective) {
            return;
        }
        let span = SlotSpanMetadata::from_addr(effective);
        let span_start = SlotSpanMetadata::to_slot_span_start(span);
        let slot_size = (*span).bucket().slot_size;
        let slot_start = span_start + (effective - span_start) / slot_size * slot_size;
        ref_count::InSlotRefCount::from_slot(slot_start, slot_size)
            .report_if_dangling(slot_start);
    }
}
