//! Buckets: per-slot-size span lists and the allocation slow path pieces
//! that operate on a single bucket.

use crate::freelist::FreelistEntry;
use crate::layout::{
    MAX_PARTITION_PAGES_PER_SPAN, MAX_SLOTS_PER_SPAN, PARTITION_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};
use crate::slot_span::SlotSpanMetadata;
use crate::util::{abort_with_message, align_up, is_aligned, MIN_SLOT_SIZE};

/// One bucket: all slot spans carving slots of a single size.
///
/// List heads are null when empty. The active list may transiently hold
/// full, empty or decommitted spans; `set_new_active_slot_span` sweeps
/// them to where they belong.
pub struct Bucket {
    pub slot_size: usize,
    slots_per_span: u16,
    pages_per_span: u8,
    can_store_raw_size: bool,
    pub(crate) active_head: *mut SlotSpanMetadata,
    pub(crate) empty_head: *mut SlotSpanMetadata,
    pub(crate) decommitted_head: *mut SlotSpanMetadata,
    pub(crate) num_full_spans: usize,
}

impl Bucket {
    /// Placeholder for unused bucket array entries.
    pub(crate) const UNUSED: Bucket = Bucket {
        slot_size: 0,
        slots_per_span: 0,
        pages_per_span: 0,
        can_store_raw_size: false,
        active_head: core::ptr::null_mut(),
        empty_head: core::ptr::null_mut(),
        decommitted_head: core::ptr::null_mut(),
        num_full_spans: 0,
    };

    pub(crate) fn new(slot_size: usize) -> Bucket {
        if slot_size < MIN_SLOT_SIZE || !is_aligned(slot_size, MIN_SLOT_SIZE) {
            abort_with_message(
                "spanalloc: bucket slot size must be a non-zero multiple of 16\n",
            );
        }
        if slot_size > MAX_PARTITION_PAGES_PER_SPAN * PARTITION_PAGE_SIZE {
            abort_with_message("spanalloc: bucket slot size too large for a slot span\n");
        }

        let pages_per_span = Self::compute_pages_per_span(slot_size);
        let slots_per_span = pages_per_span * PARTITION_PAGE_SIZE / slot_size;
        debug_assert!(slots_per_span >= 1 && slots_per_span <= MAX_SLOTS_PER_SPAN);

        // Single-slot spans covering more than one partition page have a
        // spare neighbouring metadata record to store the requested size.
        let can_store_raw_size = slots_per_span == 1 && pages_per_span > 1;

        Bucket {
            slot_size,
            slots_per_span: slots_per_span as u16,
            pages_per_span: pages_per_span as u8,
            can_store_raw_size,
            active_head: core::ptr::null_mut(),
            empty_head: core::ptr::null_mut(),
            decommitted_head: core::ptr::null_mut(),
            num_full_spans: 0,
        }
    }

    /// Pick the span size (in partition pages) that wastes the smallest
    /// fraction of the span on the unusable tail remainder.
    fn compute_pages_per_span(slot_size: usize) -> usize {
        let mut best_pages = 1;
        let mut best_waste = usize::MAX;
        for pages in 1..=MAX_PARTITION_PAGES_PER_SPAN {
            let span_bytes = pages * PARTITION_PAGE_SIZE;
            if span_bytes < slot_size {
                continue;
            }
            // Normalize waste per page so different span sizes compare.
            let waste = (span_bytes % slot_size) * MAX_PARTITION_PAGES_PER_SPAN / pages;
            if waste < best_waste {
                best_waste = waste;
                best_pages = pages;
                if waste == 0 {
                    break;
                }
            }
        }
        best_pages
    }

    #[inline]
    pub fn slots_per_span(&self) -> usize {
        self.slots_per_span as usize
    }

    #[inline]
    pub fn get_pages_per_span(&self) -> usize {
        self.pages_per_span as usize
    }

    #[inline]
    pub fn get_bytes_per_span(&self) -> usize {
        self.pages_per_span as usize * PARTITION_PAGE_SIZE
    }

    #[inline]
    pub fn can_store_raw_size(&self) -> bool {
        self.can_store_raw_size
    }

    /// Walk the active list until its head is a span that can satisfy an
    /// allocation, sweeping every span that cannot to its proper place:
    /// full spans are unlinked and counted, empty and decommitted spans
    /// move to their lists. Returns false when no usable span remains.
    ///
    /// # Safety
    /// Must be called under the root lock.
    pub(crate) unsafe fn set_new_active_slot_span(&mut self) -> bool {
        let mut span = self.active_head;
        while !span.is_null() {
            let next = (*span).next_slot_span;

            if (*span).is_active() {
                self.active_head = span;
                return true;
            }

            if (*span).is_empty() {
                (*span).next_slot_span = self.empty_head;
                self.empty_head = span;
            } else if (*span).is_decommitted() {
                (*span).next_slot_span = self.decommitted_head;
                self.decommitted_head = span;
            } else {
                debug_assert!((*span).is_full());
                (*span).bits.set_marked_full(true);
                self.num_full_spans += 1;
                // Full spans are not kept on any list; they rejoin the
                // active list on their first free.
                (*span).next_slot_span = core::ptr::null_mut();
            }

            span = next;
        }
        self.active_head = core::ptr::null_mut();
        false
    }

    /// Provision more slots of `span` and allocate one of them.
    ///
    /// Slots are provisioned lazily, one system page worth at a time: the
    /// first unprovisioned slot is handed out directly and the remaining
    /// slots that fit the touched system pages are pushed onto the
    /// freelist in ascending address order.
    ///
    /// # Safety
    /// Must be called under the root lock; the span must have unprovisioned
    /// slots and an empty freelist.
    pub(crate) unsafe fn provision_more_slots_and_alloc_one(
        &mut self,
        span: *mut SlotSpanMetadata,
    ) -> usize {
        let num_unprovisioned = (*span).bits.num_unprovisioned_slots();
        debug_assert!(num_unprovisioned > 0);
        debug_assert!((*span).get_freelist_head().is_null());

        let span_start = SlotSpanMetadata::to_slot_span_start(span);
        let num_allocated = (*span).bits.num_allocated_slots();
        debug_assert!(
            num_allocated + num_unprovisioned == self.slots_per_span()
        );

        let return_slot = span_start + self.slot_size * num_allocated;
        let next_slot = return_slot + self.slot_size;
        // Provision up to the end of the system page the next slot starts
        // in, so later allocations from this page are freelist hits.
        let provision_end = align_up(next_slot, SYSTEM_PAGE_SIZE);

        let mut slots_provisioned = (provision_end - return_slot) / self.slot_size;
        if slots_provisioned > num_unprovisioned {
            slots_provisioned = num_unprovisioned;
        }
        debug_assert!(slots_provisioned >= 1);

        (*span)
            .bits
            .set_num_allocated_slots(num_allocated + 1);
        (*span)
            .bits
            .set_num_unprovisioned_slots(num_unprovisioned - slots_provisioned);

        // Thread the remaining freshly provisioned slots, in address order.
        let mut prev: *mut FreelistEntry = core::ptr::null_mut();
        let mut slot = return_slot + self.slot_size;
        for _ in 1..slots_provisioned {
            let entry = FreelistEntry::emplace(slot);
            if prev.is_null() {
                (*span).set_freelist_head(entry);
            } else {
                (*prev).set_next(entry);
            }
            prev = entry;
            slot += self.slot_size;
        }
        (*span).bits.set_freelist_is_sorted(true);

        return_slot
    }
}
