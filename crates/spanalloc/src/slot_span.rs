//! Per-partition-page metadata and the slot span state machine.
//!
//! Every partition page of a super page has one 64-byte metadata record in
//! the super page's metadata area. The record of a span's first page holds
//! the live `SlotSpanMetadata`; records of the span's remaining pages only
//! carry the backwards offset to that first record.
//!
//! A slot span is in exactly one of four states, derived from its counters
//! rather than stored:
//!
//! * active:      some slots allocated, and a free or unprovisioned slot exists
//! * full:        every slot allocated
//! * empty:       no slots allocated, freelist still provisioned
//! * decommitted: no slots allocated, backing pages returned to the OS

use crate::bucket::Bucket;
use crate::freelist::{self, FreelistEntry};
use crate::layout::{
    is_within_super_page_payload, partition_page_index, super_page_base, FIRST_PAYLOAD_PAGE,
    GUARD_PAGE_INDEX, METADATA_AREA_OFFSET, PAGE_METADATA_SHIFT, PAGE_METADATA_SIZE,
    PARTITION_PAGE_SHIFT,
};
use crate::util::abort_with_message;

/// Packed span counters and flags.
///
/// Layout (32 bits):
/// * bits 0..13   number of allocated slots
/// * bits 13..26  number of unprovisioned slots
/// * bit 26       marked full (removed from the bucket's active list)
/// * bit 27       freelist is sorted by address
/// * bit 28       span is registered in the empty-span ring
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpanBits(u32);

const COUNT_BITS: u32 = 13;
const COUNT_MASK: u32 = (1 << COUNT_BITS) - 1;
const UNPROVISIONED_SHIFT: u32 = COUNT_BITS;
const MARKED_FULL_BIT: u32 = 1 << 26;
const FREELIST_SORTED_BIT: u32 = 1 << 27;
const IN_EMPTY_CACHE_BIT: u32 = 1 << 28;

impl SpanBits {
    pub(crate) const fn new() -> Self {
        SpanBits(0)
    }

    #[inline]
    pub(crate) fn num_allocated_slots(self) -> usize {
        (self.0 & COUNT_MASK) as usize
    }

    #[inline]
    pub(crate) fn set_num_allocated_slots(&mut self, count: usize) {
        debug_assert!(count <= COUNT_MASK as usize);
        self.0 = (self.0 & !COUNT_MASK) | count as u32;
    }

    #[inline]
    pub(crate) fn num_unprovisioned_slots(self) -> usize {
        ((self.0 >> UNPROVISIONED_SHIFT) & COUNT_MASK) as usize
    }

    #[inline]
    pub(crate) fn set_num_unprovisioned_slots(&mut self, count: usize) {
        debug_assert!(count <= COUNT_MASK as usize);
        self.0 = (self.0 & !(COUNT_MASK << UNPROVISIONED_SHIFT))
            | ((count as u32) << UNPROVISIONED_SHIFT);
    }

    #[inline]
    pub(crate) fn marked_full(self) -> bool {
        self.0 & MARKED_FULL_BIT != 0
    }

    #[inline]
    pub(crate) fn set_marked_full(&mut self, full: bool) {
        if full {
            self.0 |= MARKED_FULL_BIT;
        } else {
            self.0 &= !MARKED_FULL_BIT;
        }
    }

    #[inline]
    pub(crate) fn freelist_is_sorted(self) -> bool {
        self.0 & FREELIST_SORTED_BIT != 0
    }

    #[inline]
    pub(crate) fn set_freelist_is_sorted(&mut self, sorted: bool) {
        if sorted {
            self.0 |= FREELIST_SORTED_BIT;
        } else {
            self.0 &= !FREELIST_SORTED_BIT;
        }
    }

    #[inline]
    pub(crate) fn in_empty_cache(self) -> bool {
        self.0 & IN_EMPTY_CACHE_BIT != 0
    }

    #[inline]
    pub(crate) fn set_in_empty_cache(&mut self, cached: bool) {
        if cached {
            self.0 |= IN_EMPTY_CACHE_BIT;
        } else {
            self.0 &= !IN_EMPTY_CACHE_BIT;
        }
    }
}

/// Metadata for one slot span. Lives in the metadata record of the span's
/// first partition page. All mutation happens under the owning root's lock.
#[repr(C)]
pub struct SlotSpanMetadata {
    freelist_head: *mut FreelistEntry,
    pub(crate) next_slot_span: *mut SlotSpanMetadata,
    bucket: *const Bucket,
    pub(crate) bits: SpanBits,
    /// Slot in the root's empty-span ring this span was last registered at.
    pub(crate) empty_cache_index: u8,
}

/// One metadata record per partition page.
#[repr(C, align(64))]
pub struct PageMetadata {
    pub(crate) slot_span: SlotSpanMetadata,
    /// Distance, in records, back to the record of the span's first page.
    pub(crate) slot_span_offset: u8,
    /// False for records of pages not belonging to any span.
    pub(crate) is_valid: bool,
}

const _: () = assert!(core::mem::size_of::<PageMetadata>() == PAGE_METADATA_SIZE);
const _: () = assert!(core::mem::align_of::<PageMetadata>() == PAGE_METADATA_SIZE);

impl SlotSpanMetadata {
    pub(crate) fn new(bucket: *const Bucket) -> Self {
        SlotSpanMetadata {
            freelist_head: core::ptr::null_mut(),
            next_slot_span: core::ptr::null_mut(),
            bucket,
            bits: SpanBits::new(),
            empty_cache_index: 0,
        }
    }

    #[inline]
    pub(crate) fn bucket(&self) -> &Bucket {
        unsafe { &*self.bucket }
    }

    // ---- state predicates -------------------------------------------------

    #[inline]
    pub fn is_active(&self) -> bool {
        self.bits.num_allocated_slots() > 0
            && (!self.freelist_head.is_null() || self.bits.num_unprovisioned_slots() > 0)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let full =
            self.bits.num_allocated_slots() == self.bucket().slots_per_span();
        debug_assert!(!full || self.freelist_head.is_null());
        debug_assert!(!full || self.bits.num_unprovisioned_slots() == 0);
        full
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.num_allocated_slots() == 0 && !self.freelist_head.is_null()
    }

    #[inline]
    pub fn is_decommitted(&self) -> bool {
        let decommitted =
            self.bits.num_allocated_slots() == 0 && self.freelist_head.is_null();
        if decommitted {
            debug_assert!(self.bits.num_unprovisioned_slots() == 0);
            debug_assert!(!self.bits.in_empty_cache());
        }
        decommitted
    }

    // ---- freelist ---------------------------------------------------------

    #[inline]
    pub(crate) fn get_freelist_head(&self) -> *mut FreelistEntry {
        self.freelist_head
    }

    /// Replace the freelist head. Conservatively marks the list unsorted.
    #[inline]
    pub(crate) fn set_freelist_head(&mut self, head: *mut FreelistEntry) {
        debug_assert!(
            head.is_null()
                || super_page_base(head as usize)
                    == super_page_base(self as *const _ as usize)
        );
        self.freelist_head = head;
        self.bits.set_freelist_is_sorted(false);
    }

    /// Take the slot at the freelist head. The caller must have checked
    /// that the freelist is non-empty.
    ///
    /// Removing the head keeps the remainder sorted, so the sorted flag is
    /// left alone.
    ///
    /// # Safety
    /// Must be called under the root lock with a non-null freelist head.
    #[inline]
    pub(crate) unsafe fn pop_for_alloc(&mut self) -> usize {
        debug_assert!(!self.freelist_head.is_null());
        let entry = self.freelist_head;
        self.freelist_head = (*entry).get_next();
        self.bits
            .set_num_allocated_slots(self.bits.num_allocated_slots() + 1);
        entry as usize
    }

    /// Return one slot to the span. Returns true when the span changed
    /// state and the caller must run the free slow path.
    ///
    /// # Safety
    /// Must be called under the root lock; `slot_start` must be a slot
    /// boundary of this span.
    pub(crate) unsafe fn free(&mut self, slot_start: usize) -> bool {
        let entry = slot_start as *mut FreelistEntry;
        if entry == self.freelist_head {
            abort_with_message("spanalloc: double free detected\n");
        }
        if self.bits.num_allocated_slots() == 0 {
            abort_with_message("spanalloc: free on a span with no allocated slots\n");
        }
        debug_assert!(
            self.freelist_head.is_null() || (*self.freelist_head).get_next() != entry,
            "double free (second entry)"
        );

        let entry = FreelistEntry::emplace(slot_start);
        (*entry).set_next(self.freelist_head);
        self.set_freelist_head(entry);

        let remaining = self.bits.num_allocated_slots() - 1;
        self.bits.set_num_allocated_slots(remaining);
        // Spans storing an explicit requested size hold a single slot and
        // so always hit the slow path through `remaining == 0`.
        debug_assert!(!self.bucket().can_store_raw_size() || remaining == 0);
        remaining == 0 || self.bits.marked_full()
    }

    /// Splice a caller-built chain of `count` freed slots onto the
    /// freelist. The whole chain is validated against this span's slot
    /// range before any metadata is touched.
    ///
    /// # Safety
    /// Must be called under the root lock. `head`/`tail` must point into
    /// writable slots; validation rejects chains that leave the span.
    pub(crate) unsafe fn append_free_list(
        &mut self,
        head: *mut FreelistEntry,
        tail: *mut FreelistEntry,
        count: usize,
    ) -> bool {
        let span_start = Self::to_slot_span_start(self);
        let span_end = span_start + self.bucket().get_bytes_per_span();
        let slot_size = self.bucket().slot_size;

        let mut seen = 0usize;
        let mut cursor = head;
        while !cursor.is_null() {
            let addr = cursor as usize;
            if addr < span_start
                || addr >= span_end
                || (addr - span_start) % slot_size != 0
            {
                abort_with_message(
                    "spanalloc: bulk free entry outside its slot span\n",
                );
            }
            seen += 1;
            if seen > count {
                break;
            }
            if cursor == tail {
                break;
            }
            cursor = (*cursor).get_next();
        }
        if seen != count || cursor != tail || !(*tail).get_next().is_null() {
            abort_with_message("spanalloc: corrupted bulk free chain\n");
        }
        if count > self.bits.num_allocated_slots() {
            abort_with_message(
                "spanalloc: bulk free releases more slots than allocated\n",
            );
        }

        (*tail).set_next(self.freelist_head);
        self.set_freelist_head(head);
        let remaining = self.bits.num_allocated_slots() - count;
        self.bits.set_num_allocated_slots(remaining);
        remaining == 0 || self.bits.marked_full()
    }

    /// Prepare a decommitted span for reuse: every slot counts as
    /// unprovisioned again.
    ///
    /// # Safety
    /// Must be called under the root lock on a decommitted span.
    pub(crate) unsafe fn reset_for_reuse(&mut self) {
        debug_assert!(self.is_decommitted());
        self.bits
            .set_num_unprovisioned_slots(self.bucket().slots_per_span());
        self.next_slot_span = core::ptr::null_mut();
    }

    /// Sort the freelist into ascending address order. Idempotent; called
    /// off the hot path (purge) to make later allocations walk memory
    /// forwards.
    ///
    /// # Safety
    /// Must be called under the root lock.
    pub(crate) unsafe fn sort_freelist(&mut self) {
        if self.bits.freelist_is_sorted() {
            return;
        }
        self.freelist_head = freelist::sort_by_address(self.freelist_head);
        self.bits.set_freelist_is_sorted(true);
    }

    // ---- raw size ---------------------------------------------------------

    /// Spans that can store a raw size hold exactly one slot spanning more
    /// than one partition page, so the next page's metadata record is free
    /// to hold the requested size.
    #[inline]
    unsafe fn raw_size_ptr(&self) -> *mut usize {
        debug_assert!(self.bucket().can_store_raw_size());
        let record = self as *const SlotSpanMetadata as usize;
        (record + PAGE_METADATA_SIZE) as *mut usize
    }

    /// # Safety
    /// Only valid on spans whose bucket can store a raw size.
    #[inline]
    pub(crate) unsafe fn set_raw_size(&mut self, raw_size: usize) {
        self.raw_size_ptr().write(raw_size);
    }

    /// # Safety
    /// Only valid on spans whose bucket can store a raw size.
    #[inline]
    pub(crate) unsafe fn get_raw_size(&self) -> usize {
        self.raw_size_ptr().read()
    }

    // ---- diagnostics ------------------------------------------------------

    /// Bytes of the span that have been provisioned so far.
    #[inline]
    pub fn get_provisioned_size(&self) -> usize {
        if self.is_decommitted() {
            return 0;
        }
        let provisioned_slots =
            self.bucket().slots_per_span() - self.bits.num_unprovisioned_slots();
        provisioned_slots * self.bucket().slot_size
    }

    /// Length of the freelist, derived from the counters instead of
    /// walking the list.
    #[inline]
    pub fn get_freelist_length(&self) -> usize {
        if self.is_decommitted() {
            return 0;
        }
        let provisioned_slots =
            self.bucket().slots_per_span() - self.bits.num_unprovisioned_slots();
        provisioned_slots - self.bits.num_allocated_slots()
    }

    /// Bytes of one slot that are in use, including the in-slot ref count
    /// reservation when present.
    #[inline]
    pub fn get_utilized_slot_size(&self) -> usize {
        if self.bucket().can_store_raw_size() {
            unsafe { self.get_raw_size() }
        } else {
            self.bucket().slot_size
        }
    }

    // ---- address <-> metadata mapping -------------------------------------

    /// Metadata record for the partition page containing `addr`. Aborts on
    /// addresses inside the metadata or guard pages.
    ///
    /// # Safety
    /// `addr` must lie within a live super page of some root.
    pub(crate) unsafe fn page_metadata_from_addr(addr: usize) -> *mut PageMetadata {
        let index = partition_page_index(addr);
        if index < FIRST_PAYLOAD_PAGE || index >= GUARD_PAGE_INDEX {
            abort_with_message(
                "spanalloc: address maps into a metadata or guard page\n",
            );
        }
        let metadata_area = super_page_base(addr) + METADATA_AREA_OFFSET;
        (metadata_area as *mut PageMetadata).add(index)
    }

    /// Slot span owning the payload address `addr`.
    ///
    /// # Safety
    /// `addr` must lie within a live super page of some root.
    pub unsafe fn from_addr(addr: usize) -> *mut SlotSpanMetadata {
        let mut page = Self::page_metadata_from_addr(addr);
        if !(*page).is_valid {
            abort_with_message("spanalloc: address not backed by a slot span\n");
        }
        if (*page).slot_span_offset != 0 {
            page = page.sub((*page).slot_span_offset as usize);
            if !(*page).is_valid || (*page).slot_span_offset != 0 {
                abort_with_message("spanalloc: corrupted slot span metadata\n");
            }
        }
        let span = &mut (*page).slot_span as *mut SlotSpanMetadata;
        if (*span).bucket.is_null() || (*span).bucket().slot_size == 0 {
            abort_with_message("spanalloc: corrupted slot span metadata\n");
        }
        span
    }

    /// Like `from_addr`, but additionally requires `addr` to be an exact
    /// slot boundary.
    ///
    /// # Safety
    /// Same as `from_addr`.
    pub unsafe fn from_slot_start(slot_start: usize) -> *mut SlotSpanMetadata {
        let span = Self::from_addr(slot_start);
        let span_start = Self::to_slot_span_start(span);
        if (slot_start - span_start) % (*span).bucket().slot_size != 0 {
            abort_with_message("spanalloc: address is not a slot boundary\n");
        }
        span
    }

    /// Like `from_addr`, but additionally requires `addr` to fall within
    /// the in-use bytes of its slot.
    ///
    /// # Safety
    /// Same as `from_addr`.
    pub unsafe fn from_object_inner_addr(addr: usize) -> *mut SlotSpanMetadata {
        let span = Self::from_addr(addr);
        let span_start = Self::to_slot_span_start(span);
        let offset_in_slot = (addr - span_start) % (*span).bucket().slot_size;
        if offset_in_slot >= (*span).get_utilized_slot_size() {
            abort_with_message("spanalloc: address beyond the in-use slot bytes\n");
        }
        span
    }

    /// First payload address of the span owning this metadata record.
    ///
    /// Inverse of `from_addr`: for any payload address `a` of a span `s`,
    /// `to_slot_span_start(from_addr(a))` is the span's first slot.
    ///
    /// # Safety
    /// `span` must point at a live span-head metadata record.
    pub unsafe fn to_slot_span_start(span: *const SlotSpanMetadata) -> usize {
        let record_addr = span as usize;
        let offset_in_super = record_addr & crate::layout::SUPER_PAGE_OFFSET_MASK;
        debug_assert!(offset_in_super >= METADATA_AREA_OFFSET);
        let index = (offset_in_super - METADATA_AREA_OFFSET) >> PAGE_METADATA_SHIFT;
        debug_assert!(index >= FIRST_PAYLOAD_PAGE && index < GUARD_PAGE_INDEX);
        super_page_base(record_addr) + (index << PARTITION_PAGE_SHIFT)
    }

    /// Debug-only check that an address belongs to the payload area.
    #[inline]
    pub(crate) fn debug_check_payload(addr: usize) {
        debug_assert!(is_within_super_page_payload(addr));
    }
}
