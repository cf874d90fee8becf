//! Partition roots: the lock, the buckets, and the slow paths.

use crate::address_map;
use crate::brp::ref_count::{InSlotRefCount, REF_COUNT_RESERVED};
use crate::bucket::Bucket;
use crate::config;
use crate::freelist::FreelistEntry;
use crate::layout::SYSTEM_PAGE_SIZE;
use crate::platform;
use crate::slot_span::SlotSpanMetadata;
use crate::superpage::SuperPageCursor;
use crate::sync::Mutex;
use crate::util::{abort_with_message, align_up, poison_region};

pub const MAX_BUCKETS: usize = 64;

/// Root creation flags.
#[derive(Clone, Copy, Default)]
pub struct RootFlags {
    /// Reserve the trailing bytes of every slot for an in-slot reference
    /// count, enabling `CheckedPtr` protection for this root's memory.
    pub enable_backup_ref: bool,
}

struct RootInner {
    buckets: [Bucket; MAX_BUCKETS],
    num_buckets: usize,
    cursor: SuperPageCursor,
    empty_ring: [*mut SlotSpanMetadata; config::MAX_EMPTY_SPAN_RING_SIZE],
    empty_ring_index: usize,
    empty_ring_size: usize,
}

// All raw pointers in RootInner refer to process-lifetime mappings and are
// only dereferenced under the root lock.
unsafe impl Send for RootInner {}

/// One partition root. Owns its super pages, buckets and empty-span ring.
/// Roots live for the whole process; `new` hands out a `'static` reference
/// backed by a private mapping, never a movable value, because super page
/// metadata records the root's address.
pub struct Root {
    brp_enabled: bool,
    inner: Mutex<RootInner>,
}

/// Observable state of a slot span. Exactly one state holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Active,
    Full,
    Empty,
    Decommitted,
}

/// Snapshot of one slot span, taken under the root lock.
#[derive(Debug, Clone, Copy)]
pub struct SpanInfo {
    pub state: SpanState,
    pub slot_size: usize,
    pub slot_span_start: usize,
    pub num_allocated_slots: usize,
    pub freelist_length: usize,
    pub provisioned_size: usize,
    pub utilized_slot_size: usize,
}

impl Root {
    /// Create a root with one bucket per entry of `slot_sizes`. Each slot
    /// size must be a multiple of 16. Aborts on invalid configuration and
    /// on failure to reserve the root itself.
    pub fn new(slot_sizes: &[usize], flags: RootFlags) -> &'static Root {
        if slot_sizes.is_empty() || slot_sizes.len() > MAX_BUCKETS {
            abort_with_message("spanalloc: root needs between 1 and 64 bucket sizes\n");
        }

        let mut buckets = [Bucket::UNUSED; MAX_BUCKETS];
        for (i, &size) in slot_sizes.iter().enumerate() {
            buckets[i] = Bucket::new(size);
        }

        let root = Root {
            brp_enabled: flags.enable_backup_ref,
            inner: Mutex::new(RootInner {
                buckets,
                num_buckets: slot_sizes.len(),
                cursor: SuperPageCursor::new(),
                empty_ring: [core::ptr::null_mut(); config::MAX_EMPTY_SPAN_RING_SIZE],
                empty_ring_index: 0,
                empty_ring_size: config::empty_span_ring_size(),
            }),
        };

        // The root's address is recorded in the super page map, so it must
        // never move: place it in its own mapping and leak it.
        let bytes = align_up(core::mem::size_of::<Root>(), SYSTEM_PAGE_SIZE);
        unsafe {
            let mem = platform::map_anonymous(bytes) as *mut Root;
            if mem.is_null() {
                abort_with_message("spanalloc: failed to reserve memory for a root\n");
            }
            mem.write(root);
            &*mem
        }
    }

    #[inline]
    pub fn backup_ref_enabled(&self) -> bool {
        self.brp_enabled
    }

    /// Trailing bytes of every slot reserved for the in-slot ref count.
    #[inline]
    pub(crate) fn ref_count_reserved(&self) -> usize {
        if self.brp_enabled {
            REF_COUNT_RESERVED
        } else {
            0
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    pub fn bucket_slot_size(&self, bucket_index: usize) -> usize {
        let inner = self.inner.lock();
        if bucket_index >= inner.num_buckets {
            abort_with_message("spanalloc: bucket index out of range\n");
        }
        inner.buckets[bucket_index].slot_size
    }

    // ---- allocation ---------------------------------------------------

    /// Allocate one slot from the given bucket. Returns the slot start
    /// address, or None when the OS is out of address space. Aborts when
    /// `requested_size` cannot fit the slot alongside the ref count
    /// reservation.
    pub fn alloc(&self, bucket_index: usize, requested_size: usize) -> Option<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if bucket_index >= inner.num_buckets {
            abort_with_message("spanalloc: bucket index out of range\n");
        }
        let bucket = &mut inner.buckets[bucket_index] as *mut Bucket;

        unsafe {
            let reserved = self.ref_count_reserved();
            if requested_size.saturating_add(reserved) > (*bucket).slot_size {
                abort_with_message("spanalloc: requested size exceeds the bucket slot\n");
            }

            let (slot_start, span) = self.alloc_from_bucket(inner, bucket)?;
            SlotSpanMetadata::debug_check_payload(slot_start);

            if (*bucket).can_store_raw_size() {
                (*span).set_raw_size(requested_size + reserved);
            }
            if self.brp_enabled {
                InSlotRefCount::init_for_new_allocation(slot_start, (*bucket).slot_size);
            }
            Some(slot_start)
        }
    }

    /// The bucket-level allocation path: active span first, then sweep,
    /// then empty and decommitted span reuse, then a fresh span.
    unsafe fn alloc_from_bucket(
        &self,
        inner: &mut RootInner,
        bucket: *mut Bucket,
    ) -> Option<(usize, *mut SlotSpanMetadata)> {
        // Fast path: the current active span still has free slots.
        let head = (*bucket).active_head;
        if !head.is_null() && !(*head).get_freelist_head().is_null() {
            return Some(((*head).pop_for_alloc(), head));
        }

        // Sweep the active list for a usable span.
        if (*bucket).set_new_active_slot_span() {
            let span = (*bucket).active_head;
            let slot_start = if !(*span).get_freelist_head().is_null() {
                (*span).pop_for_alloc()
            } else {
                (*bucket).provision_more_slots_and_alloc_one(span)
            };
            return Some((slot_start, span));
        }

        // Reuse an empty span if one is still provisioned. Spans on the
        // empty list may have been decommitted by ring eviction since they
        // were listed.
        loop {
            let span = (*bucket).empty_head;
            if span.is_null() {
                break;
            }
            (*bucket).empty_head = (*span).next_slot_span;
            if (*span).is_empty() {
                (*span).next_slot_span = core::ptr::null_mut();
                (*bucket).active_head = span;
                return Some(((*span).pop_for_alloc(), span));
            }
            if (*span).is_decommitted() {
                (*span).next_slot_span = (*bucket).decommitted_head;
                (*bucket).decommitted_head = span;
                continue;
            }
            abort_with_message("spanalloc: corrupted span on the empty list\n");
        }

        // Revive a decommitted span: all of its slots count as
        // unprovisioned again and the backing pages read as zero.
        let span = (*bucket).decommitted_head;
        if !span.is_null() {
            (*bucket).decommitted_head = (*span).next_slot_span;
            (*span).reset_for_reuse();
            (*bucket).active_head = span;
            let slot_start = (*bucket).provision_more_slots_and_alloc_one(span);
            return Some((slot_start, span));
        }

        // Carve a brand new span.
        let span = inner.cursor.allocate_span(self as *const Root, bucket);
        if span.is_null() {
            return None; // Out of address space.
        }
        (*bucket).active_head = span;
        let slot_start = (*bucket).provision_more_slots_and_alloc_one(span);
        Some((slot_start, span))
    }

    // ---- free -----------------------------------------------------------

    /// Free the slot starting at `slot_start`. With backup references
    /// enabled, a slot that still has raw pointer references is only
    /// logically freed here: its payload is poisoned and the physical free
    /// runs when the last reference goes away.
    pub fn free(&self, slot_start: usize) {
        if address_map::lookup_root(slot_start) != self as *const Root {
            abort_with_message("spanalloc: free() called on invalid pointer\n");
        }
        unsafe {
            let span = SlotSpanMetadata::from_slot_start(slot_start);
            if self.brp_enabled {
                let slot_size = (*span).bucket().slot_size;
                let ref_count = InSlotRefCount::from_slot(slot_start, slot_size);
                if !ref_count.release_from_allocator(slot_start) {
                    // Still referenced: poison everything but the ref count
                    // and defer the physical free.
                    let payload = (*span).get_utilized_slot_size() - REF_COUNT_RESERVED;
                    poison_region(slot_start, payload);
                    return;
                }
            }
            let mut guard = self.inner.lock();
            self.free_in_span(&mut guard, span, slot_start);
        }
    }

    /// Free a batch of slots belonging to one slot span with a single
    /// lock acquisition. The chain is validated against the span before
    /// the span is touched; a slot from another span aborts.
    pub fn free_batch(&self, slots: &[usize]) {
        let Some((&first, _)) = slots.split_first() else {
            return;
        };
        if address_map::lookup_root(first) != self as *const Root {
            abort_with_message("spanalloc: free() called on invalid pointer\n");
        }
        unsafe {
            let span = SlotSpanMetadata::from_slot_start(first);

            let mut head: *mut FreelistEntry = core::ptr::null_mut();
            let mut tail: *mut FreelistEntry = core::ptr::null_mut();
            let mut count = 0usize;
            for &slot_start in slots {
                if address_map::lookup_root(slot_start) != self as *const Root {
                    abort_with_message("spanalloc: free() called on invalid pointer\n");
                }
                if self.brp_enabled {
                    let slot_span = SlotSpanMetadata::from_slot_start(slot_start);
                    let slot_size = (*slot_span).bucket().slot_size;
                    let ref_count = InSlotRefCount::from_slot(slot_start, slot_size);
                    if !ref_count.release_from_allocator(slot_start) {
                        let payload =
                            (*slot_span).get_utilized_slot_size() - REF_COUNT_RESERVED;
                        poison_region(slot_start, payload);
                        continue;
                    }
                }
                let entry = FreelistEntry::emplace(slot_start);
                if head.is_null() {
                    head = entry;
                } else {
                    (*tail).set_next(entry);
                }
                tail = entry;
                count += 1;
            }
            if count == 0 {
                return;
            }

            let mut guard = self.inner.lock();
            let needs_slow_path = (*span).append_free_list(head, tail, count);
            if needs_slow_path {
                self.free_slow_path(&mut guard, span);
            }
        }
    }

    /// Physical free of a slot whose logical free was deferred while raw
    /// pointer references were outstanding.
    pub(crate) fn finish_deferred_free(&self, slot_start: usize) {
        unsafe {
            let span = SlotSpanMetadata::from_slot_start(slot_start);
            let mut guard = self.inner.lock();
            self.free_in_span(&mut guard, span, slot_start);
        }
    }

    unsafe fn free_in_span(
        &self,
        inner: &mut RootInner,
        span: *mut SlotSpanMetadata,
        slot_start: usize,
    ) {
        let needs_slow_path = (*span).free(slot_start);
        if needs_slow_path {
            self.free_slow_path(inner, span);
        }
    }

    /// Runs when a free changed its span's state: the span either left the
    /// full state or became empty.
    unsafe fn free_slow_path(&self, inner: &mut RootInner, span: *mut SlotSpanMetadata) {
        let bucket = (*span).bucket() as *const Bucket as *mut Bucket;

        if (*span).bits.marked_full() {
            (*span).bits.set_marked_full(false);
            debug_assert!((*bucket).num_full_spans > 0);
            (*bucket).num_full_spans -= 1;
            // Full spans are unlisted; rejoin the active list.
            (*span).next_slot_span = (*bucket).active_head;
            (*bucket).active_head = span;
        }

        if (*span).bits.num_allocated_slots() == 0 {
            // The span went empty. If it is the current active span, pick
            // a new one; otherwise it stays in the active list until the
            // next sweep.
            if span == (*bucket).active_head {
                (*bucket).set_new_active_slot_span();
            }
            if (*bucket).can_store_raw_size() {
                (*span).set_raw_size(0);
            }
            self.register_empty(inner, span);
        }
    }

    /// Park a newly empty span in the ring. The ring holds the most recent
    /// empty spans; registering into an occupied ring slot decommits the
    /// previous occupant first.
    unsafe fn register_empty(&self, inner: &mut RootInner, span: *mut SlotSpanMetadata) {
        if (*span).bits.in_empty_cache() {
            let old = (*span).empty_cache_index as usize;
            if old < inner.empty_ring_size && inner.empty_ring[old] == span {
                inner.empty_ring[old] = core::ptr::null_mut();
            }
        }

        let index = inner.empty_ring_index;
        let evicted = inner.empty_ring[index];
        if !evicted.is_null() {
            self.decommit_if_possible(evicted);
        }

        inner.empty_ring[index] = span;
        (*span).bits.set_in_empty_cache(true);
        (*span).empty_cache_index = index as u8;
        inner.empty_ring_index = (index + 1) % inner.empty_ring_size;
    }

    /// Decommit a span evicted from the ring, unless it was re-activated
    /// (or re-filled) since it was registered.
    unsafe fn decommit_if_possible(&self, span: *mut SlotSpanMetadata) {
        (*span).bits.set_in_empty_cache(false);
        if (*span).is_empty() {
            self.decommit_span(span);
        }
    }

    /// Return the span's provisioned pages to the OS. The span stays in
    /// whatever list currently holds it; the next active-list sweep files
    /// it under the bucket's decommitted list.
    unsafe fn decommit_span(&self, span: *mut SlotSpanMetadata) {
        debug_assert!((*span).is_empty());
        let span_start = SlotSpanMetadata::to_slot_span_start(span);
        let committed = align_up((*span).get_provisioned_size(), SYSTEM_PAGE_SIZE);
        if committed > 0 {
            platform::advise_free(span_start as *mut u8, committed);
        }
        (*span).set_freelist_head(core::ptr::null_mut());
        (*span).bits.set_num_unprovisioned_slots(0);
        debug_assert!((*span).is_decommitted());
    }

    // ---- maintenance ----------------------------------------------------

    /// Release cached memory: decommit every span parked in the empty-span
    /// ring and sort the freelists of listed spans so that reuse walks
    /// memory in address order.
    pub fn purge(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        unsafe {
            for index in 0..inner.empty_ring_size {
                let span = inner.empty_ring[index];
                if !span.is_null() {
                    inner.empty_ring[index] = core::ptr::null_mut();
                    self.decommit_if_possible(span);
                }
            }
            for bucket_index in 0..inner.num_buckets {
                let mut span = inner.buckets[bucket_index].active_head;
                while !span.is_null() {
                    (*span).sort_freelist();
                    span = (*span).next_slot_span;
                }
            }
        }
    }

    // ---- diagnostics ------------------------------------------------------

    /// Snapshot the slot span owning `addr`.
    pub fn span_info(&self, addr: usize) -> SpanInfo {
        if address_map::lookup_root(addr) != self as *const Root {
            abort_with_message("spanalloc: address not managed by this root\n");
        }
        let _guard = self.inner.lock();
        unsafe {
            let span = SlotSpanMetadata::from_addr(addr);
            let state = if (*span).is_decommitted() {
                SpanState::Decommitted
            } else if (*span).is_empty() {
                SpanState::Empty
            } else if (*span).is_full() {
                SpanState::Full
            } else {
                debug_assert!((*span).is_active());
                SpanState::Active
            };
            SpanInfo {
                state,
                slot_size: (*span).bucket().slot_size,
                slot_span_start: SlotSpanMetadata::to_slot_span_start(span),
                num_allocated_slots: (*span).bits.num_allocated_slots(),
                freelist_length: (*span).get_freelist_length(),
                provisioned_size: (*span).get_provisioned_size(),
                utilized_slot_size: (*span).get_utilized_slot_size(),
            }
        }
    }
}
