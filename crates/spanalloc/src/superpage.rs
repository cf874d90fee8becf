//! Super page reservation and slot span carving.

use crate::address_map;
use crate::bucket::Bucket;
use crate::layout::{
    FIRST_PAYLOAD_PAGE, GUARD_PAGE_INDEX, METADATA_AREA_OFFSET, PARTITION_PAGE_SHIFT,
    PARTITION_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};
use crate::platform;
use crate::root::Root;
use crate::slot_span::{PageMetadata, SlotSpanMetadata};

/// Bump cursor over the payload pages of the most recent super page.
/// Exhausted tails (fewer free pages than a span needs) are abandoned; a
/// fresh super page is reserved instead.
pub(crate) struct SuperPageCursor {
    current_base: usize,
    next_page_index: usize,
}

impl SuperPageCursor {
    pub(crate) const fn new() -> Self {
        SuperPageCursor {
            current_base: 0,
            next_page_index: 0,
        }
    }

    /// Carve a new slot span for `bucket`. Returns null when the OS
    /// refuses to hand out a super page.
    ///
    /// # Safety
    /// Must be called under the root lock. `root` and `bucket` must be
    /// pointers that stay valid for the process lifetime.
    pub(crate) unsafe fn allocate_span(
        &mut self,
        root: *const Root,
        bucket: *const Bucket,
    ) -> *mut SlotSpanMetadata {
        let pages_needed = (*bucket).get_pages_per_span();

        if self.current_base == 0 || self.next_page_index + pages_needed > GUARD_PAGE_INDEX {
            if !self.map_new_super_page(root) {
                return core::ptr::null_mut();
            }
        }

        let page_index = self.next_page_index;
        self.next_page_index += pages_needed;

        let records = (self.current_base + METADATA_AREA_OFFSET) as *mut PageMetadata;
        let head = records.add(page_index);
        for i in 0..pages_needed {
            let record = records.add(page_index + i);
            (*record).slot_span_offset = i as u8;
            (*record).is_valid = true;
        }
        let span = &mut (*head).slot_span as *mut SlotSpanMetadata;
        span.write(SlotSpanMetadata::new(bucket));
        (*span)
            .bits
            .set_num_unprovisioned_slots((*bucket).slots_per_span());

        debug_assert_eq!(
            SlotSpanMetadata::to_slot_span_start(span),
            self.current_base + (page_index << PARTITION_PAGE_SHIFT)
        );
        span
    }

    unsafe fn map_new_super_page(&mut self, root: *const Root) -> bool {
        let base = platform::map_super_page();
        if base == 0 {
            return false;
        }

        // Leading guard system page (the metadata area follows it in the
        // same partition page) and trailing guard partition page.
        platform::protect_none(base as *mut u8, SYSTEM_PAGE_SIZE);
        platform::protect_none(
            (base + (GUARD_PAGE_INDEX << PARTITION_PAGE_SHIFT)) as *mut u8,
            PARTITION_PAGE_SIZE,
        );

        address_map::register_super_page(base, root);

        self.current_base = base;
        self.next_page_index = FIRST_PAYLOAD_PAGE;
        true
    }
}
