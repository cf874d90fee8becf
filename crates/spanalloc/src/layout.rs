//! Address-space layout constants for super pages.
//!
//! The heap is carved out of 2 MiB *super pages*, each aligned to its own
//! size. A super page is subdivided into 16 KiB *partition pages*:
//!
//! ```text
//! | guard (4 KiB) | metadata area | unused | payload pages 1..=126 | guard page 127 |
//! ```
//!
//! Partition page 0 holds one inaccessible guard system page followed by
//! the metadata records for the whole super page; partition page 127 is a
//! trailing guard. Slot spans are built from 1..=4 consecutive payload
//! pages.

/// System (OS) page size. Fixed at 4 KiB; platforms with larger base pages
/// are not supported.
pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT;
pub const SYSTEM_PAGE_SHIFT: usize = 12;

/// Partition page: the granule slot spans are built from.
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;
pub const PARTITION_PAGE_SHIFT: usize = 14;

/// Super page: unit of reservation from the OS.
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_BASE_MASK: usize = !(SUPER_PAGE_SIZE - 1);
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;

pub const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize =
    SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

/// One metadata record per partition page, 64 bytes each, so a record for
/// partition page `i` lives at `super_page + METADATA_AREA_OFFSET + i * 64`.
pub const PAGE_METADATA_SIZE: usize = 1 << PAGE_METADATA_SHIFT;
pub const PAGE_METADATA_SHIFT: usize = 6;

/// The metadata area starts one system page into the super page; the first
/// system page itself is an inaccessible guard.
pub const METADATA_AREA_OFFSET: usize = SYSTEM_PAGE_SIZE;
pub const METADATA_AREA_SIZE: usize =
    NUM_PARTITION_PAGES_PER_SUPER_PAGE * PAGE_METADATA_SIZE;

/// A slot span covers at most this many partition pages.
pub const MAX_PARTITION_PAGES_PER_SPAN: usize = 4;

/// Slot counts are stored in 13-bit metadata fields.
pub const MAX_SLOTS_PER_SPAN: usize = (1 << 13) - 1;

/// Index of the first payload partition page.
pub const FIRST_PAYLOAD_PAGE: usize = 1;
/// Index of the trailing guard partition page.
pub const GUARD_PAGE_INDEX: usize = NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1;

/// Base address of the super page containing `addr`.
#[inline(always)]
pub const fn super_page_base(addr: usize) -> usize {
    addr & SUPER_PAGE_BASE_MASK
}

/// Index of the partition page containing `addr` within its super page.
#[inline(always)]
pub const fn partition_page_index(addr: usize) -> usize {
    (addr & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT
}

/// Whether `addr` falls inside the payload region of its super page
/// (excludes the metadata/guard partition page 0 and the trailing guard).
#[inline(always)]
pub const fn is_within_super_page_payload(addr: usize) -> bool {
    let index = partition_page_index(addr);
    index >= FIRST_PAYLOAD_PAGE && index < GUARD_PAGE_INDEX
}

const _: () = assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE == 128);
const _: () = assert!(METADATA_AREA_SIZE + METADATA_AREA_OFFSET <= PARTITION_PAGE_SIZE);
const _: () =
    assert!(MAX_PARTITION_PAGES_PER_SPAN * PARTITION_PAGE_SIZE / crate::util::MIN_SLOT_SIZE
        <= MAX_SLOTS_PER_SPAN);
