//! Global super page -> owning root map.
//!
//! A two-level radix table over the 47-bit user address space, keyed by
//! super page number. Level 1 is a table of pointers to level-2 blocks;
//! each level-2 block covers 2^13 super pages (16 GiB of address space).
//! Lookups are lock-free; level-2 blocks are published with a CAS and
//! never freed.
//!
//! Used on every pointer wrap and free to decide whether an address
//! belongs to a managed heap at all, so lookup is two dependent loads.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::layout::{SUPER_PAGE_SHIFT, SUPER_PAGE_SIZE};
use crate::platform;
use crate::root::Root;
use crate::util::abort_with_message;

const ADDRESS_BITS: usize = 47;
const L2_BITS: usize = 13;
const L2_ENTRIES: usize = 1 << L2_BITS;
const L1_ENTRIES: usize = 1 << (ADDRESS_BITS - SUPER_PAGE_SHIFT - L2_BITS);

#[allow(clippy::declare_interior_mutable_const)]
const NULL_BLOCK: AtomicPtr<AtomicUsize> = AtomicPtr::new(core::ptr::null_mut());
static LEVEL1: [AtomicPtr<AtomicUsize>; L1_ENTRIES] = [NULL_BLOCK; L1_ENTRIES];

#[inline]
fn split(addr: usize) -> Option<(usize, usize)> {
    if addr >> ADDRESS_BITS != 0 {
        return None;
    }
    let super_page_number = addr >> SUPER_PAGE_SHIFT;
    Some((super_page_number >> L2_BITS, super_page_number & (L2_ENTRIES - 1)))
}

/// Record `root` as the owner of the super page at `base`.
///
/// # Safety
/// `base` must be a super-page-aligned address of a live reservation and
/// `root` must stay valid for the process lifetime.
pub(crate) unsafe fn register_super_page(base: usize, root: *const Root) {
    debug_assert!(base % SUPER_PAGE_SIZE == 0);
    let Some((l1, l2)) = split(base) else {
        abort_with_message("spanalloc: super page outside the mappable address range\n");
    };
    let block = ensure_block(l1);
    (*block.add(l2)).store(root as usize, Ordering::Release);
}

unsafe fn ensure_block(l1: usize) -> *mut AtomicUsize {
    let slot = &LEVEL1[l1];
    let existing = slot.load(Ordering::Acquire);
    if !existing.is_null() {
        return existing;
    }
    let bytes = L2_ENTRIES * core::mem::size_of::<AtomicUsize>();
    let fresh = platform::map_anonymous(crate::util::align_up(
        bytes,
        crate::layout::SYSTEM_PAGE_SIZE,
    )) as *mut AtomicUsize;
    if fresh.is_null() {
        abort_with_message("spanalloc: failed to map the super page table\n");
    }
    // Anonymous mappings start zeroed, i.e. every entry reads "unmanaged".
    match slot.compare_exchange(
        core::ptr::null_mut(),
        fresh,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => fresh,
        Err(winner) => {
            platform::unmap(
                fresh as *mut u8,
                crate::util::align_up(bytes, crate::layout::SYSTEM_PAGE_SIZE),
            );
            winner
        }
    }
}

/// Root owning the super page containing `addr`, or null for addresses
/// outside any managed heap.
#[inline]
pub(crate) fn lookup_root(addr: usize) -> *const Root {
    let Some((l1, l2)) = split(addr) else {
        return core::ptr::null();
    };
    let block = LEVEL1[l1].load(Ordering::Acquire);
    if block.is_null() {
        return core::ptr::null();
    }
    unsafe { (*block.add(l2)).load(Ordering::Acquire) as *const Root }
}

/// Whether `addr` falls inside any managed super page.
#[inline]
pub fn is_managed(addr: usize) -> bool {
    !lookup_root(addr).is_null()
}
