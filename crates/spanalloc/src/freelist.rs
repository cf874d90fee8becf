//! Intrusive freelist stored inside the free slots themselves.
//!
//! The first word of every free slot holds the address of the next free
//! slot, encoded so that a plain heap value does not look like a valid
//! pointer: the address is XORed with a per-process random secret and then
//! byte-swapped. Decoding verifies the result stays inside the same super
//! page as the entry it was read from, which catches most overwrites of
//! freelist words before they are followed.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::layout::super_page_base;
use crate::platform;
use crate::util::abort_with_message;

static ENCODE_SECRET: AtomicU64 = AtomicU64::new(0);

#[inline]
fn secret() -> usize {
    let current = ENCODE_SECRET.load(Ordering::Relaxed);
    if current != 0 {
        return current as usize;
    }
    init_secret()
}

#[cold]
fn init_secret() -> usize {
    let mut value = platform::fast_random_u64();
    if value == 0 {
        value = 0x9E37_79B9_7F4A_7C15;
    }
    // First writer wins so every thread encodes with the same secret.
    match ENCODE_SECRET.compare_exchange(0, value, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => value as usize,
        Err(existing) => existing as usize,
    }
}

#[inline]
fn encode(ptr: *mut FreelistEntry) -> usize {
    ((ptr as usize) ^ secret()).swap_bytes()
}

#[inline]
fn decode(encoded: usize) -> *mut FreelistEntry {
    (encoded.swap_bytes() ^ secret()) as *mut FreelistEntry
}

/// One entry of the in-slot freelist. Lives at the start of a free slot.
#[repr(transparent)]
pub struct FreelistEntry {
    encoded_next: usize,
}

impl FreelistEntry {
    /// Turn the first word of the free slot at `slot_start` into a list
    /// entry with no successor.
    ///
    /// # Safety
    /// `slot_start` must be the start of a free, writable slot.
    #[inline]
    pub unsafe fn emplace(slot_start: usize) -> *mut FreelistEntry {
        let entry = slot_start as *mut FreelistEntry;
        (*entry).encoded_next = encode(core::ptr::null_mut());
        entry
    }

    /// Decode the successor pointer. Aborts if the decoded address escapes
    /// the super page this entry lives in.
    ///
    /// # Safety
    /// `self` must be a live freelist entry inside a super page.
    #[inline]
    pub unsafe fn get_next(&self) -> *mut FreelistEntry {
        let next = decode(self.encoded_next);
        if next.is_null() {
            return next;
        }
        let self_addr = self as *const FreelistEntry as usize;
        if super_page_base(next as usize) != super_page_base(self_addr) {
            abort_with_message("spanalloc: freelist corruption detected\n");
        }
        next
    }

    /// # Safety
    /// `self` must be a live freelist entry.
    #[inline]
    pub unsafe fn set_next(&mut self, next: *mut FreelistEntry) {
        self.encoded_next = encode(next);
    }
}

/// Sort a freelist into ascending address order, in place, without
/// allocating. Classic top-down merge sort on the singly linked list;
/// recursion depth is bounded by the list length's log.
///
/// # Safety
/// `head` must be either null or the head of a well-formed freelist whose
/// entries all live in the same super page.
pub unsafe fn sort_by_address(head: *mut FreelistEntry) -> *mut FreelistEntry {
    if head.is_null() || (*head).get_next().is_null() {
        return head;
    }

    // Split the list in two by running a slow and a fast cursor.
    let mut slow = head;
    let mut fast = (*head).get_next();
    while !fast.is_null() {
        fast = (*fast).get_next();
        if fast.is_null() {
            break;
        }
        slow = (*slow).get_next();
        fast = (*fast).get_next();
    }
    let second = (*slow).get_next();
    (*slow).set_next(core::ptr::null_mut());

    let a = sort_by_address(head);
    let b = sort_by_address(second);
    merge_by_address(a, b)
}

unsafe fn merge_by_address(
    mut a: *mut FreelistEntry,
    mut b: *mut FreelistEntry,
) -> *mut FreelistEntry {
    let mut head: *mut FreelistEntry = core::ptr::null_mut();
    let mut tail: *mut FreelistEntry = core::ptr::null_mut();

    while !a.is_null() && !b.is_null() {
        let take_a = (a as usize) < (b as usize);
        let next = if take_a { a } else { b };
        if take_a {
            a = (*a).get_next();
        } else {
            b = (*b).get_next();
        }
        if head.is_null() {
            head = next;
        } else {
            (*tail).set_next(next);
        }
        tail = next;
    }

    let rest = if a.is_null() { b } else { a };
    if head.is_null() {
        return rest;
    }
    (*tail).set_next(rest);
    head
}
