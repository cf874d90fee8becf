//! Checked raw pointer wrappers backed by in-slot reference counts.
//!
//! A `CheckedPtr` holds a plain address. While it points into a
//! backup-ref-enabled root, wrapping takes a reference on the slot and
//! dropping releases it, so the allocator can tell when a freed slot is
//! still pointed at. Pointers to unmanaged memory (stack, other heaps,
//! null) pass through untouched.
//!
//! One-past-the-end pointers are legal to hold and compare but not to
//! dereference; they are tagged with a high *poison* bit so a dereference
//! is caught even without resolving the slot.

use super::ref_count::InSlotRefCount;
use super::{is_poisoned, with_poison, without_poison};
use crate::address_map;
use crate::layout::is_within_super_page_payload;
use crate::root::Root;
use crate::slot_span::SlotSpanMetadata;
use crate::util::abort_with_message;

/// A reference-counted pointer wrapper.
///
/// `ALLOW_DANGLING` permits wrapping and holding pointers to slots that
/// were already logically freed. `PROTECTED` turns the reference counting
/// on; with it off the wrapper degenerates to a plain address (used to
/// carry pointers through code that cannot afford the checks).
#[repr(transparent)]
pub struct CheckedPtr<const ALLOW_DANGLING: bool = false, const PROTECTED: bool = true> {
    addr: usize,
}

/// Wrapper for references that are expected to outlive their allocation.
pub type DanglingTolerantPtr = CheckedPtr<true, true>;
/// Wrapper with the protection compiled out.
pub type UncheckedPtr = CheckedPtr<false, false>;

struct ResolvedSlot {
    root: *const Root,
    span: *mut SlotSpanMetadata,
    slot_start: usize,
    slot_size: usize,
}

/// Strip the poison bit and step one-past-the-end addresses back into
/// their slot, so resolution lands on the owning slot.
#[inline]
fn effective_addr(addr: usize) -> usize {
    without_poison(addr).wrapping_sub(is_poisoned(addr) as usize)
}

/// Resolve the managed slot containing `addr`, or None for addresses
/// outside every root's payload area.
unsafe fn resolve_slot(addr: usize) -> Option<ResolvedSlot> {
    let root = address_map::lookup_root(addr);
    if root.is_null() {
        return None;
    }
    if !is_within_super_page_payload(addr) {
        return None;
    }
    let span = SlotSpanMetadata::from_addr(addr);
    let span_start = SlotSpanMetadata::to_slot_span_start(span);
    let slot_size = (*span).bucket().slot_size;
    let slot_start = span_start + (addr - span_start) / slot_size * slot_size;
    Some(ResolvedSlot {
        root,
        span,
        slot_start,
        slot_size,
    })
}

/// Bytes of the slot usable by the caller (excludes the ref count
/// reservation).
unsafe fn payload_size(slot: &ResolvedSlot) -> usize {
    (*slot.span).get_utilized_slot_size() - (*slot.root).ref_count_reserved()
}

/// Pointer arithmetic shared by the in-place and value-producing
/// operations. Inside a managed slot the result must stay within the same
/// allocation; landing exactly one past the payload yields a poisoned
/// address. `enforce` aborts on anything further out.
unsafe fn checked_arithmetic(addr: usize, delta: isize, enforce: bool) -> usize {
    let base = without_poison(addr);
    let Some(slot) = resolve_slot(effective_addr(addr)) else {
        // Unmanaged memory: plain arithmetic.
        return base.wrapping_add_signed(delta);
    };

    let new_addr = match base.checked_add_signed(delta) {
        Some(a) => a,
        None => {
            abort_with_message("spanalloc: pointer arithmetic overflow\n");
        }
    };

    let payload_end = slot.slot_start + payload_size(&slot);
    if new_addr >= slot.slot_start && new_addr < payload_end {
        return new_addr;
    }
    if new_addr == payload_end {
        if cfg!(feature = "oob-poison") {
            return with_poison(new_addr);
        }
        return new_addr;
    }
    if enforce {
        abort_with_message("spanalloc: pointer arithmetic escaped its allocation\n");
    }
    new_addr
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> CheckedPtr<ALLOW_DANGLING, PROTECTED> {
    pub const fn null() -> Self {
        CheckedPtr { addr: 0 }
    }

    /// Wrap an address. If it points into a backup-ref-enabled root, a
    /// reference is taken on the owning slot; wrapping a freed slot aborts
    /// unless `ALLOW_DANGLING`.
    pub fn wrap(addr: usize) -> Self {
        if PROTECTED && addr != 0 {
            unsafe {
                if let Some(slot) = resolve_slot(effective_addr(addr)) {
                    if (*slot.root).backup_ref_enabled() {
                        let ref_count =
                            InSlotRefCount::from_slot(slot.slot_start, slot.slot_size);
                        if ALLOW_DANGLING {
                            ref_count.acquire_allow_dangling();
                        } else {
                            ref_count.acquire();
                        }
                    }
                }
            }
        }
        CheckedPtr { addr }
    }

    /// Wrap the given raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::wrap(ptr as usize)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// The wrapped address with the poison bit stripped. Safe for
    /// comparisons and logging; not a licence to dereference.
    #[inline]
    pub fn address(&self) -> usize {
        without_poison(self.addr)
    }

    /// Extract the address for dereferencing. Aborts on one-past-the-end
    /// pointers and, with the `slow-checks` feature, on pointers whose
    /// slot was already freed.
    pub fn get(&self) -> usize {
        if is_poisoned(self.addr) {
            abort_with_message(
                "spanalloc: dereference of a one-past-the-end pointer\n",
            );
        }
        #[cfg(feature = "slow-checks")]
        if PROTECTED && self.addr != 0 {
            unsafe {
                if let Some(slot) = resolve_slot(self.addr) {
                    if (*slot.root).backup_ref_enabled()
                        && !InSlotRefCount::from_slot(slot.slot_start, slot.slot_size)
                            .is_alive()
                    {
                        abort_with_message("spanalloc: use of freed memory detected\n");
                    }
                }
            }
        }
        self.addr
    }

    /// `get()` as a typed pointer.
    pub fn as_ptr<T>(&self) -> *mut T {
        self.get() as *mut T
    }

    /// Move the pointer forward by `delta` bytes, in place. The result
    /// must stay inside the same allocation; exactly one past the payload
    /// is allowed but poisoned.
    pub fn advance(&mut self, delta: isize) {
        self.addr = unsafe { checked_arithmetic(self.addr, delta, true) };
    }

    /// Move the pointer backwards by `delta` bytes, in place.
    pub fn retreat(&mut self, delta: isize) {
        self.addr = unsafe { checked_arithmetic(self.addr, delta.wrapping_neg(), true) };
    }

    /// Produce a new wrapper `delta` bytes away. Bounds are enforced only
    /// with the `strict-oob-checks` feature; the poison bit is managed
    /// either way.
    pub fn offset(&self, delta: isize) -> Self {
        let new_addr = unsafe {
            checked_arithmetic(self.addr, delta, cfg!(feature = "strict-oob-checks"))
        };
        Self::wrap(new_addr)
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> Drop
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn drop(&mut self) {
        if !PROTECTED || self.addr == 0 {
            return;
        }
        unsafe {
            if let Some(slot) = resolve_slot(effective_addr(self.addr)) {
                if (*slot.root).backup_ref_enabled() {
                    let ref_count =
                        InSlotRefCount::from_slot(slot.slot_start, slot.slot_size);
                    if ref_count.release(slot.slot_start) {
                        (*slot.root).finish_deferred_free(slot.slot_start);
                    }
                }
            }
        }
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> Clone
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn clone(&self) -> Self {
        Self::wrap(self.addr)
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> Default
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn default() -> Self {
        Self::null()
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> PartialEq
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> Eq
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> PartialOrd
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> Ord
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.address().cmp(&other.address())
    }
}

impl<const ALLOW_DANGLING: bool, const PROTECTED: bool> core::fmt::Debug
    for CheckedPtr<ALLOW_DANGLING, PROTECTED>
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CheckedPtr({:#x})", self.address())?;
        if is_poisoned(self.addr) {
            write!(f, " (one past the end)")?;
        }
        Ok(())
    }
}
