//! spanalloc: slot span management with backup reference protection.
//!
//! Memory is reserved in 2 MiB super pages, carved into *slot spans* that
//! serve fixed-size slots through per-bucket freelists. Per-span metadata
//! lives at a fixed offset inside the super page, so any payload address
//! maps to its span in a few shifts, with no global table on the hot path.
//!
//! On top of the spans sits backup reference protection: roots created
//! with `enable_backup_ref` reserve the tail of every slot for a
//! reference count, and [`CheckedPtr`] wrappers keep it up to date so
//! use-after-free turns into a clean abort (or a report, for tolerated
//! dangling pointers) instead of silent corruption.

pub mod address_map;
pub mod brp;
pub mod bucket;
pub mod config;
pub mod freelist;
pub mod layout;
pub mod platform;
pub mod root;
pub mod slot_span;
mod superpage;
pub mod sync;
pub mod util;

pub use brp::checked_ptr::{CheckedPtr, DanglingTolerantPtr, UncheckedPtr};
pub use brp::hooks::{
    dangling_references_outstanding, reset_hooks, set_dangling_detected_hook,
    set_dangling_released_hook, DanglingPtrHook,
};
pub use brp::ref_count::{InSlotRefCount, REF_COUNT_RESERVED};
pub use brp::report_if_dangling;
pub use root::{Root, RootFlags, SpanInfo, SpanState};
pub use slot_span::SlotSpanMetadata;
