//! Corruption and misuse detection tests.
//!
//! Every scenario here is expected to abort the process, so each one runs
//! in a subprocess: we spawn the test binary with `SPANALLOC_SCENARIO`
//! set, and check that the child dies with the expected diagnostic on
//! stderr.

use spanalloc::{CheckedPtr, InSlotRefCount, Root, RootFlags};

fn plain_root(slot_sizes: &[usize]) -> &'static Root {
    Root::new(slot_sizes, RootFlags::default())
}

fn brp_root(slot_sizes: &[usize]) -> &'static Root {
    Root::new(
        slot_sizes,
        RootFlags {
            enable_backup_ref: true,
        },
    )
}

// ---------------------------------------------------------------------------
// Helper: run a scenario in a subprocess and check the abort diagnostic.
// ---------------------------------------------------------------------------

fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env("SPANALLOC_SCENARIO", scenario_name)
        // The driver test detects the env var and runs the scenario,
        // aborting before any assertion fires.
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have aborted, but exited \
         successfully. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. \
         Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

// ---------------------------------------------------------------------------
// Scenario driver: when SPANALLOC_SCENARIO is set, run the requested
// scenario instead of normal test assertions.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("SPANALLOC_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "double_free" => scenario_double_free(),
        "double_free_backup_ref" => scenario_double_free_backup_ref(),
        "invalid_free_stack" => scenario_invalid_free_stack(),
        "misaligned_free" => scenario_misaligned_free(),
        "bulk_free_foreign_span" => scenario_bulk_free_foreign_span(),
        "freelist_overwrite" => scenario_freelist_overwrite(),
        "oob_advance" => scenario_oob_advance(),
        "poisoned_deref" => scenario_poisoned_deref(),
        "use_after_free_deref" => scenario_use_after_free_deref(),
        "wrap_freed_slot" => scenario_wrap_freed_slot(),
        "dangling_wrap_after_physical_free" => scenario_dangling_wrap_after_physical_free(),
        "ref_count_underflow" => scenario_ref_count_underflow(),
        "inner_addr_past_requested_size" => scenario_inner_addr_past_requested_size(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

/// Scenario: free the same slot twice on a plain root.
fn scenario_double_free() {
    let root = plain_root(&[64]);
    let slot = root.alloc(0, 64).unwrap();
    root.free(slot);
    root.free(slot);
    unreachable!("double free was not detected");
}

/// Scenario: free the same slot twice with backup references enabled; the
/// ref count catches it before the freelist does.
fn scenario_double_free_backup_ref() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    root.free(slot);
    root.free(slot);
    unreachable!("double free was not detected");
}

/// Scenario: free a stack address that no root manages.
fn scenario_invalid_free_stack() {
    let root = plain_root(&[64]);
    let mut stack_var: u64 = 0xDEAD;
    root.free(&mut stack_var as *mut u64 as usize);
    unreachable!("invalid free of a stack pointer was not detected");
}

/// Scenario: free an interior address instead of the slot start.
fn scenario_misaligned_free() {
    let root = plain_root(&[64]);
    let slot = root.alloc(0, 64).unwrap();
    root.free(slot + 8);
    unreachable!("misaligned free was not detected");
}

/// Scenario: a bulk free whose chain mixes slots from two spans. The
/// validation walk must reject the chain before touching either span.
fn scenario_bulk_free_foreign_span() {
    // 4096-byte slots, 4 per span: eight allocations fill two spans.
    let root = plain_root(&[4096]);
    let slots: Vec<usize> = (0..8).map(|_| root.alloc(0, 4096).unwrap()).collect();
    root.free_batch(&[slots[0], slots[7]]);
    unreachable!("foreign bulk free entry was not detected");
}

/// Scenario: overwrite a freed slot's freelist word, then allocate until
/// the corrupted link is followed.
fn scenario_freelist_overwrite() {
    let root = plain_root(&[64]);
    let a = root.alloc(0, 64).unwrap();
    let b = root.alloc(0, 64).unwrap();
    root.free(b);
    root.free(a);
    // The freelist is now a -> b. Smash a's next pointer.
    unsafe { (a as *mut usize).write(0xAAAA_AAAA_AAAA_AAAA) };
    root.alloc(0, 64).unwrap(); // pops a, decodes the smashed link
    unreachable!("freelist overwrite was not detected");
}

/// Scenario: advance a checked pointer two slots forward.
fn scenario_oob_advance() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    let mut ptr = CheckedPtr::<false, true>::wrap(slot);
    ptr.advance(128);
    unreachable!("out-of-bounds advance was not detected");
}

/// Scenario: dereference a one-past-the-end pointer.
fn scenario_poisoned_deref() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    let mut ptr = CheckedPtr::<false, true>::wrap(slot);
    ptr.advance(64 - 8); // exactly one past the payload
    let _ = ptr.get();
    unreachable!("one-past-the-end dereference was not detected");
}

/// Scenario: dereference through a wrapper after the slot was freed.
fn scenario_use_after_free_deref() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    let ptr = spanalloc::DanglingTolerantPtr::wrap(slot);
    root.free(slot);
    let _ = ptr.get();
    unreachable!("use-after-free dereference was not detected");
}

/// Scenario: wrap a pointer to a slot that was already physically freed.
fn scenario_wrap_freed_slot() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    root.free(slot);
    let _ptr = CheckedPtr::<false, true>::wrap(slot);
    unreachable!("wrap of a freed slot was not detected");
}

/// Scenario: a dangling-tolerant wrap of a slot whose physical free has
/// already run. The count is defunct (no references, memory released), so
/// even the tolerant wrapper must not resurrect it: its drop would push
/// the slot onto the freelist a second time.
fn scenario_dangling_wrap_after_physical_free() {
    let root = brp_root(&[64]);
    let slot = root.alloc(0, 48).unwrap();
    root.free(slot);
    let _ptr = spanalloc::DanglingTolerantPtr::wrap(slot);
    unreachable!("wrap of a physically freed slot was not detected");
}

/// Scenario: release an in-slot ref count more often than it was acquired.
fn scenario_ref_count_underflow() {
    let mut buf = [0u8; 64];
    let slot = buf.as_mut_ptr() as usize;
    let rc = unsafe {
        InSlotRefCount::init_for_new_allocation(slot, buf.len());
        InSlotRefCount::from_slot(slot, buf.len())
    };
    rc.acquire();
    assert!(!rc.release(slot));
    rc.release(slot);
    unreachable!("ref count underflow was not detected");
}

/// Scenario: resolve an address past the recorded request size of a
/// single-slot span.
fn scenario_inner_addr_past_requested_size() {
    let root = plain_root(&[2 * spanalloc::layout::PARTITION_PAGE_SIZE]);
    let slot = root.alloc(0, 1000).unwrap();
    // 2000 is inside the slot but past the 1000 bytes in use.
    let _ = unsafe { spanalloc::SlotSpanMetadata::from_object_inner_addr(slot + 2000) };
    unreachable!("inner address past the request size was not detected");
}

// ---------------------------------------------------------------------------
// The tests proper.
// ---------------------------------------------------------------------------

#[test]
fn double_free_detected() {
    expect_abort_subprocess("double_free", "double free detected");
}

#[test]
fn double_free_detected_with_backup_refs() {
    expect_abort_subprocess("double_free_backup_ref", "double free detected");
}

#[test]
fn invalid_free_stack_detected() {
    expect_abort_subprocess("invalid_free_stack", "free() called on invalid pointer");
}

#[test]
fn misaligned_free_detected() {
    expect_abort_subprocess("misaligned_free", "not a slot boundary");
}

#[test]
fn bulk_free_foreign_span_detected() {
    expect_abort_subprocess(
        "bulk_free_foreign_span",
        "bulk free entry outside its slot span",
    );
}

#[test]
fn freelist_overwrite_detected() {
    expect_abort_subprocess("freelist_overwrite", "freelist corruption detected");
}

#[test]
fn oob_advance_detected() {
    expect_abort_subprocess("oob_advance", "pointer arithmetic escaped its allocation");
}

#[test]
#[cfg(feature = "oob-poison")]
fn poisoned_deref_detected() {
    expect_abort_subprocess(
        "poisoned_deref",
        "dereference of a one-past-the-end pointer",
    );
}

#[test]
#[cfg(feature = "slow-checks")]
fn use_after_free_deref_detected() {
    expect_abort_subprocess("use_after_free_deref", "use of freed memory detected");
}

#[test]
fn wrap_freed_slot_detected() {
    expect_abort_subprocess("wrap_freed_slot", "reference taken to freed memory");
}

#[test]
fn dangling_wrap_after_physical_free_detected() {
    expect_abort_subprocess(
        "dangling_wrap_after_physical_free",
        "reference taken to freed memory",
    );
}

#[test]
fn ref_count_underflow_detected() {
    expect_abort_subprocess("ref_count_underflow", "slot reference count underflow");
}

#[test]
fn inner_addr_past_requested_size_detected() {
    expect_abort_subprocess(
        "inner_addr_past_requested_size",
        "address beyond the in-use slot bytes",
    );
}
