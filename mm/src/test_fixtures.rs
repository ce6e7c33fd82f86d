//! Shared fixtures for heap tests: a static region the suites can hand to
//! the heap over and over, plus a canned growth hook.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use opal_abi::addr::VirtAddr;

use crate::kernel_heap::{kheap_initialize, kheap_set_expand_hook};

/// Total backing store carved out for the test heap.
pub const TEST_REGION_SIZE: usize = 256 * 1024;

/// The slice of the region handed to the heap at reset; the remainder is
/// what the growth hook can grant.
pub const TEST_REGION_INITIAL: usize = 128 * 1024;

#[repr(C, align(64))]
struct TestRegion(UnsafeCell<[u8; TEST_REGION_SIZE]>);

// SAFETY: only reached through the heap, which serialises all access.
unsafe impl Sync for TestRegion {}

static TEST_REGION: TestRegion = TestRegion(UnsafeCell::new([0; TEST_REGION_SIZE]));

static TAIL_GRANTED: AtomicBool = AtomicBool::new(false);

/// Base address of the test region.
pub fn test_region_base() -> VirtAddr {
    VirtAddr::new(TEST_REGION.0.get() as u64)
}

/// Reinitialise the heap over the first [`TEST_REGION_INITIAL`] bytes of the
/// region and clear any growth hook. Every heap test starts here so the
/// suites stay order-independent.
pub fn reset_test_heap() {
    kheap_set_expand_hook(None);
    TAIL_GRANTED.store(false, Ordering::Relaxed);
    kheap_initialize(test_region_base(), TEST_REGION_INITIAL);
}

/// Growth hook granting the unused tail of the test region exactly once.
pub fn grant_region_tail(min_size: usize) -> usize {
    let tail = TEST_REGION_SIZE - TEST_REGION_INITIAL;
    if min_size > tail {
        return 0;
    }
    if TAIL_GRANTED.swap(true, Ordering::Relaxed) {
        return 0;
    }
    tail
}
