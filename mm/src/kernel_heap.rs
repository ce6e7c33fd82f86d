//! Kernel heap: coalescing free-list allocator.
//!
//! The heap manages one contiguous byte region handed over at
//! [`kheap_initialize`]. Blocks carry a [`BlockHeader`] directly below their
//! payload and form a doubly-linked list in strict address order; allocation
//! is first-fit with splitting, deallocation merges adjacent free blocks so
//! that no two neighbouring blocks are ever both free once a free or
//! reallocation has returned.
//!
//! # Contract
//!
//! - [`kmalloc`]`(size)`: payload of at least `size` bytes, disjoint from
//!   every live allocation; null on exhaustion. Size 0 is treated as 1.
//! - [`kmalloc_aligned`]`(size, align)`: payload address is a multiple of
//!   `align` (power of two; 0 is coerced to 1). The block keeps its own
//!   header immediately below the aligned address and any prefix gap goes
//!   back to the free list.
//! - [`krealloc`]: null pointer behaves as `kmalloc`, size 0 frees, a block
//!   that is already large enough is returned unchanged, otherwise
//!   allocate-copy-free.
//! - [`kfree`]: tolerates null; out-of-range or not-currently-used pointers
//!   are rejected with a log line rather than corrupting the list.
//!
//! The heap never aborts: null is the sole failure signal. When the region
//! is exhausted an optional [`ExpandHeapFn`] hook may grow it contiguously
//! at the top; without a hook the allocation simply fails.

use core::ffi::c_void;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use opal_abi::addr::VirtAddr;
use opal_lib::{IrqMutex, align_down_usize, align_up_usize, klog_debug, klog_info};

/// Size of the per-block bookkeeping header. Also the allocation granule:
/// payload sizes are rounded up to a multiple of this, which keeps every
/// header (and therefore every payload) on a header-aligned boundary.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

#[repr(C)]
struct BlockHeader {
    /// Payload byte count, not including this header.
    size: usize,
    used: bool,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
}

/// Point-in-time heap statistics.
///
/// `used_size` counts payload plus header for every used block, so
/// `free_size = total_size - used_size` accounts for free-block headers as
/// part of the free space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_size: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub allocation_count: u64,
    pub free_count: u64,
}

struct KernelHeap {
    base: u64,
    total_size: usize,
    used_size: usize,
    allocation_count: u64,
    free_count: u64,
    first_block: *mut BlockHeader,
    initialized: bool,
}

// SAFETY: all access goes through the IrqMutex below.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    const fn new() -> Self {
        Self {
            base: 0,
            total_size: 0,
            used_size: 0,
            allocation_count: 0,
            free_count: 0,
            first_block: ptr::null_mut(),
            initialized: false,
        }
    }
}

static KERNEL_HEAP: IrqMutex<KernelHeap> = IrqMutex::new(KernelHeap::new());

/// Heap growth hook: asked for at least `min_size` additional bytes, mapped
/// contiguously at the current top of the region. Returns the number of
/// bytes actually made available, or 0 to refuse.
///
/// The hook runs with the heap lock held and must not allocate from the
/// heap itself.
pub type ExpandHeapFn = fn(min_size: usize) -> usize;

static EXPAND_HOOK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install (or clear) the heap growth hook.
pub fn kheap_set_expand_hook(hook: Option<ExpandHeapFn>) {
    let raw = match hook {
        Some(f) => f as *mut (),
        None => ptr::null_mut(),
    };
    EXPAND_HOOK.store(raw, Ordering::Release);
}

fn load_expand_hook() -> Option<ExpandHeapFn> {
    let raw = EXPAND_HOOK.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only `kheap_set_expand_hook` stores here, and it stores a
        // valid `ExpandHeapFn`.
        Some(unsafe { core::mem::transmute::<*mut (), ExpandHeapFn>(raw) })
    }
}

// =============================================================================
// Initialisation
// =============================================================================

/// Hand a memory region to the heap.
///
/// The caller guarantees `[base, base + size)` is mapped, writable, and
/// owned by the heap for the rest of the process lifetime. The region is
/// trimmed to header-granule boundaries and becomes a single free block.
/// Calling this again discards all bookkeeping for the previous region
/// (soft-reboot path); live allocations from it must no longer be touched.
pub fn kheap_initialize(base: VirtAddr, size: usize) {
    let aligned_base = align_up_usize(base.as_u64() as usize, HEADER_SIZE);
    let slack = aligned_base - base.as_u64() as usize;
    let total = align_down_usize(size.saturating_sub(slack), HEADER_SIZE);

    let mut heap = KERNEL_HEAP.lock();

    if total < 2 * HEADER_SIZE {
        klog_info!("kheap: region too small ({} bytes), not initialized", size);
        heap.initialized = false;
        return;
    }

    let first = aligned_base as *mut BlockHeader;
    // SAFETY: the caller guarantees the region is mapped and exclusively ours.
    unsafe {
        (*first).size = total - HEADER_SIZE;
        (*first).used = false;
        (*first).next = ptr::null_mut();
        (*first).prev = ptr::null_mut();
    }

    heap.base = aligned_base as u64;
    heap.total_size = total;
    heap.used_size = 0;
    heap.allocation_count = 0;
    heap.free_count = 0;
    heap.first_block = first;
    heap.initialized = true;

    klog_info!("kheap: {} bytes at 0x{:x}", total, aligned_base);
}

// =============================================================================
// Internal list operations
// =============================================================================

/// Rounded-up payload size for a request. Zero-byte requests occupy one
/// granule, matching the minimum split remainder.
fn request_size(size: usize) -> usize {
    align_up_usize(size.max(1), HEADER_SIZE)
}

fn payload_of(block: *mut BlockHeader) -> *mut u8 {
    unsafe { (block as *mut u8).add(HEADER_SIZE) }
}

fn header_of(payload: *mut u8) -> *mut BlockHeader {
    unsafe { (payload).sub(HEADER_SIZE) as *mut BlockHeader }
}

/// First-fit scan for a free block with at least `needed` payload bytes.
fn find_free_block(heap: &KernelHeap, needed: usize) -> *mut BlockHeader {
    let mut block = heap.first_block;
    while !block.is_null() {
        unsafe {
            if !(*block).used && (*block).size >= needed {
                return block;
            }
            block = (*block).next;
        }
    }
    ptr::null_mut()
}

/// Carve `needed` bytes off the front of a free block, leaving the remainder
/// as a new free successor when it can hold a header plus one granule.
fn split_block(block: *mut BlockHeader, needed: usize) {
    unsafe {
        let excess = (*block).size - needed;
        if excess < HEADER_SIZE + HEADER_SIZE {
            return;
        }

        let remainder = payload_of(block).add(needed) as *mut BlockHeader;
        (*remainder).size = excess - HEADER_SIZE;
        (*remainder).used = false;
        (*remainder).next = (*block).next;
        (*remainder).prev = block;

        if !(*block).next.is_null() {
            (*(*block).next).prev = remainder;
        }
        (*block).next = remainder;
        (*block).size = needed;
    }
}

/// Walk the list once and merge every adjacent free pair. After this returns
/// no two consecutive blocks are both free.
fn merge_blocks(heap: &mut KernelHeap) {
    let mut block = heap.first_block;
    while !block.is_null() {
        unsafe {
            let next = (*block).next;
            if !next.is_null() && !(*block).used && !(*next).used {
                (*block).size += HEADER_SIZE + (*next).size;
                (*block).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).prev = block;
                }
                // Re-test the same block against its new successor.
                continue;
            }
            block = next;
        }
    }
}

/// Grow the region through the expand hook. Returns `true` if new space was
/// appended.
fn try_expand(heap: &mut KernelHeap, min_size: usize) -> bool {
    let Some(hook) = load_expand_hook() else {
        return false;
    };

    let granted = align_down_usize(hook(min_size), HEADER_SIZE);
    if granted < 2 * HEADER_SIZE {
        return false;
    }

    let new_block = (heap.base as usize + heap.total_size) as *mut BlockHeader;

    // Find the current tail to link the new block after it.
    let mut tail = heap.first_block;
    unsafe {
        while !(*tail).next.is_null() {
            tail = (*tail).next;
        }
        (*new_block).size = granted - HEADER_SIZE;
        (*new_block).used = false;
        (*new_block).next = ptr::null_mut();
        (*new_block).prev = tail;
        (*tail).next = new_block;
    }

    heap.total_size += granted;
    klog_debug!("kheap: expanded by {} bytes", granted);
    merge_blocks(heap);
    true
}

fn alloc_locked(heap: &mut KernelHeap, size: usize) -> *mut c_void {
    let needed = request_size(size);

    let mut block = find_free_block(heap, needed);
    if block.is_null() {
        if !try_expand(heap, needed + HEADER_SIZE) {
            return ptr::null_mut();
        }
        block = find_free_block(heap, needed);
        if block.is_null() {
            return ptr::null_mut();
        }
    }

    split_block(block, needed);
    unsafe {
        (*block).used = true;
        heap.used_size += (*block).size + HEADER_SIZE;
    }
    heap.allocation_count += 1;

    payload_of(block) as *mut c_void
}

/// Validate that `payload` points at the payload of a used block in the
/// current region. Returns the header, or null for foreign pointers and
/// double frees.
fn checked_header(heap: &KernelHeap, payload: *mut u8) -> *mut BlockHeader {
    let addr = payload as usize;
    let base = heap.base as usize;
    let end = base + heap.total_size;

    if addr < base + HEADER_SIZE || addr >= end {
        return ptr::null_mut();
    }
    if (addr - base) % HEADER_SIZE != 0 {
        return ptr::null_mut();
    }

    let header = header_of(payload);
    unsafe {
        if !(*header).used {
            return ptr::null_mut();
        }
    }
    header
}

fn free_locked(heap: &mut KernelHeap, payload: *mut u8) -> bool {
    let header = checked_header(heap, payload);
    if header.is_null() {
        return false;
    }

    unsafe {
        heap.used_size -= (*header).size + HEADER_SIZE;
        (*header).used = false;
    }
    heap.free_count += 1;
    merge_blocks(heap);
    true
}

// =============================================================================
// Public allocation API
// =============================================================================

/// Allocate `size` bytes. Null on failure; never panics.
pub fn kmalloc(size: usize) -> *mut c_void {
    let mut heap = KERNEL_HEAP.lock();
    if !heap.initialized {
        klog_info!("kmalloc: heap not initialized");
        return ptr::null_mut();
    }
    alloc_locked(&mut heap, size)
}

/// Allocate `size` bytes zeroed.
pub fn kzalloc(size: usize) -> *mut c_void {
    let out = kmalloc(size);
    if !out.is_null() {
        // SAFETY: kmalloc returned a live payload of at least `size` bytes.
        unsafe { ptr::write_bytes(out as *mut u8, 0, size) };
    }
    out
}

/// Allocate `size` bytes whose address is a multiple of `align`.
///
/// `align` must be a power of two; 0 is coerced to 1. Works by requesting
/// `size + align + HEADER_SIZE` from the ordinary path, re-headering the
/// block just below the aligned address, and giving the prefix gap back to
/// the free list.
pub fn kmalloc_aligned(size: usize, align: usize) -> *mut c_void {
    let align = align.max(1);
    if !align.is_power_of_two() {
        klog_debug!("kmalloc_aligned: bad alignment {}", align);
        return ptr::null_mut();
    }
    // Granule alignment already satisfies anything up to the header size.
    if align <= HEADER_SIZE {
        return kmalloc(size);
    }

    let mut heap = KERNEL_HEAP.lock();
    if !heap.initialized {
        klog_info!("kmalloc_aligned: heap not initialized");
        return ptr::null_mut();
    }

    let raw = alloc_locked(&mut heap, size.saturating_add(align).saturating_add(HEADER_SIZE));
    if raw.is_null() {
        return ptr::null_mut();
    }

    let payload = raw as usize;
    let mut aligned = align_up_usize(payload, align);
    // The gap, when present, must be able to host a free block of its own.
    if aligned != payload && aligned - payload < 2 * HEADER_SIZE {
        aligned += align;
    }
    if aligned == payload {
        return raw;
    }

    let orig = header_of(raw as *mut u8);
    let gap = aligned - payload;
    unsafe {
        let orig_size = (*orig).size;
        let carved = (aligned - HEADER_SIZE) as *mut BlockHeader;

        (*carved).size = orig_size - gap;
        (*carved).used = true;
        (*carved).next = (*orig).next;
        (*carved).prev = orig;
        if !(*orig).next.is_null() {
            (*(*orig).next).prev = carved;
        }

        (*orig).next = carved;
        (*orig).size = gap - HEADER_SIZE;
        (*orig).used = false;
    }
    heap.used_size -= gap;
    merge_blocks(&mut heap);

    aligned as *mut c_void
}

/// Resize an allocation.
///
/// Null behaves as [`kmalloc`], size 0 frees and returns null, a block that
/// already fits is returned unchanged, otherwise the contents move to a
/// fresh block and the old one is freed.
pub fn krealloc(old: *mut c_void, new_size: usize) -> *mut c_void {
    if old.is_null() {
        return kmalloc(new_size);
    }
    if new_size == 0 {
        kfree(old);
        return ptr::null_mut();
    }

    let mut heap = KERNEL_HEAP.lock();
    if !heap.initialized {
        return ptr::null_mut();
    }

    let header = checked_header(&heap, old as *mut u8);
    if header.is_null() {
        klog_info!("krealloc: invalid block 0x{:x}", old as usize);
        return ptr::null_mut();
    }

    let old_size = unsafe { (*header).size };
    if old_size >= new_size {
        return old;
    }

    let fresh = alloc_locked(&mut heap, new_size);
    if fresh.is_null() {
        return ptr::null_mut();
    }

    // SAFETY: both blocks are live and at least `old_size` bytes long.
    unsafe {
        ptr::copy_nonoverlapping(old as *const u8, fresh as *mut u8, old_size);
    }
    free_locked(&mut heap, old as *mut u8);

    fresh
}

/// Release an allocation. Null is a no-op; pointers the heap does not own
/// (or already-freed blocks) are rejected with a log line.
pub fn kfree(ptr_in: *mut c_void) {
    if ptr_in.is_null() {
        return;
    }

    let mut heap = KERNEL_HEAP.lock();
    if !heap.initialized {
        return;
    }

    if !free_locked(&mut heap, ptr_in as *mut u8) {
        klog_info!("kfree: invalid block or double free at 0x{:x}", ptr_in as usize);
    }
}

// =============================================================================
// Statistics & diagnostics
// =============================================================================

/// Snapshot the heap counters.
pub fn get_heap_stats() -> HeapStats {
    let heap = KERNEL_HEAP.lock();
    HeapStats {
        total_size: heap.total_size,
        used_size: heap.used_size,
        free_size: heap.total_size - heap.used_size,
        allocation_count: heap.allocation_count,
        free_count: heap.free_count,
    }
}

/// Count used and free blocks in the list.
pub fn heap_block_counts() -> (u32, u32) {
    let heap = KERNEL_HEAP.lock();
    let mut used = 0u32;
    let mut free = 0u32;
    let mut block = heap.first_block;
    while !block.is_null() {
        unsafe {
            if (*block).used {
                used += 1;
            } else {
                free += 1;
            }
            block = (*block).next;
        }
    }
    (used, free)
}

/// Count adjacent pairs of free blocks. Zero whenever the coalescing
/// invariant holds.
pub fn heap_adjacent_free_pairs() -> u32 {
    let heap = KERNEL_HEAP.lock();
    let mut pairs = 0u32;
    let mut block = heap.first_block;
    while !block.is_null() {
        unsafe {
            let next = (*block).next;
            if !next.is_null() && !(*block).used && !(*next).used {
                pairs += 1;
            }
            block = next;
        }
    }
    pairs
}

/// Payload size of the largest free block.
pub fn heap_largest_free_block() -> usize {
    let heap = KERNEL_HEAP.lock();
    let mut largest = 0usize;
    let mut block = heap.first_block;
    while !block.is_null() {
        unsafe {
            if !(*block).used && (*block).size > largest {
                largest = (*block).size;
            }
            block = (*block).next;
        }
    }
    largest
}

/// Dump the counters to the kernel log.
pub fn print_heap_stats() {
    let stats = get_heap_stats();
    klog_info!("=== Kernel Heap ===");
    klog_info!("total: {} bytes", stats.total_size);
    klog_info!("used:  {} bytes", stats.used_size);
    klog_info!("free:  {} bytes", stats.free_size);
    klog_info!("allocs: {}  frees: {}", stats.allocation_count, stats.free_count);
}
