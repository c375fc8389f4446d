//! The allocator itself. [`InternalAllocator`] owns the region list and
//! implements the public operations single-threadedly; [`TagAlloc`] wraps it
//! in a [`Mutex`] and exposes the public API, including
//! [`std::alloc::GlobalAlloc`].
//!
//! Allocation: pick the large or small path by size, first-fit over the
//! region free lists, split the found block if the remainder is worth
//! keeping, mark it used. Release: merge with free neighbors immediately,
//! reinsert at the head of the free list, and unmap the whole region when
//! its last used block is gone.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    block::{align_up, Block, ALIGNMENT, MIN_BLOCK_SIZE, TAG_OVERHEAD},
    config::Config,
    counters::Counters,
    freelist, large, platform,
    region::{self, Region},
    Pointer,
};

/// Total block size needed to serve a `size` byte request: room for both
/// tags, rounded up to the block granularity, never below the minimum block.
pub(crate) fn effective_size(size: usize) -> usize {
    MIN_BLOCK_SIZE.max(align_up(size + TAG_OVERHEAD))
}

/// Single threaded allocator core. All state of the process-wide allocator
/// lives here: the region list, the configuration and the counters. Every
/// method takes `&mut self`; thread safety is [`TagAlloc`]'s business.
pub(crate) struct InternalAllocator {
    /// Head of the global region list, always the most recently mapped
    /// region. `None` until the first small allocation, and again whenever
    /// every region has been reclaimed.
    root: Pointer<Region>,
    /// Tuning knobs, frozen at first use.
    config: Config,
    /// Observability counters.
    counters: Counters,
    /// Whether `config` has been loaded yet. The environment is read lazily
    /// so that a `TagAlloc` in static storage doesn't need any code to run
    /// at program startup.
    initialized: bool,
}

// The region pointers are plain addresses of memory owned exclusively by
// this struct, so moving it across threads is fine.
unsafe impl Send for InternalAllocator {}

impl InternalAllocator {
    pub const fn new() -> Self {
        Self {
            root: None,
            config: Config::DEFAULT,
            counters: Counters::ZERO,
            initialized: false,
        }
    }

    pub fn with_config(config: Config) -> Self {
        config.validate();
        Self {
            config,
            initialized: true,
            ..Self::new()
        }
    }

    /// Loads the configuration from the environment on the first call and
    /// never again.
    fn ensure_init(&mut self) {
        if !self.initialized {
            self.config = Config::from_env();
            self.initialized = true;
        }
    }

    pub fn config(&mut self) -> Config {
        self.ensure_init();
        self.config
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// First fit: walk the regions from the most recent one, and inside each
    /// region walk its free list, returning the first block big enough for
    /// `size` total bytes.
    unsafe fn find_fit(&mut self, size: usize) -> Option<Block> {
        let mut current = self.root;

        while let Some(region) = current {
            if region.as_ref().n_free >= 1 {
                self.counters.check_amount += 1;

                let mut candidate = region.as_ref().block_list;
                while let Some(block) = candidate {
                    self.counters.blocks_checked += 1;
                    if block.size() >= size {
                        return Some(block);
                    }
                    candidate = block.next_free();
                }
            }

            current = region.as_ref().next;
        }

        None
    }

    /// Maps one more region and prepends it to the region list.
    unsafe fn grow_heap(&mut self) -> Pointer<Region> {
        let mut region = region::create(self.config.region_size)?;

        region.as_mut().next = self.root;
        if let Some(mut head) = self.root {
            head.as_mut().prev = Some(region);
        }
        self.root = Some(region);

        self.counters.region_allocs += 1;
        self.counters.bytes_unused += region::capacity(self.config.region_size) as u64;
        self.counters.note_utilization();

        Some(region)
    }

    /// Unlinks an empty region from the region list and unmaps it.
    unsafe fn reclaim(&mut self, region: NonNull<Region>) {
        debug_assert_eq!(region.as_ref().n_used, 0);

        // Fully coalesced, the region is back to one maximal free block.
        debug_assert_eq!(
            region.as_ref().start.next().size(),
            region::capacity(self.config.region_size)
        );
        self.counters.bytes_unused -= region::capacity(self.config.region_size) as u64;

        let prev = region.as_ref().prev;
        let next = region.as_ref().next;
        if let Some(mut prev) = prev {
            prev.as_mut().next = next;
        }
        if let Some(mut next) = next {
            next.as_mut().prev = prev;
        }
        if self.root == Some(region) {
            self.root = next;
        }

        region::destroy(region, self.config.region_size);
        self.counters.region_frees += 1;
    }

    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        self.ensure_init();

        if size == 0 {
            return None;
        }

        if size > self.config.max_block_size {
            return self.allocate_large(size);
        }

        let size = effective_size(size);

        let block = match self.find_fit(size) {
            Some(block) => block,
            // No region can serve this. Map a fresh one and retry once; its
            // initial free block is guaranteed to fit anything up to
            // `max_block_size`, but the OS may refuse the mapping.
            None => {
                self.grow_heap()?;
                self.find_fit(size)?
            }
        };

        let mut region = block.region_of(self.config.region_size);

        match freelist::split(block, size, &self.config) {
            Some(rest) => region.as_mut().replace(block, rest),
            None => region.as_mut().unlink(block),
        }

        block.mark_used();
        region.as_mut().n_used += 1;

        if self.config.scribble_char != 0 {
            block.scribble(self.config.scribble_char);
        }

        self.counters.total_allocs += 1;
        self.counters.bytes_used += block.size() as u64;
        self.counters.bytes_unused -= block.size() as u64;
        self.counters.note_utilization();

        debug_assert_eq!(
            region.as_ref().n_free as usize,
            region.as_ref().free_list_len()
        );

        Some(block.payload())
    }

    unsafe fn allocate_large(&mut self, size: usize) -> Pointer<u8> {
        let block = large::acquire(size)?;

        if self.config.scribble_char != 0 {
            block.scribble(self.config.scribble_char);
        }

        self.counters.large_block_allocs += 1;

        Some(block.payload())
    }

    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        self.ensure_init();

        let block = Block::from_payload(ptr);

        if block.is_large() {
            self.counters.large_block_frees += 1;
            large::release(block);
            return;
        }

        assert!(block.is_used(), "released a block that is not in use");

        let size = block.size() as u64;
        self.counters.bytes_used -= size;
        self.counters.bytes_unused += size;
        self.counters.note_utilization();
        self.counters.total_frees += 1;

        block.mark_free();
        block.clear_free_links();

        let mut region = block.region_of(self.config.region_size);
        region.as_mut().n_used -= 1;

        let merged = freelist::coalesce(block, self.config.region_size);
        region.as_mut().push_front(merged);

        debug_assert_eq!(
            region.as_ref().n_free as usize,
            region.as_ref().free_list_len()
        );

        if region.as_ref().n_used == 0 {
            self.reclaim(region);
        }
    }

    pub unsafe fn allocate_zeroed(&mut self, nmemb: usize, size: usize) -> Pointer<u8> {
        if nmemb == 0 || size == 0 {
            return None;
        }

        let total = nmemb.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        ptr::write_bytes(ptr.as_ptr(), 0, total);

        Some(ptr)
    }

    pub unsafe fn resize(&mut self, ptr: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(ptr) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            self.release(ptr);
            return None;
        }

        self.ensure_init();

        let block = Block::from_payload(ptr);

        // Usable window: total size minus one 16 byte chunk of bookkeeping.
        // For large blocks that's exactly the prelude; for small blocks it
        // leaves a little slack on top of the two tag words.
        let usable = block.size().saturating_sub(16);

        // A large block whose contents now comfortably fit a region block is
        // worth moving; a small block is never shrunk in place.
        let back_to_small =
            block.is_large() && size.saturating_add(32) < self.config.max_block_size;

        if usable > size && !back_to_small {
            return Some(ptr);
        }

        // Copy whatever the old payload can actually hold, which is never
        // less than what the caller originally requested.
        let preserved = block.payload_size().min(size);

        let new_ptr = self.allocate(size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), preserved);
        self.release(ptr);

        Some(new_ptr)
    }

    pub unsafe fn resize_array(
        &mut self,
        ptr: Pointer<u8>,
        nmemb: usize,
        size: usize,
    ) -> Pointer<u8> {
        let Some(total) = nmemb.checked_mul(size) else {
            // reallocarray semantics: report out of memory and leave the
            // original allocation untouched.
            platform::set_oom_errno();
            return None;
        };

        self.resize(ptr, total)
    }
}

/// Public interface. A [`TagAlloc`] is an independent allocator instance; it
/// can be used directly through the inherent methods or installed as the
/// program's `#[global_allocator]`:
///
/// ```no_run
/// use tagalloc::TagAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: TagAlloc = TagAlloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
///
/// The malloc style operations are available on any instance:
///
/// ```rust
/// use tagalloc::TagAlloc;
///
/// let allocator = TagAlloc::new();
///
/// let ptr = allocator.allocate(64).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 16, 0);
/// unsafe {
///     ptr.as_ptr().write_bytes(0xff, 64);
///     allocator.release(Some(ptr));
/// }
/// ```
pub struct TagAlloc {
    inner: Mutex<InternalAllocator>,
}

impl TagAlloc {
    /// Builds an allocator whose configuration is read from the `TAGALLOC_*`
    /// environment variables the first time it is used.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(InternalAllocator::new()),
        }
    }

    /// Builds an allocator with an explicit configuration, ignoring the
    /// environment.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is structurally invalid, see [`Config`].
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Mutex::new(InternalAllocator::with_config(config)),
        }
    }

    /// Allocates `size` bytes and returns a 16-byte aligned pointer to them,
    /// or `None` when `size` is zero or the OS refuses memory.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        unsafe { inner.allocate(size) }
    }

    /// Releases an allocation. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and must not have been
    /// released already.
    pub unsafe fn release(&self, ptr: Option<NonNull<u8>>) {
        let (Ok(mut inner), Some(ptr)) = (self.inner.lock(), ptr) else {
            return;
        };
        inner.release(ptr);
    }

    /// Allocates a zero-filled array of `nmemb` elements of `size` bytes
    /// each. Either operand being zero yields `None`.
    pub fn allocate_zeroed(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        unsafe { inner.allocate_zeroed(nmemb, size) }
    }

    /// Resizes an allocation, `realloc` style: `None` as the pointer
    /// allocates, size zero releases, otherwise the contents move to a block
    /// that fits `size` bytes unless the current one already does. On
    /// failure the original allocation is left untouched and `None` is
    /// returned.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must have come from this allocator and must not have
    /// been released.
    pub unsafe fn resize(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        inner.resize(ptr, size)
    }

    /// Like [`Self::resize`] with a size of `nmemb * size`, except the
    /// multiplication is overflow checked: on overflow the original
    /// allocation is untouched, the platform's out-of-memory error code is
    /// set and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::resize`].
    pub unsafe fn resize_array(
        &self,
        ptr: Option<NonNull<u8>>,
        nmemb: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        inner.resize_array(ptr, nmemb, size)
    }

    /// Snapshot of the allocation counters.
    pub fn counters(&self) -> Counters {
        self.inner
            .lock()
            .map(|inner| inner.counters())
            .unwrap_or_default()
    }

    /// The configuration this allocator runs with. Reads the environment if
    /// no operation has triggered that yet.
    pub fn config(&self) -> Config {
        self.inner
            .lock()
            .map(|mut inner| inner.config())
            .unwrap_or_default()
    }
}

impl Default for TagAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TagAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads are 16 byte aligned by construction, stricter alignments
        // are not supported.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(NonNull::new(ptr));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate_zeroed(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.resize(NonNull::new(ptr), new_size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::check_consistency;

    fn allocator() -> InternalAllocator {
        InternalAllocator::with_config(Config::default())
    }

    unsafe fn assert_heap_empty(allocator: &InternalAllocator) {
        assert!(allocator.root.is_none());
        let counters = allocator.counters();
        assert_eq!(counters.region_allocs, counters.region_frees);
        assert_eq!(counters.total_allocs, counters.total_frees);
        assert_eq!(counters.bytes_used, 0);
        assert_eq!(counters.bytes_unused, 0);
    }

    #[test]
    fn allocate_then_release_returns_the_heap() {
        unsafe {
            let mut allocator = allocator();

            let first = allocator.allocate(24).unwrap();
            let second = allocator.allocate(40).unwrap();

            assert_eq!(allocator.counters().region_allocs, 1);

            allocator.release(first);
            allocator.release(second);

            assert_heap_empty(&allocator);
            assert_eq!(allocator.counters().region_frees, 1);
        }
    }

    #[test]
    fn zero_size_allocation_fails() {
        unsafe {
            let mut allocator = allocator();
            assert!(allocator.allocate(0).is_none());
            assert_eq!(allocator.counters().total_allocs, 0);
        }
    }

    #[test]
    fn payloads_are_16_byte_aligned() {
        unsafe {
            let mut allocator = allocator();
            let mut live = Vec::new();

            for size in [1, 8, 24, 100, 1000, 2048, 10_000] {
                let ptr = allocator.allocate(size).unwrap();
                assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
                live.push(ptr);
            }

            for ptr in live {
                allocator.release(ptr);
            }
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn large_path_boundary() {
        unsafe {
            let mut allocator = allocator();
            let threshold = allocator.config().max_block_size;

            let small = allocator.allocate(threshold).unwrap();
            assert_eq!(allocator.counters().large_block_allocs, 0);
            assert_eq!(allocator.counters().total_allocs, 1);

            let large = allocator.allocate(threshold + 1).unwrap();
            assert_eq!(allocator.counters().large_block_allocs, 1);
            assert_eq!(allocator.counters().total_allocs, 1);

            allocator.release(small);
            allocator.release(large);
            assert_eq!(allocator.counters().large_block_frees, 1);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn large_blocks_carry_a_tagged_prelude() {
        unsafe {
            let mut allocator = allocator();

            let ptr = allocator.allocate(10_000).unwrap();
            assert_eq!(allocator.counters().large_block_allocs, 1);

            let block = Block::from_payload(ptr);
            assert!(block.is_large());
            assert!(block.is_used());
            assert_eq!(block.size(), align_up(10_000) + large::PRELUDE_SIZE);

            // Large blocks never touch regions.
            assert!(allocator.root.is_none());

            allocator.release(ptr);
            assert_eq!(allocator.counters().large_block_frees, 1);
        }
    }

    #[test]
    fn exact_fit_does_not_split() {
        unsafe {
            let mut allocator = allocator();
            let region_size = allocator.config().region_size;

            // A request that rounds up to the whole initial free block.
            let size = region::capacity(region_size) - TAG_OVERHEAD;
            assert!(size > allocator.config().max_block_size);

            // Raise the threshold so this still takes the small path.
            let mut allocator = InternalAllocator::with_config(Config {
                max_block_size: size,
                ..Config::default()
            });

            let ptr = allocator.allocate(size).unwrap();
            let region = allocator.root.unwrap();
            assert_eq!(region.as_ref().n_used, 1);
            assert_eq!(region.as_ref().n_free, 0);
            check_consistency(region, region_size);

            allocator.release(ptr);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn coalescing_merges_adjacent_neighbors() {
        unsafe {
            let mut allocator = allocator();
            let region_size = allocator.config().region_size;

            // Fill one region with 32 byte allocations (48 byte blocks).
            let count = region::capacity(region_size) / effective_size(32);
            let mut live: Vec<Option<NonNull<u8>>> = Vec::new();
            for _ in 0..count {
                live.push(Some(allocator.allocate(32).unwrap()));
            }

            let region = allocator.root.unwrap();
            assert_eq!(allocator.counters().region_allocs, 1);
            assert_eq!(region.as_ref().n_used as usize, count);
            assert_eq!(region.as_ref().n_free, 0);

            // Release every other block: no two free neighbors, so no
            // coalescing yet.
            for ptr in live.iter_mut().step_by(2) {
                allocator.release(ptr.take().unwrap());
                check_consistency(region, region_size);
            }
            assert_eq!(region.as_ref().n_free as usize, count.div_ceil(2));

            // Releasing an odd block merges it with both neighbors.
            let n_free = region.as_ref().n_free;
            allocator.release(live[1].take().unwrap());
            check_consistency(region, region_size);
            assert_eq!(region.as_ref().n_free, n_free - 1);

            // The merged block serves a request none of the 48 byte holes
            // could, still within the same region.
            let ptr = allocator.allocate(64).unwrap();
            assert_eq!(allocator.counters().region_allocs, 1);
            let base = region.as_ptr() as usize;
            let addr = ptr.as_ptr() as usize;
            assert!(base < addr && addr < base + region_size);
            check_consistency(region, region_size);

            allocator.release(ptr);
            for ptr in live.into_iter().flatten() {
                allocator.release(ptr);
            }
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn resize_routes_null_and_zero() {
        unsafe {
            let mut allocator = allocator();

            // resize(None, n) behaves like allocate(n).
            let ptr = allocator.resize(None, 32).unwrap();
            assert_eq!(allocator.counters().total_allocs, 1);

            // resize(ptr, 0) behaves like release(ptr).
            assert!(allocator.resize(Some(ptr), 0).is_none());
            assert_eq!(allocator.counters().total_frees, 1);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn resize_in_place_when_the_block_already_fits() {
        unsafe {
            let mut allocator = allocator();

            let ptr = allocator.allocate(100).unwrap();
            let block = Block::from_payload(ptr);
            let usable = block.size() - 16;

            // Shrinking or staying under the usable window moves nothing.
            assert_eq!(allocator.resize(Some(ptr), usable - 1), Some(ptr));
            assert_eq!(allocator.resize(Some(ptr), 10), Some(ptr));
            assert_eq!(allocator.counters().total_allocs, 1);

            allocator.release(ptr);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn resize_moves_and_preserves_contents() {
        unsafe {
            let mut allocator = allocator();

            let ptr = allocator.allocate(100).unwrap();
            for i in 0..100 {
                ptr.as_ptr().add(i).write(i as u8);
            }

            let moved = allocator.resize(Some(ptr), 500).unwrap();
            assert_ne!(moved, ptr);
            for i in 0..100 {
                assert_eq!(moved.as_ptr().add(i).read(), i as u8);
            }
            // The old block was released by the move.
            assert_eq!(allocator.counters().total_frees, 1);

            allocator.release(moved);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn resize_large_block_back_to_small() {
        unsafe {
            let mut allocator = allocator();
            let threshold = allocator.config().max_block_size;

            let ptr = allocator.allocate(threshold * 2).unwrap();
            assert!(Block::from_payload(ptr).is_large());
            ptr.as_ptr().write_bytes(0x7e, 64);

            let moved = allocator.resize(Some(ptr), 64).unwrap();
            assert!(!Block::from_payload(moved).is_large());
            for i in 0..64 {
                assert_eq!(moved.as_ptr().add(i).read(), 0x7e);
            }
            assert_eq!(allocator.counters().large_block_frees, 1);

            allocator.release(moved);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn resize_array_checks_overflow() {
        unsafe {
            let mut allocator = allocator();

            let ptr = allocator.allocate(32).unwrap();
            ptr.as_ptr().write_bytes(0x11, 32);

            #[cfg(all(target_os = "linux", not(miri)))]
            {
                *libc::__errno_location() = 0;
            }

            assert!(allocator
                .resize_array(Some(ptr), usize::MAX, 2)
                .is_none());

            #[cfg(all(target_os = "linux", not(miri)))]
            {
                assert_eq!(*libc::__errno_location(), libc::ENOMEM);
            }

            // The original allocation survived the failure.
            for i in 0..32 {
                assert_eq!(ptr.as_ptr().add(i).read(), 0x11);
            }
            allocator.release(ptr);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn resize_array_delegates_to_resize() {
        unsafe {
            let mut allocator = allocator();

            let ptr = allocator.resize_array(None, 8, 16).unwrap();
            let grown = allocator.resize_array(Some(ptr), 32, 16).unwrap();

            allocator.release(grown);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn allocate_zeroed_zeroes_and_validates() {
        unsafe {
            // Scribble on, so zeroing has something to undo.
            let mut allocator = InternalAllocator::with_config(Config {
                scribble_char: 0xaa,
                ..Config::default()
            });

            assert!(allocator.allocate_zeroed(0, 8).is_none());
            assert!(allocator.allocate_zeroed(8, 0).is_none());
            assert!(allocator.allocate_zeroed(usize::MAX, 2).is_none());

            let ptr = allocator.allocate_zeroed(8, 8).unwrap();
            for i in 0..64 {
                assert_eq!(ptr.as_ptr().add(i).read(), 0);
            }

            allocator.release(ptr);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn scribble_fills_fresh_payloads() {
        unsafe {
            let mut allocator = InternalAllocator::with_config(Config {
                scribble_char: 0xaa,
                ..Config::default()
            });

            let small = allocator.allocate(48).unwrap();
            for i in 0..48 {
                assert_eq!(small.as_ptr().add(i).read(), 0xaa);
            }

            let large = allocator.allocate(5000).unwrap();
            for i in 0..5000 {
                assert_eq!(large.as_ptr().add(i).read(), 0xaa);
            }

            allocator.release(small);
            allocator.release(large);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn repeated_cycles_balance_the_counters() {
        unsafe {
            let mut allocator = allocator();
            let cycles = 50;

            for _ in 0..cycles {
                let ptr = allocator.allocate(16).unwrap();
                allocator.release(ptr);
            }

            let counters = allocator.counters();
            assert_eq!(counters.total_allocs, cycles);
            assert_eq!(counters.total_frees, cycles);
            assert_eq!(counters.bytes_used, 0);
            assert_eq!(counters.bytes_unused, 0);
            // Freeing the only block of a region reclaims it every time.
            assert_eq!(counters.region_allocs, cycles);
            assert_eq!(counters.region_frees, cycles);
            assert!(counters.peak_utilization > 0.0);
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn several_regions_come_and_go() {
        unsafe {
            let mut allocator = allocator();
            let threshold = allocator.config().max_block_size;

            // Each of these nearly fills a region, forcing new mappings.
            let mut live = Vec::new();
            for _ in 0..5 {
                live.push(allocator.allocate(threshold).unwrap());
            }
            assert!(allocator.counters().region_allocs >= 2);

            // Release in an order that isn't the allocation order.
            for index in [3, 0, 4, 2, 1] {
                allocator.release(live[index]);
            }
            assert_heap_empty(&allocator);
        }
    }

    #[test]
    fn facade_locks_and_delegates() {
        unsafe {
            let allocator = TagAlloc::with_config(Config::default());

            let ptr = allocator.allocate(128).unwrap();
            ptr.as_ptr().write_bytes(0x42, 128);

            let grown = allocator.resize(Some(ptr), 256).unwrap();
            assert_eq!(grown.as_ptr().read(), 0x42);

            allocator.release(Some(grown));
            allocator.release(None);

            let counters = allocator.counters();
            assert_eq!(counters.total_allocs, counters.total_frees);
            assert_eq!(counters.region_allocs, counters.region_frees);
        }
    }

    #[test]
    fn global_alloc_respects_alignment_limits() {
        unsafe {
            let allocator = TagAlloc::with_config(Config::default());

            let layout = Layout::from_size_align(64, 32).unwrap();
            assert!(allocator.alloc(layout).is_null());

            let layout = Layout::from_size_align(64, 16).unwrap();
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 16, 0);

            let ptr = allocator.realloc(ptr, layout, 128);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, Layout::from_size_align(128, 16).unwrap());

            let zeroed = allocator.alloc_zeroed(layout);
            assert!(!zeroed.is_null());
            for i in 0..64 {
                assert_eq!(zeroed.add(i).read(), 0);
            }
            allocator.dealloc(zeroed, layout);

            let counters = allocator.counters();
            assert_eq!(counters.region_allocs, counters.region_frees);
        }
    }

    /// All threads hammer one shared facade; the mutex serializes them and
    /// the heap must come back empty.
    #[test]
    fn multiple_threads_share_the_facade() {
        let allocator = TagAlloc::with_config(Config::default());
        let num_threads = 8;

        std::thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let iterations: usize = if cfg!(miri) { 10 } else { 250 };
                    for i in 0..iterations {
                        let size = [16, 256, 1024, 2048, 8192][i % 5];
                        let ptr = allocator.allocate(size).unwrap();

                        let probe = [0, size / 2, size - 1];
                        for (offset, value) in probe.iter().zip([1u8, 5, 10]) {
                            ptr.as_ptr().add(*offset).write(value);
                        }
                        for (offset, value) in probe.iter().zip([1u8, 5, 10]) {
                            assert_eq!(ptr.as_ptr().add(*offset).read(), value);
                        }

                        allocator.release(Some(ptr));
                    }
                });
            }
        });

        let counters = allocator.counters();
        assert_eq!(counters.total_allocs, counters.total_frees);
        assert_eq!(counters.large_block_allocs, counters.large_block_frees);
        assert_eq!(counters.region_allocs, counters.region_frees);
        assert_eq!(counters.bytes_used, 0);
    }

    #[test]
    fn search_counters_move() {
        unsafe {
            let mut allocator = allocator();

            let first = allocator.allocate(64).unwrap();
            let checked_after_first = allocator.counters().blocks_checked;
            assert!(allocator.counters().check_amount >= 1);
            assert!(checked_after_first >= 1);

            let second = allocator.allocate(64).unwrap();
            assert!(allocator.counters().blocks_checked > checked_after_first);

            allocator.release(first);
            allocator.release(second);
            assert_heap_empty(&allocator);
        }
    }
}
