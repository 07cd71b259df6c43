//! Binary-buddy allocation.
//!
//! A [`BuddyPool`] manages a single arena of `min_unit_size << max_level`
//! bytes. Requests are rounded up to the next power-of-two multiple of the
//! minimum unit and served from a block of exactly that size, which is split
//! off a larger idle block if none is free. When both halves of a split block
//! become idle again they are merged back into their parent immediately.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! Let `L` be `max_level`.
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(L)      | O(2^L)     |
//! | Deallocate               | O(1)      | O(L)       |
//!
//! Allocation is a depth-first search of the block tree; subtrees that are
//! fully allocated or too small are pruned, but a badly fragmented arena may
//! require visiting most of the tree.
//!
//! #### Fragmentation
//!
//! Because every block is a power of two, a request just above a power of two
//! wastes nearly half of its block to internal fragmentation. External
//! fragmentation occurs when enough bytes are idle but not as one aligned
//! block of the required size; buddy coalescing recovers only what becomes
//! contiguous again.

use alloc::vec::Vec;
use core::{alloc::Layout, fmt, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
    base::BasePtr,
    tree::{self, BlockInfo, BlockTree},
    AllocError, AllocInitError, BackingAllocator, DeallocError, Global, Raw,
};

/// Configuration of a [`BuddyPool`].
///
/// The arena size is always `min_unit_size << max_level`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BuddyConfig {
    min_unit_size: usize,
    max_level: u32,
}

impl BuddyConfig {
    /// Creates a configuration with blocks of `min_unit_size` bytes at level 0
    /// and a single block of `min_unit_size << max_level` bytes at the top.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if any of the following are
    /// true:
    /// - `min_unit_size` is not a power of two.
    /// - The arena size overflows a `usize`.
    /// - The arena or the block tree cannot be described by a [`Layout`].
    pub fn new(min_unit_size: usize, max_level: u32) -> Result<BuddyConfig, AllocInitError> {
        let config = BuddyConfig {
            min_unit_size,
            max_level,
        };
        config.validate()?;

        Ok(config)
    }

    /// Creates a configuration for an arena of `arena_size` bytes divided down
    /// to units of `min_unit_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `arena_size` is not a
    /// power-of-two multiple of `min_unit_size`, or under the conditions
    /// listed for [`BuddyConfig::new`].
    pub fn with_arena_size(
        arena_size: usize,
        min_unit_size: usize,
    ) -> Result<BuddyConfig, AllocInitError> {
        if min_unit_size == 0 || arena_size % min_unit_size != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let units = arena_size / min_unit_size;
        if !units.is_power_of_two() {
            return Err(AllocInitError::InvalidConfig);
        }

        Self::new(min_unit_size, units.trailing_zeros())
    }

    /// Checks that this configuration describes a representable pool.
    ///
    /// # Errors
    ///
    /// See [`BuddyConfig::new`].
    pub fn validate(&self) -> Result<(), AllocInitError> {
        if !self.min_unit_size.is_power_of_two() {
            return Err(AllocInitError::InvalidConfig);
        }

        // Shifting must not discard any bits of the unit size.
        if self.max_level >= self.min_unit_size.leading_zeros() {
            return Err(AllocInitError::InvalidConfig);
        }

        BlockTree::metadata_layout(self.max_level)?;
        self.region_layout()?;

        Ok(())
    }

    /// Returns the size in bytes of the smallest allocatable block.
    #[inline]
    pub fn min_unit_size(&self) -> usize {
        self.min_unit_size
    }

    /// Returns the level of the root block.
    #[inline]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Returns the total number of bytes managed by the pool.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.min_unit_size << self.max_level
    }

    /// Returns the number of nodes in the block tree.
    ///
    /// # Panics
    ///
    /// Panics if the configuration has not been validated and the count
    /// overflows.
    pub fn node_count(&self) -> usize {
        tree::node_count(self.max_level).expect("block tree size overflows usize")
    }

    /// Returns the layout requirements of the region managed by a pool with
    /// this configuration.
    ///
    /// The region is aligned to the minimum unit size, so every block is too.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the arena cannot be described by a [`Layout`].
    pub fn region_layout(&self) -> Result<Layout, AllocInitError> {
        Layout::from_size_align(self.arena_size(), self.min_unit_size)
            .map_err(|_| AllocInitError::InvalidConfig)
    }
}

impl Default for BuddyConfig {
    /// A 1 KiB arena with a minimum unit of one byte.
    fn default() -> Self {
        BuddyConfig {
            min_unit_size: 1,
            max_level: 10,
        }
    }
}

/// Counters describing the activity of a [`BuddyPool`].
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct BuddyStats {
    /// Number of successful allocations.
    pub allocations: u64,
    /// Number of successful deallocations.
    pub deallocations: u64,
    /// Number of allocation requests that could not be satisfied.
    pub failed_allocations: u64,
    /// Number of deallocation requests that were rejected.
    pub rejected_deallocations: u64,
    /// Number of times a block was split into two buddies.
    pub splits: u64,
    /// Number of times two buddies were merged into their parent.
    pub merges: u64,
    /// Bytes currently allocated, counted in whole blocks.
    pub allocated_bytes: usize,
    /// Highest value `allocated_bytes` has reached.
    pub peak_allocated_bytes: usize,
}

/// A binary-buddy allocator over a single arena.
///
/// For a discussion of buddy allocation, see the [module-level documentation].
///
/// [module-level documentation]: crate::buddy
pub struct BuddyPool<A: BackingAllocator> {
    base: BasePtr,
    config: BuddyConfig,
    tree: BlockTree,
    /// Level of the live allocation starting at each unit, if any.
    leases: Vec<Option<u8>>,
    stats: BuddyStats,
    backing_allocator: A,
}

// SAFETY: the pool uniquely owns its region and metadata, and every mutation
// goes through `&mut self`.
unsafe impl<A: BackingAllocator + Send> Send for BuddyPool<A> {}

impl BuddyPool<Raw> {
    /// Constructs a new `BuddyPool` from a raw pointer.
    ///
    /// The block tree is still allocated from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, if the region would
    /// not fit between `region` and the end of the address space, or if the
    /// pool metadata could not be allocated.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`config.region_layout()`], and it must be valid for reads
    /// and writes for the entire size indicated by that `Layout`.
    ///
    /// [`config.region_layout()`]: BuddyConfig::region_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        config: BuddyConfig,
    ) -> Result<BuddyPool<Raw>, AllocInitError> {
        unsafe { RawBuddyPool::try_new(region, config).map(|p| p.with_backing_allocator(Raw)) }
    }

    /// Decomposes the pool, returning the region it was constructed with.
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// the returned pointer becomes the sole owner of the region.
    pub fn into_raw_parts(self) -> NonNull<u8> {
        self.base.ptr()
    }
}

impl BuddyPool<Global> {
    /// Attempts to construct a new `BuddyPool` backed by the global allocator.
    ///
    /// The arena is allocated first, then the block tree. If either allocation
    /// fails, everything acquired so far is released.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or if sufficient
    /// memory could not be allocated from the global allocator.
    pub fn try_new(config: BuddyConfig) -> Result<BuddyPool<Global>, AllocInitError> {
        config.validate()?;
        let region_layout = config.region_layout()?;

        unsafe {
            // SAFETY: the arena holds at least one unit, so its size is nonzero.
            let region_ptr = Global::allocate(region_layout)?;

            match RawBuddyPool::try_new(region_ptr, config) {
                Ok(p) => Ok(p.with_backing_allocator(Global)),
                Err(e) => {
                    Global.deallocate(region_ptr, region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> BuddyPool<A> {
    /// Returns the configuration of this pool.
    #[inline]
    pub fn config(&self) -> &BuddyConfig {
        &self.config
    }

    /// Returns the total number of bytes managed by this pool.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.config.arena_size()
    }

    /// Returns `true` if `ptr` points into the arena.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }

    /// Returns the activity counters of this pool.
    pub fn stats(&self) -> BuddyStats {
        BuddyStats {
            splits: self.tree.splits(),
            merges: self.tree.merges(),
            ..self.stats
        }
    }

    /// Returns the number of allocations that have not been freed.
    #[inline]
    pub fn live_allocations(&self) -> u64 {
        self.stats.allocations - self.stats.deallocations
    }

    /// Returns the number of bytes held by live allocations, counted in whole
    /// blocks.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.stats.allocated_bytes
    }

    /// Returns the total size of all idle blocks.
    pub fn idle_bytes(&self) -> usize {
        self.tree.idle_bytes()
    }

    /// Returns the size of the largest block that can currently be allocated.
    pub fn largest_idle_block(&self) -> usize {
        self.tree.largest_idle_block()
    }

    /// Returns a snapshot of the block tree node at `index`, or `None` if the
    /// index is out of bounds.
    ///
    /// Node 0 is the root; the children of node `i` are `2i + 1` and `2i + 2`.
    pub fn block(&self, index: usize) -> Option<BlockInfo> {
        self.tree.block(index)
    }

    /// Panics if the block tree or the byte accounting is inconsistent.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        self.tree.assert_consistent();
        assert_eq!(self.stats.allocated_bytes, self.tree.allocated_bytes());

        let leased = self.leases.iter().filter(|l| l.is_some()).count() as u64;
        assert_eq!(leased, self.live_allocations());
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a pointer to the whole block, whose length is
    /// `size` rounded up to a power-of-two multiple of the minimum unit. The
    /// block is aligned to the minimum unit size.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, if `size` is larger than the arena, or
    /// if no idle block is large enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 || size > self.config.arena_size() {
            trace!("rejecting allocation of {size} bytes");
            self.stats.failed_allocations += 1;
            return Err(AllocError);
        }

        let target = tree::level_for(size, self.config.min_unit_size());

        let Some(index) = self.tree.allocate(target) else {
            trace!("no idle block at level {target} for {size} bytes");
            self.stats.failed_allocations += 1;
            return Err(AllocError);
        };

        let offset = self.tree.offset_of(index, target);
        let block_size = self.config.min_unit_size() << target;
        let unit = offset / self.config.min_unit_size();
        debug_assert!(self.leases[unit].is_none());

        // `target` never exceeds `max_level`, which is below `usize::BITS`.
        self.leases[unit] = Some(target as u8);

        self.stats.allocations += 1;
        self.stats.allocated_bytes += block_size;
        self.stats.peak_allocated_bytes = self
            .stats
            .peak_allocated_bytes
            .max(self.stats.allocated_bytes);

        trace!("allocated {block_size} bytes at offset {offset:#x} for {size} bytes");

        let addr = self.base.addr_at(offset);
        Ok(self.base.with_addr_and_size(addr, block_size))
    }

    /// Deallocates the block beginning at `ptr`.
    ///
    /// Idle buddies along the block's path to the root are merged.
    ///
    /// # Errors
    ///
    /// Returns `Err` without modifying the pool if `ptr` is outside the arena
    /// or is not the start of a live allocation from this pool.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        let result = self.release(ptr);

        if let Err(e) = result {
            warn!("rejected deallocation of {ptr:p}: {e}");
            self.stats.rejected_deallocations += 1;
        }

        result
    }

    fn release(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        let offset = self
            .base
            .offset_of(ptr.addr())
            .ok_or(DeallocError::OutOfRange)?;

        let min_unit_size = self.config.min_unit_size();
        if offset % min_unit_size != 0 {
            return Err(DeallocError::NotAllocated);
        }

        let level = self.leases[offset / min_unit_size]
            .take()
            .ok_or(DeallocError::NotAllocated)?;

        let index = self.tree.index_of(offset, level.into());
        let size = min_unit_size << level;

        trace!("freeing {size} bytes at offset {offset:#x}");
        self.tree.release(index);

        self.stats.deallocations += 1;
        self.stats.allocated_bytes -= size;

        Ok(())
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyPool")
            .field("base", &self.base.ptr())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<A: BackingAllocator> Drop for BuddyPool<A> {
    fn drop(&mut self) {
        debug!(
            "destroying buddy pool at {:p} with {} live allocations",
            self.base.ptr(),
            self.live_allocations()
        );

        // Safe unwrap: this layout was checked when the pool was constructed.
        let region_layout = self.config.region_layout().unwrap();

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout)
        };
    }
}

/// Like a `BuddyPool`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `BuddyPool` itself cannot.
struct RawBuddyPool {
    base: BasePtr,
    config: BuddyConfig,
    tree: BlockTree,
    leases: Vec<Option<u8>>,
}

impl RawBuddyPool {
    /// Attempts to construct a new `RawBuddyPool` from a raw pointer.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`BuddyConfig::region_layout()`], and it must be valid for
    /// reads and writes for the entire size indicated by that `Layout`.
    unsafe fn try_new(
        region: NonNull<u8>,
        config: BuddyConfig,
    ) -> Result<RawBuddyPool, AllocInitError> {
        config.validate()?;

        let base =
            BasePtr::new(region, config.arena_size()).ok_or(AllocInitError::InvalidLocation)?;

        let tree = BlockTree::try_new(config.min_unit_size(), config.max_level())?;

        let units = 1_usize << config.max_level();
        let leases_layout =
            Layout::array::<Option<u8>>(units).map_err(|_| AllocInitError::InvalidConfig)?;
        let mut leases = Vec::new();
        leases
            .try_reserve_exact(units)
            .map_err(|_| AllocInitError::AllocFailed(leases_layout))?;
        leases.resize(units, None);

        debug!(
            "created buddy pool at {:p}: {} bytes, {}-byte units, {} tree nodes",
            region,
            config.arena_size(),
            config.min_unit_size(),
            tree.len()
        );

        Ok(RawBuddyPool {
            base,
            config,
            tree,
            leases,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> BuddyPool<A> {
        BuddyPool {
            base: self.base,
            config: self.config,
            tree: self.tree,
            leases: self.leases,
            stats: BuddyStats::default(),
            backing_allocator,
        }
    }
}
