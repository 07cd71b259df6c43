//! Fixed-block allocation.
//!
//! A [`Slab`] divides its region into `num_blocks` cells of `block_size`
//! bytes each. Free cells are threaded into a singly linked list stored in the
//! cells themselves and kept in address order, so a request larger than one
//! cell can be served by a run of adjacent free cells. The number of cells in
//! each lease is recorded in a side table indexed by the lease's first cell.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! Let `N` be the number of cells.
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate (one cell)      | O(1)      | O(1)       |
//! | Allocate (`k` cells)     | O(k)      | O(N)       |
//! | Deallocate               | O(k)      | O(N)       |
//!
//! #### Fragmentation
//!
//! Single-cell allocations exhibit no external fragmentation. Multi-cell
//! leases can fail while enough cells are free if no run of them is
//! contiguous. Internal fragmentation is bounded by one cell per allocation.

use alloc::vec::Vec;
use core::{
    alloc::Layout,
    fmt, mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use log::{debug, trace, warn};

use crate::{
    base::{BasePtr, BlockLink},
    AllocError, AllocInitError, BackingAllocator, DeallocError, Global, Raw,
};

/// A fixed-block allocator supporting contiguous multi-block leases.
pub struct Slab<A: BackingAllocator> {
    base: BasePtr,
    block_size: usize,
    num_blocks: usize,
    free_list: Option<NonZeroUsize>,
    free_blocks: usize,
    /// Number of cells leased starting at each cell, or zero.
    leases: Vec<usize>,
    backing_allocator: A,
}

// SAFETY: the slab uniquely owns its region and lease table, and every
// mutation goes through `&mut self`.
unsafe impl<A: BackingAllocator + Send> Send for Slab<A> {}

impl Slab<Raw> {
    /// Constructs a new `Slab` from a raw pointer.
    ///
    /// For a discussion of slab allocation, see the [module-level
    /// documentation].
    ///
    /// # Errors
    ///
    /// Returns an error if `block_size` is invalid, if the region would not
    /// fit between `region` and the end of the address space, or if the lease
    /// table could not be allocated.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`Slab::region_layout(block_size, num_blocks)`], and it must
    /// be valid for reads and writes for the entire size indicated by that
    /// `Layout`.
    ///
    /// [module-level documentation]: crate::slab
    /// [`Slab::region_layout(block_size, num_blocks)`]: Slab::region_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<Slab<Raw>, AllocInitError> {
        unsafe {
            RawSlab::try_new(region, block_size, num_blocks).map(|s| s.with_backing_allocator(Raw))
        }
    }

    /// Decomposes the slab, returning the region it was constructed with.
    ///
    /// Outstanding leases are forgotten; the returned pointer becomes the sole
    /// owner of the region.
    pub fn into_raw_parts(self) -> NonNull<u8> {
        self.base.ptr()
    }
}

impl Slab<Global> {
    /// Attempts to construct a new `Slab` backed by the global allocator.
    ///
    /// The memory managed by this `Slab` is allocated from the global
    /// allocator according to the layout indicated by
    /// [`Slab::region_layout(block_size, num_blocks)`].
    ///
    /// # Errors
    ///
    /// Returns an error if `block_size` is invalid or if sufficient memory
    /// could not be allocated from the global allocator.
    ///
    /// [`Slab::region_layout(block_size, num_blocks)`]: Slab::region_layout
    pub fn try_new(block_size: usize, num_blocks: usize) -> Result<Slab<Global>, AllocInitError> {
        let region_layout = Self::region_layout(block_size, num_blocks)?;

        unsafe {
            let region_ptr = if region_layout.size() == 0 {
                // Nothing is ever read through a zero-sized region.
                NonNull::new(ptr::without_provenance_mut(region_layout.align()))
                    .ok_or(AllocInitError::InvalidConfig)?
            } else {
                Global::allocate(region_layout)?
            };

            match RawSlab::try_new(region_ptr, block_size, num_blocks) {
                Ok(s) => Ok(s.with_backing_allocator(Global)),
                Err(e) => {
                    if region_layout.size() != 0 {
                        Global.deallocate(region_ptr, region_layout);
                    }

                    Err(e)
                }
            }
        }
    }
}

impl<A> Slab<A>
where
    A: BackingAllocator,
{
    /// Returns the layout requirements of the region managed by a `Slab` of
    /// `num_blocks` cells of `block_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `block_size` is not a
    /// power of two, if it is too small to hold a free-list link, or if the
    /// region cannot be represented as a [`Layout`].
    pub fn region_layout(block_size: usize, num_blocks: usize) -> Result<Layout, AllocInitError> {
        if !block_size.is_power_of_two() || block_size < mem::size_of::<BlockLink>() {
            return Err(AllocInitError::InvalidConfig);
        }

        let total_size = block_size
            .checked_mul(num_blocks)
            .ok_or(AllocInitError::InvalidConfig)?;

        Layout::from_size_align(total_size, block_size).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the size of each cell in bytes.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the total number of cells.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Returns the number of cells not currently leased.
    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Returns `true` if `ptr` points into the region managed by this slab.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }

    /// Attempts to allocate at least `size` bytes from the slab.
    ///
    /// The request is served by the lowest-addressed run of
    /// `size.div_ceil(block_size)` adjacent free cells. The returned slice
    /// covers the whole run and is aligned to `block_size`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero or no run of free cells is long enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let count = size.div_ceil(self.block_size);
        if count > self.free_blocks {
            return Err(AllocError);
        }

        let head = self.take_run(count).ok_or(AllocError)?;

        // Safe unwrap: `head` came from the free list, which never leaves the region.
        let index = self.base.offset_of(head).unwrap() / self.block_size;
        self.leases[index] = count;
        self.free_blocks -= count;

        trace!("slab leased {count} block(s) at index {index}");

        Ok(self.base.with_addr_and_size(head, count * self.block_size))
    }

    /// Unlinks the first run of `count` adjacent cells from the free list and
    /// returns the address of its first cell.
    fn take_run(&mut self, count: usize) -> Option<NonZeroUsize> {
        debug_assert!(count > 0);

        // Last free cell before `run_start`, if any.
        let mut prev: Option<NonZeroUsize> = None;
        let mut run_start = self.free_list?;
        let mut run_len = 1;
        let mut cur = run_start;

        loop {
            // SAFETY: every address on the free list holds an initialized link.
            let next = unsafe { self.base.link_mut(cur).next };

            if run_len == count {
                match prev {
                    // SAFETY: `p` is on the free list.
                    Some(p) => unsafe { self.base.link_mut(p).next = next },
                    None => self.free_list = next,
                }

                return Some(run_start);
            }

            let next = next?;
            if next.get() == cur.get() + self.block_size {
                run_len += 1;
            } else {
                prev = Some(cur);
                run_start = next;
                run_len = 1;
            }

            cur = next;
        }
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// Every cell of the lease starting at `ptr` is returned to the free list.
    ///
    /// # Errors
    ///
    /// Returns an error and leaves the slab unchanged if `ptr` is not the
    /// start of a live allocation from this slab.
    ///
    /// # Safety
    ///
    /// If `ptr` denotes a live allocation, the memory it references must not
    /// be accessed after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        let addr = ptr.addr();
        let res = self.lease_at(addr);

        match res {
            Ok((index, count)) => {
                self.leases[index] = 0;
                unsafe { self.release(addr, count) };
                trace!("slab released {count} block(s) at index {index}");
            }
            Err(e) => warn!("slab rejected deallocation of {ptr:p}: {e}"),
        }

        res.map(|_| ())
    }

    /// Looks up the lease starting at `addr`, returning its first cell index
    /// and length.
    fn lease_at(&self, addr: NonZeroUsize) -> Result<(usize, usize), DeallocError> {
        let offset = self.base.offset_of(addr).ok_or(DeallocError::OutOfRange)?;
        if offset % self.block_size != 0 {
            return Err(DeallocError::NotAllocated);
        }

        let index = offset / self.block_size;
        match self.leases[index] {
            0 => Err(DeallocError::NotAllocated),
            count => Ok((index, count)),
        }
    }

    /// Links `count` cells starting at `head` back into the free list.
    ///
    /// # Safety
    ///
    /// The cells must lie in the region and must not be on the free list.
    unsafe fn release(&mut self, head: NonZeroUsize, count: usize) {
        let mut prev = None;
        let mut cur = self.free_list;
        while let Some(addr) = cur {
            if addr > head {
                break;
            }

            prev = Some(addr);
            cur = unsafe { self.base.link_mut(addr).next };
        }

        // Thread the run back to front so each cell points at its successor.
        let mut next = cur;
        for i in (0..count).rev() {
            let addr = head.saturating_add(i * self.block_size);
            unsafe { self.base.init_link_at(addr, BlockLink { next }) };
            next = Some(addr);
        }

        match prev {
            Some(p) => unsafe { self.base.link_mut(p).next = next },
            None => self.free_list = next,
        }

        self.free_blocks += count;
    }
}

impl<A> fmt::Debug for Slab<A>
where
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("base", &self.base.ptr())
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}

impl<A> Drop for Slab<A>
where
    A: BackingAllocator,
{
    fn drop(&mut self) {
        debug!(
            "destroying slab of {} x {} bytes at {:p}",
            self.num_blocks,
            self.block_size,
            self.base.ptr()
        );

        // Safe unwrap: this layout was checked when the allocator was constructed.
        let region_layout = Self::region_layout(self.block_size, self.num_blocks).unwrap();

        if region_layout.size() != 0 {
            unsafe {
                self.backing_allocator
                    .deallocate(self.base.ptr(), region_layout)
            }
        }
    }
}

struct RawSlab {
    base: BasePtr,
    block_size: usize,
    num_blocks: usize,
    leases: Vec<usize>,
}

impl RawSlab {
    /// Attempts to construct a new `Slab` from a raw pointer.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`Slab::region_layout(block_size, num_blocks)`], and it
    /// must be valid for reads and writes for the entire size indicated by
    /// that `Layout`.
    unsafe fn try_new(
        region: NonNull<u8>,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<RawSlab, AllocInitError> {
        let layout = Slab::<Raw>::region_layout(block_size, num_blocks)?;

        let base = BasePtr::new(region, layout.size()).ok_or(AllocInitError::InvalidLocation)?;

        let leases_layout =
            Layout::array::<usize>(num_blocks).map_err(|_| AllocInitError::InvalidConfig)?;
        let mut leases = Vec::new();
        leases
            .try_reserve_exact(num_blocks)
            .map_err(|_| AllocInitError::AllocFailed(leases_layout))?;
        leases.resize(num_blocks, 0);

        // Initialize the free list by emplacing links in each block.
        for i in 0..num_blocks {
            let addr = base.addr_at(i * block_size);
            let next = (i + 1 < num_blocks).then(|| base.addr_at((i + 1) * block_size));

            unsafe { base.init_link_at(addr, BlockLink { next }) };
        }

        debug!("created slab of {num_blocks} x {block_size} bytes at {region:p}");

        Ok(RawSlab {
            base,
            block_size,
            num_blocks,
            leases,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Slab<A> {
        Slab {
            base: self.base,
            block_size: self.block_size,
            num_blocks: self.num_blocks,
            free_list: (self.num_blocks > 0).then(|| self.base.addr()),
            free_blocks: self.num_blocks,
            leases: self.leases,
            backing_allocator,
        }
    }
}
