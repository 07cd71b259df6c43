//! Arena allocators built on a tree-indexed binary-buddy system.
//!
//! The centerpiece of this crate is [`BuddyPool`], which manages one
//! contiguous arena of `min_unit_size << max_level` bytes. Blocks are tracked
//! by a complete binary tree stored as a flat array: every node is either
//! idle, allocated, or unavailable because its memory is owned by a relative.
//! Allocation splits idle blocks on demand and deallocation eagerly coalesces
//! idle buddies back into their parent.
//!
//! A simpler fixed-block allocator, [`Slab`], is provided alongside it.
//!
//! ```
//! use buddy_arena::{BuddyConfig, BuddyPool};
//!
//! // 1 KiB arena with a 1-byte minimum unit.
//! let config = BuddyConfig::new(1, 10).unwrap();
//! let mut pool = BuddyPool::try_new(config).unwrap();
//!
//! let block = pool.allocate(500).unwrap();
//! assert_eq!(block.len(), 512);
//!
//! pool.deallocate(block.cast()).unwrap();
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_arena/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod base;
pub mod buddy;
pub mod slab;
mod tree;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, ptr::NonNull};

pub use crate::{
    buddy::{BuddyConfig, BuddyPool, BuddyStats},
    slab::Slab,
    tree::{BlockInfo, BlockStatus},
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    #[error("failed to allocate {} bytes of allocator memory", .0.size())]
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    #[error("invalid allocator configuration")]
    InvalidConfig,

    /// The location of the allocator is invalid.
    ///
    /// This variant is returned when the full size of the managed region
    /// would not fit at the provided address, i.e., pointer calculations
    /// would overflow.
    #[error("managed region would overflow the address space")]
    InvalidLocation,
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
///
/// An oversized request and a request that cannot be met because of
/// fragmentation are reported identically.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("memory allocation failed")]
pub struct AllocError;

/// The error type returned when a pointer cannot be deallocated.
///
/// A rejected deallocation leaves the allocator unchanged.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum DeallocError {
    /// The pointer lies outside the region managed by the allocator.
    #[error("pointer lies outside the managed region")]
    OutOfRange,

    /// The pointer is inside the managed region but is not the start of a
    /// live allocation.
    ///
    /// This covers double frees and pointers into the middle of a block.
    #[error("pointer does not denote a live allocation")]
    NotAllocated,
}

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must be the layout that block was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;
impl Sealed for Global {}
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

impl Global {
    /// Allocates `layout` from the global allocator.
    ///
    /// # Safety
    ///
    /// `layout` must have a nonzero size.
    unsafe fn allocate(layout: Layout) -> Result<NonNull<u8>, AllocInitError> {
        debug_assert_ne!(layout.size(), 0);

        let raw = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
