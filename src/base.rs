use core::{num::NonZeroUsize, ptr::NonNull};

/// A pointer to the base of the region of memory managed by an allocator.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` managing `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the end of the region would overflow the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Returns the offset of `addr` from the base, or `None` if `addr` lies
    /// outside the region.
    #[inline]
    pub fn offset_of(self, addr: NonZeroUsize) -> Option<usize> {
        addr.get()
            .checked_sub(self.addr().get())
            .filter(|&ofs| ofs < self.extent)
    }

    /// Returns the address `offset` bytes from the base.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        debug_assert!(offset < self.extent);

        // Cannot overflow: the full extent was checked in `new`.
        self.addr().saturating_add(offset)
    }

    /// Initializes a `BlockLink` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - The memory at `addr` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn init_link_at(self, addr: NonZeroUsize, link: BlockLink) {
        debug_assert!(self.contains_addr(addr));
        if let Some(next) = link.next {
            debug_assert!(self.contains_addr(next), "next link out of region");
        }

        unsafe {
            self.with_addr(addr)
                .cast::<BlockLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a mutable reference to the `BlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `link` must contain a properly initialized `BlockLink` value.
    /// - The memory at `link` must be within the provenance of `self` and
    ///   unallocated by the associated allocator.
    #[inline]
    pub unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut BlockLink {
        debug_assert!(self.contains_addr(link));

        unsafe { self.ptr.with_addr(link).cast::<BlockLink>().as_mut() }
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    /// Creates a slice pointer of `len` bytes starting at `addr`.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(self.offset_of(addr).map_or(false, |ofs| len <= self.extent - ofs));

        NonNull::slice_from_raw_parts(self.with_addr(addr), len)
    }
}

// Rather than using pointers, store only the address of the next link. This
// avoids accidentally violating stacked borrows; the links "point to" other
// blocks, but by forgoing actual pointers, no borrow is implied.
//
// NOTE: Using this method, any actual pointer to a block must be acquired
// via the allocator base pointer, and NOT by casting these addresses
// directly!

/// A link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// linked list.
#[repr(C)]
pub struct BlockLink {
    pub next: Option<NonZeroUsize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::vec;

    #[test]
    fn offsets_are_bounded_by_extent() {
        let mut buf = vec![0u8; 64];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        let base = BasePtr::new(ptr, buf.len()).unwrap();

        assert_eq!(base.offset_of(base.addr()), Some(0));
        assert_eq!(base.offset_of(base.addr_at(63)), Some(63));

        let past_end = base.addr().checked_add(64).unwrap();
        assert_eq!(base.offset_of(past_end), None);
        assert!(!base.contains_addr(past_end));

        let before = NonZeroUsize::new(base.addr().get() - 1).unwrap();
        assert_eq!(base.offset_of(before), None);
    }

    #[test]
    fn empty_region_contains_nothing() {
        let mut buf = [0u8; 1];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        let base = BasePtr::new(ptr, 0).unwrap();

        assert!(!base.contains_addr(base.addr()));
    }

    #[test]
    fn overflowing_region_is_rejected() {
        let ptr = NonNull::new(core::ptr::without_provenance_mut::<u8>(usize::MAX)).unwrap();
        assert!(BasePtr::new(ptr, 1).is_none());
    }
}
