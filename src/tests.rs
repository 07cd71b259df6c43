#![cfg(test)]
extern crate std;

use core::{fmt::Debug, marker::PhantomData, mem, ptr::NonNull};

use crate::{AllocError, AllocInitError, BuddyConfig, BuddyPool, DeallocError, Global, Slab};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError>;

    /// Returns `true` if every byte of the allocator can be handed out again.
    fn is_vacant(&self) -> bool;
}

// Slab =======================================================================

#[derive(Clone, Debug)]
struct SlabParams {
    block_size: usize,
    num_blocks: usize,
}

impl Arbitrary for SlabParams {
    fn arbitrary(g: &mut Gen) -> Self {
        let min_shift = mem::size_of::<usize>().trailing_zeros();
        SlabParams {
            block_size: 1 << (min_shift + u32::arbitrary(g) % 5),
            num_blocks: usize::arbitrary(g) % g.size(),
        }
    }
}

impl QcAllocator for Slab<Global> {
    type Params = SlabParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        Slab::try_new(params.block_size, params.num_blocks)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        unsafe { self.deallocate(ptr) }
    }

    fn is_vacant(&self) -> bool {
        self.free_blocks() == self.num_blocks()
    }
}

// Buddy ======================================================================

#[derive(Clone, Debug)]
struct BuddyParams {
    min_unit_size: usize,
    max_level: u32,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        BuddyParams {
            min_unit_size: 1 << (u32::arbitrary(g) % 7),
            max_level: u32::arbitrary(g) % 11,
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let min_unit_size = self.min_unit_size;
        Box::new((0..self.max_level).rev().map(move |max_level| BuddyParams {
            min_unit_size,
            max_level,
        }))
    }
}

impl QcAllocator for BuddyPool<Global> {
    type Params = BuddyParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        BuddyPool::try_new(BuddyConfig::new(params.min_unit_size, params.max_level)?)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        self.deallocate(ptr)
    }

    fn is_vacant(&self) -> bool {
        self.largest_idle_block() == self.arena_size()
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp<P: Arbitrary> {
    /// Allocate a buffer described by `params`.
    Allocate { params: P },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl<P: Arbitrary> Arbitrary for AllocatorOp<P> {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                params: P::arbitrary(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

struct RawAllocation {
    id: OpId,
    ptr: NonNull<[u8]>,
}

type AllocResult = Result<NonNull<[u8]>, AllocError>;

trait PropAllocation {
    type Params: Arbitrary;

    fn size(params: &Self::Params) -> usize;
    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self;
    fn into_raw(self) -> RawAllocation;
}

trait Prop {
    /// The allocator to test for this property.
    type Allocator: QcAllocator;

    type Allocation: PropAllocation;

    /// Examines the result of an allocation.
    fn post_allocate(
        op_id: OpId,
        params: &<Self::Allocation as PropAllocation>::Params,
        res: &mut AllocResult,
    ) -> bool {
        let _ = (op_id, params, res);
        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        let _ = allocation;
        true
    }

    /// Examines the allocator after every operation.
    fn post_op(allocator: &Self::Allocator) -> bool {
        let _ = allocator;
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<P::Allocation>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcAllocator>::Params,
        capacity: usize,
    ) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp<<P::Allocation as PropAllocation>::Params>) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { params } => {
                let size = P::Allocation::size(&params);
                let mut res = self.allocator.allocate(size);

                if let Ok(ptr) = &res {
                    if size == 0 || ptr.len() < size {
                        return false;
                    }
                }

                if !P::post_allocate(op_id, &params, &mut res) {
                    return false;
                }

                match res {
                    Ok(ptr) => {
                        self.allocations.push(P::Allocation::from_raw(
                            &params,
                            RawAllocation { id: op_id, ptr },
                        ));
                    }

                    // If the allocation should have succeeded, this is handled
                    // by post_allocate
                    Err(AllocError) => (),
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_deallocate(&a) {
                    return false;
                }

                let a = a.into_raw();

                if unsafe { self.allocator.deallocate(a.ptr.cast::<u8>()) }.is_err() {
                    return false;
                }
            }
        }

        P::post_op(&self.allocator)
    }

    fn run(&mut self, ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for alloc in self.allocations.drain(..) {
            let alloc = alloc.into_raw();
            if unsafe { self.allocator.deallocate(alloc.ptr.cast::<u8>()) }.is_err() {
                return false;
            }
        }

        P::post_op(&self.allocator) && self.allocator.is_vacant()
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

/// Every live allocation keeps the contents written to it.
struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

/// The requested bytes of an allocation, painted with its operation ID.
///
/// Blocks may be aligned to a single byte, so painting is bytewise.
struct PaintedAllocation {
    op_id: OpId,
    ptr: NonNull<[u8]>,
}

#[derive(Clone, Debug)]
struct PaintedAllocationParams {
    size: usize,
}

impl Arbitrary for PaintedAllocationParams {
    fn arbitrary(g: &mut Gen) -> Self {
        PaintedAllocationParams {
            size: limited_size(g),
        }
    }
}

impl PropAllocation for PaintedAllocation {
    type Params = PaintedAllocationParams;

    fn size(params: &Self::Params) -> usize {
        params.size
    }

    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self {
        PaintedAllocation {
            op_id: raw.id,
            ptr: NonNull::slice_from_raw_parts(raw.ptr.cast::<u8>(), params.size),
        }
    }

    fn into_raw(self) -> RawAllocation {
        RawAllocation {
            id: self.op_id,
            ptr: self.ptr,
        }
    }
}

fn paint_byte(op_id: OpId) -> u8 {
    op_id.to_le_bytes()[0]
}

fn paint(op_id: OpId, params: &PaintedAllocationParams, res: &mut AllocResult) {
    if let Ok(alloc) = res {
        let block = NonNull::slice_from_raw_parts(alloc.cast::<u8>(), params.size);
        unsafe { (*block.as_ptr()).fill(paint_byte(op_id)) };
    }
}

fn paint_intact(allocation: &PaintedAllocation) -> bool {
    let bytes = unsafe { allocation.ptr.as_ref() };
    bytes.iter().all(|&b| b == paint_byte(allocation.op_id))
}

impl<A: QcAllocator> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    type Allocation = PaintedAllocation;

    fn post_allocate(op_id: OpId, params: &PaintedAllocationParams, res: &mut AllocResult) -> bool {
        paint(op_id, params, res);
        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        paint_intact(allocation)
    }
}

/// The block tree stays well formed after every operation.
struct TreeConsistent;

impl Prop for TreeConsistent {
    type Allocator = BuddyPool<Global>;

    type Allocation = PaintedAllocation;

    fn post_allocate(op_id: OpId, params: &PaintedAllocationParams, res: &mut AllocResult) -> bool {
        paint(op_id, params, res);
        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        paint_intact(allocation)
    }

    fn post_op(pool: &BuddyPool<Global>) -> bool {
        pool.assert_consistent();
        pool.allocated_bytes() + pool.idle_bytes() == pool.arena_size()
    }
}

fn check<P: Prop>(
    params: <P::Allocator as QcAllocator>::Params,
    ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>,
) -> bool {
    let mut checker: AllocatorChecker<P> = match AllocatorChecker::new(params, ops.capacity()) {
        Ok(c) => c,
        // Parameters the allocator rejects are not interesting here.
        Err(AllocInitError::InvalidConfig) => return true,
        Err(e) => panic!("allocator construction failed: {e}"),
    };

    checker.run(ops)
}

#[test]
fn slab_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<Slab<Global>>> as fn(_, _) -> bool);
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<BuddyPool<Global>>> as fn(_, _) -> bool);
}

#[test]
fn buddy_tree_stays_consistent() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<TreeConsistent> as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
