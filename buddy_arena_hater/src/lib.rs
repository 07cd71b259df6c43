#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_arena::{AllocError, AllocInitError, BuddyConfig, BuddyPool, DeallocError, Global, Slab};

pub struct BuddySubject(BuddyPool<Global>);

impl BuddySubject {
    pub fn new(min_unit_size: usize, max_level: u32) -> Result<Self, AllocInitError> {
        let config = BuddyConfig::new(min_unit_size, max_level)?;
        let b = BuddyPool::try_new(config)?;
        Ok(BuddySubject(b))
    }

    pub fn pool(&self) -> &BuddyPool<Global> {
        &self.0
    }
}

impl Subject for BuddySubject {
    type AllocError = AllocError;
    type DeallocError = DeallocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        self.0.deallocate(ptr)
    }
}

pub struct SlabSubject(Slab<Global>);

impl SlabSubject {
    pub fn new(block_size: usize, num_blocks: usize) -> Result<Self, AllocInitError> {
        let s = Slab::try_new(block_size, num_blocks)?;
        Ok(SlabSubject(s))
    }

    pub fn slab(&self) -> &Slab<Global> {
        &self.0
    }
}

impl Subject for SlabSubject {
    type AllocError = AllocError;
    type DeallocError = DeallocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        unsafe { self.0.deallocate(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc_hater::{AllocatorOp, Evaluator};
    use arbitrary::{Arbitrary, Unstructured};

    /// Deterministic filler bytes for `Unstructured`.
    fn noise(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state.to_le_bytes()[0]
            })
            .collect()
    }

    /// Returns between 256 and 1024 operations derived from `seed`.
    fn ops(seed: u64) -> Vec<AllocatorOp> {
        let bytes = noise(seed, 16 * 1024);
        let mut un = Unstructured::new(&bytes);

        let count = un.int_in_range(256..=1024_usize).unwrap();
        (0..count)
            .map(|_| AllocatorOp::arbitrary(&mut un).unwrap())
            .collect()
    }

    fn assert_busy<S: Subject>(eval: &Evaluator<S>) {
        assert!(eval.allocs() >= 16, "only {} allocations", eval.allocs());
        assert!(eval.deallocs() >= 16, "only {} deallocations", eval.deallocs());
    }

    #[test]
    fn op_streams_are_long() {
        for seed in [0, 1, 15, 0xdead_beef] {
            let ops = ops(seed);
            assert!(ops.len() >= 256);

            let frees = ops
                .iter()
                .filter(|op| matches!(op, AllocatorOp::Dealloc(_)))
                .count();
            assert!(frees >= 64, "seed {seed}: {frees} frees");
        }
    }

    #[test]
    fn buddy_survives_random_ops() {
        for seed in 0..16 {
            let subject = BuddySubject::new(16, 12).unwrap();
            let mut eval = Evaluator::new(subject);
            eval.evaluate(ops(seed)).unwrap();
            assert_busy(&eval);

            let pool = eval.subject().pool();
            assert_eq!(pool.live_allocations(), 0);
            assert_eq!(pool.stats().allocations, eval.allocs() as u64);
            assert_eq!(pool.largest_idle_block(), pool.arena_size());
        }
    }

    #[test]
    fn slab_survives_random_ops() {
        for seed in 0..16 {
            let subject = SlabSubject::new(64, 256).unwrap();
            let mut eval = Evaluator::new(subject);
            eval.evaluate(ops(seed)).unwrap();
            assert_busy(&eval);

            let slab = eval.subject().slab();
            assert_eq!(slab.free_blocks(), slab.num_blocks());
        }
    }

    #[test]
    fn byte_unit_pool_survives_random_ops() {
        let subject = BuddySubject::new(1, 16).unwrap();
        let mut eval = Evaluator::new(subject);
        eval.evaluate(ops(0xdead_beef)).unwrap();
        assert_busy(&eval);

        let stats = eval.subject().pool().stats();
        assert_eq!(stats.rejected_deallocations, 0);
        assert_eq!(stats.deallocations, stats.allocations);
        assert!(stats.merges > 0);
    }
}
