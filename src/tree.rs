//! The block tree backing a [`BuddyPool`](crate::BuddyPool).
//!
//! The tree is complete and stored as a flat array. The root (index 0) spans
//! the whole arena at level `max_level`; the children of node `i` are `2i + 1`
//! (lower half) and `2i + 2` (upper half), one level down. Level 0 nodes are
//! blocks of `min_unit_size` bytes.
//!
//! Every node is in exactly one [`BlockStatus`]. Walking down from the root,
//! the first node that is not `Unavailable` owns its entire range; everything
//! beneath it is `Unavailable`. A node above that point is `Unavailable`
//! because it has been split.

use alloc::vec::Vec;
use core::alloc::Layout;

use log::trace;

use crate::AllocInitError;

/// The allocation state of a block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockStatus {
    /// The block is free, and so is all of the memory it spans.
    Idle,

    /// The block has been handed out as a single allocation.
    Allocated,

    /// The block's memory is owned elsewhere: either the block has been split
    /// and its children own the memory, or an ancestor owns it.
    Unavailable,
}

/// A snapshot of one node in the block tree.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockInfo {
    /// Offset of the block from the start of the arena.
    pub offset: usize,
    /// Size of the block in bytes.
    pub size: usize,
    /// Level of the block. Level 0 holds the smallest blocks.
    pub level: u32,
    /// Current state of the block.
    pub status: BlockStatus,
}

#[derive(Copy, Clone, Debug)]
struct Block {
    offset: usize,
    size: usize,
    status: BlockStatus,
}

#[inline]
const fn left(index: usize) -> usize {
    2 * index + 1
}

#[inline]
const fn right(index: usize) -> usize {
    2 * index + 2
}

#[inline]
const fn parent(index: usize) -> usize {
    (index - 1) / 2
}

/// Returns the number of nodes in a tree whose root is at `max_level`.
///
/// Level `l` holds `2^(max_level - l)` nodes, so the total over levels
/// `0..=max_level` is `2^(max_level + 1) - 1`.
pub fn node_count(max_level: u32) -> Option<usize> {
    1_usize.checked_shl(max_level.checked_add(1)?)?.checked_sub(1)
}

/// Returns the lowest level whose blocks are at least `size` bytes.
///
/// The caller must ensure `size` is nonzero and no larger than the arena, so
/// the result never exceeds the root level.
pub fn level_for(size: usize, min_unit_size: usize) -> u32 {
    debug_assert!(size > 0);

    // At most `1 << max_level` units, so rounding up cannot overflow.
    size.div_ceil(min_unit_size).next_power_of_two().trailing_zeros()
}

/// A complete binary tree of blocks over a single arena.
#[derive(Debug)]
pub struct BlockTree {
    blocks: Vec<Block>,
    min_unit_size: usize,
    max_level: u32,
    splits: u64,
    merges: u64,
}

impl BlockTree {
    /// Returns the layout of the node array for a tree of this height.
    pub fn metadata_layout(max_level: u32) -> Result<Layout, AllocInitError> {
        let count = node_count(max_level).ok_or(AllocInitError::InvalidConfig)?;
        Layout::array::<Block>(count).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Allocates and initializes the node array.
    ///
    /// Only the root starts out idle.
    pub fn try_new(min_unit_size: usize, max_level: u32) -> Result<BlockTree, AllocInitError> {
        let layout = Self::metadata_layout(max_level)?;
        let count = layout.size() / core::mem::size_of::<Block>();

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(count)
            .map_err(|_| AllocInitError::AllocFailed(layout))?;
        blocks.resize(
            count,
            Block {
                offset: 0,
                size: 0,
                status: BlockStatus::Unavailable,
            },
        );

        let mut tree = BlockTree {
            blocks,
            min_unit_size,
            max_level,
            splits: 0,
            merges: 0,
        };

        let visited = tree.init(0, max_level, 0);
        debug_assert_eq!(visited, count);

        tree.blocks[0].status = BlockStatus::Idle;

        Ok(tree)
    }

    /// Fills in the subtree rooted at `index`, returning the number of nodes
    /// visited.
    fn init(&mut self, index: usize, level: u32, offset: usize) -> usize {
        let size = self.min_unit_size << level;
        self.blocks[index] = Block {
            offset,
            size,
            status: BlockStatus::Unavailable,
        };

        if level == 0 {
            return 1;
        }

        1 + self.init(left(index), level - 1, offset)
            + self.init(right(index), level - 1, offset + size / 2)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn splits(&self) -> u64 {
        self.splits
    }

    #[inline]
    pub fn merges(&self) -> u64 {
        self.merges
    }

    /// Returns the level of the node at `index`.
    #[inline]
    pub fn level_of(&self, index: usize) -> u32 {
        self.max_level - (index + 1).ilog2()
    }

    /// Returns the index of the node at `level` starting at `offset`.
    #[inline]
    pub fn index_of(&self, offset: usize, level: u32) -> usize {
        let size = self.min_unit_size << level;
        debug_assert_eq!(offset % size, 0);

        // Level `l` begins at index `2^(max_level - l) - 1`.
        let first = (1_usize << (self.max_level - level)) - 1;
        first + offset / size
    }

    /// Returns the offset of the node at `index`, which lies on `level`.
    #[inline]
    pub fn offset_of(&self, index: usize, level: u32) -> usize {
        debug_assert_eq!(self.level_of(index), level);

        let first = (1_usize << (self.max_level - level)) - 1;
        (index - first) * (self.min_unit_size << level)
    }

    pub fn block(&self, index: usize) -> Option<BlockInfo> {
        self.blocks.get(index).map(|b| BlockInfo {
            offset: b.offset,
            size: b.size,
            level: self.level_of(index),
            status: b.status,
        })
    }

    /// Leases an idle block at `target` level, splitting larger blocks as
    /// needed.
    ///
    /// On success, returns the index of the allocated node. The search is
    /// depth-first and visits lower halves first, so the lowest suitable
    /// address wins.
    pub fn allocate(&mut self, target: u32) -> Option<usize> {
        debug_assert!(target <= self.max_level);

        self.find_idle(0, self.max_level, target)
    }

    fn find_idle(&mut self, index: usize, level: u32, target: u32) -> Option<usize> {
        if level < target {
            return None;
        }

        match self.blocks[index].status {
            BlockStatus::Allocated => return None,

            BlockStatus::Idle if level == target => {
                self.blocks[index].status = BlockStatus::Allocated;
                return Some(index);
            }

            // `level > target`, so this is not a leaf.
            BlockStatus::Idle => self.split(index),

            BlockStatus::Unavailable if level == 0 => return None,

            BlockStatus::Unavailable => (),
        }

        self.find_idle(left(index), level - 1, target)
            .or_else(|| self.find_idle(right(index), level - 1, target))
    }

    fn split(&mut self, index: usize) {
        trace!(
            "split block {index} at offset {:#x} ({} bytes)",
            self.blocks[index].offset,
            self.blocks[index].size
        );

        self.blocks[index].status = BlockStatus::Unavailable;
        self.blocks[left(index)].status = BlockStatus::Idle;
        self.blocks[right(index)].status = BlockStatus::Idle;
        self.splits += 1;
    }

    /// Returns the allocated node at `index` to the tree, coalescing idle
    /// buddies on the path back up to the root.
    pub fn release(&mut self, index: usize) {
        debug_assert_eq!(self.blocks[index].status, BlockStatus::Allocated);

        self.blocks[index].status = BlockStatus::Idle;

        // Only ancestors of the freed node can change state. Once a parent
        // fails to merge, none of its ancestors can either.
        let mut child = index;
        while child > 0 {
            let parent = parent(child);
            if !self.merge(parent) {
                break;
            }

            child = parent;
        }
    }

    fn merge(&mut self, index: usize) -> bool {
        let (l, r) = (left(index), right(index));

        if self.blocks[l].status != BlockStatus::Idle || self.blocks[r].status != BlockStatus::Idle
        {
            return false;
        }

        trace!(
            "merge block {index} at offset {:#x} ({} bytes)",
            self.blocks[index].offset,
            self.blocks[index].size
        );

        self.blocks[index].status = BlockStatus::Idle;
        self.blocks[l].status = BlockStatus::Unavailable;
        self.blocks[r].status = BlockStatus::Unavailable;
        self.merges += 1;

        true
    }

    fn bytes_with_status(&self, status: BlockStatus) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.size)
            .sum()
    }

    /// Returns the total size of all idle blocks.
    ///
    /// Idle blocks never overlap, so each byte is counted at most once.
    pub fn idle_bytes(&self) -> usize {
        self.bytes_with_status(BlockStatus::Idle)
    }

    /// Returns the total size of all allocated blocks.
    #[cfg(test)]
    pub fn allocated_bytes(&self) -> usize {
        self.bytes_with_status(BlockStatus::Allocated)
    }

    /// Returns the size of the largest idle block, or 0 if there is none.
    pub fn largest_idle_block(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Idle)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    /// Panics if the tree violates any structural or status invariant.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        let root = &self.blocks[0];
        assert_eq!(root.offset, 0);
        assert_eq!(root.size, self.min_unit_size << self.max_level);

        self.assert_subtree(0, self.max_level, false);

        assert_eq!(
            self.idle_bytes() + self.allocated_bytes(),
            root.size,
            "idle and allocated blocks must tile the arena"
        );
    }

    #[cfg(test)]
    fn assert_subtree(&self, index: usize, level: u32, owned_above: bool) {
        let block = &self.blocks[index];
        assert_eq!(block.size, self.min_unit_size << level, "block {index}");

        if owned_above {
            assert_eq!(
                block.status,
                BlockStatus::Unavailable,
                "block {index} lies inside an idle or allocated block"
            );
        } else if block.status == BlockStatus::Unavailable {
            assert!(level > 0, "leaf {index} is unavailable but not owned");
        }

        if level == 0 {
            return;
        }

        let (l, r) = (left(index), right(index));
        assert_eq!(self.blocks[l].offset, block.offset, "block {index}");
        assert_eq!(
            self.blocks[r].offset,
            block.offset + block.size / 2,
            "block {index}"
        );

        let split = !owned_above && block.status == BlockStatus::Unavailable;
        if split {
            let both_idle = self.blocks[l].status == BlockStatus::Idle
                && self.blocks[r].status == BlockStatus::Idle;
            assert!(!both_idle, "block {index} has two idle buddies");
        }

        self.assert_subtree(l, level - 1, !split);
        self.assert_subtree(r, level - 1, !split);
    }
}
