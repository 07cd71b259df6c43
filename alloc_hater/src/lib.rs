//! Evaluates size-based allocators by painting every block they hand out and
//! checking that no other operation disturbs it.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{fmt, mem::MaybeUninit, ptr::NonNull, slice};

/// Requests are drawn from `0..2^n` for a random `n` up to this limit, which
/// biases them toward small sizes.
pub const MAX_SIZE_BITS: u8 = 16;

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocatorOp {
    /// Allocate at least this many bytes.
    Alloc(usize),
    /// Free a live block. Given `n` live blocks, the block at index
    /// `idx % n` is freed.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => {
                let bits = u8::arbitrary(u)? % (MAX_SIZE_BITS + 1);
                AllocatorOp::Alloc(usize::arbitrary(u)? % (1 << bits))
            }
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError: fmt::Debug;
    type DeallocError: fmt::Debug;

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// If `ptr` denotes a block currently allocated by this allocator, the
    /// block must not be accessed after this call.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::DeallocError>;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // The whole block, as returned by the allocator.
    ptr: NonNull<[u8]>,
    // The ID of the last operation that painted this block.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - The memory at `ptr` may only be accessed through the returned `Block`
    ///   until it is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, id: u64) -> Block {
        let mut b = Block { ptr, id };
        b.paint(id);
        b
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.ptr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.len() == 0
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: every byte was initialized by `paint`.
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

/// Why an evaluation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The allocator returned a block smaller than requested.
    ShortBlock { requested: usize, returned: usize },
    /// A zero-byte request succeeded.
    ZeroSized,
    /// A live block was overwritten by another operation.
    Corrupted,
    /// The allocator refused to free one of its own blocks.
    Rejected(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::ShortBlock {
                requested,
                returned,
            } => write!(f, "requested {requested} bytes, got {returned}"),
            Failure::ZeroSized => f.write_str("zero-byte allocation succeeded"),
            Failure::Corrupted => f.write_str("live block was overwritten"),
            Failure::Rejected(e) => write!(f, "deallocation rejected: {e}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    /// The failing operation, or `None` if the failure occurred while freeing
    /// the blocks left over at the end.
    pub failed_op: Option<AllocatorOp>,
    pub failure: Failure,
}

pub struct Evaluator<S: Subject> {
    subject: S,
    allocs: usize,
    deallocs: usize,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator {
            subject,
            allocs: 0,
            deallocs: 0,
        }
    }

    /// Returns the number of successful allocations made so far.
    pub fn allocs(&self) -> usize {
        self.allocs
    }

    /// Returns the number of blocks freed by `Dealloc` operations so far.
    ///
    /// Blocks freed at the end of an evaluation are not counted.
    pub fn deallocs(&self) -> usize {
        self.deallocs
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    /// Runs `ops` against the subject, then frees every block still live.
    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in (0_u64..).zip(ops) {
            let failure = match op {
                AllocatorOp::Alloc(size) => self.alloc(&mut blocks, size, op_id).err(),
                AllocatorOp::Dealloc(raw_idx) => self.dealloc(&mut blocks, raw_idx, op_id).err(),
            };

            if let Some(failure) = failure {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                    failure,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if let Err(failure) = self.free(block) {
                return Err(Failed {
                    completed,
                    failed_op: None,
                    failure,
                });
            }
        }

        Ok(())
    }

    fn alloc(&mut self, blocks: &mut Blocks, size: usize, op_id: u64) -> Result<(), Failure> {
        let ptr = match self.subject.allocate(size) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };

        if size == 0 {
            return Err(Failure::ZeroSized);
        }

        if ptr.len() < size {
            return Err(Failure::ShortBlock {
                requested: size,
                returned: ptr.len(),
            });
        }

        blocks.push(unsafe { Block::init(ptr, op_id) });
        self.allocs += 1;
        Ok(())
    }

    fn dealloc(&mut self, blocks: &mut Blocks, raw_idx: usize, op_id: u64) -> Result<(), Failure> {
        let Some(mut block) = blocks.remove_modulo(raw_idx) else {
            return Ok(());
        };

        if !block.verify() {
            return Err(Failure::Corrupted);
        }

        // Repaint so a stale write through a freed block is caught later.
        block.paint(op_id);
        self.free(block)?;
        self.deallocs += 1;
        Ok(())
    }

    fn free(&mut self, block: Block) -> Result<(), Failure> {
        if !block.verify() {
            return Err(Failure::Corrupted);
        }

        unsafe { self.subject.deallocate(block.ptr()) }
            .map_err(|e| Failure::Rejected(format!("{e:?}")))
    }
}
