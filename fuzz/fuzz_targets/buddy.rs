#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use buddy_arena_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MAX_UNIT_SHIFT: u8 = 8;
const MAX_LEVEL: u32 = 16;

#[derive(Clone, Debug)]
struct Args {
    min_unit_size: usize,
    max_level: u32,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let min_unit_size = 1 << (u8::arbitrary(un)? % (MAX_UNIT_SHIFT + 1));
        let max_level = u32::arbitrary(un)? % (MAX_LEVEL + 1);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            min_unit_size,
            max_level,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        min_unit_size,
        max_level,
        ops,
    } = args;

    let pool = match BuddySubject::new(min_unit_size, max_level) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(pool);
    eval.evaluate(ops).unwrap();

    let pool = eval.subject().pool();
    assert_eq!(pool.largest_idle_block(), pool.arena_size());
});
