use super::*;
use block_cache::BlockCache;
use trans::OpContext;

use bitvec::prelude::*;
use log::trace;

/// Free block bitmap. Bit `b` of the bitmap region is set while block `b`
/// is in use; metadata blocks are marked in use by mkfs.
pub struct BitMap {
    start: usize,
    blocks: usize, // # of blocks, sum, including the meta_data blocks
}

impl BitMap {
    pub fn new(start_block_no: usize, blocks: usize) -> Self {
        Self {
            start: start_block_no,
            blocks,
        }
    }

    /// Claim the first free block and zero it.
    ///
    /// # warning
    /// should be enveloped by begin_op() and end_op()
    pub fn alloc(&self, cache: &BlockCache, ctx: &mut OpContext) -> usize {
        for base in (0..self.blocks).step_by(BIT_PER_BLOCK) {
            let mut block = cache.acquire(self.start + base / BIT_PER_BLOCK);
            let len = BIT_PER_BLOCK.min(self.blocks - base);
            let bits = &mut block.data_mut().view_bits_mut::<Lsb0>()[..len];
            let Some(bi) = bits.first_zero() else {
                continue;
            };
            bits.set(bi, true);
            cache.sync(Some(&mut *ctx), &block);
            drop(block);

            let block_no = base + bi;
            let mut fresh = cache.acquire(block_no);
            fresh.data_mut().fill(0);
            cache.sync(Some(ctx), &fresh);
            trace!("alloc block {block_no}");
            return block_no;
        }
        panic!("balloc: out of blocks");
    }

    /// # warning
    /// should be enveloped by begin_op() and end_op()
    pub fn free(&self, cache: &BlockCache, ctx: &mut OpContext, block_no: usize) {
        assert!(block_no < self.blocks, "free of block {block_no} past the end");
        let mut block = cache.acquire(self.start + block_no / BIT_PER_BLOCK);
        let bits = block.data_mut().view_bits_mut::<Lsb0>();
        bits.set(block_no % BIT_PER_BLOCK, false);
        cache.sync(Some(ctx), &block);
        trace!("free block {block_no}");
    }

    pub fn num_free(&self, cache: &BlockCache) -> usize {
        (0..self.blocks)
            .step_by(BIT_PER_BLOCK)
            .map(|base| {
                let block = cache.acquire(self.start + base / BIT_PER_BLOCK);
                let len = BIT_PER_BLOCK.min(self.blocks - base);
                block.data().view_bits::<Lsb0>()[..len].count_zeros()
            })
            .sum()
    }
}
