//! Block cache. Every in-memory copy of a disk block lives here, at most
//! one per block number.
//!
//! Two lock tiers: `state` guards the slot arena and the recency list and is
//! held only for list manipulation; each block has its own lock, held by
//! whoever acquired the block. The state lock is never held while waiting
//! for a block lock or doing device I/O.

use super::*;
use bitmap::BitMap;
use block_device::BlockDevice;
use disk::SuperBlock;
use trans::{LogManager, LogStats, OpContext};

use log::trace;
use parking_lot::{lock_api::ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

struct BlockBuf {
    data: [u8; BSIZE],
    /// has data been read from disk?
    valid: bool,
}

struct Slot {
    block_no: usize,
    /// checked out by a `Block`
    acquired: bool,
    /// part of an uncommitted transaction
    pinned: bool,
    buf: Arc<Mutex<BlockBuf>>,
}

#[derive(Default)]
struct CacheState {
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    /// slot indices, most recently used first
    lru: VecDeque<usize>,
    index: HashMap<usize, usize>,
}

impl CacheState {
    fn slot(&mut self, slot: usize) -> &mut Slot {
        match self.slots[slot].as_mut() {
            Some(entry) => entry,
            None => panic!("block cache: dangling slot {slot}"),
        }
    }

    fn touch(&mut self, slot: usize) {
        if let Some(pos) = self.lru.iter().position(|&s| s == slot) {
            self.lru.remove(pos);
        }
        self.lru.push_front(slot);
    }

    fn insert(&mut self, entry: Slot) -> usize {
        let block_no = entry.block_no;
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(block_no, slot);
        self.lru.push_front(slot);
        slot
    }

    /// Drop least recently used blocks that are neither pinned nor acquired
    /// until fewer than `threshold` remain or nothing else can go.
    fn evict(&mut self, threshold: usize) {
        while self.index.len() >= threshold {
            let victim = self.lru.iter().rposition(|&slot| {
                self.slots[slot]
                    .as_ref()
                    .is_some_and(|entry| !entry.pinned && !entry.acquired)
            });
            let Some(slot) = victim.and_then(|pos| self.lru.remove(pos)) else {
                break;
            };
            if let Some(entry) = self.slots[slot].take() {
                trace!("evict block {}", entry.block_no);
                self.index.remove(&entry.block_no);
                self.free_slots.push(slot);
            }
        }
    }
}

/// An acquired block. Dropping it releases the block.
pub struct Block<'a> {
    cache: &'a BlockCache,
    slot: usize,
    block_no: usize,
    guard: Option<ArcMutexGuard<RawMutex, BlockBuf>>,
}

impl Block<'_> {
    pub fn block_no(&self) -> usize {
        self.block_no
    }

    fn buf(&self) -> &BlockBuf {
        match self.guard.as_ref() {
            Some(guard) => &**guard,
            None => unreachable!("block {} used after release", self.block_no),
        }
    }

    fn buf_mut(&mut self) -> &mut BlockBuf {
        match self.guard.as_mut() {
            Some(guard) => &mut **guard,
            None => unreachable!("block {} used after release", self.block_no),
        }
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.buf().data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.buf_mut().data
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.state();
        state.slot(self.slot).acquired = false;
        // unlock while `acquired` is still consistent with the block lock
        self.guard.take();
    }
}

pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    sb: SuperBlock,
    threshold: usize,
    state: Mutex<CacheState>,
    log: LogManager,
    bitmap: BitMap,
}

impl BlockCache {
    /// Build the cache over a formatted device and replay its log.
    pub fn new(device: Arc<dyn BlockDevice>, sb: SuperBlock, config: &Config) -> Result<Self> {
        config.validate(sb.num_log_blocks as usize)?;
        let log_size = config.log_size(sb.num_log_blocks as usize);
        let cache = Self {
            device: Arc::clone(&device),
            sb,
            threshold: config.eviction_threshold,
            state: Mutex::new(CacheState::default()),
            log: LogManager::new(
                sb.log_start as usize,
                log_size,
                sb.bitmap_start as usize..sb.num_blocks as usize,
                device,
            ),
            bitmap: BitMap::new(sb.bitmap_start as usize, sb.num_blocks as usize),
        };
        cache.recover()?;
        Ok(cache)
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn block_device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.device)
    }

    /// Check out block `block_no`, loading it from disk on a miss. Blocks
    /// until no one else holds it.
    pub fn acquire(&self, block_no: usize) -> Block<'_> {
        loop {
            let mut state = self.state();
            if let Some(&slot) = state.index.get(&block_no) {
                let entry = state.slot(slot);
                let guard = if entry.acquired {
                    None
                } else {
                    entry.buf.try_lock_arc()
                };
                let Some(guard) = guard else {
                    // held elsewhere: sleep on its lock, then look it up
                    // again since it may have been evicted meanwhile
                    let buf = Arc::clone(&entry.buf);
                    drop(state);
                    drop(buf.lock());
                    continue;
                };
                entry.acquired = true;
                state.touch(slot);
                drop(state);
                return self.checked_out(slot, block_no, guard);
            }

            state.evict(self.threshold);
            let buf = Arc::new(Mutex::new(BlockBuf {
                data: [0; BSIZE],
                valid: false,
            }));
            let guard = buf.lock_arc();
            let slot = state.insert(Slot {
                block_no,
                acquired: true,
                pinned: false,
                buf,
            });
            drop(state);
            return self.checked_out(slot, block_no, guard);
        }
    }

    fn checked_out(
        &self,
        slot: usize,
        block_no: usize,
        mut guard: ArcMutexGuard<RawMutex, BlockBuf>,
    ) -> Block<'_> {
        if !guard.valid {
            self.device.read_block(block_no, &mut guard.data);
            guard.valid = true;
        }
        Block {
            cache: self,
            slot,
            block_no,
            guard: Some(guard),
        }
    }

    /// Same as dropping the block.
    pub fn release(&self, block: Block<'_>) {
        drop(block);
    }

    /// With a transaction, log the block and pin it until the commit;
    /// without one, write it to the device now.
    pub fn sync(&self, ctx: Option<&mut OpContext>, block: &Block<'_>) {
        match ctx {
            Some(ctx) => {
                if self.log.log_write(ctx, block.block_no) {
                    self.set_pinned(block, true);
                }
            }
            None => self.device.write_block(block.block_no, block.data()),
        }
    }

    pub fn set_pinned(&self, block: &Block<'_>, pinned: bool) {
        self.state().slot(block.slot).pinned = pinned;
    }

    pub fn get_num_cached_blocks(&self) -> usize {
        self.state().index.len()
    }

    pub fn begin_op(&self) -> OpContext {
        self.log.begin_op()
    }

    pub fn end_op(&self, ctx: OpContext) {
        self.log.end_op(self, ctx)
    }

    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }

    pub fn recover(&self) -> Result<()> {
        self.log.recover(self)
    }

    /// Allocate a zeroed block.
    pub fn alloc(&self, ctx: &mut OpContext) -> usize {
        self.bitmap.alloc(self, ctx)
    }

    pub fn free(&self, ctx: &mut OpContext, block_no: usize) {
        self.bitmap.free(self, ctx, block_no)
    }

    pub fn num_free_blocks(&self) -> usize {
        self.bitmap.num_free(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;

    fn cache_with(threshold: usize) -> (Arc<MemDisk>, BlockCache) {
        let image = MemDisk::new(300);
        let params = mkfs::MkfsParams {
            num_blocks: 300,
            num_inodes: 64,
            num_log_blocks: 31,
        };
        let sb = mkfs::mkfs(&image, &params).unwrap();
        let disk = Arc::new(image.snapshot());
        let config = Config {
            eviction_threshold: threshold,
            ..Config::default()
        };
        let cache = BlockCache::new(disk.clone(), sb, &config).unwrap();
        (disk, cache)
    }

    #[test]
    fn test_acquire_loads_from_device_once() {
        let (disk, cache) = cache_with(EVICTION_THRESHOLD);
        let block_no = cache.super_block().data_start as usize + 5;
        let mut raw = [0u8; BSIZE];
        raw[7] = 42;
        disk.write_block(block_no, &raw);

        let block = cache.acquire(block_no);
        assert_eq!(block.data()[7], 42);
        drop(block);

        // later device writes are not seen through the cached copy
        disk.write_block(block_no, &[0u8; BSIZE]);
        assert_eq!(cache.acquire(block_no).data()[7], 42);
        assert_eq!(cache.get_num_cached_blocks(), 1);
    }

    #[test]
    fn test_eviction_keeps_cache_near_threshold() {
        let (_disk, cache) = cache_with(4);
        let base = cache.super_block().data_start as usize;
        for block_no in base..base + 10 {
            cache.release(cache.acquire(block_no));
        }
        assert!(cache.get_num_cached_blocks() <= 4);
    }

    #[test]
    fn test_pinned_and_held_blocks_survive_eviction() {
        let (_disk, cache) = cache_with(2);
        let base = cache.super_block().data_start as usize;

        let mut ctx = cache.begin_op();
        let mut pinned = cache.acquire(base);
        pinned.data_mut()[0] = 1;
        cache.sync(Some(&mut ctx), &pinned);
        drop(pinned);
        let held = cache.acquire(base + 1);

        for block_no in base + 2..base + 8 {
            cache.release(cache.acquire(block_no));
        }
        // both survivors plus the most recent miss
        assert_eq!(cache.get_num_cached_blocks(), 3);
        assert_eq!(held.block_no(), base + 1);
        drop(held);

        // the pinned copy was not reloaded from disk
        assert_eq!(cache.acquire(base).data()[0], 1);
        cache.end_op(ctx);
    }

    #[test]
    fn test_sync_without_transaction_writes_through() {
        let (disk, cache) = cache_with(EVICTION_THRESHOLD);
        let block_no = cache.super_block().data_start as usize + 3;
        let mut block = cache.acquire(block_no);
        block.data_mut().fill(5);
        cache.sync(None, &block);
        assert_eq!(disk.block(block_no), [5u8; BSIZE]);
    }
}
