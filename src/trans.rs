//! Write-ahead log. A typical use is:
//!   let mut ctx = cache.begin_op();
//!   let mut block = cache.acquire(block_no);
//!   modify block.data_mut()
//!   cache.sync(Some(&mut ctx), &block);
//!   drop(block);
//!   cache.end_op(ctx);
//!
//! The last transaction to end commits every block logged by the batch:
//! home blocks are copied into the log region, the header is written (the
//! commit point), then the log is installed into the home locations and
//! the header is cleared.

use super::*;
use block_cache::BlockCache;
use block_device::BlockDevice;
use disk::LogHeader;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::Range;
use std::sync::Arc;

/// Transaction handle, one per open file system operation.
///
/// Only `begin_op` creates one and only `end_op` consumes it, so a
/// transaction cannot be ended twice.
#[must_use = "a transaction must be ended with end_op"]
#[derive(Debug)]
pub struct OpContext {
    /// log slots this operation may still claim
    rm: usize,
    ended: bool,
}

impl OpContext {
    pub fn remaining(&self) -> usize {
        self.rm
    }
}

impl Drop for OpContext {
    fn drop(&mut self) {
        if !self.ended && !std::thread::panicking() {
            warn!("transaction dropped without end_op, the log will never commit");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPhase {
    Idle,
    /// transactions open
    Batching(usize),
    /// copying home blocks into the log region
    Committing,
    /// copying the log region back home
    Installing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub phase: LogPhase,
    pub log_used: usize,
    pub log_size: usize,
    pub outstanding: usize,
    /// batches committed since mount
    pub commits: u64,
    /// home blocks written by installation since mount, recovery included
    pub installed_blocks: u64,
}

struct LogState {
    header: LogHeader,
    /// slots reserved by open transactions or held by logged blocks
    log_used: usize,
    /// how many FS sys calls are executing.
    outstanding: usize,
    phase: LogPhase,
    commits: u64,
    installed_blocks: u64,
}

pub struct LogManager {
    /// block number of the log header
    start: usize,
    size: usize,
    /// blocks a logged copy may be installed into
    homes: Range<usize>,
    device: Arc<dyn BlockDevice>,
    state: Mutex<LogState>,
    /// signalled when slots are given back
    begin: Condvar,
    /// signalled when a batch has been installed
    end: Condvar,
}

impl LogManager {
    pub fn new(
        start: usize,
        size: usize,
        homes: Range<usize>,
        device: Arc<dyn BlockDevice>,
    ) -> Self {
        assert!(size <= LOG_MAX_SIZE);
        assert!(size >= OP_MAX_NUM_BLOCKS, "log of {size} slots cannot hold one transaction");
        Self {
            start,
            size,
            homes,
            device,
            state: Mutex::new(LogState {
                header: LogHeader::default(),
                log_used: 0,
                outstanding: 0,
                phase: LogPhase::Idle,
                commits: 0,
                installed_blocks: 0,
            }),
            begin: Condvar::new(),
            end: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn read_head(&self) -> Result<LogHeader> {
        let mut buf = [0u8; BSIZE];
        self.device.read_block(self.start, &mut buf);
        LogHeader::decode(&buf, self.size, self.homes.clone())
    }

    fn write_head(&self, header: &LogHeader) {
        self.device.write_block(self.start, &header.encode());
    }

    /// Replay a batch that committed but may not have been installed.
    /// Replaying an already-installed batch writes the same content again.
    pub fn recover(&self, cache: &BlockCache) -> Result<()> {
        let header = self.read_head()?;
        if header.is_empty() {
            return Ok(());
        }
        info!("recovering {} logged blocks", header.num_blocks());
        let mut state = self.state.lock();
        state.phase = LogPhase::Installing;
        self.install(cache, &header);
        state.installed_blocks += header.num_blocks() as u64;
        self.write_head(&LogHeader::default());
        state.phase = LogPhase::Idle;
        Ok(())
    }

    /// log blocks(disk) -> home blocks(disk), unpinning them.
    fn install(&self, cache: &BlockCache, header: &LogHeader) {
        for (i, &block_no) in header.block_no.iter().enumerate() {
            let log_block = cache.acquire(self.start + 1 + i);
            let mut home = cache.acquire(block_no);
            home.data_mut().copy_from_slice(log_block.data());
            cache.sync(None, &home);
            cache.set_pinned(&home, false);
        }
    }

    /// home blocks(mem) -> log blocks(disk).
    fn write_log(&self, cache: &BlockCache, header: &LogHeader) {
        for (i, &block_no) in header.block_no.iter().enumerate() {
            let home = cache.acquire(block_no);
            let mut log_block = cache.acquire(self.start + 1 + i);
            log_block.data_mut().copy_from_slice(home.data());
            cache.sync(None, &log_block);
        }
    }

    pub fn begin_op(&self) -> OpContext {
        let mut state = self.state.lock();
        while state.log_used + OP_MAX_NUM_BLOCKS > self.size {
            self.begin.wait(&mut state);
        }
        state.log_used += OP_MAX_NUM_BLOCKS;
        state.outstanding += 1;
        state.phase = LogPhase::Batching(state.outstanding);
        OpContext {
            rm: OP_MAX_NUM_BLOCKS,
            ended: false,
        }
    }

    /// Record `block_no` in the current batch. Returns true on its first
    /// appearance, when the caller must pin the block.
    pub fn log_write(&self, ctx: &mut OpContext, block_no: usize) -> bool {
        let mut state = self.state.lock();
        assert!(state.outstanding > 0, "log_write outside of transaction");
        if state.header.block_no.contains(&block_no) {
            // log absorption
            return false;
        }
        assert!(
            ctx.rm > 0,
            "transaction dirtied more than {OP_MAX_NUM_BLOCKS} blocks (block {block_no})"
        );
        assert!(state.header.num_blocks() < self.size, "log overflow");
        ctx.rm -= 1;
        state.header.block_no.push(block_no);
        true
    }

    pub fn end_op(&self, cache: &BlockCache, mut ctx: OpContext) {
        ctx.ended = true;
        let mut state = self.state.lock();
        assert!(state.outstanding > 0);
        state.log_used -= ctx.rm;
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.commit(cache, &mut state);
            state.phase = LogPhase::Idle;
            self.end.notify_all();
            self.begin.notify_all();
        } else {
            state.phase = LogPhase::Batching(state.outstanding);
            self.begin.notify_all();
            let batch = state.commits;
            while state.commits == batch {
                self.end.wait(&mut state);
            }
        }
    }

    fn commit(&self, cache: &BlockCache, state: &mut MutexGuard<'_, LogState>) {
        let header = std::mem::take(&mut state.header);
        let num_blocks = header.num_blocks();
        if num_blocks > 0 {
            state.phase = LogPhase::Committing;
            self.write_log(cache, &header);
            self.write_head(&header); // the real commit
            state.log_used -= num_blocks;

            state.phase = LogPhase::Installing;
            self.install(cache, &header);
            self.write_head(&LogHeader::default());
            state.installed_blocks += num_blocks as u64;
        }
        debug_assert_eq!(state.log_used, 0);
        state.commits += 1;
        debug!("commit #{}: {num_blocks} blocks", state.commits);
    }

    pub fn stats(&self) -> LogStats {
        let state = self.state.lock();
        LogStats {
            phase: state.phase,
            log_used: state.log_used,
            log_size: self.size,
            outstanding: state.outstanding,
            commits: state.commits,
            installed_blocks: state.installed_blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;
    use disk::{SuperBlock, SUPER_BLOCK_NO};
    use error::FsError;

    fn fresh() -> (Arc<MemDisk>, BlockCache) {
        let image = MemDisk::new(200);
        let params = mkfs::MkfsParams {
            num_blocks: 200,
            num_inodes: 32,
            num_log_blocks: 31,
        };
        let sb = mkfs::mkfs(&image, &params).unwrap();
        let disk = Arc::new(image.snapshot());
        let cache = BlockCache::new(disk.clone(), sb, &Config::default()).unwrap();
        (disk, cache)
    }

    fn data_block(sb: &SuperBlock) -> usize {
        sb.data_start as usize + 10
    }

    #[test]
    fn test_dirty_block_is_logged_once() {
        let (_disk, cache) = fresh();
        let block_no = data_block(cache.super_block());

        let mut ctx = cache.begin_op();
        for _ in 0..3 {
            let mut block = cache.acquire(block_no);
            block.data_mut()[0] += 1;
            cache.sync(Some(&mut ctx), &block);
        }
        assert_eq!(ctx.remaining(), OP_MAX_NUM_BLOCKS - 1);
        assert_eq!(cache.log_stats().log_used, OP_MAX_NUM_BLOCKS);
        cache.end_op(ctx);

        let stats = cache.log_stats();
        assert_eq!(stats.phase, LogPhase::Idle);
        assert_eq!(stats.log_used, 0);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.installed_blocks, 1);
    }

    #[test]
    fn test_empty_transaction_writes_nothing() {
        let (disk, cache) = fresh();
        let before = disk.write_count();
        let ctx = cache.begin_op();
        cache.end_op(ctx);
        assert_eq!(disk.write_count(), before);
    }

    #[test]
    fn test_commit_write_order() {
        let (disk, cache) = fresh();
        let sb = *cache.super_block();
        let block_no = data_block(&sb);
        let log_start = sb.log_start as usize;

        let mut ctx = cache.begin_op();
        let mut block = cache.acquire(block_no);
        block.data_mut().fill(0xab);
        cache.sync(Some(&mut ctx), &block);
        drop(block);
        // nothing reaches the disk before the commit
        assert_eq!(disk.writes_to(block_no), 0);
        cache.end_op(ctx);

        assert_eq!(disk.writes_to(log_start + 1), 1);
        assert_eq!(disk.writes_to(log_start), 2);
        assert_eq!(disk.writes_to(block_no), 1);
        assert_eq!(disk.block(block_no), [0xab; BSIZE]);
        assert_eq!(disk.block(log_start), LogHeader::default().encode());
    }

    #[test]
    #[should_panic(expected = "transaction dirtied more than")]
    fn test_overrunning_a_transaction_is_fatal() {
        let (_disk, cache) = fresh();
        let first = data_block(cache.super_block());
        let mut ctx = cache.begin_op();
        for block_no in first..first + OP_MAX_NUM_BLOCKS + 1 {
            let block = cache.acquire(block_no);
            cache.sync(Some(&mut ctx), &block);
        }
        cache.end_op(ctx);
    }

    #[test]
    fn test_empty_header_recovery_is_noop() {
        let (disk, cache) = fresh();
        let before = disk.write_count();
        cache.recover().unwrap();
        assert_eq!(disk.write_count(), before);
    }

    fn corrupt_header(disk: &MemDisk, sb: &SuperBlock, header: &LogHeader) -> MemDisk {
        let crashed = disk.snapshot();
        crashed.write_block(sb.log_start as usize, &header.encode());
        crashed.snapshot()
    }

    #[test]
    fn test_header_longer_than_the_log_is_rejected() {
        let (disk, cache) = fresh();
        let sb = *cache.super_block();
        let header = LogHeader {
            block_no: (0..40).map(|i| data_block(&sb) + i).collect(),
        };
        let crashed = Arc::new(corrupt_header(&disk, &sb, &header));
        assert!(matches!(
            BlockCache::new(crashed.clone(), sb, &Config::default()),
            Err(FsError::Format(_))
        ));
        assert_eq!(crashed.write_count(), 0);
    }

    #[test]
    fn test_header_naming_a_block_past_the_device_is_rejected() {
        let (disk, cache) = fresh();
        let sb = *cache.super_block();
        for bad in [sb.num_blocks as usize + 4800, sb.log_start as usize + 1, SUPER_BLOCK_NO] {
            let header = LogHeader { block_no: vec![bad] };
            let crashed = Arc::new(corrupt_header(&disk, &sb, &header));
            assert!(matches!(
                BlockCache::new(crashed.clone(), sb, &Config::default()),
                Err(FsError::Format(_))
            ));
            assert_eq!(crashed.write_count(), 0);
        }
    }
}
