use super::*;

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;

/// Synchronous whole-block device. Device errors are not part of the
/// contract: an implementation halts instead of returning them.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: usize, buf: &mut [u8]);
    fn write_block(&self, blockno: usize, buf: &[u8]);
}

/// Disk image stored in a regular file.
pub struct FileDisk {
    file: File,
}

impl FileDisk {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Self::new(file))
    }

    pub fn num_blocks(&self) -> Result<usize> {
        Ok(self.file.metadata()?.len() as usize / BSIZE)
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), BSIZE);
        if let Err(err) = self.file.read_exact_at(buf, (blockno * BSIZE) as u64) {
            panic!("read block {blockno}: {err}");
        }
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) {
        assert_eq!(buf.len(), BSIZE);
        if let Err(err) = self.file.write_all_at(buf, (blockno * BSIZE) as u64) {
            panic!("write block {blockno}: {err}");
        }
    }
}

struct MemDiskState {
    blocks: Vec<[u8; BSIZE]>,
    /// writes issued so far, persisted or not
    writes: usize,
    writes_per_block: HashMap<usize, usize>,
    /// writes numbered above this are dropped
    frozen_at: Option<usize>,
}

/// RAM disk for tests. Counts writes and can simulate a power cut: after
/// `freeze_after(n)` only the next `n` writes reach the medium.
pub struct MemDisk {
    state: Mutex<MemDiskState>,
}

impl MemDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self::with_blocks(vec![[0u8; BSIZE]; num_blocks])
    }

    fn with_blocks(blocks: Vec<[u8; BSIZE]>) -> Self {
        Self {
            state: Mutex::new(MemDiskState {
                blocks,
                writes: 0,
                writes_per_block: HashMap::new(),
                frozen_at: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemDiskState> {
        self.state.lock()
    }

    pub fn num_blocks(&self) -> usize {
        self.state().blocks.len()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn writes_to(&self, blockno: usize) -> usize {
        self.state()
            .writes_per_block
            .get(&blockno)
            .copied()
            .unwrap_or(0)
    }

    /// Let `n` more writes through, then drop every later one.
    pub fn freeze_after(&self, n: usize) {
        let mut state = self.state();
        state.frozen_at = Some(state.writes + n);
    }

    pub fn is_frozen(&self) -> bool {
        let state = self.state();
        state.frozen_at.is_some_and(|limit| state.writes >= limit)
    }

    /// A fresh disk holding what had reached the medium, as seen after a
    /// reboot.
    pub fn snapshot(&self) -> MemDisk {
        MemDisk::with_blocks(self.state().blocks.clone())
    }

    /// Raw copy of one persisted block.
    pub fn block(&self, blockno: usize) -> [u8; BSIZE] {
        self.state().blocks[blockno]
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) {
        let state = self.state();
        assert!(blockno < state.blocks.len(), "read past end: {blockno}");
        buf.copy_from_slice(&state.blocks[blockno]);
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) {
        let mut state = self.state();
        assert!(blockno < state.blocks.len(), "write past end: {blockno}");
        state.writes += 1;
        *state.writes_per_block.entry(blockno).or_insert(0) += 1;
        if state.frozen_at.is_some_and(|limit| state.writes > limit) {
            return;
        }
        state.blocks[blockno].copy_from_slice(buf);
    }
}
