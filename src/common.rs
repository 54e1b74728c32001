use super::*;
use disk::{DirEntry, InodeEntry};

use std::mem::size_of;

pub const FSMAGIC: u32 = 0x10203040;

/// block size
pub const BSIZE: usize = 512;

/// root i-number
pub const ROOT_INODE_NO: usize = 1;

/// direct blocks in inode
pub const INODE_NUM_DIRECT: usize = 12;

/// block numbers held by the indirect block
pub const INODE_NUM_INDIRECT: usize = BSIZE / size_of::<u32>();

/// max # of blocks a file can have
pub const INODE_MAX_BLOCKS: usize = INODE_NUM_DIRECT + INODE_NUM_INDIRECT;

/// max file size in bytes
pub const INODE_MAX_BYTES: usize = INODE_MAX_BLOCKS * BSIZE;

/// size of an on-disk inode
pub const INODE_SIZE: usize = 64;
const_assert!(size_of::<InodeEntry>() <= INODE_SIZE);

/// inodes per block
pub const INODE_PER_BLOCK: usize = BSIZE / INODE_SIZE;

/// bitmap bits per block
pub const BIT_PER_BLOCK: usize = BSIZE * 8;

/// Directory is a file containing a sequence of dirent structures.
pub const FILE_NAME_MAX_LENGTH: usize = 14;

/// size of an on-disk directory entry
pub const DIR_ENTRY_SIZE: usize = 16;
const_assert!(size_of::<DirEntry>() == DIR_ENTRY_SIZE);
const_assert!(BSIZE % DIR_ENTRY_SIZE == 0);

/// max # of blocks any FS op writes
pub const OP_MAX_NUM_BLOCKS: usize = 10;

/// max # of block numbers the log header can record
pub const LOG_MAX_SIZE: usize = (BSIZE - size_of::<u32>()) / size_of::<u32>();

/// cached blocks kept before eviction kicks in
pub const EVICTION_THRESHOLD: usize = 20;

/// unreferenced in-memory inodes kept around
pub const INODE_CACHE_CAPACITY: usize = 50;

/// open files per file table
pub const NFILE: usize = 100;

/// bytes a single transaction of the file layer may write
pub const FILE_WRITE_CHUNK: usize = (OP_MAX_NUM_BLOCKS - 1 - 1 - 2) / 2 * BSIZE;
