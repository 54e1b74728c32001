//! A crash-consistent storage engine: block cache, write-ahead log,
//! bitmap block allocator and an inode layer with files and directories.

/// Perform a const assertion.
macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod bitmap; // free block bitmap
pub mod block_cache; // cache for block devices
pub mod block_device;
pub mod common;
pub mod config;
pub mod disk; // on-disk layout
pub mod error;
pub mod file; // open file table
pub mod fs; // file system
pub mod inode;
pub mod mkfs;
pub mod path;
pub mod trans; // write-ahead log
pub mod vfs; // FUSE front end

pub use block_cache::{Block, BlockCache};
pub use block_device::{BlockDevice, FileDisk, MemDisk};
pub use common::*;
pub use config::Config;
pub use disk::{InodeType, SuperBlock};
pub use error::{FsError, Result};
pub use file::{FileTable, OpenFlags};
pub use fs::FileSystem;
pub use inode::{Inode, InodeGuard, InodeTree, Stat};
pub use mkfs::{mkfs, MkfsParams};
pub use trans::{LogPhase, LogStats, OpContext};
