use super::*;
use block_cache::BlockCache;
use block_device::BlockDevice;
use disk::{InodeType, SuperBlock, SUPER_BLOCK_NO};
use error::FsError;
use inode::{Inode, InodeTree};
use trans::{LogStats, OpContext};

use log::info;
use std::sync::Arc;

/// A mounted file system: the block cache with its log and allocator, and
/// the inode tree on top.
pub struct FileSystem {
    sb: SuperBlock,
    config: Config,
    cache: Arc<BlockCache>,
    inodes: InodeTree,
}

impl FileSystem {
    /// Mount the image on `device`, replaying its log first.
    pub fn open(device: Arc<dyn BlockDevice>, config: Config) -> Result<Self> {
        let sb = Self::read_super_block(device.as_ref())?;
        Self::mount(device, sb, config)
    }

    /// Like `open`, for a device of `device_blocks` blocks: an image
    /// claiming more blocks than that is refused before recovery touches it.
    pub fn open_sized(
        device: Arc<dyn BlockDevice>,
        device_blocks: usize,
        config: Config,
    ) -> Result<Self> {
        if device_blocks <= SUPER_BLOCK_NO {
            return Err(FsError::Format(format!(
                "device of {device_blocks} blocks has no super block"
            )));
        }
        let sb = Self::read_super_block(device.as_ref())?;
        if sb.num_blocks as usize > device_blocks {
            return Err(FsError::Format(format!(
                "image claims {} blocks, the device holds {device_blocks}",
                sb.num_blocks
            )));
        }
        Self::mount(device, sb, config)
    }

    fn read_super_block(device: &dyn BlockDevice) -> Result<SuperBlock> {
        let mut buf = [0u8; BSIZE];
        device.read_block(SUPER_BLOCK_NO, &mut buf);
        SuperBlock::decode(&buf)
    }

    fn mount(device: Arc<dyn BlockDevice>, sb: SuperBlock, config: Config) -> Result<Self> {
        let cache = Arc::new(BlockCache::new(device, sb, &config)?);
        let inodes = InodeTree::new(Arc::clone(&cache), config.inode_cache_capacity);
        info!(
            "mounted: {} blocks, {} inodes, log of {} slots",
            sb.num_blocks,
            sb.num_inodes,
            cache.log_stats().log_size
        );
        Ok(Self {
            sb,
            config,
            cache,
            inodes,
        })
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn inodes(&self) -> &InodeTree {
        &self.inodes
    }

    pub fn begin_op(&self) -> OpContext {
        self.cache.begin_op()
    }

    pub fn end_op(&self, ctx: OpContext) {
        self.cache.end_op(ctx)
    }

    /// Run `f` inside one transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut OpContext) -> T) -> T {
        let mut ctx = self.begin_op();
        let out = f(&mut ctx);
        self.end_op(ctx);
        out
    }

    /// Write `buf` to `inode` at `offset`, one transaction per
    /// `FILE_WRITE_CHUNK` bytes so no transaction outgrows its log budget.
    /// A failing chunk stops the write; earlier chunks stay written.
    pub fn write_inode(&self, inode: &Arc<Inode>, buf: &[u8], offset: usize) -> Result<usize> {
        let mut done = 0;
        for chunk in buf.chunks(FILE_WRITE_CHUNK) {
            done += self.transaction(|ctx| {
                let mut guard = self.inodes.lock(inode);
                self.inodes.write(ctx, &mut guard, chunk, offset + done)
            })?;
        }
        Ok(done)
    }

    /// Set the length of a regular file, zero-filling when it grows.
    pub fn resize(&self, inode: &Arc<Inode>, size: usize) -> Result<()> {
        let (typ, current) = {
            let guard = self.inodes.lock(inode);
            (guard.typ(), guard.num_bytes())
        };
        if typ == InodeType::Directory {
            return Err(FsError::IsDirectory);
        }
        if size <= current {
            return self.transaction(|ctx| {
                let mut guard = self.inodes.lock(inode);
                self.inodes.truncate(ctx, &mut guard, size)
            });
        }
        if size > INODE_MAX_BYTES {
            return Err(FsError::FileTooLarge);
        }
        let zeroes = vec![0u8; size - current];
        self.write_inode(inode, &zeroes, current).map(drop)
    }

    pub fn log_stats(&self) -> LogStats {
        self.cache.log_stats()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.cache.num_free_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;

    fn fs() -> FileSystem {
        let image = MemDisk::new(1000);
        let params = mkfs::MkfsParams {
            num_blocks: 1000,
            num_inodes: 64,
            num_log_blocks: 31,
        };
        mkfs::mkfs(&image, &params).unwrap();
        FileSystem::open(Arc::new(image), Config::default()).unwrap()
    }

    #[test]
    fn test_open_rejects_unformatted_device() {
        let blank: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(100));
        assert!(matches!(
            FileSystem::open(blank, Config::default()),
            Err(FsError::Format(_))
        ));
    }

    #[test]
    fn test_open_sized_refuses_truncated_image() {
        let image = MemDisk::new(1000);
        let params = mkfs::MkfsParams {
            num_blocks: 1000,
            num_inodes: 64,
            num_log_blocks: 31,
        };
        mkfs::mkfs(&image, &params).unwrap();
        let disk = Arc::new(image.snapshot());

        for device_blocks in [1, 999] {
            assert!(matches!(
                FileSystem::open_sized(disk.clone(), device_blocks, Config::default()),
                Err(FsError::Format(_))
            ));
        }
        assert_eq!(disk.write_count(), 0);
        assert!(FileSystem::open_sized(disk, 1000, Config::default()).is_ok());
    }

    #[test]
    fn test_resize_grows_with_zeroes_and_shrinks() {
        let fs = fs();
        let tree = fs.inodes();
        let inode = fs.transaction(|ctx| {
            let root = tree.get(ROOT_INODE_NO);
            let file = tree.create(ctx, &root, "f", InodeType::Regular, 0, 0);
            tree.put(ctx, root);
            file.unwrap()
        });
        assert_eq!(fs.write_inode(&inode, b"abc", 0).unwrap(), 3);

        fs.resize(&inode, 4 * BSIZE).unwrap();
        let mut buf = vec![1u8; 4 * BSIZE];
        assert_eq!(tree.read(&mut tree.lock(&inode), &mut buf, 0), 4 * BSIZE);
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..].iter().all(|&b| b == 0));

        fs.resize(&inode, 2).unwrap();
        assert_eq!(tree.lock(&inode).num_bytes(), 2);
        assert!(matches!(
            fs.resize(&inode, INODE_MAX_BYTES + 1),
            Err(FsError::FileTooLarge)
        ));

        let root = fs.transaction(|ctx| fs.namei(ctx, None, "/")).unwrap();
        assert!(matches!(fs.resize(&root, 0), Err(FsError::IsDirectory)));
        fs.transaction(|ctx| {
            tree.put(ctx, root);
            tree.put(ctx, inode);
        });
    }
}
