//! Image formatter.
//!
//! Writes go straight to the device: there is no log yet to protect them.

use super::*;
use block_device::BlockDevice;
use disk::{DirEntry, InodeEntry, InodeType, SuperBlock, SUPER_BLOCK_NO};
use error::FsError;

use bitvec::prelude::*;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsParams {
    pub num_blocks: usize,
    pub num_inodes: usize,
    /// header block included
    pub num_log_blocks: usize,
}

impl Default for MkfsParams {
    fn default() -> Self {
        Self {
            num_blocks: 2000,
            num_inodes: 200,
            num_log_blocks: LOG_MAX_SIZE + 1,
        }
    }
}

/// Compute the region layout for `params`.
pub fn layout(params: &MkfsParams) -> Result<SuperBlock> {
    if params.num_log_blocks < OP_MAX_NUM_BLOCKS + 1 {
        return Err(FsError::InvalidArgument("log region cannot hold one transaction"));
    }
    if params.num_inodes <= ROOT_INODE_NO || params.num_inodes > u16::MAX as usize + 1 {
        return Err(FsError::InvalidArgument("inode count out of range"));
    }
    if params.num_blocks > u32::MAX as usize {
        return Err(FsError::InvalidArgument("too many blocks"));
    }
    let log_start = SUPER_BLOCK_NO + 1;
    let bitmap_start = log_start + params.num_log_blocks;
    let inode_start = bitmap_start + params.num_blocks.div_ceil(BIT_PER_BLOCK);
    let data_start = inode_start + params.num_inodes.div_ceil(INODE_PER_BLOCK);
    // the root directory needs one data block
    if data_start >= params.num_blocks {
        return Err(FsError::InvalidArgument("image too small for its metadata"));
    }
    Ok(SuperBlock {
        magic: FSMAGIC,
        num_blocks: params.num_blocks as u32,
        num_data_blocks: (params.num_blocks - data_start) as u32,
        num_inodes: params.num_inodes as u32,
        num_log_blocks: params.num_log_blocks as u32,
        log_start: log_start as u32,
        bitmap_start: bitmap_start as u32,
        inode_start: inode_start as u32,
        data_start: data_start as u32,
    })
}

/// Format `device` with an empty root directory.
pub fn mkfs(device: &dyn BlockDevice, params: &MkfsParams) -> Result<SuperBlock> {
    let sb = layout(params)?;
    sb.check()?;

    let zeroes = [0u8; BSIZE];
    for block_no in 0..params.num_blocks {
        device.write_block(block_no, &zeroes);
    }
    device.write_block(SUPER_BLOCK_NO, &sb.encode());

    // metadata and the root directory block are in use
    let root_block = sb.data_start as usize;
    let mut bitmap = vec![0u8; sb.num_blocks_for_bitmap() * BSIZE];
    bitmap.view_bits_mut::<Lsb0>()[..=root_block].fill(true);
    for (i, chunk) in bitmap.chunks(BSIZE).enumerate() {
        device.write_block(sb.bitmap_start as usize + i, chunk);
    }

    let mut root = InodeEntry {
        typ: InodeType::Directory,
        num_links: 1,
        num_bytes: (2 * DIR_ENTRY_SIZE) as u32,
        ..Default::default()
    };
    root.addrs[0] = root_block as u32;
    let mut block = [0u8; BSIZE];
    root.store(&mut block, ROOT_INODE_NO);
    device.write_block(sb.inode_block(ROOT_INODE_NO), &block);

    let mut block = [0u8; BSIZE];
    for (i, name) in [".", ".."].into_iter().enumerate() {
        let entry = DirEntry::new(ROOT_INODE_NO, name)?;
        block[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }
    device.write_block(root_block, &block);

    info!(
        "formatted {} blocks: log {}+{}, bitmap {}, inodes {}, data {}",
        sb.num_blocks,
        sb.log_start,
        sb.num_log_blocks,
        sb.bitmap_start,
        sb.inode_start,
        sb.data_start
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;

    #[test]
    fn test_layout_regions_are_ordered() {
        let sb = layout(&MkfsParams {
            num_blocks: 1000,
            num_inodes: 200,
            num_log_blocks: 31,
        })
        .unwrap();
        assert_eq!(sb.log_start, 2);
        assert_eq!(sb.bitmap_start, 33);
        assert_eq!(sb.inode_start, 34);
        assert_eq!(sb.data_start, 34 + 25);
        assert_eq!(sb.num_data_blocks, 1000 - 59);
        assert!(sb.check().is_ok());
    }

    #[test]
    fn test_layout_rejects_impossible_params() {
        let tiny_log = MkfsParams {
            num_log_blocks: OP_MAX_NUM_BLOCKS,
            ..MkfsParams::default()
        };
        assert!(matches!(layout(&tiny_log), Err(FsError::InvalidArgument(_))));

        let tiny_disk = MkfsParams {
            num_blocks: 40,
            ..MkfsParams::default()
        };
        assert!(layout(&tiny_disk).is_err());
    }

    #[test]
    fn test_mkfs_writes_root_directory() {
        let disk = MemDisk::new(1000);
        let params = MkfsParams {
            num_blocks: 1000,
            ..MkfsParams::default()
        };
        let sb = mkfs(&disk, &params).unwrap();
        assert_eq!(SuperBlock::decode(&disk.block(SUPER_BLOCK_NO)).unwrap(), sb);

        let root = InodeEntry::load(&disk.block(sb.inode_block(ROOT_INODE_NO)), ROOT_INODE_NO);
        assert_eq!(root.typ, InodeType::Directory);
        assert_eq!(root.num_bytes as usize, 2 * DIR_ENTRY_SIZE);

        let dir = disk.block(root.addrs[0] as usize);
        let dot = DirEntry::decode(&dir[..DIR_ENTRY_SIZE]);
        let dotdot = DirEntry::decode(&dir[DIR_ENTRY_SIZE..]);
        assert!(dot.matches(".") && dot.inode_no as usize == ROOT_INODE_NO);
        assert!(dotdot.matches("..") && dotdot.inode_no as usize == ROOT_INODE_NO);

        let bitmap = disk.block(sb.bitmap_start as usize);
        let bits = bitmap.view_bits::<Lsb0>();
        assert_eq!(bits.first_zero(), Some(sb.data_start as usize + 1));
    }
}
