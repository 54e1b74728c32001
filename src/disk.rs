//! Disk layout:
//! [ boot block | super block | log header + log blocks | free bit map | inode blocks | data blocks ]
//!
//! Records are encoded with bincode's fixed-width little-endian format so
//! every record occupies exactly its `repr(C)` size on disk.

use super::*;
use error::FsError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::mem::size_of;
use std::ops::Range;

/// block number of the super block
pub const SUPER_BLOCK_NO: usize = 1;

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> T {
    bincode::deserialize(bytes).unwrap_or_else(|err| panic!("corrupt {what}: {err}"))
}

fn encode<T: Serialize>(value: &T, bytes: &mut [u8], what: &str) {
    let encoded = bincode::serialize(value).unwrap_or_else(|err| panic!("encode {what}: {err}"));
    bytes[..encoded.len()].copy_from_slice(&encoded);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    /// Must be FSMAGIC
    pub magic: u32,
    /// Size of file system image (blocks)
    pub num_blocks: u32,
    /// Number of data blocks
    pub num_data_blocks: u32,
    /// Number of inodes.
    pub num_inodes: u32,
    /// Number of log blocks, including the header
    pub num_log_blocks: u32,
    /// Block number of the log header
    pub log_start: u32,
    /// Block number of first free map block
    pub bitmap_start: u32,
    /// Block number of first inode block
    pub inode_start: u32,
    /// Block number of first data block
    pub data_start: u32,
}

impl SuperBlock {
    pub fn decode(buf: &[u8; BSIZE]) -> Result<Self> {
        let sb: SuperBlock = bincode::deserialize(&buf[..size_of::<SuperBlock>()])
            .map_err(|err| FsError::Format(format!("unreadable super block: {err}")))?;
        sb.check()?;
        Ok(sb)
    }

    pub fn encode(&self) -> [u8; BSIZE] {
        let mut buf = [0u8; BSIZE];
        encode(self, &mut buf, "super block");
        buf
    }

    /// Regions must be disjoint, big enough, and laid out as log, bitmap,
    /// inodes, data.
    pub fn check(&self) -> Result<()> {
        let bad = |msg: String| Err(FsError::Format(msg));
        if self.magic != FSMAGIC {
            return bad(format!("bad magic {:#x}", self.magic));
        }
        if (self.log_start as usize) <= SUPER_BLOCK_NO {
            return bad(format!("log starts at block {}", self.log_start));
        }
        let log_end = self
            .log_start
            .checked_add(self.num_log_blocks)
            .ok_or_else(|| FsError::Format("log region overflows".into()))?;
        if log_end != self.bitmap_start {
            return bad("log region does not end at the bitmap".into());
        }
        if self.num_log_blocks < 2 {
            return bad(format!("log region of {} blocks", self.num_log_blocks));
        }
        let bitmap_blocks = self.inode_start.checked_sub(self.bitmap_start);
        if bitmap_blocks.map_or(true, |n| (n as usize) < self.num_blocks_for_bitmap()) {
            return bad("bitmap region too small".into());
        }
        let inode_blocks = self.data_start.checked_sub(self.inode_start);
        if inode_blocks.map_or(true, |n| (n as usize) < self.num_blocks_for_inodes()) {
            return bad("inode region too small".into());
        }
        if self.data_start > self.num_blocks
            || self.num_blocks - self.data_start != self.num_data_blocks
        {
            return bad("data region does not match the block count".into());
        }
        if (self.num_inodes as usize) <= ROOT_INODE_NO {
            return bad(format!("{} inodes leave no room for root", self.num_inodes));
        }
        Ok(())
    }

    pub fn num_blocks_for_bitmap(&self) -> usize {
        (self.num_blocks as usize).div_ceil(BIT_PER_BLOCK)
    }

    pub fn num_blocks_for_inodes(&self) -> usize {
        (self.num_inodes as usize).div_ceil(INODE_PER_BLOCK)
    }

    /// block holding inode `inode_no`
    pub fn inode_block(&self, inode_no: usize) -> usize {
        self.inode_start as usize + inode_no / INODE_PER_BLOCK
    }

    /// bitmap block holding the bit of `block_no`
    pub fn bitmap_block(&self, block_no: usize) -> usize {
        self.bitmap_start as usize + block_no / BIT_PER_BLOCK
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum InodeType {
    #[default]
    Invalid = 0,
    Directory = 1,
    Regular = 2,
    Device = 3,
}

/// inode on disk
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeEntry {
    /// File type
    pub typ: InodeType,
    /// Major device number (Device only)
    pub major: u16,
    /// Minor device number (Device only)
    pub minor: u16,
    /// Number of hard links to inode in file system
    pub num_links: u16,
    /// Size of file (bytes)
    pub num_bytes: u32,
    /// Direct data block addresses
    pub addrs: [u32; INODE_NUM_DIRECT],
    /// Block of further addresses
    pub indirect: u32,
}

impl InodeEntry {
    fn offset(inode_no: usize) -> usize {
        (inode_no % INODE_PER_BLOCK) * INODE_SIZE
    }

    /// Read inode `inode_no` out of its inode block.
    pub fn load(block: &[u8; BSIZE], inode_no: usize) -> Self {
        let off = Self::offset(inode_no);
        decode(&block[off..off + INODE_SIZE], "inode entry")
    }

    /// Write inode `inode_no` into its inode block.
    pub fn store(&self, block: &mut [u8; BSIZE], inode_no: usize) {
        let off = Self::offset(inode_no);
        encode(self, &mut block[off..off + INODE_SIZE], "inode entry");
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// inode num, 0 for a free slot
    pub inode_no: u16,
    /// not nul-terminated when the name is exactly FILE_NAME_MAX_LENGTH long
    pub name: [u8; FILE_NAME_MAX_LENGTH],
}

impl DirEntry {
    pub fn new(inode_no: usize, name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > FILE_NAME_MAX_LENGTH {
            return Err(FsError::NameTooLong);
        }
        let mut entry = DirEntry {
            inode_no: inode_no as u16,
            name: [0; FILE_NAME_MAX_LENGTH],
        };
        entry.name[..bytes.len()].copy_from_slice(bytes);
        Ok(entry)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(&bytes[..DIR_ENTRY_SIZE], "directory entry")
    }

    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        encode(self, &mut buf, "directory entry");
        buf
    }

    pub fn name(&self) -> String {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_NAME_MAX_LENGTH);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    /// Fixed-length comparison, like strncmp over FILE_NAME_MAX_LENGTH bytes.
    pub fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        let len = bytes.len().min(FILE_NAME_MAX_LENGTH);
        if self.name[..len] != bytes[..len] {
            return false;
        }
        len == FILE_NAME_MAX_LENGTH || self.name[len] == 0
    }
}

/// Log header, the first block of the log region.
///
/// `block_no` is empty when nothing awaits installation; otherwise the
/// listed blocks were committed and must be replayed from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHeader {
    pub block_no: Vec<usize>,
}

impl LogHeader {
    pub fn num_blocks(&self) -> usize {
        self.block_no.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_no.is_empty()
    }

    pub fn encode(&self) -> [u8; BSIZE] {
        assert!(self.block_no.len() <= LOG_MAX_SIZE, "log header overflow");
        let mut buf = [0u8; BSIZE];
        buf[..4].copy_from_slice(&(self.block_no.len() as u32).to_le_bytes());
        for (i, &block_no) in self.block_no.iter().enumerate() {
            let off = 4 + i * 4;
            buf[off..off + 4].copy_from_slice(&(block_no as u32).to_le_bytes());
        }
        buf
    }

    /// Decode a header for a log of `capacity` slots whose blocks may only
    /// be installed into `homes`.
    pub fn decode(buf: &[u8; BSIZE], capacity: usize, homes: Range<usize>) -> Result<Self> {
        let word = |i: usize| {
            let off = i * 4;
            u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as usize
        };
        let num_blocks = word(0);
        if num_blocks > capacity.min(LOG_MAX_SIZE) {
            return Err(FsError::Format(format!(
                "log header lists {num_blocks} blocks, the log holds {capacity}"
            )));
        }
        let block_no: Vec<usize> = (1..=num_blocks).map(word).collect();
        if let Some(bad) = block_no.iter().find(|&&b| !homes.contains(&b)) {
            return Err(FsError::Format(format!(
                "log header names block {bad} outside {homes:?}"
            )));
        }
        Ok(LogHeader { block_no })
    }
}

/// `i`-th block number stored in an indirect block.
pub fn indirect_addr(block: &[u8; BSIZE], i: usize) -> u32 {
    let off = i * 4;
    u32::from_le_bytes([block[off], block[off + 1], block[off + 2], block[off + 3]])
}

pub fn set_indirect_addr(block: &mut [u8; BSIZE], i: usize, block_no: u32) {
    let off = i * 4;
    block[off..off + 4].copy_from_slice(&block_no.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_super_block() -> SuperBlock {
        SuperBlock {
            magic: FSMAGIC,
            num_blocks: 1000,
            num_data_blocks: 1000 - 46,
            num_inodes: 200,
            num_log_blocks: 18,
            log_start: 2,
            bitmap_start: 20,
            inode_start: 21,
            data_start: 46,
        }
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(bincode::serialize(&InodeEntry::default()).unwrap().len(), INODE_SIZE);
        assert_eq!(bincode::serialize(&DirEntry::default()).unwrap().len(), DIR_ENTRY_SIZE);
        assert_eq!(size_of::<SuperBlock>(), 36);
    }

    #[test]
    fn test_super_block_layout_checks() {
        let sb = sample_super_block();
        assert!(sb.check().is_ok());
        assert_eq!(SuperBlock::decode(&sb.encode()).unwrap(), sb);

        let bad_magic = SuperBlock { magic: 7, ..sb };
        assert!(matches!(bad_magic.check(), Err(FsError::Format(_))));

        let overlapping = SuperBlock { inode_start: 20, ..sb };
        assert!(overlapping.check().is_err());

        let short_data = SuperBlock { num_data_blocks: 3, ..sb };
        assert!(short_data.check().is_err());

        let huge_log = SuperBlock {
            num_log_blocks: u32::MAX,
            ..sb
        };
        assert!(matches!(huge_log.check(), Err(FsError::Format(_))));

        let inverted = SuperBlock {
            bitmap_start: 30,
            inode_start: 21,
            ..sb
        };
        assert!(matches!(inverted.check(), Err(FsError::Format(_))));
    }

    #[test]
    fn test_inode_entry_slots_do_not_overlap() {
        let mut block = [0u8; BSIZE];
        let mut a = InodeEntry {
            typ: InodeType::Regular,
            num_links: 1,
            num_bytes: 42,
            ..Default::default()
        };
        a.addrs[3] = 99;
        let b = InodeEntry {
            typ: InodeType::Directory,
            indirect: 7,
            ..Default::default()
        };
        a.store(&mut block, 9);
        b.store(&mut block, 10);
        assert_eq!(InodeEntry::load(&block, 9), a);
        assert_eq!(InodeEntry::load(&block, 10), b);
        assert_eq!(InodeEntry::load(&block, 11).typ, InodeType::Invalid);
    }

    #[test]
    #[should_panic(expected = "corrupt inode entry")]
    fn test_unknown_inode_type_is_fatal() {
        let mut block = [0u8; BSIZE];
        block[0] = 9;
        InodeEntry::load(&block, 0);
    }

    #[test]
    fn test_dir_entry_names() {
        let entry = DirEntry::new(5, "foo").unwrap();
        assert!(entry.matches("foo"));
        assert!(!entry.matches("fo"));
        assert!(!entry.matches("foo1"));
        assert_eq!(entry.name(), "foo");

        let long = DirEntry::new(5, "abcdefghijklmn").unwrap();
        assert!(long.matches("abcdefghijklmn"));
        assert_eq!(long.name(), "abcdefghijklmn");
        assert!(matches!(
            DirEntry::new(5, "abcdefghijklmno"),
            Err(FsError::NameTooLong)
        ));

        assert_eq!(DirEntry::decode(&entry.encode()), entry);
    }

    #[test]
    fn test_log_header_codec() {
        let header = LogHeader {
            block_no: vec![50, 7, 300],
        };
        let buf = header.encode();
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
        assert_eq!(LogHeader::decode(&buf, 30, 5..1000).unwrap(), header);
        assert!(LogHeader::decode(&[0u8; BSIZE], 30, 5..1000).unwrap().is_empty());

        let mut garbage = [0u8; BSIZE];
        garbage[..4].copy_from_slice(&(LOG_MAX_SIZE as u32 + 1).to_le_bytes());
        assert!(LogHeader::decode(&garbage, LOG_MAX_SIZE, 5..1000).is_err());
    }

    #[test]
    fn test_log_header_is_checked_against_the_layout() {
        let buf = LogHeader {
            block_no: vec![50, 7, 300],
        }
        .encode();
        assert!(matches!(
            LogHeader::decode(&buf, 2, 5..1000),
            Err(FsError::Format(_))
        ));
        assert!(matches!(
            LogHeader::decode(&buf, 30, 10..1000),
            Err(FsError::Format(_))
        ));
        assert!(matches!(
            LogHeader::decode(&buf, 30, 5..300),
            Err(FsError::Format(_))
        ));
    }

    #[test]
    fn test_indirect_addrs() {
        let mut block = [0u8; BSIZE];
        set_indirect_addr(&mut block, INODE_NUM_INDIRECT - 1, 1234);
        assert_eq!(indirect_addr(&block, INODE_NUM_INDIRECT - 1), 1234);
        assert_eq!(indirect_addr(&block, 0), 0);
    }
}
