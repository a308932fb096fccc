//! On-disk layout descriptor.
//!
//! Disk layout:
//! [ superblock | free bitmap | inode blocks | root directory | data blocks ]
//!
//! `format` computes the superblock for the fixed geometry and writes it
//! to block 0. The directory region is not named by a field; it starts
//! right after the inode blocks.

use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::dir::DIR_BLOCKS;
use crate::fs::inode::{DINODE_SIZE, IPB};
use crate::param::{BITMAP_BYTES, BLOCK_SIZE, NINODES};

/// Block 0 of every disk image. All fields count whole blocks.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, AsBytes, FromBytes)]
pub struct Superblock {
    /// Blocks holding the free-block bitmap.
    pub bitmap_block_count: u16,
    /// First bitmap block.
    pub bitmap_block_offset: u16,
    /// Blocks holding the inode table.
    pub inode_block_count: u16,
    /// First inode block.
    pub inode_block_offset: u16,
}

pub const SUPERBLOCK_SIZE: usize = mem::size_of::<Superblock>();
const_assert!(SUPERBLOCK_SIZE <= BLOCK_SIZE);

impl Superblock {
    /// The superblock for the fixed geometry.
    pub fn compute() -> Superblock {
        let bitmap_block_count = BITMAP_BYTES.div_ceil(BLOCK_SIZE) as u16;
        let bitmap_block_offset = 1;
        Superblock {
            bitmap_block_count,
            bitmap_block_offset,
            inode_block_count: (NINODES * DINODE_SIZE).div_ceil(BLOCK_SIZE) as u16,
            inode_block_offset: bitmap_block_offset + bitmap_block_count,
        }
    }

    /// A mounted image must describe exactly the fixed geometry.
    pub fn is_valid(&self) -> bool {
        *self == Superblock::compute()
    }

    /// Block containing inode `inum`.
    pub fn iblock(&self, inum: usize) -> u32 {
        self.inode_block_offset as u32 + (inum / IPB) as u32
    }

    /// First block of the root directory region.
    pub fn dir_block(&self) -> u32 {
        (self.inode_block_offset + self.inode_block_count) as u32
    }

    /// First data block; everything below it is metadata.
    pub fn first_data_block(&self) -> u32 {
        self.dir_block() + DIR_BLOCKS as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_geometry() {
        let sb = Superblock::compute();
        assert_eq!(sb.bitmap_block_count, 1);
        assert_eq!(sb.bitmap_block_offset, 1);
        assert_eq!(sb.inode_block_count, 1);
        assert_eq!(sb.inode_block_offset, 2);
        assert_eq!(sb.dir_block(), 3);
        assert_eq!(sb.first_data_block(), 4);
        assert!(sb.is_valid());
    }

    #[test]
    fn foreign_superblocks_are_rejected() {
        let mut sb = Superblock::compute();
        sb.inode_block_offset = 7;
        assert!(!sb.is_valid());
        assert!(!Superblock::default().is_valid());
    }

    #[test]
    fn inode_blocks_follow_the_bitmap() {
        let sb = Superblock::compute();
        assert_eq!(sb.iblock(0), 2);
        assert_eq!(sb.iblock(IPB - 1), 2);
        assert_eq!(sb.iblock(IPB), 3);
    }
}
