//! Inodes.
//!
//! An inode holds a file's size and the addresses of its blocks: ten
//! direct slots, one single-indirect block of `NINDIRECT` entries, and
//! one double-indirect block of single-indirect blocks. The whole table
//! lives in memory while mounted; each inode carries a dirty flag so
//! unmount writes back only what changed.
//!
//! On disk a block number of 0 means "unallocated" (block 0 holds the
//! superblock and can never be a data block). In memory the sentinel
//! becomes `Option<NonZeroU16>`.

use core::mem;
use core::num::NonZeroU16;

use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{AsBytes, FromBytes};

use crate::param::{BLOCK_SIZE, NDIRECT, NINDIRECT};

/// On-disk inode kind: anything else marks a corrupt image.
const KIND_FREE: u16 = 0;
const KIND_REGULAR: u16 = 1;

/// On-disk inode structure. repr(C) because it is the disk image format.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dinode {
    /// Size of file (bytes).
    pub size: u32,
    /// Direct data block addresses.
    pub direct: [u16; NDIRECT],
    /// Single-indirect block address.
    pub single_indirect: u16,
    /// Double-indirect block address.
    pub double_indirect: u16,
    /// KIND_FREE or KIND_REGULAR.
    pub kind: u16,
    pub _pad: u16,
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();
const_assert_eq!(DINODE_SIZE, 32);

/// Inodes per block.
pub const IPB: usize = BLOCK_SIZE / DINODE_SIZE;
// A block holds a whole number of inodes, so block-at-a-time writeback
// never splits one.
const_assert!(BLOCK_SIZE % DINODE_SIZE == 0);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeKind {
    Free,
    Regular,
}

/// In-memory copy of an inode plus its dirty flag.
#[derive(Clone, Copy)]
pub struct Inode {
    pub kind: InodeKind,
    pub size: u32,
    pub direct: [Option<NonZeroU16>; NDIRECT],
    pub single_indirect: Option<NonZeroU16>,
    pub double_indirect: Option<NonZeroU16>,
    pub dirty: bool,
}

impl Inode {
    pub const FREE: Inode = Inode {
        kind: InodeKind::Free,
        size: 0,
        direct: [None; NDIRECT],
        single_indirect: None,
        double_indirect: None,
        dirty: false,
    };

    pub fn from_dinode(dinode: &Dinode) -> Inode {
        Inode {
            kind: if dinode.kind == KIND_FREE {
                InodeKind::Free
            } else {
                InodeKind::Regular
            },
            size: dinode.size,
            direct: dinode.direct.map(NonZeroU16::new),
            single_indirect: NonZeroU16::new(dinode.single_indirect),
            double_indirect: NonZeroU16::new(dinode.double_indirect),
            dirty: false,
        }
    }

    pub fn to_dinode(&self) -> Dinode {
        Dinode {
            size: self.size,
            direct: self.direct.map(|slot| slot.map_or(0, NonZeroU16::get)),
            single_indirect: self.single_indirect.map_or(0, NonZeroU16::get),
            double_indirect: self.double_indirect.map_or(0, NonZeroU16::get),
            kind: match self.kind {
                InodeKind::Free => KIND_FREE,
                InodeKind::Regular => KIND_REGULAR,
            },
            _pad: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.kind == InodeKind::Free
    }

    /// Claim a free inode for a fresh empty file.
    pub fn init_regular(&mut self) {
        *self = Inode::FREE;
        self.kind = InodeKind::Regular;
        self.dirty = true;
    }

    /// Return the inode to the free pool. The caller has already released
    /// its blocks.
    pub fn clear(&mut self) {
        *self = Inode::FREE;
        self.dirty = true;
    }
}

/// One indirect block: a dense array of block numbers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct IndirectBlock {
    entries: [u16; NINDIRECT],
}

const_assert_eq!(mem::size_of::<IndirectBlock>(), BLOCK_SIZE);

impl IndirectBlock {
    pub fn zeroed() -> IndirectBlock {
        IndirectBlock {
            entries: [0; NINDIRECT],
        }
    }

    pub fn get(&self, slot: usize) -> Option<NonZeroU16> {
        NonZeroU16::new(self.entries[slot])
    }

    pub fn set(&mut self, slot: usize, bno: u16) {
        self.entries[slot] = bno;
    }

    /// Iterate the allocated entries.
    pub fn iter_set(&self) -> impl Iterator<Item = NonZeroU16> + '_ {
        self.entries.iter().filter_map(|&bno| NonZeroU16::new(bno))
    }
}

/// Where a file-relative block index lands in the addressing tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tier {
    Direct(usize),
    Single(usize),
    Double { outer: usize, inner: usize },
}

impl Tier {
    /// Decompose `block_index`, or `None` beyond the addressable maximum.
    pub fn of(block_index: usize) -> Option<Tier> {
        if block_index < NDIRECT {
            return Some(Tier::Direct(block_index));
        }
        if block_index < NDIRECT + NINDIRECT {
            return Some(Tier::Single(block_index - NDIRECT));
        }
        let index = block_index - NDIRECT - NINDIRECT;
        let outer = index / NINDIRECT;
        if outer >= NINDIRECT {
            return None;
        }
        Some(Tier::Double {
            outer,
            inner: index % NINDIRECT,
        })
    }
}
