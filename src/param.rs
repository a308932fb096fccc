use core::mem;

/// Total number of blocks on the disk.
pub const DISK_BLOCKS: usize = 8192;

/// Bytes per disk block.
pub const BLOCK_SIZE: usize = 4096;

/// Inodes in the inode table; equivalently, the maximum number of files.
pub const NINODES: usize = 64;

/// Open-file descriptor slots.
pub const NFD: usize = 32;

/// Maximum file-name length, excluding the terminator.
pub const NAME_MAX: usize = 15;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 10;

/// Block numbers held by one indirect block.
pub const NINDIRECT: usize = BLOCK_SIZE / mem::size_of::<u16>();

/// Bytes in the free-block bitmap, one bit per disk block.
pub const BITMAP_BYTES: usize = DISK_BLOCKS / 8;

/// Largest file-relative block index the addressing tree can express.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;
