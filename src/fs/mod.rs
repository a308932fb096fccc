//! File system implementation. Five layers:
//!   + Disk: the file-backed block device.
//!   + Blocks: the free-block bitmap allocator.
//!   + Inodes: size plus direct/single/double-indirect block addresses.
//!   + Directory: the flat root table of names.
//!   + Descriptors: open files with per-open byte offsets.
//!
//! All metadata lives in memory while mounted. Each structure carries a
//! dirty flag; unmount writes back exactly the dirty ones and closes the
//! disk. Data and indirect blocks are written through immediately, so a
//! flushed image is self-contained.

use std::cmp;
use std::num::NonZeroU16;
use std::path::Path;

use log::{debug, error, warn};
use parking_lot::Mutex;
use zerocopy::AsBytes;

use crate::disk::Disk;
use crate::error::FsError;
use crate::param::{BLOCK_SIZE, NINODES};

mod bitmap;
mod dir;
mod file;
mod inode;
mod superblock;

use bitmap::Bitmap;
use dir::{Directory, FileName, DIR_BLOCKS};
use file::FdTable;
use inode::{Dinode, Inode, IndirectBlock, Tier, DINODE_SIZE, IPB};
use superblock::{Superblock, SUPERBLOCK_SIZE};

/// A mounted file system. Dropping it closes the disk without writing
/// anything back; use `unmount` for an orderly shutdown.
pub struct FileSystem {
    disk: Disk,
    superblock: Superblock,
    sb_dirty: bool,
    bitmap: Bitmap,
    inodes: [Inode; NINODES],
    dir: Directory,
    fds: FdTable,
}

impl FileSystem {
    /// Create a fresh empty file system on a new disk image at `path`.
    pub fn format(path: &Path) -> Result<(), FsError> {
        Disk::create(path)?;
        let disk = Disk::open(path)?;
        let superblock = Superblock::compute();

        let mut block = [0u8; BLOCK_SIZE];
        block[..SUPERBLOCK_SIZE].copy_from_slice(superblock.as_bytes());
        disk.write(0, &block)?;

        // Exactly the metadata blocks start out allocated.
        let mut bitmap = Bitmap::new();
        for bno in 0..superblock.first_data_block() {
            bitmap.set(bno);
        }
        let mut copied = 0;
        let total = bitmap.as_bytes().len();
        for i in 0..superblock.bitmap_block_count as u32 {
            block = [0u8; BLOCK_SIZE];
            let n = cmp::min(BLOCK_SIZE, total - copied);
            block[..n].copy_from_slice(&bitmap.as_bytes()[copied..copied + n]);
            disk.write(superblock.bitmap_block_offset as u32 + i, &block)?;
            copied += n;
        }

        // Zeroed inode table and root directory.
        block = [0u8; BLOCK_SIZE];
        for i in 0..superblock.inode_block_count as u32 {
            disk.write(superblock.inode_block_offset as u32 + i, &block)?;
        }
        for i in 0..DIR_BLOCKS as u32 {
            disk.write(superblock.dir_block() + i, &block)?;
        }

        debug!("fs: formatted {}", path.display());
        Ok(())
    }

    /// Load the metadata of the file system stored at `path`.
    pub fn mount(path: &Path) -> Result<FileSystem, FsError> {
        let disk = Disk::open(path)?;
        let mut block = [0u8; BLOCK_SIZE];

        disk.read(0, &mut block)?;
        let mut superblock = Superblock::default();
        superblock
            .as_bytes_mut()
            .copy_from_slice(&block[..SUPERBLOCK_SIZE]);
        if !superblock.is_valid() {
            return Err(FsError::InvalidImage);
        }

        let mut bitmap = Bitmap::new();
        let mut copied = 0;
        let total = bitmap.as_bytes().len();
        for i in 0..superblock.bitmap_block_count as u32 {
            disk.read(superblock.bitmap_block_offset as u32 + i, &mut block)?;
            let n = cmp::min(BLOCK_SIZE, total - copied);
            bitmap.as_bytes_mut()[copied..copied + n].copy_from_slice(&block[..n]);
            copied += n;
        }

        let mut inodes = [Inode::FREE; NINODES];
        for block_index in 0..superblock.inode_block_count as usize {
            let lo = block_index * IPB;
            if lo >= NINODES {
                break;
            }
            let hi = cmp::min(lo + IPB, NINODES);
            disk.read(
                superblock.inode_block_offset as u32 + block_index as u32,
                &mut block,
            )?;
            for (inum, inode) in inodes.iter_mut().enumerate().take(hi).skip(lo) {
                let at = (inum % IPB) * DINODE_SIZE;
                let mut dinode = Dinode::default();
                dinode
                    .as_bytes_mut()
                    .copy_from_slice(&block[at..at + DINODE_SIZE]);
                *inode = Inode::from_dinode(&dinode);
            }
        }

        disk.read(superblock.dir_block(), &mut block)?;
        let dir = Directory::load(&block);

        debug!("fs: mounted {}", path.display());
        Ok(FileSystem {
            disk,
            superblock,
            sb_dirty: false,
            bitmap,
            inodes,
            dir,
            fds: FdTable::new(),
        })
    }

    /// Write every dirty structure back and close the disk.
    pub fn unmount(mut self) -> Result<(), FsError> {
        self.flush()?;
        debug!("fs: unmounted");
        Ok(())
    }

    fn flush(&mut self) -> Result<(), FsError> {
        let mut block = [0u8; BLOCK_SIZE];

        if self.sb_dirty {
            block[..SUPERBLOCK_SIZE].copy_from_slice(self.superblock.as_bytes());
            self.disk.write(0, &block)?;
            self.sb_dirty = false;
        }

        if self.bitmap.dirty() {
            let total = self.bitmap.as_bytes().len();
            let mut copied = 0;
            for i in 0..self.superblock.bitmap_block_count as u32 {
                block = [0u8; BLOCK_SIZE];
                let n = cmp::min(BLOCK_SIZE, total - copied);
                block[..n].copy_from_slice(&self.bitmap.as_bytes()[copied..copied + n]);
                self.disk
                    .write(self.superblock.bitmap_block_offset as u32 + i, &block)?;
                copied += n;
            }
            self.bitmap.mark_clean();
        }

        for block_index in 0..self.superblock.inode_block_count as usize {
            let lo = block_index * IPB;
            if lo >= NINODES {
                break;
            }
            let hi = cmp::min(lo + IPB, NINODES);
            if !self.inodes[lo..hi].iter().any(|inode| inode.dirty) {
                continue;
            }
            let bno = self.superblock.inode_block_offset as u32 + block_index as u32;
            self.disk.read(bno, &mut block)?;
            for inum in lo..hi {
                if self.inodes[inum].dirty {
                    let at = (inum % IPB) * DINODE_SIZE;
                    block[at..at + DINODE_SIZE]
                        .copy_from_slice(self.inodes[inum].to_dinode().as_bytes());
                }
            }
            self.disk.write(bno, &block)?;
            for inode in &mut self.inodes[lo..hi] {
                inode.dirty = false;
            }
        }

        if self.dir.dirty() {
            block = [0u8; BLOCK_SIZE];
            self.dir.store(&mut block);
            self.disk.write(self.superblock.dir_block(), &block)?;
            self.dir.mark_clean();
        }

        Ok(())
    }

    /// Create an empty file named `name` in the root directory.
    pub fn create(&mut self, name: &str) -> Result<(), FsError> {
        let name = FileName::new(name)?;
        if self.dir.lookup(&name).is_some() {
            return Err(FsError::Exists);
        }
        let inum = self
            .inodes
            .iter()
            .position(Inode::is_free)
            .ok_or(FsError::NoInodes)?;
        // The directory slot is claimed first, so a full root leaves the
        // inode table untouched.
        self.dir.insert(&name, inum as u8)?;
        self.inodes[inum].init_regular();
        Ok(())
    }

    /// Remove `name` and free every block it references. Fails while any
    /// descriptor is open on the file.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        let name = FileName::new(name)?;
        let (slot, inum) = self.dir.lookup(&name).ok_or(FsError::NotFound)?;
        if self.fds.any_open(inum) {
            return Err(FsError::Busy);
        }
        let ino = inum as usize;
        for i in 0..self.inodes[ino].direct.len() {
            if let Some(bno) = self.inodes[ino].direct[i] {
                self.bitmap.free(bno.get());
            }
        }
        if let Some(bno) = self.inodes[ino].single_indirect {
            self.free_single_chain(bno.get())?;
        }
        if let Some(bno) = self.inodes[ino].double_indirect {
            self.free_double_chain(bno.get())?;
        }
        self.inodes[ino].clear();
        self.dir.remove(slot);
        Ok(())
    }

    /// Open `name`, returning a descriptor with offset 0.
    pub fn open(&mut self, name: &str) -> Result<i32, FsError> {
        let name = FileName::new(name)?;
        let (_, inum) = self.dir.lookup(&name).ok_or(FsError::NotFound)?;
        self.fds.alloc(inum)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), FsError> {
        self.fds.close(fd)
    }

    /// Read up to `buf.len()` bytes at the descriptor's offset. Returns 0
    /// at or past end of file.
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        let open = *self.fds.get(fd)?;
        let inum = open.inum as usize;
        let size = self.inodes[inum].size as usize;
        let mut pos = open.offset as usize;
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = cmp::min(buf.len(), size - pos);
        let mut block = [0u8; BLOCK_SIZE];
        let mut done = 0;
        while done < want {
            let (bidx, in_block) = (pos / BLOCK_SIZE, pos % BLOCK_SIZE);
            let n = cmp::min(want - done, BLOCK_SIZE - in_block);
            match self.map_block(inum, bidx, false)? {
                Some(bno) => {
                    self.disk.read(bno as u32, &mut block)?;
                    buf[done..done + n].copy_from_slice(&block[in_block..in_block + n]);
                }
                // Inside the size but never allocated: reads as zeros.
                None => buf[done..done + n].fill(0),
            }
            done += n;
            pos += n;
        }
        self.fds.get_mut(fd)?.offset = pos as u32;
        Ok(done)
    }

    /// Write `buf` at the descriptor's offset, extending the file as
    /// needed. When the disk fills up, returns the bytes that made it.
    pub fn write(&mut self, fd: i32, buf: &[u8]) -> Result<usize, FsError> {
        let open = *self.fds.get(fd)?;
        let inum = open.inum as usize;
        let mut pos = open.offset as usize;
        let mut block = [0u8; BLOCK_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let (bidx, in_block) = (pos / BLOCK_SIZE, pos % BLOCK_SIZE);
            let n = cmp::min(buf.len() - done, BLOCK_SIZE - in_block);
            let bno = match self.map_block(inum, bidx, true) {
                Ok(Some(bno)) => bno,
                Ok(None) => {
                    warn!("fs: out of blocks after writing {done} bytes");
                    break;
                }
                Err(err) if done > 0 => {
                    error!("fs: write stopped early: {err}");
                    break;
                }
                Err(err) => return Err(err),
            };
            let result = self.disk.read(bno as u32, &mut block).and_then(|()| {
                block[in_block..in_block + n].copy_from_slice(&buf[done..done + n]);
                self.disk.write(bno as u32, &block)
            });
            match result {
                Ok(()) => {}
                Err(err) if done > 0 => {
                    error!("fs: write stopped early: {err}");
                    break;
                }
                Err(err) => return Err(err),
            }
            done += n;
            pos += n;
        }
        if pos as u32 > self.inodes[inum].size {
            self.inodes[inum].size = pos as u32;
            self.inodes[inum].dirty = true;
        }
        self.fds.get_mut(fd)?.offset = pos as u32;
        Ok(done)
    }

    /// Move the descriptor's offset. The valid range is `0..=size`.
    pub fn seek(&mut self, fd: i32, offset: i64) -> Result<(), FsError> {
        let inum = self.fds.get(fd)?.inum as usize;
        if offset < 0 || offset as u64 > self.inodes[inum].size as u64 {
            return Err(FsError::BadOffset);
        }
        self.fds.get_mut(fd)?.offset = offset as u32;
        Ok(())
    }

    /// Shrink the file to `length` bytes; extending is not possible.
    pub fn truncate(&mut self, fd: i32, length: i64) -> Result<(), FsError> {
        let inum = self.fds.get(fd)?.inum as usize;
        if length < 0 || length as u64 > self.inodes[inum].size as u64 {
            return Err(FsError::BadLength);
        }
        let length = length as u32;
        let keep = (length as usize).div_ceil(BLOCK_SIZE);

        for i in keep..self.inodes[inum].direct.len() {
            if let Some(bno) = self.inodes[inum].direct[i].take() {
                self.bitmap.free(bno.get());
                self.inodes[inum].dirty = true;
            }
        }
        // The indirect chains are freed only once every surviving block is
        // a direct one; a partially live chain is kept whole.
        if keep <= self.inodes[inum].direct.len() {
            if let Some(bno) = self.inodes[inum].single_indirect.take() {
                self.free_single_chain(bno.get())?;
                self.inodes[inum].dirty = true;
            }
            if let Some(bno) = self.inodes[inum].double_indirect.take() {
                self.free_double_chain(bno.get())?;
                self.inodes[inum].dirty = true;
            }
        }
        if self.inodes[inum].size != length {
            self.inodes[inum].size = length;
            self.inodes[inum].dirty = true;
        }
        let open = self.fds.get_mut(fd)?;
        if open.offset > length {
            open.offset = length;
        }
        Ok(())
    }

    /// Current size of the open file.
    pub fn filesize(&self, fd: i32) -> Result<usize, FsError> {
        let inum = self.fds.get(fd)?.inum as usize;
        Ok(self.inodes[inum].size as usize)
    }

    /// Fresh copies of every file name in the root directory.
    pub fn list_files(&self) -> Vec<String> {
        self.dir.names()
    }

    /// Allocate a zeroed block, or `None` when the disk is full.
    fn alloc_block(&mut self) -> Result<Option<u16>, FsError> {
        let Some(bno) = self.bitmap.alloc() else {
            return Ok(None);
        };
        if let Err(err) = self.disk.write(bno as u32, &[0u8; BLOCK_SIZE]) {
            self.bitmap.free(bno);
            return Err(err);
        }
        Ok(Some(bno))
    }

    fn read_indirect(&self, bno: u16) -> Result<IndirectBlock, FsError> {
        let mut block = [0u8; BLOCK_SIZE];
        self.disk.read(bno as u32, &mut block)?;
        let mut indirect = IndirectBlock::zeroed();
        indirect.as_bytes_mut().copy_from_slice(&block);
        Ok(indirect)
    }

    fn write_indirect(&self, bno: u16, indirect: &IndirectBlock) -> Result<(), FsError> {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(indirect.as_bytes());
        self.disk.write(bno as u32, &block)
    }

    /// Translate a file-relative block index into a disk block number.
    /// With `alloc`, missing data blocks and missing indirect container
    /// blocks are allocated and zeroed on demand; `Ok(None)` then means
    /// the disk is full. Without `alloc`, `Ok(None)` means "not there".
    fn map_block(
        &mut self,
        inum: usize,
        block_index: usize,
        alloc: bool,
    ) -> Result<Option<u16>, FsError> {
        let Some(tier) = Tier::of(block_index) else {
            return Ok(None);
        };
        match tier {
            Tier::Direct(i) => {
                if let Some(bno) = self.inodes[inum].direct[i] {
                    return Ok(Some(bno.get()));
                }
                if !alloc {
                    return Ok(None);
                }
                let Some(bno) = self.alloc_block()? else {
                    return Ok(None);
                };
                self.inodes[inum].direct[i] = NonZeroU16::new(bno);
                self.inodes[inum].dirty = true;
                Ok(Some(bno))
            }
            Tier::Single(i) => {
                let container = match self.inodes[inum].single_indirect {
                    Some(bno) => bno.get(),
                    None => {
                        if !alloc {
                            return Ok(None);
                        }
                        let Some(bno) = self.alloc_block()? else {
                            return Ok(None);
                        };
                        self.inodes[inum].single_indirect = NonZeroU16::new(bno);
                        self.inodes[inum].dirty = true;
                        bno
                    }
                };
                self.map_slot(container, i, alloc)
            }
            Tier::Double { outer, inner } => {
                let container = match self.inodes[inum].double_indirect {
                    Some(bno) => bno.get(),
                    None => {
                        if !alloc {
                            return Ok(None);
                        }
                        let Some(bno) = self.alloc_block()? else {
                            return Ok(None);
                        };
                        self.inodes[inum].double_indirect = NonZeroU16::new(bno);
                        self.inodes[inum].dirty = true;
                        bno
                    }
                };
                let mut outer_block = self.read_indirect(container)?;
                let single = match outer_block.get(outer) {
                    Some(bno) => bno.get(),
                    None => {
                        if !alloc {
                            return Ok(None);
                        }
                        let Some(bno) = self.alloc_block()? else {
                            return Ok(None);
                        };
                        outer_block.set(outer, bno);
                        self.write_indirect(container, &outer_block)?;
                        bno
                    }
                };
                self.map_slot(single, inner, alloc)
            }
        }
    }

    /// Resolve one slot of an indirect container block.
    fn map_slot(&mut self, container: u16, slot: usize, alloc: bool) -> Result<Option<u16>, FsError> {
        let mut indirect = self.read_indirect(container)?;
        if let Some(bno) = indirect.get(slot) {
            return Ok(Some(bno.get()));
        }
        if !alloc {
            return Ok(None);
        }
        let Some(bno) = self.alloc_block()? else {
            return Ok(None);
        };
        indirect.set(slot, bno);
        self.write_indirect(container, &indirect)?;
        Ok(Some(bno))
    }

    /// Free a single-indirect chain: every data block it names, then the
    /// container itself.
    fn free_single_chain(&mut self, container: u16) -> Result<(), FsError> {
        let indirect = self.read_indirect(container)?;
        for bno in indirect.iter_set() {
            self.bitmap.free(bno.get());
        }
        self.bitmap.free(container);
        Ok(())
    }

    /// Free a double-indirect chain: every single-indirect chain it names,
    /// then the container itself.
    fn free_double_chain(&mut self, container: u16) -> Result<(), FsError> {
        let outer = self.read_indirect(container)?;
        for single in outer.iter_set() {
            self.free_single_chain(single.get())?;
        }
        self.bitmap.free(container);
        Ok(())
    }
}

/// The flat API keeps one mounted file system for the whole process.
static MOUNTED: Mutex<Option<FileSystem>> = Mutex::new(None);

fn status(result: Result<(), FsError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            error!("fs: {err}");
            -1
        }
    }
}

fn count(result: Result<usize, FsError>) -> i32 {
    match result {
        Ok(n) => n as i32,
        Err(err) => {
            error!("fs: {err}");
            -1
        }
    }
}

fn with_mounted<T>(op: impl FnOnce(&mut FileSystem) -> Result<T, FsError>) -> Result<T, FsError> {
    let mut mounted = MOUNTED.lock();
    let fs = mounted.as_mut().ok_or(FsError::NotMounted)?;
    op(fs)
}

/// Create a fresh file system on a new disk image named `name`.
pub fn make_fs(name: &str) -> i32 {
    status(FileSystem::format(Path::new(name)))
}

/// Mount the file system stored in the disk image named `name`.
pub fn mount_fs(name: &str) -> i32 {
    let mut mounted = MOUNTED.lock();
    if mounted.is_some() {
        error!("fs: {}", FsError::AlreadyMounted);
        return -1;
    }
    match FileSystem::mount(Path::new(name)) {
        Ok(fs) => {
            *mounted = Some(fs);
            0
        }
        Err(err) => {
            error!("fs: {err}");
            -1
        }
    }
}

/// Write back all dirty state and release the mounted file system.
pub fn umount_fs(name: &str) -> i32 {
    let taken = MOUNTED.lock().take();
    match taken {
        Some(fs) => {
            debug!("fs: unmounting {name}");
            status(fs.unmount())
        }
        None => {
            error!("fs: {}", FsError::NotMounted);
            -1
        }
    }
}

pub fn fs_create(name: &str) -> i32 {
    status(with_mounted(|fs| fs.create(name)))
}

pub fn fs_delete(name: &str) -> i32 {
    status(with_mounted(|fs| fs.delete(name)))
}

pub fn fs_open(name: &str) -> i32 {
    match with_mounted(|fs| fs.open(name)) {
        Ok(fd) => fd,
        Err(err) => {
            error!("fs: {err}");
            -1
        }
    }
}

pub fn fs_close(fd: i32) -> i32 {
    status(with_mounted(|fs| fs.close(fd)))
}

pub fn fs_read(fd: i32, buf: &mut [u8]) -> i32 {
    count(with_mounted(|fs| fs.read(fd, buf)))
}

pub fn fs_write(fd: i32, buf: &[u8]) -> i32 {
    count(with_mounted(|fs| fs.write(fd, buf)))
}

pub fn fs_lseek(fd: i32, offset: i64) -> i32 {
    status(with_mounted(|fs| fs.seek(fd, offset)))
}

pub fn fs_truncate(fd: i32, length: i64) -> i32 {
    status(with_mounted(|fs| fs.truncate(fd, length)))
}

pub fn fs_get_filesize(fd: i32) -> i32 {
    count(with_mounted(|fs| fs.filesize(fd)))
}

/// Fill `files` with fresh copies of every file name.
pub fn fs_listfiles(files: &mut Vec<String>) -> i32 {
    status(with_mounted(|fs| {
        *files = fs.list_files();
        Ok(())
    }))
}
