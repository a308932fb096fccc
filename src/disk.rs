//! File-backed block device.
//!
//! A disk image is a plain file of exactly `DISK_BLOCKS * BLOCK_SIZE`
//! bytes. Reads and writes are whole-block and positional; the file is
//! closed when the `Disk` drops.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;

use crate::error::FsError;
use crate::param::{BLOCK_SIZE, DISK_BLOCKS};

const IMAGE_BYTES: u64 = (DISK_BLOCKS * BLOCK_SIZE) as u64;

/// An open disk image of fixed geometry.
pub struct Disk {
    image: File,
}

impl Disk {
    /// Create (or recreate) a zero-filled disk image at `path`.
    pub fn create(path: &Path) -> Result<(), FsError> {
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        image.set_len(IMAGE_BYTES)?;
        debug!(
            "disk: created {} ({} blocks of {} bytes)",
            path.display(),
            DISK_BLOCKS,
            BLOCK_SIZE
        );
        Ok(())
    }

    /// Open an existing disk image, rejecting files of the wrong geometry.
    pub fn open(path: &Path) -> Result<Disk, FsError> {
        let image = OpenOptions::new().read(true).write(true).open(path)?;
        if image.metadata()?.len() != IMAGE_BYTES {
            return Err(FsError::InvalidImage);
        }
        Ok(Disk { image })
    }

    /// Read block `bno` into `buf`.
    pub fn read(&self, bno: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), FsError> {
        if bno as usize >= DISK_BLOCKS {
            return Err(FsError::BadBlock(bno));
        }
        self.image
            .read_exact_at(buf, bno as u64 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Write `buf` to block `bno`.
    pub fn write(&self, bno: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), FsError> {
        if bno as usize >= DISK_BLOCKS {
            return Err(FsError::BadBlock(bno));
        }
        self.image
            .write_all_at(buf, bno as u64 * BLOCK_SIZE as u64)?;
        Ok(())
    }
}
