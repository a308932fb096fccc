//! Error taxonomies for both cores.
//!
//! Internal code propagates these with `?`; the flat public API converts
//! every failure to `-1` after logging it, so no error type crosses the
//! C-shaped boundary.

use std::io;

use thiserror::Error;

/// Failures of the thread-local storage core.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("calling thread already owns a storage area")]
    AlreadyExists,

    #[error("calling thread owns no storage area")]
    NoSuchArea,

    #[error("source thread owns no storage area")]
    NoSuchSource,

    #[error("cannot clone a thread's storage area into itself")]
    CloneSelf,

    #[error("offset {offset} plus length {len} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },

    #[error("page mapping failed: {0}")]
    Map(#[source] io::Error),

    #[error("page protection change failed: {0}")]
    Protect(#[source] io::Error),
}

/// Failures of the file-system core.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no file system is mounted")]
    NotMounted,

    #[error("a file system is already mounted")]
    AlreadyMounted,

    #[error("disk image does not contain a valid file system")]
    InvalidImage,

    #[error("block number {0} is outside the disk")]
    BadBlock(u32),

    #[error("file name is empty, too long, or contains NUL")]
    BadName,

    #[error("file already exists")]
    Exists,

    #[error("no such file")]
    NotFound,

    #[error("inode table is full")]
    NoInodes,

    #[error("root directory is full")]
    RootFull,

    #[error("all file descriptors are in use")]
    NoDescriptors,

    #[error("bad file descriptor")]
    BadDescriptor,

    #[error("offset is out of range")]
    BadOffset,

    #[error("cannot extend a file by truncating it")]
    BadLength,

    #[error("file is currently open")]
    Busy,

    #[error("disk I/O failed: {0}")]
    Io(#[from] io::Error),
}
