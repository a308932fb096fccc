//! User-level systems services: copy-on-write thread-local storage backed
//! by protection-trapped pages, and a small persistent file system with
//! direct, single-indirect, and double-indirect block addressing.
//!
//! Both cores expose a flat integer-returning API (`tls_*`, `fs_*`,
//! `make_fs`/`mount_fs`/`umount_fs`): non-negative on success, -1 on any
//! failure. The file-system core is also usable as an owned
//! [`FileSystem`] value, one per disk image.

#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

mod disk;
mod error;
mod fs;
mod page;
mod param;
mod tls;
mod trap;

pub use disk::Disk;
pub use error::{FsError, TlsError};
pub use fs::{
    fs_close, fs_create, fs_delete, fs_get_filesize, fs_listfiles, fs_lseek, fs_open, fs_read,
    fs_truncate, fs_write, make_fs, mount_fs, umount_fs, FileSystem,
};
pub use param::{BLOCK_SIZE, DISK_BLOCKS, NAME_MAX, NFD, NINODES};
pub use tls::{tls_clone, tls_create, tls_destroy, tls_read, tls_write, ThreadId};
