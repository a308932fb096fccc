//! Page type for thread-local storage.
//!
//! A `Page` owns one anonymous private mapping of host-page length. Pages
//! are born inaccessible; the storage operations toggle their protection
//! for exactly the duration of a call.

use std::io;
use std::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::error::TlsError;

bitflags! {
    /// Access protection for a page. `Prot::empty()` means inaccessible.
    pub struct Prot: libc::c_int {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
    }
}

/// One mmap'd page. The mapping is released when the value drops.
pub struct Page {
    mem: NonNull<u8>,
    len: usize,
}

// SAFETY: the page's memory is raw and unaliased by references; callers
// copy through raw pointers while holding the registry lock, and the
// fault router only compares addresses.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

/// Host page size in bytes.
pub fn size() -> usize {
    page_size::get()
}

impl Page {
    /// Map a fresh zero-filled page with the given protection.
    pub fn map(prot: Prot) -> Result<Page, TlsError> {
        let len = size();
        // SAFETY: requests a fresh anonymous private mapping; no existing
        // memory is affected.
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot.bits(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(TlsError::Map(io::Error::last_os_error()));
        }
        let mem = NonNull::new(mem.cast::<u8>()).ok_or_else(|| {
            TlsError::Map(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
        })?;
        Ok(Page { mem, len })
    }

    /// Change the page's access protection.
    pub fn protect(&self, prot: Prot) -> Result<(), TlsError> {
        // SAFETY: the range [mem, mem + len) is exactly this page's mapping.
        if unsafe { libc::mprotect(self.mem.as_ptr().cast(), self.len, prot.bits()) } != 0 {
            return Err(TlsError::Protect(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// First address of the page.
    pub fn start(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    /// One past the last address of the page.
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `map` and is unmapped once.
        if unsafe { libc::munmap(self.mem.as_ptr().cast(), self.len) } != 0 {
            log::error!("tls: munmap failed: {}", io::Error::last_os_error());
        }
    }
}
