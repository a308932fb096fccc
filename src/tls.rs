//! Copy-on-write thread-local storage.
//!
//! Each thread may own one storage area: a size-rounded run of pages that
//! stays inaccessible except while a read or write is in flight. `clone`
//! shares the source's pages instead of copying them; the first write
//! through either record breaks the sharing page by page.
//!
//! A process-wide registry maps thread identities to their records. Every
//! operation takes the registry lock on entry and holds it to completion;
//! the operations never block on I/O, so the contention window is short.

use std::cmp;
use std::mem;
use std::ptr;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use crate::error::TlsError;
use crate::page::{self, Page, Prot};
use crate::trap::{self, Span};

/// Identity of a thread, as reported by the platform.
pub type ThreadId = libc::pthread_t;

/// One thread's storage area.
struct TlsRecord {
    tid: ThreadId,
    size: usize,
    /// The strong count of each handle is the page's reference count: the
    /// page is unmapped exactly when the last record sharing it lets go.
    pages: Vec<Arc<Page>>,
}

impl TlsRecord {
    /// Accesses are bounded by the page-rounded capacity, not by `size`.
    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), TlsError> {
        let capacity = self.pages.len() * page::size();
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(TlsError::OutOfBounds { offset, len });
        }
        Ok(())
    }

    /// Apply `prot` to every page of the record. A failing page does not
    /// stop the sweep; the first error is reported after the rest are done.
    fn set_protection(&self, prot: Prot) -> Result<(), TlsError> {
        let mut first_err = None;
        for page in &self.pages {
            if let Err(err) = page.protect(prot) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Registry {
    records: Vec<TlsRecord>,
}

impl Registry {
    const fn new() -> Registry {
        Registry {
            records: Vec::new(),
        }
    }

    fn index_of(&self, tid: ThreadId) -> Option<usize> {
        self.records.iter().position(|record| record.tid == tid)
    }

    fn find(&self, tid: ThreadId) -> Option<&TlsRecord> {
        self.records.iter().find(|record| record.tid == tid)
    }

    /// Address spans of every page of every record, for the fault router.
    fn spans(&self) -> Vec<Span> {
        self.records
            .iter()
            .flat_map(|record| record.pages.iter())
            .map(|page| Span {
                start: page.start(),
                end: page.end(),
            })
            .collect()
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

fn self_tid() -> ThreadId {
    // SAFETY: always valid to query the calling thread's id.
    unsafe { libc::pthread_self() }
}

fn create(size: usize) -> Result<(), TlsError> {
    trap::install();
    let tid = self_tid();
    let mut registry = REGISTRY.lock();
    if registry.index_of(tid).is_some() {
        return Err(TlsError::AlreadyExists);
    }
    let count = size.div_ceil(page::size());
    let mut pages = Vec::with_capacity(count);
    for _ in 0..count {
        // Fresh pages start inaccessible. On a partial failure the pages
        // mapped so far are unmapped when the vector drops.
        pages.push(Arc::new(Page::map(Prot::empty())?));
    }
    registry.records.push(TlsRecord { tid, size, pages });
    trap::publish(registry.spans());
    Ok(())
}

fn destroy() -> Result<(), TlsError> {
    let mut registry = REGISTRY.lock();
    let idx = registry
        .index_of(self_tid())
        .ok_or(TlsError::NoSuchArea)?;
    // Dropping the record releases its share of every page; pages still
    // referenced by another record survive.
    drop(registry.records.swap_remove(idx));
    trap::publish(registry.spans());
    Ok(())
}

fn read(offset: usize, buf: &mut [u8]) -> Result<(), TlsError> {
    let registry = REGISTRY.lock();
    let record = registry.find(self_tid()).ok_or(TlsError::NoSuchArea)?;
    record.check_bounds(offset, buf.len())?;
    if buf.is_empty() {
        return Ok(());
    }
    record.set_protection(Prot::READ | Prot::WRITE)?;
    scopeguard::defer! {
        if let Err(err) = record.set_protection(Prot::empty()) {
            error!("tls: failed to re-protect pages: {err}");
        }
    }
    let ps = page::size();
    let mut copied = 0;
    while copied < buf.len() {
        let pos = offset + copied;
        let (index, in_page) = (pos / ps, pos % ps);
        let n = cmp::min(buf.len() - copied, ps - in_page);
        // SAFETY: every page of the record is readable for the duration of
        // the call and `index` is in bounds by the check above.
        unsafe {
            ptr::copy_nonoverlapping(
                record.pages[index].as_ptr().add(in_page),
                buf.as_mut_ptr().add(copied),
                n,
            );
        }
        copied += n;
    }
    Ok(())
}

fn write(offset: usize, buf: &[u8]) -> Result<(), TlsError> {
    let mut registry = REGISTRY.lock();
    let idx = registry
        .index_of(self_tid())
        .ok_or(TlsError::NoSuchArea)?;
    registry.records[idx].check_bounds(offset, buf.len())?;
    if buf.is_empty() {
        return Ok(());
    }
    registry.records[idx].set_protection(Prot::READ | Prot::WRITE)?;

    let ps = page::size();
    let first = offset / ps;
    let last = (offset + buf.len() - 1) / ps;

    // Break sharing before any store: a page referenced by more than one
    // record is never mutated in place.
    let mut replaced = false;
    let mut failure = None;
    for index in first..=last {
        let record = &mut registry.records[idx];
        if Arc::strong_count(&record.pages[index]) <= 1 {
            continue;
        }
        let fresh = match Page::map(Prot::READ | Prot::WRITE) {
            Ok(page) => page,
            Err(err) => {
                failure = Some(err);
                break;
            }
        };
        // SAFETY: the old page was made readable above, the fresh page is
        // writable, and both are page::size() long.
        unsafe { ptr::copy_nonoverlapping(record.pages[index].as_ptr(), fresh.as_ptr(), ps) };
        let old = mem::replace(&mut record.pages[index], Arc::new(fresh));
        // The surviving page still backs records that are outside any
        // operation; it goes back to inaccessible now.
        if let Err(err) = old.protect(Prot::empty()) {
            error!("tls: failed to re-protect a shared page: {err}");
        }
        replaced = true;
    }

    if failure.is_none() {
        let record = &registry.records[idx];
        let mut copied = 0;
        while copied < buf.len() {
            let pos = offset + copied;
            let (index, in_page) = (pos / ps, pos % ps);
            let n = cmp::min(buf.len() - copied, ps - in_page);
            // SAFETY: sharing was broken above, so this record is the sole
            // owner of every touched page, and the pages are writable.
            unsafe {
                ptr::copy_nonoverlapping(
                    buf.as_ptr().add(copied),
                    record.pages[index].as_ptr().add(in_page),
                    n,
                );
            }
            copied += n;
        }
    }

    let restore = registry.records[idx].set_protection(Prot::empty());
    if replaced {
        trap::publish(registry.spans());
    }
    if let Some(err) = failure {
        return Err(err);
    }
    restore
}

fn clone_from(source: ThreadId) -> Result<(), TlsError> {
    let tid = self_tid();
    if tid == source {
        return Err(TlsError::CloneSelf);
    }
    let mut registry = REGISTRY.lock();
    if registry.index_of(tid).is_some() {
        return Err(TlsError::AlreadyExists);
    }
    let (size, pages) = {
        let src = registry.find(source).ok_or(TlsError::NoSuchSource)?;
        (src.size, src.pages.iter().map(Arc::clone).collect())
    };
    registry.records.push(TlsRecord { tid, size, pages });
    // No page addresses changed, so the published fault index stays valid.
    Ok(())
}

fn status(result: Result<(), TlsError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            error!("tls: {err}");
            -1
        }
    }
}

/// Create a storage area of at least `size` bytes for the calling thread.
pub fn tls_create(size: usize) -> i32 {
    status(create(size))
}

/// Release the calling thread's storage area.
pub fn tls_destroy() -> i32 {
    status(destroy())
}

/// Copy `buf.len()` bytes starting at `offset` out of the calling
/// thread's storage area.
pub fn tls_read(offset: usize, buf: &mut [u8]) -> i32 {
    status(read(offset, buf))
}

/// Copy `buf` into the calling thread's storage area at `offset`.
pub fn tls_write(offset: usize, buf: &[u8]) -> i32 {
    status(write(offset, buf))
}

/// Give the calling thread a storage area sharing `source`'s pages.
pub fn tls_clone(source: ThreadId) -> i32 {
    status(clone_from(source))
}
