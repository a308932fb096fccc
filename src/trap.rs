//! Fault router for protected storage pages.
//!
//! A process-wide SIGSEGV/SIGBUS handler attributes a faulting address to
//! the thread-local storage pages and terminates the offending thread with
//! a diagnostic. Faults outside every storage page keep their default
//! fatal disposition.
//!
//! The handler may interrupt a storage operation mid-flight, so it must
//! not take the registry lock. Instead it consults an immutable snapshot
//! of page spans published through an atomic pointer. Snapshots are
//! rebuilt under the registry lock whenever the set of mapped pages
//! changes; superseded snapshots are retired but never freed, because the
//! handler may still be scanning one.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Once;

use parking_lot::Mutex;

/// Half-open address range of one storage page.
#[derive(Clone, Copy)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

static INDEX: AtomicPtr<Vec<Span>> = AtomicPtr::new(ptr::null_mut());
static RETIRED: Mutex<Vec<Box<Vec<Span>>>> = Mutex::new(Vec::new());
static INSTALL: Once = Once::new();

/// Install the fault router. Idempotent; called on first storage creation.
pub fn install() {
    INSTALL.call_once(|| {
        // SAFETY: zeroed sigaction is a valid starting point; the handler
        // address and flags are filled in before the struct is used.
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = router as usize;
        action.sa_flags = libc::SA_SIGINFO;
        // SAFETY: installs a handler for the whole process, as intended.
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &action, ptr::null_mut());
        }
    });
}

/// Publish a new span snapshot. Must be called with the registry lock held
/// so that publications are totally ordered.
pub fn publish(spans: Vec<Span>) {
    let fresh = Box::into_raw(Box::new(spans));
    let old = INDEX.swap(fresh, Ordering::SeqCst);
    if !old.is_null() {
        // Keep superseded snapshots alive: the router does not synchronize
        // with this swap and may still be reading one.
        // SAFETY: `old` came from Box::into_raw in a previous publish.
        RETIRED.lock().push(unsafe { Box::from_raw(old) });
    }
}

/// Does the address fall inside any published storage page?
fn hit(addr: usize) -> bool {
    let index = INDEX.load(Ordering::SeqCst);
    if index.is_null() {
        return false;
    }
    // SAFETY: published snapshots are immutable and never freed.
    contains(unsafe { &*index }, addr)
}

fn contains(spans: &[Span], addr: usize) -> bool {
    spans.iter().any(|span| span.start <= addr && addr < span.end)
}

/// Write the diagnostic with raw `write(2)`: the router runs in signal
/// context, where neither `log` nor the allocator may be used.
fn diagnose(tid: libc::pthread_t) {
    let mut buf = [0u8; 96];
    let mut n = 0;
    for &byte in b"tls: thread " {
        buf[n] = byte;
        n += 1;
    }
    let mut digits = [0u8; 20];
    let mut d = 0;
    let mut value = tid as u64;
    loop {
        digits[d] = b'0' + (value % 10) as u8;
        d += 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    while d > 0 {
        d -= 1;
        buf[n] = digits[d];
        n += 1;
    }
    for &byte in b" made an illegal storage access\n" {
        buf[n] = byte;
        n += 1;
    }
    // SAFETY: plain write(2) of a stack buffer; async-signal-safe.
    let _ = unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), n) };
}

extern "C" fn router(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: with SA_SIGINFO the kernel passes a valid siginfo_t, and
    // si_addr is defined for SIGSEGV and SIGBUS.
    let addr = unsafe { (*info).si_addr() } as usize;
    if hit(addr) {
        // SAFETY: pthread_self and pthread_exit act only on this thread.
        unsafe {
            diagnose(libc::pthread_self());
            libc::pthread_exit(ptr::null_mut());
        }
    }
    // Not a storage page: restore the default disposition and re-deliver.
    // SAFETY: resetting to SIG_DFL and re-raising reproduces the fatal fault.
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        libc::signal(libc::SIGBUS, libc::SIG_DFL);
        libc::raise(sig);
    }
}
