//! The in-process transport: a shared library injected into the target via
//! `LD_PRELOAD`. Each exported symbol consults the canonical policy,
//! optionally stages a rewritten argument in thread-local storage, and
//! forwards to the next symbol in the dynamic linker's chain.
//!
//! ```bash
//! LD_PRELOAD=/path/to/libmirage_shim.so k3s server
//! ```
//!
//! Setting `MIRAGE_VERBOSE` in the target's environment logs every rewrite
//! to stderr. Syscalls issued through the vDSO or raw instructions bypass
//! libc and are out of this transport's reach; that is the contract, and the
//! ptrace supervisor covers those cases.

use libc::{c_char, c_int, c_ulong, c_void, size_t, socklen_t, ssize_t};
use mirage_policy::Policy;
use once_cell::sync::{Lazy, OnceCell};
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};

#[macro_use]
mod log;
mod fs;
mod net;

/// Next-in-chain addresses for every interposed symbol. Written once before
/// any shim runs, read-only afterwards.
pub(crate) struct RealFns {
    pub open: unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int,
    pub openat: unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int,
    pub stat: unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int,
    pub lstat: unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int,
    pub statfs: unsafe extern "C" fn(*const c_char, *mut libc::statfs) -> c_int,
    pub fstatfs: unsafe extern "C" fn(c_int, *mut libc::statfs) -> c_int,
    pub fopen: unsafe extern "C" fn(*const c_char, *const c_char) -> *mut libc::FILE,
    pub socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    pub bind: unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int,
    pub setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
    pub ioctl: unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int,
    pub sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const libc::sockaddr,
        socklen_t,
    ) -> ssize_t,
    pub recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut libc::sockaddr,
        *mut socklen_t,
    ) -> ssize_t,
    pub close: unsafe extern "C" fn(c_int) -> c_int,
}

static REAL: OnceCell<RealFns> = OnceCell::new();
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// The canonical interposer rule set; every shim consults it rather than
/// hard-coding its own dispatch. Forced in the constructor so no hot path
/// pays for the first use.
static POLICY: Lazy<Policy> = Lazy::new(Policy::interposer_default);

pub(crate) fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub(crate) fn real() -> &'static RealFns {
    REAL.get_or_init(|| unsafe { RealFns::resolve() })
}

pub(crate) fn policy() -> &'static Policy {
    &POLICY
}

impl RealFns {
    /// Chase every symbol through `RTLD_NEXT`. A hole in the table means the
    /// target cannot safely run; abort with a diagnostic rather than limp.
    unsafe fn resolve() -> Self {
        macro_rules! sym {
            ($name:literal) => {
                std::mem::transmute(must_resolve(CStr::from_bytes_with_nul_unchecked($name)))
            };
        }
        RealFns {
            open: sym!(b"open\0"),
            openat: sym!(b"openat\0"),
            stat: sym!(b"stat\0"),
            lstat: sym!(b"lstat\0"),
            statfs: sym!(b"statfs\0"),
            fstatfs: sym!(b"fstatfs\0"),
            fopen: sym!(b"fopen\0"),
            socket: sym!(b"socket\0"),
            bind: sym!(b"bind\0"),
            setsockopt: sym!(b"setsockopt\0"),
            ioctl: sym!(b"ioctl\0"),
            sendto: sym!(b"sendto\0"),
            recvfrom: sym!(b"recvfrom\0"),
            close: sym!(b"close\0"),
        }
    }
}

unsafe fn must_resolve(name: &CStr) -> *mut c_void {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if sym.is_null() {
        let msg = format!("[mirage-shim] missing libc symbol {name:?}, aborting\n");
        libc::write(2, msg.as_ptr() as *const c_void, msg.len());
        libc::abort();
    }
    sym
}

#[ctor::ctor]
fn initialize() {
    VERBOSE.store(
        std::env::var_os("MIRAGE_VERBOSE").is_some(),
        Ordering::Relaxed,
    );
    let _ = real();
    Lazy::force(&POLICY);
    shim_log!("interposer loaded");
}
