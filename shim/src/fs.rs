//! Filesystem shims: path redirection for the open and stat families, and
//! fs-type spoofing on the statfs results. Dispatch comes from the policy's
//! rule table; these functions only adapt it to the libc calling
//! conventions.

use crate::{policy, real};
use libc::{c_char, c_int, mode_t};
use mirage_policy::mem::LocalMemory;
use mirage_policy::rewrite::{AccessIntent, Rewrite, PATH_MAX};
use mirage_policy::{ExitVerdict, SyscallEvent};
use std::cell::UnsafeCell;
use std::ffi::CStr;

thread_local! {
    // Staged replacement paths. The target owns the memory its argument
    // points at, so the shim hands the real symbol a pointer into this
    // buffer instead; it is valid only until the current call returns.
    static STAGING: UnsafeCell<[u8; PATH_MAX]> = const { UnsafeCell::new([0; PATH_MAX]) };
}

/// Run the entry rule for `sysno` against `path`. Returns the pointer to
/// pass through: the original on a miss or fail-closed, the staged
/// replacement on a hit.
unsafe fn redirect(sysno: libc::c_long, path: *const c_char, intent: AccessIntent) -> *const c_char {
    if path.is_null() {
        return path;
    }
    let bytes = CStr::from_ptr(path).to_bytes();
    STAGING.with(|cell| {
        let buf = &mut *cell.get();
        match policy().stage_path(sysno, bytes, intent, buf) {
            Rewrite::Rewritten { len } => {
                shim_log!(
                    "redirect {} -> {}",
                    String::from_utf8_lossy(bytes),
                    String::from_utf8_lossy(&buf[..len])
                );
                buf.as_ptr() as *const c_char
            }
            Rewrite::TooLong => {
                shim_log!(
                    "replacement for {} exceeds {} bytes, passing through",
                    String::from_utf8_lossy(bytes),
                    PATH_MAX
                );
                path
            }
            Rewrite::Unmatched => path,
        }
    })
}

/// Run the exit rule for `sysno` against the result buffer, through the
/// identity memory adapter. Same executor the supervisor uses.
unsafe fn spoof_result(sysno: libc::c_long, ret: c_int, buf: *mut libc::statfs) {
    if buf.is_null() {
        return;
    }
    let ev = SyscallEvent {
        pid: libc::getpid(),
        sysno,
        args: [0, buf as u64, 0, 0, 0, 0],
        ret: ret as i64,
    };
    if policy().on_exit(&ev, &mut LocalMemory) == ExitVerdict::Rewritten {
        let spoof = policy().spoof();
        shim_log!(
            "statfs: spoofed f_type {:#x} -> {:#x}",
            spoof.from,
            spoof.to
        );
    }
}

/// open/openat carry a mode argument only when the flags demand one.
fn wants_mode(flags: c_int) -> bool {
    flags & (libc::O_CREAT | libc::O_TMPFILE) != 0
}

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let path = redirect(libc::SYS_open, path, AccessIntent::from_open_flags(flags));
    if wants_mode(flags) {
        (real().open)(path, flags, mode)
    } else {
        (real().open)(path, flags)
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let path = redirect(libc::SYS_openat, path, AccessIntent::from_open_flags(flags));
    if wants_mode(flags) {
        (real().openat)(dirfd, path, flags, mode)
    } else {
        (real().openat)(dirfd, path, flags)
    }
}

#[no_mangle]
pub unsafe extern "C" fn stat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    (real().stat)(redirect(libc::SYS_stat, path, AccessIntent::ReadOnly), buf)
}

#[no_mangle]
pub unsafe extern "C" fn lstat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    (real().lstat)(redirect(libc::SYS_lstat, path, AccessIntent::ReadOnly), buf)
}

// fopen is a library call with no syscall number of its own; it opens
// through the same rule as open.
#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut libc::FILE {
    let intent = if mode.is_null() {
        AccessIntent::ReadOnly
    } else {
        AccessIntent::from_fopen_mode(CStr::from_ptr(mode).to_bytes())
    };
    (real().fopen)(redirect(libc::SYS_open, path, intent), mode)
}

#[no_mangle]
pub unsafe extern "C" fn statfs(path: *const c_char, buf: *mut libc::statfs) -> c_int {
    let ret = (real().statfs)(path, buf);
    spoof_result(libc::SYS_statfs, ret, buf);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn fstatfs(fd: c_int, buf: *mut libc::statfs) -> c_int {
    let ret = (real().fstatfs)(fd, buf);
    spoof_result(libc::SYS_fstatfs, ret, buf);
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn mode_is_forwarded_for_create_and_tmpfile() {
        assert!(wants_mode(libc::O_WRONLY | libc::O_CREAT));
        assert!(wants_mode(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL));
        assert!(wants_mode(libc::O_RDWR | libc::O_TMPFILE));
        assert!(wants_mode(libc::O_WRONLY | libc::O_CREAT | libc::O_TMPFILE));
        assert!(!wants_mode(libc::O_RDONLY));
        assert!(!wants_mode(libc::O_WRONLY | libc::O_TRUNC));
        assert!(!wants_mode(libc::O_RDWR | libc::O_APPEND));
    }

    #[test]
    fn redirect_stages_matched_paths_and_passes_foreign_ones() {
        let foreign = CString::new("/etc/hostname").unwrap();
        let out = unsafe { redirect(libc::SYS_open, foreign.as_ptr(), AccessIntent::ReadOnly) };
        assert_eq!(out, foreign.as_ptr());

        // the cgroup mapping rewrites unconditionally, so this is
        // deterministic regardless of what exists under /tmp
        let cgroup = CString::new("/sys/fs/cgroup/cpu/cpu.shares").unwrap();
        let out = unsafe { redirect(libc::SYS_open, cgroup.as_ptr(), AccessIntent::ReadOnly) };
        assert_ne!(out, cgroup.as_ptr());
        let staged = unsafe { CStr::from_ptr(out) };
        assert_eq!(staged.to_bytes(), b"/tmp/fake-cgroup/cpu/cpu.shares");
    }

    #[test]
    fn redirect_is_gated_on_the_rule_table() {
        // no entry rule covers unlink, so even a mapped path passes through
        let mapped = CString::new("/sys/fs/cgroup/cpu/cpu.shares").unwrap();
        let out = unsafe { redirect(libc::SYS_unlink, mapped.as_ptr(), AccessIntent::ReadOnly) };
        assert_eq!(out, mapped.as_ptr());
    }
}
