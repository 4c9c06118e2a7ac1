//! Netlink and bridge shims. The sandbox refuses netlink multicast
//! subscriptions and most bridge ioctls; the runtimes treat either failure
//! as fatal even though they can live without the notifications.

use crate::{policy, real};
use libc::{c_int, c_ulong, c_void, size_t, socklen_t, ssize_t};
use mirage_policy::BindVerdict;
use std::sync::atomic::{AtomicU64, Ordering};

const FD_LIMIT: usize = 1024;

/// Lock-free bitmap of descriptors created with `AF_NETLINK`. Mutated only
/// from the socket and close shims, read from the rest; descriptors at or
/// above the limit are simply never tracked.
pub(crate) struct FdSet {
    words: [AtomicU64; FD_LIMIT / 64],
}

impl FdSet {
    pub(crate) const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; FD_LIMIT / 64],
        }
    }

    fn slot(fd: c_int) -> Option<(usize, u64)> {
        if fd < 0 || fd as usize >= FD_LIMIT {
            return None;
        }
        Some((fd as usize / 64, 1u64 << (fd as usize % 64)))
    }

    pub(crate) fn insert(&self, fd: c_int) -> bool {
        match Self::slot(fd) {
            Some((w, bit)) => {
                self.words[w].fetch_or(bit, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Clears the bit whether or not it was set; returns whether it was.
    pub(crate) fn remove(&self, fd: c_int) -> bool {
        match Self::slot(fd) {
            Some((w, bit)) => self.words[w].fetch_and(!bit, Ordering::Relaxed) & bit != 0,
            None => false,
        }
    }

    pub(crate) fn contains(&self, fd: c_int) -> bool {
        match Self::slot(fd) {
            Some((w, bit)) => self.words[w].load(Ordering::Relaxed) & bit != 0,
            None => false,
        }
    }
}

static NETLINK_FDS: FdSet = FdSet::new();

// linux/sockios.h; libc carries none of the bridge requests.
const SIOCBRADDBR: c_ulong = 0x89a0;
const SIOCBRDELBR: c_ulong = 0x89a1;
const SIOCBRADDIF: c_ulong = 0x89a2;
const SIOCBRDELIF: c_ulong = 0x89a3;
const SIOCDEVPRIVATE: c_ulong = 0x89f0;

fn is_bridge_query_name(name: &[u8]) -> bool {
    name.starts_with(b"docker") || name.starts_with(b"br-")
}

/// The name field of a caller-owned request structure; the slice lives no
/// longer than the borrow of that structure.
unsafe fn ifr_name_bytes<'a>(ifr: &'a libc::ifreq) -> &'a [u8] {
    let raw = &ifr.ifr_name;
    let bytes = std::slice::from_raw_parts(raw.as_ptr() as *const u8, raw.len());
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (real().socket)(domain, ty, protocol);
    if fd >= 0 && domain == libc::AF_NETLINK && NETLINK_FDS.insert(fd) {
        shim_log!("tracking netlink socket fd={fd}");
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn bind(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    if NETLINK_FDS.contains(sockfd)
        && !addr.is_null()
        && (*addr).sa_family == libc::AF_NETLINK as libc::sa_family_t
    {
        let nl = &*(addr as *const libc::sockaddr_nl);
        if policy().on_netlink_bind(nl.nl_groups) == BindVerdict::RetryWithoutGroups {
            shim_log!(
                "bind fd={sockfd} groups={:#x}: clearing multicast mask",
                nl.nl_groups
            );
            let mut safe = *nl;
            safe.nl_groups = 0;
            (real().bind)(
                sockfd,
                &safe as *const libc::sockaddr_nl as *const libc::sockaddr,
                addrlen,
            );
            // the subscription cannot be honoured here; the callers we care
            // about only need the bind itself to succeed
            return 0;
        }
    }
    (real().bind)(sockfd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if NETLINK_FDS.contains(sockfd) {
        if let Some(ret) = policy().on_netlink_setsockopt() {
            shim_log!("setsockopt fd={sockfd} level={level} optname={optname}: forcing {ret}");
            return ret as c_int;
        }
    }
    (real().setsockopt)(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int {
    match request {
        SIOCBRADDBR | SIOCBRDELBR | SIOCBRADDIF | SIOCBRDELIF => {
            shim_log!("bridge ioctl {request:#x} on fd={fd}");
            (real().ioctl)(fd, request, argp)
        }
        r if (r == SIOCDEVPRIVATE || r == libc::SIOCGIFFLAGS) && !argp.is_null() => {
            let ifr = argp as *mut libc::ifreq;
            if !is_bridge_query_name(ifr_name_bytes(&*ifr)) {
                return (real().ioctl)(fd, request, argp);
            }
            let ret = (real().ioctl)(fd, request, argp);
            if ret < 0 {
                // the sandbox cannot answer; report success with an empty
                // reply so the interface probe keeps going
                shim_log!(
                    "ioctl {request:#x} on {} failed, reporting empty success",
                    String::from_utf8_lossy(ifr_name_bytes(&*ifr))
                );
                let union_at = std::mem::size_of_val(&(*ifr).ifr_name);
                std::ptr::write_bytes(
                    (argp as *mut u8).add(union_at),
                    0,
                    std::mem::size_of::<libc::ifreq>() - union_at,
                );
                return 0;
            }
            ret
        }
        _ => (real().ioctl)(fd, request, argp),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    if NETLINK_FDS.contains(sockfd) {
        shim_log!("sendto fd={sockfd} len={len}");
    }
    (real().sendto)(sockfd, buf, len, flags, dest, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let ret = (real().recvfrom)(sockfd, buf, len, flags, src, addrlen);
    if NETLINK_FDS.contains(sockfd) {
        shim_log!("recvfrom fd={sockfd} -> {ret}");
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if NETLINK_FDS.remove(fd) {
        shim_log!("untracking netlink socket fd={fd}");
    }
    (real().close)(fd)
}
