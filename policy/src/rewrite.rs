//! Path redirection. An ordered table of exact and prefix mappings aims the
//! hidden `/proc/sys` and `/sys/fs/cgroup` hierarchies at fixture trees the
//! operator populates under `/tmp`. Resolution writes into a caller-supplied
//! buffer so the interposer's hot path never allocates.

use crate::magic;

/// Safe bound for a rewritten path, terminator included.
pub const PATH_MAX: usize = 4096;

pub const DEV_ZERO: &str = "/dev/zero";
pub const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    ReadOnly,
    Writable,
}

impl AccessIntent {
    pub fn from_open_flags(flags: i32) -> Self {
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            AccessIntent::ReadOnly
        } else {
            AccessIntent::Writable
        }
    }

    pub fn from_fopen_mode(mode: &[u8]) -> Self {
        if mode.iter().any(|b| matches!(b, b'w' | b'a' | b'+')) {
            AccessIntent::Writable
        } else {
            AccessIntent::ReadOnly
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub from: &'static str,
    pub to: &'static str,
    /// Whole-path match rather than prefix match.
    pub exact: bool,
    /// When the mapped fixture is absent, fall back to the device sinks so
    /// reads still succeed and writes are discarded.
    pub device_fallback: bool,
}

impl Mapping {
    fn accepts(&self, path: &[u8]) -> bool {
        if self.exact {
            path == self.from.as_bytes()
        } else {
            path.starts_with(self.from.as_bytes())
        }
    }
}

/// Order matters: the cpuacct percpu file sits under the cgroup prefix and
/// must win before it.
pub const CANONICAL_MAPPINGS: &[Mapping] = &[
    Mapping {
        from: magic::DISKSTATS_PATH,
        to: "/tmp/fake-diskstats",
        exact: true,
        device_fallback: false,
    },
    Mapping {
        from: magic::CPUACCT_PERCPU_PATH,
        to: "/tmp/fake-cpuacct-usage-percpu",
        exact: true,
        device_fallback: false,
    },
    Mapping {
        from: magic::PROC_SYS_PREFIX,
        to: "/tmp/fake-procsys/",
        exact: false,
        device_fallback: true,
    },
    Mapping {
        from: magic::CGROUP_PREFIX,
        to: "/tmp/fake-cgroup",
        exact: false,
        device_fallback: false,
    },
];

#[derive(Debug, PartialEq, Eq)]
pub enum Rewrite {
    Unmatched,
    /// `out[..len]` holds the replacement, `out[len]` the terminator.
    Rewritten { len: usize },
    /// Replacement would not fit the safe bound; fail closed.
    TooLong,
}

#[derive(Debug, Clone, Copy)]
pub struct PathRewriter {
    mappings: &'static [Mapping],
}

pub const CANONICAL: PathRewriter = PathRewriter::new(CANONICAL_MAPPINGS);

impl PathRewriter {
    pub const fn new(mappings: &'static [Mapping]) -> Self {
        Self { mappings }
    }

    /// Cheap guard for hot paths.
    pub fn matches(&self, path: &[u8]) -> bool {
        self.mappings.iter().any(|m| m.accepts(path))
    }

    pub fn resolve(&self, path: &[u8], intent: AccessIntent, out: &mut [u8]) -> Rewrite {
        self.resolve_with(path, intent, out, &fixture_present)
    }

    /// `exists` receives the nul-terminated candidate and reports whether the
    /// fixture is actually there.
    pub fn resolve_with(
        &self,
        path: &[u8],
        intent: AccessIntent,
        out: &mut [u8],
        exists: &dyn Fn(&[u8]) -> bool,
    ) -> Rewrite {
        let Some(m) = self.mappings.iter().find(|m| m.accepts(path)) else {
            return Rewrite::Unmatched;
        };
        let tail = if m.exact { &[][..] } else { &path[m.from.len()..] };
        let len = m.to.len() + tail.len();
        if len + 1 > out.len() || len + 1 > PATH_MAX {
            return Rewrite::TooLong;
        }
        out[..m.to.len()].copy_from_slice(m.to.as_bytes());
        out[m.to.len()..len].copy_from_slice(tail);
        out[len] = 0;
        if m.device_fallback && !exists(&out[..=len]) {
            let dev = match intent {
                AccessIntent::ReadOnly => DEV_ZERO,
                AccessIntent::Writable => DEV_NULL,
            };
            out[..dev.len()].copy_from_slice(dev.as_bytes());
            out[dev.len()] = 0;
            return Rewrite::Rewritten { len: dev.len() };
        }
        Rewrite::Rewritten { len }
    }
}

fn fixture_present(cpath: &[u8]) -> bool {
    unsafe { libc::access(cpath.as_ptr() as *const libc::c_char, libc::F_OK) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(path: &[u8], intent: AccessIntent, present: bool) -> (Rewrite, Vec<u8>) {
        let mut out = [0u8; PATH_MAX];
        let r = CANONICAL.resolve_with(path, intent, &mut out, &|_| present);
        let s = match r {
            Rewrite::Rewritten { len } => out[..len].to_vec(),
            _ => Vec::new(),
        };
        (r, s)
    }

    #[test]
    fn procsys_prefix_maps_to_fixture() {
        let (r, s) = resolve(b"/proc/sys/kernel/pid_max", AccessIntent::ReadOnly, true);
        assert_eq!(r, Rewrite::Rewritten { len: s.len() });
        assert_eq!(s, b"/tmp/fake-procsys/kernel/pid_max");
    }

    #[test]
    fn missing_procsys_fixture_falls_back_to_devices() {
        let (_, s) = resolve(b"/proc/sys/fs/file-max", AccessIntent::ReadOnly, false);
        assert_eq!(s, b"/dev/zero");
        let (_, s) = resolve(b"/proc/sys/fs/file-max", AccessIntent::Writable, false);
        assert_eq!(s, b"/dev/null");
    }

    #[test]
    fn cgroup_prefix_rewrites_unconditionally() {
        let (_, s) = resolve(
            b"/sys/fs/cgroup/memory/memory.stat",
            AccessIntent::ReadOnly,
            false,
        );
        assert_eq!(s, b"/tmp/fake-cgroup/memory/memory.stat");
    }

    #[test]
    fn exact_maps_win_over_their_prefix() {
        let (_, s) = resolve(
            b"/sys/fs/cgroup/cpuacct/cpuacct.usage_percpu",
            AccessIntent::ReadOnly,
            false,
        );
        assert_eq!(s, b"/tmp/fake-cpuacct-usage-percpu");
        let (_, s) = resolve(b"/proc/diskstats", AccessIntent::ReadOnly, false);
        assert_eq!(s, b"/tmp/fake-diskstats");
    }

    #[test]
    fn foreign_paths_are_untouched() {
        let (r, _) = resolve(b"/etc/hostname", AccessIntent::ReadOnly, true);
        assert_eq!(r, Rewrite::Unmatched);
        // an exact map must not catch path extensions
        let (r, _) = resolve(b"/proc/diskstats2", AccessIntent::ReadOnly, true);
        assert_eq!(r, Rewrite::Unmatched);
    }

    #[test]
    fn oversized_replacement_fails_closed() {
        let mut path = b"/proc/sys/".to_vec();
        path.resize(PATH_MAX - 1, b'x');
        let (r, _) = resolve(&path, AccessIntent::ReadOnly, true);
        assert_eq!(r, Rewrite::TooLong);
    }

    #[test]
    fn intent_from_flags_and_modes() {
        assert_eq!(
            AccessIntent::from_open_flags(libc::O_RDONLY),
            AccessIntent::ReadOnly
        );
        assert_eq!(
            AccessIntent::from_open_flags(libc::O_WRONLY | libc::O_TRUNC),
            AccessIntent::Writable
        );
        assert_eq!(
            AccessIntent::from_open_flags(libc::O_RDWR),
            AccessIntent::Writable
        );
        assert_eq!(AccessIntent::from_fopen_mode(b"r"), AccessIntent::ReadOnly);
        assert_eq!(AccessIntent::from_fopen_mode(b"rb"), AccessIntent::ReadOnly);
        assert_eq!(AccessIntent::from_fopen_mode(b"r+"), AccessIntent::Writable);
        assert_eq!(AccessIntent::from_fopen_mode(b"w"), AccessIntent::Writable);
        assert_eq!(AccessIntent::from_fopen_mode(b"a"), AccessIntent::Writable);
    }
}
