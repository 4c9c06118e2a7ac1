//! Transport-independent interception policy: which syscalls to inspect and
//! what to do when they match. Rules are plain values. The supervisor runs
//! them through [`Policy::on_entry`]/[`Policy::on_exit`]; the preload shim
//! stages path rewrites with [`Policy::stage_path`] (it may not write into
//! the caller's buffer), shares [`Policy::on_exit`] for result buffers, and
//! takes its netlink verdicts from [`Policy::on_netlink_bind`] and
//! [`Policy::on_netlink_setsockopt`]. The bridge ioctl intercept keys on
//! request codes rather than syscall numbers and lives in the shim alone.
//! Tracee memory is only reached through the [`mem::TraceeMemory`] seam.

use crate::mem::TraceeMemory;
use crate::rewrite::{AccessIntent, PathRewriter, Rewrite, PATH_MAX};
use crate::statfs::FsTypeSpoof;
use tracing::debug;

pub mod magic;
pub mod mem;
pub mod rewrite;
pub mod statfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Entry,
    Exit,
}

impl Phase {
    pub fn flip(self) -> Phase {
        match self {
            Phase::Entry => Phase::Exit,
            Phase::Exit => Phase::Entry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Rewrite the C string at argument register `path_arg` in place.
    /// `flags_arg` names the open-flags register used to pick the device
    /// sink for unmapped fixture paths; absent for stat-like calls.
    RewritePathArg {
        path_arg: usize,
        flags_arg: Option<usize>,
    },
    /// Rewrite the statfs record at argument register `buf_arg`, only when
    /// the call succeeded.
    RewriteFsTypeResult { buf_arg: usize },
    /// Do not let the kernel see the call; report `ret` instead.
    ForceSuccess { ret: i64 },
    /// Netlink bind with a multicast mask: retry with the mask cleared and
    /// report success. Only the in-process transport can express the retry.
    FakeZeroGroups,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub sysno: libc::c_long,
    pub phase: Phase,
    pub action: Action,
}

/// One stop's worth of context, borrowed for the duration of a handler call.
#[derive(Debug, Clone, Copy)]
pub struct SyscallEvent {
    pub pid: i32,
    pub sysno: libc::c_long,
    pub args: [u64; 6],
    /// Return value; meaningful at exit only.
    pub ret: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EntryVerdict {
    Passthrough,
    /// Argument memory was rewritten in place; registers are untouched.
    Rewritten,
    Suppress { ret: i64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExitVerdict {
    Passthrough,
    /// Result buffer was rewritten in place.
    Rewritten,
    Override { ret: i64 },
}

/// What a transport should do with a netlink bind it intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindVerdict {
    Passthrough,
    /// Reissue the bind with the multicast mask cleared and report success.
    RetryWithoutGroups,
}

/// An ordered rule list plus the rewrite primitives the rules share.
pub struct Policy {
    rules: Vec<Rule>,
    rewriter: PathRewriter,
    spoof: FsTypeSpoof,
}

impl Policy {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            rewriter: rewrite::CANONICAL,
            spoof: statfs::CANONICAL,
        }
    }

    /// The rule set the ptrace supervisor ships with: path redirection at
    /// entry of open/openat, fs-type spoofing at exit of statfs/fstatfs.
    pub fn supervisor_default() -> Self {
        Self::new(vec![
            Rule {
                sysno: libc::SYS_open,
                phase: Phase::Entry,
                action: Action::RewritePathArg {
                    path_arg: 0,
                    flags_arg: Some(1),
                },
            },
            Rule {
                sysno: libc::SYS_openat,
                phase: Phase::Entry,
                action: Action::RewritePathArg {
                    path_arg: 1,
                    flags_arg: Some(2),
                },
            },
            Rule {
                sysno: libc::SYS_statfs,
                phase: Phase::Exit,
                action: Action::RewriteFsTypeResult { buf_arg: 1 },
            },
            Rule {
                sysno: libc::SYS_fstatfs,
                phase: Phase::Exit,
                action: Action::RewriteFsTypeResult { buf_arg: 1 },
            },
        ])
    }

    /// The rule set the preload shim implements, a superset of the
    /// supervisor's: stat-family paths are library calls and reachable, and
    /// the netlink tri-intercept only makes sense next to the real symbols.
    pub fn interposer_default() -> Self {
        let mut rules = Self::supervisor_default().rules;
        rules.extend([
            Rule {
                sysno: libc::SYS_stat,
                phase: Phase::Entry,
                action: Action::RewritePathArg {
                    path_arg: 0,
                    flags_arg: None,
                },
            },
            Rule {
                sysno: libc::SYS_lstat,
                phase: Phase::Entry,
                action: Action::RewritePathArg {
                    path_arg: 0,
                    flags_arg: None,
                },
            },
            Rule {
                sysno: libc::SYS_socket,
                phase: Phase::Entry,
                action: Action::Passthrough,
            },
            Rule {
                sysno: libc::SYS_bind,
                phase: Phase::Entry,
                action: Action::FakeZeroGroups,
            },
            Rule {
                sysno: libc::SYS_setsockopt,
                phase: Phase::Entry,
                action: Action::ForceSuccess { ret: 0 },
            },
            Rule {
                sysno: libc::SYS_close,
                phase: Phase::Entry,
                action: Action::Passthrough,
            },
        ]);
        Self::new(rules)
    }

    /// First rule accepting `(sysno, phase)`, in authoring order.
    pub fn rule_for(&self, sysno: libc::c_long, phase: Phase) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.sysno == sysno && r.phase == phase)
    }

    pub fn rewriter(&self) -> &PathRewriter {
        &self.rewriter
    }

    pub fn spoof(&self) -> &FsTypeSpoof {
        &self.spoof
    }

    /// Apply the matching entry rule. Memory faults downgrade the event to
    /// a passthrough; the tracee is never aborted over a failed rewrite.
    pub fn on_entry(&self, ev: &SyscallEvent, mem: &mut dyn TraceeMemory) -> EntryVerdict {
        match self.rule_for(ev.sysno, Phase::Entry) {
            Some(Rule {
                action: Action::RewritePathArg {
                    path_arg,
                    flags_arg,
                },
                ..
            }) => self.rewrite_path(ev, *path_arg, *flags_arg, mem),
            Some(Rule {
                action: Action::ForceSuccess { ret },
                ..
            }) => EntryVerdict::Suppress { ret: *ret },
            Some(Rule {
                action: Action::FakeZeroGroups,
                ..
            }) => {
                // needs the transport to reissue the call with a patched
                // address; transports that can ask on_netlink_bind instead
                EntryVerdict::Passthrough
            }
            // exit-only actions
            _ => EntryVerdict::Passthrough,
        }
    }

    /// Apply the matching exit rule. Failed syscalls carry undefined result
    /// buffers and are never touched.
    pub fn on_exit(&self, ev: &SyscallEvent, mem: &mut dyn TraceeMemory) -> ExitVerdict {
        match self.rule_for(ev.sysno, Phase::Exit) {
            Some(Rule {
                action: Action::RewriteFsTypeResult { buf_arg },
                ..
            }) => {
                if ev.ret < 0 {
                    return ExitVerdict::Passthrough;
                }
                let addr = ev.args[*buf_arg];
                if addr == 0 {
                    return ExitVerdict::Passthrough;
                }
                match self.spoof.apply_remote(mem, addr) {
                    Ok(true) => {
                        debug!(
                            pid = ev.pid,
                            from = %format_args!("{:#x}", self.spoof.from),
                            to = %format_args!("{:#x}", self.spoof.to),
                            "spoofed fs type"
                        );
                        ExitVerdict::Rewritten
                    }
                    Ok(false) => ExitVerdict::Passthrough,
                    Err(err) => {
                        debug!(pid = ev.pid, %err, "statfs rewrite failed, passing through");
                        ExitVerdict::Passthrough
                    }
                }
            }
            Some(Rule {
                action: Action::ForceSuccess { ret },
                ..
            }) => ExitVerdict::Override { ret: *ret },
            _ => ExitVerdict::Passthrough,
        }
    }

    /// Entry executor for `RewritePathArg` under a transport that may not
    /// write into the caller's buffer: the replacement lands in `out` and
    /// the caller passes that through instead. Returns `Unmatched` when no
    /// rewrite rule covers `sysno`, so the rule table gates the shims.
    pub fn stage_path(
        &self,
        sysno: libc::c_long,
        path: &[u8],
        intent: AccessIntent,
        out: &mut [u8],
    ) -> Rewrite {
        match self.rule_for(sysno, Phase::Entry) {
            Some(Rule {
                action: Action::RewritePathArg { .. },
                ..
            }) => self.rewriter.resolve(path, intent, out),
            _ => Rewrite::Unmatched,
        }
    }

    /// Executor for `FakeZeroGroups`: a bind on a tracked netlink socket
    /// with multicast mask `groups` is retried without the mask only when
    /// the rule table says so and the mask is non-zero.
    pub fn on_netlink_bind(&self, groups: u32) -> BindVerdict {
        match self.rule_for(libc::SYS_bind, Phase::Entry) {
            Some(Rule {
                action: Action::FakeZeroGroups,
                ..
            }) if groups != 0 => BindVerdict::RetryWithoutGroups,
            _ => BindVerdict::Passthrough,
        }
    }

    /// Forced return for setsockopt on a tracked netlink socket, if the
    /// rule table carries one.
    pub fn on_netlink_setsockopt(&self) -> Option<i64> {
        match self.rule_for(libc::SYS_setsockopt, Phase::Entry) {
            Some(Rule {
                action: Action::ForceSuccess { ret },
                ..
            }) => Some(*ret),
            _ => None,
        }
    }

    fn rewrite_path(
        &self,
        ev: &SyscallEvent,
        path_arg: usize,
        flags_arg: Option<usize>,
        mem: &mut dyn TraceeMemory,
    ) -> EntryVerdict {
        let addr = ev.args[path_arg];
        if addr == 0 {
            return EntryVerdict::Passthrough;
        }
        let path = match mem.read_cstring(addr, PATH_MAX) {
            Ok(p) => p,
            Err(err) => {
                debug!(pid = ev.pid, %err, "path read failed, passing through");
                return EntryVerdict::Passthrough;
            }
        };
        let intent = flags_arg
            .map(|i| AccessIntent::from_open_flags(ev.args[i] as i32))
            .unwrap_or(AccessIntent::ReadOnly);
        let mut out = [0u8; PATH_MAX];
        match self.rewriter.resolve(&path, intent, &mut out) {
            Rewrite::Unmatched => EntryVerdict::Passthrough,
            Rewrite::TooLong => {
                debug!(
                    pid = ev.pid,
                    path = %String::from_utf8_lossy(&path),
                    "replacement would overflow, leaving path alone"
                );
                EntryVerdict::Passthrough
            }
            Rewrite::Rewritten { len } => match mem.write_cstring(addr, &out[..len]) {
                Ok(()) => {
                    debug!(
                        pid = ev.pid,
                        from = %String::from_utf8_lossy(&path),
                        to = %String::from_utf8_lossy(&out[..len]),
                        "rewrote path"
                    );
                    EntryVerdict::Rewritten
                }
                Err(err) => {
                    debug!(pid = ev.pid, %err, "path write failed, passing through");
                    EntryVerdict::Passthrough
                }
            },
        }
    }
}
