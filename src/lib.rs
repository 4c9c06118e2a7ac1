//! Mirage lies between a container runtime and a sandboxed kernel whose
//! surface is incomplete: a 9p root advertised where ext4 is expected,
//! `/proc/sys` and `/sys/fs/cgroup` missing or read-only, netlink multicast
//! subscriptions refused, bridge ioctls unsupported. It rewrites the system
//! calls the target issues so the target believes it is on a conventional
//! host.
//!
//! Two transports execute one policy model:
//!
//! - the **supervisor** in this crate traces a child with ptrace, stopping
//!   it at every syscall boundary to rewrite arguments and results across
//!   the process boundary;
//! - the **interposer** (`mirage-shim`) is preloaded into the target and
//!   wraps the libc entry points in place.
//!
//! Exactly one of the two is active in a given process image.
//!
//! # Usage
//!
//! ```no_run
//! use mirage::{Policy, Supervisor};
//! use std::process::Command;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut cmd = Command::new("k3s");
//! cmd.arg("server");
//! let mut supervisor = Supervisor::spawn(cmd, Policy::supervisor_default())?;
//! let status = supervisor.run()?;
//! std::process::exit(status);
//! # }
//! ```

use anyhow::{Context, Result};
use mirage_policy::{EntryVerdict, ExitVerdict, Phase, SyscallEvent};
use pete::{Ptracer, Restart, Stop, Tracee};
use rand::Rng;
use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub mod fixtures;
mod mem;
mod syscall_names;

use mem::TraceeMem;
use syscall_names::syscall_name;

pub use mirage_policy::Policy;

/// Drives one target process tree under ptrace, applying a [`Policy`] at
/// every syscall boundary.
pub struct Supervisor {
    ptracer: Ptracer,
    policy: Policy,
    tracees: HashMap<i32, TraceeState>,
    /// Forced returns for calls suppressed at entry, keyed by pid.
    blocked: HashMap<i32, i64>,
    stop: Arc<AtomicBool>,
    root: i32,
    root_status: i32,
}

/// Per-tracee bookkeeping. The kernel's syscall-stop signal is identical on
/// entry and exit, so the phase is a flag toggled on every stop; it is never
/// inferred from register contents.
struct TraceeState {
    phase: Phase,
    last_sysno: i64,
}

impl TraceeState {
    fn new() -> Self {
        Self {
            phase: Phase::Entry,
            last_sysno: -1,
        }
    }

    /// Phase of the current stop; flips the flag for the next one.
    fn observe_stop(&mut self) -> Phase {
        let phase = self.phase;
        self.phase = phase.flip();
        phase
    }
}

impl Supervisor {
    /// Fork and exec `cmd` as a traced child. The tracer follows forks,
    /// vforks and clones, so the whole tree stays covered.
    pub fn spawn(cmd: Command, policy: Policy) -> Result<Self> {
        let mut ptracer = Ptracer::new();
        let child = ptracer.spawn(cmd).context("spawning traced target")?;
        let root = child.id() as i32;
        info!(pid = root, "tracing target");

        Ok(Self {
            ptracer,
            policy,
            tracees: HashMap::new(),
            blocked: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
            root,
            root_status: 0,
        })
    }

    /// Polled between stops; register it against SIGINT/SIGTERM for an
    /// orderly shutdown.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Pump stops until the target tree is gone, then return the root
    /// target's exit status.
    pub fn run(&mut self) -> Result<i32> {
        while let Some(mut tracee) = self.ptracer.wait()? {
            if self.stop.load(Ordering::Relaxed) {
                info!("terminate requested, releasing tracees");
                break;
            }
            self.on_stop(&mut tracee)?;
            self.ptracer.restart(tracee, Restart::Syscall)?;
        }
        Ok(self.root_status)
    }

    fn on_stop(&mut self, tracee: &mut Tracee) -> Result<()> {
        let pid = tracee.pid.as_raw();
        match &tracee.stop {
            Stop::SyscallEnter | Stop::SyscallExit => self.on_syscall_stop(tracee)?,
            Stop::Fork { new } | Stop::Vfork { new } | Stop::Clone { new } => {
                // the child is auto-attached and will show up at its own
                // syscall stops with a fresh phase flag
                debug!(parent = pid, child = new.as_raw(), "new tracee");
            }
            Stop::Exiting { exit_code } => {
                let status = decode_wait_status(*exit_code);
                self.tracees.remove(&pid);
                self.blocked.remove(&pid);
                if pid == self.root {
                    self.root_status = status;
                    debug!(pid, status, "root target exiting");
                }
            }
            Stop::SignalDelivery { signal } => {
                // reinjected on restart; group and event stops never reach
                // this arm, so nothing is swallowed here
                trace!(pid, ?signal, "forwarding signal");
            }
            _ => {}
        }
        Ok(())
    }

    fn on_syscall_stop(&mut self, tracee: &mut Tracee) -> Result<()> {
        let mut regs = tracee.registers()?;
        let pid = tracee.pid.as_raw();
        // orig_rax survives the kernel overwriting rax with the result
        let sysno = regs.orig_rax as i64;

        let state = self.tracees.entry(pid).or_insert_with(TraceeState::new);
        let phase = state.observe_stop();
        match (phase, &tracee.stop) {
            (Phase::Entry, Stop::SyscallEnter) | (Phase::Exit, Stop::SyscallExit) => {}
            _ => warn!(pid, ?phase, stop = ?tracee.stop, "phase flag out of step"),
        }
        if phase == Phase::Entry {
            state.last_sysno = sysno;
        } else if state.last_sysno != sysno {
            trace!(
                pid,
                entry = state.last_sysno,
                exit = sysno,
                "syscall number changed between phases"
            );
        }

        let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
        match phase {
            Phase::Entry => {
                trace!(pid, syscall = %syscall_name(regs.orig_rax), "entry");
                let ev = SyscallEvent {
                    pid,
                    sysno,
                    args,
                    ret: 0,
                };
                let verdict = self.policy.on_entry(&ev, &mut TraceeMem::new(tracee));
                if let EntryVerdict::Suppress { ret } = verdict {
                    // Blocked call: aim the kernel at a syscall number that
                    // cannot exist and supply the result at exit.
                    let fake = 512 + rand::thread_rng().gen::<u16>() as u64;
                    debug!(pid, sysno, fake, ret, "suppressing syscall");
                    regs.orig_rax = fake;
                    tracee.set_registers(regs)?;
                    self.blocked.insert(pid, ret);
                }
            }
            Phase::Exit => {
                trace!(
                    pid,
                    syscall = %syscall_name(regs.orig_rax),
                    ret = regs.rax as i64,
                    "exit"
                );
                if let Some(ret) = self.blocked.remove(&pid) {
                    regs.rax = ret as u64;
                    tracee.set_registers(regs)?;
                    return Ok(());
                }
                let ev = SyscallEvent {
                    pid,
                    sysno,
                    args,
                    ret: regs.rax as i64,
                };
                if let ExitVerdict::Override { ret } =
                    self.policy.on_exit(&ev, &mut TraceeMem::new(tracee))
                {
                    regs.rax = ret as u64;
                    tracee.set_registers(regs)?;
                }
            }
        }
        Ok(())
    }
}

/// The exit event carries the raw wait status; fold signal deaths into the
/// conventional 128+signo shell encoding.
fn decode_wait_status(raw: i32) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        128 + libc::WTERMSIG(raw)
    } else {
        raw
    }
}
