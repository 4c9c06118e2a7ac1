//! Materialises the fixture trees the canonical rewrite rules point at:
//! a cgroup v1 hierarchy under `/tmp/fake-cgroup`, the sysctl entries the
//! container runtimes actually read under `/tmp/fake-procsys`, and the two
//! single-file fixtures. The values only need to be plausible; nothing is
//! documented as depending on the exact numbers.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

const SUBSYSTEMS: &[&str] = &[
    "cpu", "cpuacct", "memory", "blkio", "devices", "freezer", "net_cls", "net_prio", "pids",
    "hugetlb",
];

const CGROUP_FILES: &[(&str, &str)] = &[
    ("cpu/cpu.shares", "1024\n"),
    ("cpu/cpu.cfs_period_us", "100000\n"),
    ("cpu/cpu.cfs_quota_us", "-1\n"),
    ("cpu/cpu.stat", "nr_periods 0\nnr_throttled 0\nthrottled_time 0\n"),
    // ~8 EiB, the kernel's spelling of "unlimited"
    ("memory/memory.limit_in_bytes", "9223372036854771712\n"),
    ("blkio/blkio.throttle.io_service_bytes", ""),
    ("blkio/blkio.throttle.io_serviced", ""),
    ("devices/devices.list", "a *:* rwm\n"),
    ("freezer/freezer.state", "THAWED\n"),
    ("net_cls/net_cls.classid", "0\n"),
    ("net_prio/net_prio.ifpriomap", ""),
    ("pids/pids.max", "max\n"),
    ("pids/pids.current", "1\n"),
];

const PROCSYS_FILES: &[(&str, &str)] = &[
    ("kernel/panic", "0\n"),
    ("kernel/panic_on_oops", "0\n"),
    ("kernel/pid_max", "4194304\n"),
    ("kernel/keys/root_maxkeys", "1000000\n"),
    ("kernel/keys/root_maxbytes", "25000000\n"),
    ("vm/panic_on_oom", "0\n"),
    ("vm/overcommit_memory", "1\n"),
];

const DISKSTATS: &str =
    "   8       0 sda 12021 287 1019168 3044 7613 10873 563712 8891 0 7340 11935 0 0 0 0 0 0\n";

/// Seed everything under `base` (normally `/tmp`).
pub fn seed_into(base: &Path) -> Result<()> {
    let cgroup = base.join("fake-cgroup");
    for &subsystem in SUBSYSTEMS {
        fs::create_dir_all(cgroup.join(subsystem))
            .with_context(|| format!("creating cgroup subsystem {subsystem}"))?;
    }
    for &(rel, content) in CGROUP_FILES {
        write_fixture(&cgroup.join(rel), content)?;
    }
    for (rel, content) in dynamic_cgroup_files() {
        write_fixture(&cgroup.join(rel), &content)?;
    }

    let procsys = base.join("fake-procsys");
    for &(rel, content) in PROCSYS_FILES {
        write_fixture(&procsys.join(rel), content)?;
    }

    write_fixture(&base.join("fake-diskstats"), DISKSTATS)?;
    write_fixture(
        &base.join("fake-cpuacct-usage-percpu"),
        &percpu_usage_line(),
    )?;

    Ok(())
}

/// Seed the default `/tmp` locations the canonical mappings use.
pub fn seed() -> Result<()> {
    seed_into(Path::new("/tmp"))
}

fn write_fixture(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "seeded fixture");
    Ok(())
}

/// One-shot snapshots of the files the emulated cgroupfs derives from the
/// clock.
fn dynamic_cgroup_files() -> Vec<(&'static str, String)> {
    let ns = monotonic_ns();
    vec![
        ("cpuacct/cpuacct.usage", format!("{ns}\n")),
        (
            "cpuacct/cpuacct.stat",
            format!(
                "user {}\nsystem {}\n",
                ns / 2 / 10_000_000,
                ns / 4 / 10_000_000
            ),
        ),
        ("memory/memory.usage_in_bytes", "209715200\n".to_owned()),
        ("memory/memory.max_usage_in_bytes", "262144000\n".to_owned()),
        (
            "memory/memory.stat",
            "cache 0\nrss 209715200\nmapped_file 0\npgfault 0\npgmajfault 0\n".to_owned(),
        ),
    ]
}

fn percpu_usage_line() -> String {
    let per_cpu = monotonic_ns() / 4;
    format!("{per_cpu} {per_cpu} {per_cpu} {per_cpu}\n")
}

fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec * 1_000_000_000 + ts.tv_nsec
}
