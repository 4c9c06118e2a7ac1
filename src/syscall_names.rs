//! Number-to-name mapping for x86_64 syscalls, so verbose lines read
//! `openat` rather than `257`. Diagnostics only; dispatch never consults it.

use once_cell::sync::Lazy;
use std::collections::HashMap;

type SyscallTable = HashMap<u64, String>;

static TABLE: Lazy<SyscallTable> = Lazy::new(load_syscall_table);
const SYSCALLS: &str = include_str!("data/syscalls_x64.tsv");

fn load_syscall_table() -> SyscallTable {
    let mut syscalls = HashMap::new();

    for line in SYSCALLS.split_terminator('\n') {
        let (call_no, name) = line
            .split_once('\t')
            .map(|(x, y)| (x.trim().parse::<u64>().unwrap(), y.trim().to_owned()))
            .unwrap();
        syscalls.insert(call_no, name);
    }

    syscalls
}

pub(crate) fn syscall_name(call_no: u64) -> String {
    TABLE
        .get(&call_no)
        .cloned()
        .unwrap_or_else(|| format!("unknown (syscall no = {call_no:#x})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_the_intercepted_calls() {
        assert_eq!(syscall_name(libc::SYS_open as u64), "open");
        assert_eq!(syscall_name(libc::SYS_openat as u64), "openat");
        assert_eq!(syscall_name(libc::SYS_statfs as u64), "statfs");
        assert_eq!(syscall_name(libc::SYS_fstatfs as u64), "fstatfs");
        assert_eq!(syscall_name(libc::SYS_bind as u64), "bind");
    }

    #[test]
    fn unknown_numbers_fall_back_to_hex() {
        assert!(syscall_name(0x5005).starts_with("unknown"));
    }
}
