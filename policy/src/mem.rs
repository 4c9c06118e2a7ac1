//! Access to a tracee's address space, abstracted so rule code never knows
//! which transport is active. The supervisor implements [`TraceeMemory`]
//! across the process boundary; the interposer's implementation is the
//! identity over its own address space.

use std::mem::size_of;
use thiserror::Error;

const WORD: usize = size_of::<u64>();

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("fault reading {len} bytes at {addr:#x}")]
    Read { addr: u64, len: usize },
    #[error("fault writing {len} bytes at {addr:#x}")]
    Write { addr: u64, len: usize },
}

pub trait TraceeMemory {
    fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Read a nul-terminated string, one word at a time, scanning each word
    /// for the terminator. A fault after the first word is treated as the
    /// end of the string; a string longer than `max` is truncated and
    /// terminated, which can produce an incorrect rewrite for pathological
    /// paths (known limitation).
    fn read_cstring(&mut self, addr: u64, max: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(WORD * 8);
        let mut word = [0u8; WORD];
        loop {
            match self.read_bytes(addr + out.len() as u64, &mut word) {
                Err(e) if out.is_empty() => return Err(e),
                Err(_) => break,
                Ok(()) => {}
            }
            if let Some(nul) = word.iter().position(|b| *b == 0) {
                out.extend_from_slice(&word[..nul]);
                break;
            }
            out.extend_from_slice(&word);
            if out.len() >= max - 1 {
                break;
            }
        }
        out.truncate(max - 1);
        Ok(out)
    }

    /// Write `s` plus a terminator. The final partial word is padded with
    /// the bytes already present in the tracee so nothing past the
    /// terminator changes.
    fn write_cstring(&mut self, addr: u64, s: &[u8]) -> Result<(), MemoryError> {
        let mut data = Vec::with_capacity(s.len() + WORD);
        data.extend_from_slice(s);
        data.push(0);
        let tail = data.len() % WORD;
        if tail != 0 {
            let base = data.len() - tail;
            let mut word = [0u8; WORD];
            self.read_bytes(addr + base as u64, &mut word)?;
            data.extend_from_slice(&word[tail..]);
        }
        self.write_bytes(addr, &data)
    }
}

/// Identity adapter over the calling process's own address space, for the
/// in-process transport. Addresses must be valid in this process; they come
/// straight from the intercepted call's arguments.
pub struct LocalMemory;

impl TraceeMemory for LocalMemory {
    fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if addr == 0 {
            return Err(MemoryError::Read {
                addr,
                len: buf.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        if addr == 0 {
            return Err(MemoryError::Write {
                addr,
                len: data.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A flat region at a fixed base, standing in for a tracee.
    pub(crate) struct BufMemory {
        pub base: u64,
        pub data: Vec<u8>,
    }

    impl BufMemory {
        pub(crate) fn new(base: u64, size: usize) -> Self {
            Self {
                base,
                data: vec![0; size],
            }
        }

        pub(crate) fn load(&mut self, addr: u64, bytes: &[u8]) {
            let off = (addr - self.base) as usize;
            self.data[off..off + bytes.len()].copy_from_slice(bytes);
        }

        fn range(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
            let off = addr.checked_sub(self.base)? as usize;
            if off + len > self.data.len() {
                return None;
            }
            Some(off..off + len)
        }
    }

    impl TraceeMemory for BufMemory {
        fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
            match self.range(addr, buf.len()) {
                Some(r) => {
                    buf.copy_from_slice(&self.data[r]);
                    Ok(())
                }
                None => Err(MemoryError::Read {
                    addr,
                    len: buf.len(),
                }),
            }
        }

        fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
            match self.range(addr, data.len()) {
                Some(r) => {
                    self.data[r].copy_from_slice(data);
                    Ok(())
                }
                None => Err(MemoryError::Write {
                    addr,
                    len: data.len(),
                }),
            }
        }
    }

    /// Every access faults; for the fail-open paths.
    pub(crate) struct FaultyMemory;

    impl TraceeMemory for FaultyMemory {
        fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
            Err(MemoryError::Read {
                addr,
                len: buf.len(),
            })
        }

        fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
            Err(MemoryError::Write {
                addr,
                len: data.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::BufMemory;
    use super::*;

    #[test]
    fn cstring_read_stops_at_terminator() {
        let mut mem = BufMemory::new(0x1000, 64);
        mem.load(0x1000, b"/proc/sys/kernel/pid_max\0garbage");
        let s = mem.read_cstring(0x1000, 4096).unwrap();
        assert_eq!(s, b"/proc/sys/kernel/pid_max");
    }

    #[test]
    fn cstring_read_fault_past_first_word_is_end_of_string() {
        // 16-byte region holds exactly two words and no terminator.
        let mut mem = BufMemory::new(0x1000, 16);
        mem.load(0x1000, b"0123456789abcdef");
        let s = mem.read_cstring(0x1000, 4096).unwrap();
        assert_eq!(s, b"0123456789abcdef");
    }

    #[test]
    fn cstring_read_fault_on_first_word_propagates() {
        let mut mem = BufMemory::new(0x1000, 16);
        assert!(mem.read_cstring(0x8000, 4096).is_err());
    }

    #[test]
    fn cstring_read_truncates_at_cap() {
        let mut mem = BufMemory::new(0x1000, 64);
        mem.load(0x1000, b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let s = mem.read_cstring(0x1000, 16).unwrap();
        assert_eq!(s.len(), 15);
    }

    #[test]
    fn cstring_write_preserves_trailing_word_bytes() {
        let mut mem = BufMemory::new(0x1000, 32);
        mem.load(0x1000, b"/tmp/original-path\0XYZWVUT");
        mem.write_cstring(0x1000, b"/tmp/new").unwrap();
        // terminator lands mid-word; the bytes after it are untouched
        assert_eq!(&mem.data[..9], b"/tmp/new\0");
        assert_eq!(&mem.data[9..16], b"inal-pa");
        assert_eq!(&mem.data[16..22], b"th\0XYZ");
    }

    #[test]
    fn cstring_round_trip_is_byte_identical() {
        let mut mem = BufMemory::new(0x1000, 64);
        mem.load(0x1000, b"/sys/fs/cgroup/memory\0padpadpad");
        let before = mem.data.clone();
        let s = mem.read_cstring(0x1000, 4096).unwrap();
        mem.write_cstring(0x1000, &s).unwrap();
        assert_eq!(mem.data, before);
    }
}
