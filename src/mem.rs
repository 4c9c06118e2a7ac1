//! The supervisor's view of a stopped tracee's memory, borrowed for the
//! duration of one stop.

use mirage_policy::mem::{MemoryError, TraceeMemory};
use pete::Tracee;

pub(crate) struct TraceeMem<'a> {
    tracee: &'a mut Tracee,
}

impl<'a> TraceeMem<'a> {
    pub(crate) fn new(tracee: &'a mut Tracee) -> Self {
        Self { tracee }
    }
}

impl TraceeMemory for TraceeMem<'_> {
    fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let len = buf.len();
        match self.tracee.read_memory_mut(addr, buf) {
            Ok(n) if n == len => Ok(()),
            _ => Err(MemoryError::Read { addr, len }),
        }
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        match self.tracee.write_memory(addr, data) {
            Ok(n) if n == data.len() => Ok(()),
            _ => Err(MemoryError::Write {
                addr,
                len: data.len(),
            }),
        }
    }
}
