//! Spoofing the filesystem type a successful `statfs`/`fstatfs` reports.
//! The sandbox's 9p root scares container runtimes into refusing to start;
//! rewriting the superblock magic to ext4 keeps them going.

use crate::magic;
use crate::mem::{MemoryError, TraceeMemory};
use std::mem::size_of;

#[derive(Debug, Clone, Copy)]
pub struct FsTypeSpoof {
    pub from: u32,
    pub to: u32,
}

pub const CANONICAL: FsTypeSpoof = FsTypeSpoof {
    from: magic::NINE_P,
    to: magic::EXT4,
};

impl FsTypeSpoof {
    /// Returns true when the record was modified. Records whose type is not
    /// the source magic are left byte-identical.
    pub fn apply(&self, sb: &mut libc::statfs) -> bool {
        if sb.f_type != self.from as libc::__fsword_t {
            return false;
        }
        sb.f_type = self.to as libc::__fsword_t;
        // ext4 advertises 255; a zero or absurd value trips path-length
        // probes in the target
        if sb.f_namelen < 1 || sb.f_namelen > 255 {
            sb.f_namelen = 255;
        }
        true
    }

    /// Same rewrite against a record living in tracee memory. Nothing is
    /// written back unless the record actually changes.
    pub fn apply_remote(
        &self,
        mem: &mut dyn TraceeMemory,
        addr: u64,
    ) -> Result<bool, MemoryError> {
        let mut raw = [0u8; size_of::<libc::statfs>()];
        mem.read_bytes(addr, &mut raw)?;
        let mut sb: libc::statfs =
            unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::statfs) };
        if !self.apply(&mut sb) {
            return Ok(false);
        }
        let raw = unsafe {
            std::slice::from_raw_parts(
                &sb as *const libc::statfs as *const u8,
                size_of::<libc::statfs>(),
            )
        };
        mem.write_bytes(addr, raw)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::testing::BufMemory;

    fn nine_p_record() -> libc::statfs {
        let mut sb: libc::statfs = unsafe { std::mem::zeroed() };
        sb.f_type = magic::NINE_P as libc::__fsword_t;
        sb.f_bsize = 4096;
        sb.f_blocks = 1 << 20;
        sb.f_namelen = 255;
        sb
    }

    #[test]
    fn nine_p_becomes_ext4() {
        let mut sb = nine_p_record();
        assert!(CANONICAL.apply(&mut sb));
        assert_eq!(sb.f_type, magic::EXT4 as libc::__fsword_t);
        assert_eq!(sb.f_namelen, 255);
    }

    #[test]
    fn zero_namelen_is_clamped() {
        let mut sb = nine_p_record();
        sb.f_namelen = 0;
        assert!(CANONICAL.apply(&mut sb));
        assert_eq!(sb.f_namelen, 255);

        let mut sb = nine_p_record();
        sb.f_namelen = 4096;
        assert!(CANONICAL.apply(&mut sb));
        assert_eq!(sb.f_namelen, 255);
    }

    #[test]
    fn sane_namelen_survives() {
        let mut sb = nine_p_record();
        sb.f_namelen = 128;
        assert!(CANONICAL.apply(&mut sb));
        assert_eq!(sb.f_namelen, 128);
    }

    #[test]
    fn foreign_types_pass_untouched() {
        let mut sb = nine_p_record();
        sb.f_type = magic::XFS as libc::__fsword_t;
        sb.f_namelen = 0;
        let before = sb;
        assert!(!CANONICAL.apply(&mut sb));
        // byte-for-byte, clamp included
        let a = unsafe {
            std::slice::from_raw_parts(&before as *const _ as *const u8, size_of::<libc::statfs>())
        };
        let b = unsafe {
            std::slice::from_raw_parts(&sb as *const _ as *const u8, size_of::<libc::statfs>())
        };
        assert_eq!(a, b);
    }

    #[test]
    fn spoof_is_idempotent() {
        let mut sb = nine_p_record();
        assert!(CANONICAL.apply(&mut sb));
        let once = sb;
        assert!(!CANONICAL.apply(&mut sb));
        let a = unsafe {
            std::slice::from_raw_parts(&once as *const _ as *const u8, size_of::<libc::statfs>())
        };
        let b = unsafe {
            std::slice::from_raw_parts(&sb as *const _ as *const u8, size_of::<libc::statfs>())
        };
        assert_eq!(a, b);
    }

    #[test]
    fn remote_rewrite_leaves_rest_of_record_alone() {
        let mut mem = BufMemory::new(0x2000, size_of::<libc::statfs>() + 16);
        let sb = nine_p_record();
        let raw = unsafe {
            std::slice::from_raw_parts(&sb as *const _ as *const u8, size_of::<libc::statfs>())
        };
        mem.load(0x2000, raw);
        let before = mem.data.clone();

        assert!(CANONICAL.apply_remote(&mut mem, 0x2000).unwrap());
        let mut round: libc::statfs = unsafe { std::mem::zeroed() };
        let dst = &mut round as *mut libc::statfs as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(mem.data.as_ptr(), dst, size_of::<libc::statfs>())
        };
        assert_eq!(round.f_type, magic::EXT4 as libc::__fsword_t);
        assert_eq!(round.f_bsize, 4096);
        assert_eq!(round.f_blocks, 1 << 20);

        // spoofing back restores the original bytes
        let reverse = FsTypeSpoof {
            from: magic::EXT4,
            to: magic::NINE_P,
        };
        assert!(reverse.apply_remote(&mut mem, 0x2000).unwrap());
        assert_eq!(mem.data, before);
    }

    #[test]
    fn untracked_type_triggers_no_write() {
        let mut mem = BufMemory::new(0x2000, size_of::<libc::statfs>());
        let mut sb = nine_p_record();
        sb.f_type = magic::BTRFS as libc::__fsword_t;
        let raw = unsafe {
            std::slice::from_raw_parts(&sb as *const _ as *const u8, size_of::<libc::statfs>())
        };
        mem.load(0x2000, raw);
        let before = mem.data.clone();
        assert!(!CANONICAL.apply_remote(&mut mem, 0x2000).unwrap());
        assert_eq!(mem.data, before);
    }
}
