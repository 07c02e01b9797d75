//! The shared inode numbering and attribute scheme used by every node kind.
//!
//! The tree (`dir.rs`, `file.rs`) owns the actual node structs; this module
//! only holds what they all need: a process-wide ino counter and the
//! `FileAttr` builder, mirroring `nodes::make_attr` in the teacher but with
//! our own mode/uid/gid policy (SPEC_FULL.md §3).
use fuser::{FileAttr, FileType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_INO: AtomicU64 = AtomicU64::new(2);

/// Allocates the next inode number. Ino 1 is reserved for the root and is
/// never handed out here.
pub fn alloc_ino() -> u64 {
    NEXT_INO.fetch_add(1, Ordering::Relaxed)
}

pub const ROOT_INO: u64 = 1;

fn epoch() -> SystemTime {
    UNIX_EPOCH
}

/// Builds a `FileAttr` for a freshly-created node. `size` is the content
/// length for files, 0 for everything else; directories get nlink fixed up
/// by the caller once children are known.
pub fn make_attr(ino: u64, kind: FileType, size: u64, perm: u16) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size,
        blocks: (size + 511) / 512,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: epoch(),
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ino_allocation_is_monotonic_and_skips_root() {
        let a = alloc_ino();
        let b = alloc_ino();
        assert!(a >= 2);
        assert!(b > a);
        assert_ne!(a, ROOT_INO);
    }

    #[test]
    fn directory_attr_starts_with_two_links() {
        let attr = make_attr(alloc_ino(), FileType::Directory, 0, 0o755);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.kind, FileType::Directory);
    }
}
