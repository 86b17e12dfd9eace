//! The on-demand FUSE filesystem.
//!
//! `FsCore` owns the inode tree and the lookup pipeline; `WorkerFs` is
//! the thin `fuser::Filesystem` glue translating kernel requests into
//! core calls and core results into replies.

mod dir;
mod file;
mod fs;

pub use dir::{CachedMeta, DirEntryItem, Directory};
pub use file::{FileInit, FileNode};
pub use fs::{FsCore, Node, ROOT_INO};

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen,
    ReplyStatfs, Request,
};

/// Kernel-side entry/attr cache lifetime for normal entries. The user
/// script gets zero instead, so it is re-resolved on every run.
pub(crate) const ENTRY_TTL: Duration = Duration::from_secs(5 * 60);

const BLOCK_SIZE: u32 = 512;

/// `fuser::Filesystem` adapter over [`FsCore`].
pub struct WorkerFs {
    core: Arc<FsCore>,
}

impl WorkerFs {
    pub fn new(core: Arc<FsCore>) -> Self {
        Self { core }
    }
}

/// Attributes for a file reply. The stored mode is widened with 0o777:
/// the container runs as root and needs exec on every file.
pub(crate) fn file_attr(ino: u64, mode: u32, size: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(BLOCK_SIZE as u64),
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::RegularFile,
        perm: ((mode | 0o777) & 0o7777) as u16,
        nlink: 1,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub(crate) fn dir_attr(ino: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

impl Filesystem for WorkerFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            return reply.error(libc::ENOENT);
        };
        let parent = match self.core.node(parent) {
            Some(Node::Dir(dir)) => dir,
            _ => return reply.error(libc::ENOENT),
        };

        match self.core.lookup(&parent, name) {
            Ok((Node::Dir(dir), ttl)) => reply.entry(&ttl, &dir_attr(dir.ino()), 0),
            Ok((Node::File(file), ttl)) => {
                reply.entry(&ttl, &file_attr(file.ino(), file.mode(), file.size()), 0)
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.core.node(ino) {
            Some(Node::Dir(dir)) => reply.attr(&ENTRY_TTL, &dir_attr(dir.ino())),
            Some(Node::File(file)) => reply.attr(
                &file.ttl(),
                &file_attr(file.ino(), file.mode(), file.size()),
            ),
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.core.node(ino) {
            Some(Node::File(file)) => match file.open() {
                // The inode itself is the handle; open is idempotent.
                Ok(()) => reply.opened(ino, 0),
                Err(errno) => reply.error(errno),
            },
            Some(Node::Dir(_)) => reply.error(libc::EISDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.core.node(ino) {
            Some(Node::File(file)) => match file.read(offset, size) {
                Ok(bytes) => reply.data(&bytes),
                Err(errno) => reply.error(errno),
            },
            Some(Node::Dir(_)) => reply.error(libc::EISDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.core.node(ino) {
            Some(Node::Dir(dir)) => dir,
            Some(Node::File(_)) => return reply.error(libc::ENOTDIR),
            None => return reply.error(libc::ENOENT),
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for item in self.core.readdir(&dir) {
            let kind = if item.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((item.ino, kind, item.name));
        }

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok()
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // The remote side is effectively unbounded; report a large
        // fixed capacity.
        reply.statfs(1 << 30, 1 << 30, 1 << 30, 0, 0, 4096, 255, 4096);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_attrs_widen_mode_for_exec() {
        let attr = file_attr(7, 0o644, 1024);
        assert_eq!(attr.perm, 0o777);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 1024);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.kind, FileType::RegularFile);

        // setuid-style bits survive the widening
        let attr = file_attr(7, 0o4755, 10);
        assert_eq!(attr.perm, 0o4777);
    }

    #[test]
    fn dir_attrs_are_fixed() {
        let attr = dir_attr(3);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.kind, FileType::Directory);
    }
}
