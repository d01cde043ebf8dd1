use fuser::{FileAttr, FileType};
use libc::S_IFMT;
use std::fs::Metadata;
use std::io;
use std::os::unix::prelude::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Map std::io::Error to the errno carried back in the FUSE reply.
/// The raw OS error is the accurate one whenever it is present.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

pub(crate) fn mode_to_filetype(mode: u32) -> FileType {
    match mode & (S_IFMT as u32) {
        x if x == libc::S_IFREG as u32 => FileType::RegularFile,
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

/// Build the attribute block the kernel sees from a backing-object stat.
/// `ino` is the id-derived inode number, never the backing filesystem's.
pub(crate) fn metadata_to_fileattr(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: systime(meta.atime(), meta.atime_nsec()),
        mtime: systime(meta.mtime(), meta.mtime_nsec()),
        ctime: systime(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: mode_to_filetype(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}
