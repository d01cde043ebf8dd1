use std::ffi::OsString;

use fuser::FileType;
use libc::S_IFMT;

/// One record of a merged directory listing, cached in the directory's
/// descriptor between opendir and releasedir. Offsets are 1-based and
/// sequential; `offset` is the value handed back to the kernel so the
/// next readdir can resume after this entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub mode: u32,
    pub offset: i64,
    pub deleted: bool,
}

impl DirEntry {
    /// Directory-entry type, derived from the high mode bits.
    pub fn dtype(&self) -> u32 {
        (self.mode & S_IFMT as u32) >> 12
    }

    pub fn kind(&self) -> FileType {
        match self.dtype() {
            x if x == libc::DT_DIR as u32 => FileType::Directory,
            x if x == libc::DT_LNK as u32 => FileType::Symlink,
            x if x == libc::DT_BLK as u32 => FileType::BlockDevice,
            x if x == libc::DT_CHR as u32 => FileType::CharDevice,
            x if x == libc::DT_FIFO as u32 => FileType::NamedPipe,
            x if x == libc::DT_SOCK as u32 => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }
}

/// Where serialized entries go: the kernel reply buffer in production,
/// a bounded stub in tests. `push` reports that the entry did NOT fit;
/// the serializer stops at the first refusal.
pub trait DirentSink {
    fn push(&mut self, entry: &DirEntry) -> bool;
}

impl DirentSink for fuser::ReplyDirectory {
    fn push(&mut self, entry: &DirEntry) -> bool {
        self.add(entry.ino, entry.offset, entry.kind(), &entry.name)
    }
}

/// Stream the cached listing into the reply buffer, starting after
/// `offset` entries, until the batch is exhausted or the buffer is full.
pub fn fill(stream: &[DirEntry], offset: i64, sink: &mut impl DirentSink) -> Result<(), i32> {
    if offset < 0 || offset as usize > stream.len() {
        return Err(libc::EINVAL);
    }
    for entry in &stream[offset as usize..] {
        if sink.push(entry) {
            break;
        }
    }
    Ok(())
}
