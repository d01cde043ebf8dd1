use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::overlay::direntry::DirEntry;
use crate::overlay::ident::ObjectId;

/// The re-plumbable half of an open descriptor: the kernel fd and the
/// layer it is currently open against. Taking this lock serialises I/O
/// with the close/reopen pair during copy-up re-plumbing, so no request
/// can observe a transiently closed fd.
#[derive(Debug)]
pub struct FdState {
    pub file: File,
    pub layer: usize,
}

#[derive(Debug)]
pub enum Backing {
    File(Mutex<FdState>),
    /// Merged listing snapshotted at opendir time.
    Dir(Vec<DirEntry>),
}

/// One open handle: the owning object, the process that opened it, the
/// open flags (kept for reopens), and the file or directory backing.
#[derive(Debug)]
pub struct Descriptor {
    pub id: ObjectId,
    pub pid: u32,
    pub flags: i32,
    pub backing: Backing,
}

impl Descriptor {
    pub fn open_file(id: ObjectId, pid: u32, flags: i32, file: File, layer: usize) -> Self {
        Descriptor {
            id,
            pid,
            flags,
            backing: Backing::File(Mutex::new(FdState { file, layer })),
        }
    }

    pub fn open_dir(id: ObjectId, pid: u32, stream: Vec<DirEntry>) -> Self {
        Descriptor {
            id,
            pid,
            flags: 0,
            backing: Backing::Dir(stream),
        }
    }

    pub fn file_state(&self) -> Option<&Mutex<FdState>> {
        match &self.backing {
            Backing::File(state) => Some(state),
            Backing::Dir(_) => None,
        }
    }

    pub fn stream(&self) -> Option<&[DirEntry]> {
        match &self.backing {
            Backing::Dir(stream) => Some(stream),
            Backing::File(_) => None,
        }
    }
}

struct Inner {
    map: HashMap<u64, Arc<Descriptor>>,
    next_fh: u64,
}

/// Open-descriptor table. Handles are opaque 64-bit tokens minted here;
/// records are shared out as Arcs so I/O happens outside the table lock.
pub struct FdTable {
    inner: Mutex<Inner>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                next_fh: 1,
            }),
        }
    }

    pub fn put(&self, descriptor: Descriptor) -> u64 {
        let mut inner = self.inner.lock();
        let fh = inner.next_fh;
        inner.next_fh = inner.next_fh.wrapping_add(1);
        inner.map.insert(fh, Arc::new(descriptor));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<Descriptor>> {
        self.inner.lock().map.get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<Descriptor>> {
        self.inner.lock().map.remove(&fh)
    }

    /// First file-backed descriptor owned by `(id, pid)`. getattr uses
    /// this to answer from fstat while the caller holds the file open.
    pub fn find_by_owner(&self, id: &ObjectId, pid: u32) -> Option<Arc<Descriptor>> {
        let inner = self.inner.lock();
        inner
            .map
            .values()
            .find(|d| d.id == *id && d.pid == pid && d.file_state().is_some())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
