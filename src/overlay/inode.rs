use std::collections::HashMap;

use parking_lot::Mutex;

use crate::overlay::ident::{ObjectId, ROOT_ID};

/// In-memory state for one logical object: its identity, the shallowest
/// layer currently carrying it (None while absent everywhere), and the
/// kernel's outstanding lookup count.
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: ObjectId,
    pub layer: Option<usize>,
    nlookup: u64,
}

struct Maps {
    by_handle: HashMap<u64, Inode>,
    by_id: HashMap<ObjectId, u64>,
}

/// Two mappings over the same records: by node handle and by object id.
/// The handle is the id-derived inode number, so handles are stable
/// tokens independent of in-process layout; the root is always handle 1.
///
/// Records are created on first successful lookup, retained while the
/// kernel holds references, and discarded when `forget` drains the count.
/// The root record is pre-installed and never discarded.
pub struct InodeTable {
    maps: Mutex<Maps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_handle = HashMap::new();
        let mut by_id = HashMap::new();
        by_handle.insert(
            1,
            Inode {
                id: ROOT_ID,
                layer: None,
                nlookup: 1,
            },
        );
        by_id.insert(ROOT_ID, 1);
        InodeTable {
            maps: Mutex::new(Maps { by_handle, by_id }),
        }
    }

    /// Snapshot of the record behind a node handle.
    pub fn get(&self, handle: u64) -> Option<Inode> {
        self.maps.lock().by_handle.get(&handle).cloned()
    }

    /// Snapshot of the record for an object id, if the kernel knows it.
    pub fn find_by_id(&self, id: &ObjectId) -> Option<Inode> {
        let maps = self.maps.lock();
        let handle = maps.by_id.get(id)?;
        maps.by_handle.get(handle).cloned()
    }

    /// Record a successful kernel lookup: bump the count of an existing
    /// record or install a fresh one. Returns the node handle.
    pub fn register_lookup(&self, id: ObjectId, layer: Option<usize>) -> u64 {
        let mut maps = self.maps.lock();
        if let Some(&handle) = maps.by_id.get(&id) {
            if let Some(inode) = maps.by_handle.get_mut(&handle) {
                inode.nlookup += 1;
                inode.layer = layer;
            }
            return handle;
        }
        let handle = id.to_ino();
        maps.by_handle.insert(
            handle,
            Inode {
                id,
                layer,
                nlookup: 1,
            },
        );
        maps.by_id.insert(id, handle);
        handle
    }

    /// Drop `n` kernel references (`n == 0` clears the count outright);
    /// at zero the record is removed from both maps. The root is exempt.
    pub fn forget(&self, handle: u64, n: u64) {
        let mut maps = self.maps.lock();
        let Some(inode) = maps.by_handle.get_mut(&handle) else {
            return;
        };
        if inode.id.is_root() {
            return;
        }
        if n == 0 {
            inode.nlookup = 0;
        } else {
            inode.nlookup = inode.nlookup.saturating_sub(n);
        }
        if inode.nlookup == 0 {
            let id = inode.id;
            maps.by_handle.remove(&handle);
            maps.by_id.remove(&id);
        }
    }

    /// Update the recorded layer of an object (after copy-up, removal,
    /// or a fresh locate).
    pub fn set_layer(&self, id: &ObjectId, layer: Option<usize>) {
        let mut maps = self.maps.lock();
        if let Some(&handle) = maps.by_id.get(id) {
            if let Some(inode) = maps.by_handle.get_mut(&handle) {
                inode.layer = layer;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
