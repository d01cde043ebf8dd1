use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::MetadataExt;

use crate::overlay::direntry::DirEntry;
use crate::overlay::ident::ObjectId;
use crate::overlay::store::LayerStore;

/// Merged listing of a directory object: walk the layers top-down, first
/// occurrence of a name wins, whited-out names are suppressed, and a
/// layer whose backing object is not a directory masks everything deeper.
/// A synthetic `.` entry for the directory itself is appended and offsets
/// are assigned sequentially starting at 1.
pub fn merged_entries(store: &LayerStore, dir: &ObjectId) -> Result<Vec<DirEntry>, i32> {
    let mut names: HashMap<OsString, DirEntry> = HashMap::new();

    for layer in 0..store.num_layers() {
        let dir_path = store.path(layer, dir);
        let meta = match fs::symlink_metadata(&dir_path) {
            Ok(m) => m,
            // Absent on this layer; keep aggregating deeper ones.
            Err(_) => continue,
        };
        if !meta.is_dir() {
            break;
        }
        let Ok(read_dir) = fs::read_dir(&dir_path) else {
            break;
        };

        for entry in read_dir.flatten() {
            let name = entry.file_name();
            if names.contains_key(&name) {
                continue;
            }
            let Ok(entry_meta) = entry.metadata() else {
                continue;
            };
            let mut merged = DirEntry {
                name: name.clone(),
                ino: 0,
                mode: entry_meta.mode(),
                offset: 0,
                deleted: false,
            };
            if store.is_deleted(&entry.path()) {
                merged.deleted = true;
            } else {
                match store.child_id(dir, &name, Some(layer)) {
                    Ok(id) => merged.ino = id.to_ino(),
                    Err(_) => {
                        tracing::debug!(
                            "no id pointer on {:?} in layer {}, skipping",
                            name,
                            layer
                        );
                        continue;
                    }
                }
            }
            names.insert(name, merged);
        }
    }

    let mut entries: Vec<DirEntry> = names.into_values().filter(|e| !e.deleted).collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.push(DirEntry {
        name: OsString::from("."),
        ino: dir.to_ino(),
        mode: libc::S_IFDIR as u32,
        offset: 0,
        deleted: false,
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.offset = i as i64 + 1;
    }
    Ok(entries)
}

/// True when the merged listing holds nothing besides the directory
/// itself. rmdir refuses with ENOTEMPTY otherwise.
pub fn is_empty(store: &LayerStore, dir: &ObjectId) -> Result<bool, i32> {
    Ok(merged_entries(store, dir)?.iter().all(|e| e.name == "."))
}
