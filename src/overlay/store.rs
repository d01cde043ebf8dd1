use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use fuser::FileAttr;
use nix::sys::stat::{mknod, utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::{statvfs, Statvfs};
use nix::sys::time::TimeSpec;

use crate::overlay::convert::{io_error_to_libc, metadata_to_fileattr};
use crate::overlay::ident::{ObjectId, ROOT_ID};

/// Object id pointer, stored on directory child entries.
pub const ID_XATTR: &str = "trusted.constor.id";
/// Whiteout marker. Presence hides same-named entries in deeper layers.
pub const DELETED_XATTR: &str = "trusted.constor.deleted";
/// ASCII decimal link count, maintained on top-layer backing objects only.
pub const LINKS_XATTR: &str = "trusted.constor.links";

const DELETED_SENTINEL: &[u8] = &[0x31];

/// Resolves `(layer, id)` pairs to backing paths and owns every on-disk
/// convention: the reserved xattrs, whiteout placeholders, link counts,
/// and copy-up. Stateless in memory; all state lives in the layer
/// directories themselves.
pub struct LayerStore {
    layers: Vec<PathBuf>,
}

impl LayerStore {
    pub fn new(layers: Vec<PathBuf>) -> Self {
        LayerStore { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn top(&self) -> &Path {
        &self.layers[0]
    }

    /// Backing path of an object on a given layer. Layer directories are
    /// flat: every entry is named by its object id.
    pub fn path(&self, layer: usize, id: &ObjectId) -> PathBuf {
        self.layers[layer].join(id.hex())
    }

    /// Path of the named child entry inside a directory object's backing dir.
    pub fn entry_path(&self, layer: usize, dir: &ObjectId, name: &OsStr) -> PathBuf {
        self.path(layer, dir).join(name)
    }

    /// Pre-create the root backing directory under the top layer.
    pub fn ensure_root(&self) -> io::Result<()> {
        let root = self.path(0, &ROOT_ID);
        match fs::create_dir(&root) {
            Ok(()) => fs::set_permissions(&root, fs::Permissions::from_mode(0o777)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Shallowest layer carrying the object, or None. A whiteout at the
    /// object's own path means the object is gone, not merely absent.
    pub fn locate(&self, id: &ObjectId) -> Option<usize> {
        for layer in 0..self.layers.len() {
            let path = self.path(layer, id);
            if self.is_deleted(&path) {
                return None;
            }
            if fs::symlink_metadata(&path).is_ok() {
                return Some(layer);
            }
        }
        None
    }

    /// Stat a backing object. The link count is taken from the links
    /// xattr (absent means 1) and the inode number is derived from the
    /// id; the backing filesystem's values for both are meaningless here.
    pub fn lstat(&self, layer: usize, id: &ObjectId) -> Result<FileAttr, i32> {
        let path = self.path(layer, id);
        let meta = fs::symlink_metadata(&path).map_err(|e| io_error_to_libc(&e))?;
        let mut attr = metadata_to_fileattr(&meta, id.to_ino());
        attr.nlink = self.read_links(&path)?.unwrap_or(1) as u32;
        Ok(attr)
    }

    /// Resolve `(dir, name)` to the child's object id. `layer == None`
    /// walks layers top-down; a whiteout for the name terminates the walk
    /// with ENOENT, as does an entry that exists without an id pointer.
    pub fn child_id(
        &self,
        dir: &ObjectId,
        name: &OsStr,
        layer: Option<usize>,
    ) -> Result<ObjectId, i32> {
        if let Some(layer) = layer {
            return self.child_id_at(layer, dir, name);
        }
        for layer in 0..self.layers.len() {
            let entry = self.entry_path(layer, dir, name);
            if self.is_deleted(&entry) {
                return Err(libc::ENOENT);
            }
            match xattr::get(&entry, ID_XATTR) {
                Ok(Some(bytes)) => {
                    return ObjectId::parse(&bytes).ok_or(libc::EIO);
                }
                Ok(None) => return Err(libc::ENOENT),
                Err(_) => continue,
            }
        }
        Err(libc::ENOENT)
    }

    fn child_id_at(&self, layer: usize, dir: &ObjectId, name: &OsStr) -> Result<ObjectId, i32> {
        let entry = self.entry_path(layer, dir, name);
        if self.is_deleted(&entry) {
            return Err(libc::ENOENT);
        }
        match xattr::get(&entry, ID_XATTR) {
            Ok(Some(bytes)) => ObjectId::parse(&bytes).ok_or(libc::EIO),
            _ => Err(libc::ENOENT),
        }
    }

    /// Tag a child entry with an object id, minting a fresh one if none
    /// is supplied. Returns the id written.
    pub fn set_child_id(&self, entry: &Path, id: Option<ObjectId>) -> Result<ObjectId, i32> {
        let id = id.unwrap_or_else(ObjectId::new_v4);
        xattr::set(entry, ID_XATTR, id.hex().as_bytes()).map_err(|e| io_error_to_libc(&e))?;
        Ok(id)
    }

    /// Turn `path` into a whiteout: make sure a placeholder entry exists
    /// (a mode-0 regular file) and set the deleted marker on it.
    pub fn mark_deleted(&self, path: &Path) -> Result<(), i32> {
        if fs::symlink_metadata(path).is_err() {
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| io_error_to_libc(&e))?;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0));
        }
        xattr::set(path, DELETED_XATTR, DELETED_SENTINEL).map_err(|e| io_error_to_libc(&e))
    }

    pub fn is_deleted(&self, path: &Path) -> bool {
        matches!(xattr::get(path, DELETED_XATTR), Ok(Some(_)))
    }

    fn read_links(&self, path: &Path) -> Result<Option<i64>, i32> {
        match xattr::get(path, LINKS_XATTR) {
            Ok(Some(bytes)) if !bytes.is_empty() => {
                let s = std::str::from_utf8(&bytes).map_err(|_| libc::EIO)?;
                Ok(Some(s.trim().parse::<i64>().map_err(|_| libc::EIO)?))
            }
            _ => Ok(None),
        }
    }

    fn write_links(&self, path: &Path, count: i64) -> Result<(), i32> {
        xattr::set(path, LINKS_XATTR, count.to_string().as_bytes())
            .map_err(|e| io_error_to_libc(&e))
    }

    /// Bump the top-layer link count; an absent xattr counts as 1.
    pub fn inc_links(&self, id: &ObjectId) -> Result<(), i32> {
        let path = self.path(0, id);
        let count = self.read_links(&path)?.unwrap_or(1);
        self.write_links(&path, count + 1)
    }

    /// Drop the top-layer link count and return the new value; an absent
    /// xattr decrements straight to 0 without being written.
    pub fn dec_links(&self, id: &ObjectId) -> Result<i64, i32> {
        let path = self.path(0, id);
        let Some(count) = self.read_links(&path)? else {
            return Ok(0);
        };
        let count = count - 1;
        self.write_links(&path, count)?;
        Ok(count)
    }

    /// Materialise an object from `from_layer` into the top layer:
    /// recreate the entry by kind, then propagate mode, ownership, the
    /// links xattr, and (for non-symlinks) atime/mtime. "Destination
    /// already exists" is benign so that concurrent copy-ups of the same
    /// object converge. On any other failure the partial destination is
    /// removed best-effort before the error propagates.
    pub fn copy_up(&self, id: &ObjectId, from_layer: usize) -> Result<(), i32> {
        if from_layer == 0 {
            return Ok(());
        }
        let src = self.path(from_layer, id);
        let dst = self.path(0, id);

        let meta = fs::symlink_metadata(&src).map_err(|e| io_error_to_libc(&e))?;
        let file_type = meta.file_type();

        let created = if file_type.is_symlink() {
            let target = fs::read_link(&src).map_err(|e| io_error_to_libc(&e))?;
            match std::os::unix::fs::symlink(&target, &dst) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(io_error_to_libc(&e)),
            }
        } else if file_type.is_dir() {
            match fs::create_dir(&dst) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(io_error_to_libc(&e)),
            }
        } else if file_type.is_file() {
            fs::copy(&src, &dst).map(|_| ()).map_err(|e| io_error_to_libc(&e))
        } else {
            let kind = SFlag::from_bits_truncate(meta.mode() & libc::S_IFMT);
            let perm = Mode::from_bits_truncate(meta.mode() & 0o7777);
            match mknod(&dst, kind, perm, meta.rdev()) {
                Ok(()) => Ok(()),
                Err(nix::errno::Errno::EEXIST) => Ok(()),
                Err(e) => Err(e as i32),
            }
        };

        created.and_then(|()| self.copy_up_attrs(&src, &dst, &meta)).map_err(|errno| {
            self.discard_partial(&dst, file_type.is_dir());
            errno
        })
    }

    fn copy_up_attrs(&self, src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<(), i32> {
        let is_symlink = meta.file_type().is_symlink();

        if !is_symlink {
            fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))
                .map_err(|e| io_error_to_libc(&e))?;
        }
        lchown(dst, Some(meta.uid()), Some(meta.gid())).map_err(|e| io_error_to_libc(&e))?;

        if let Ok(Some(links)) = xattr::get(src, LINKS_XATTR) {
            if !links.is_empty() {
                xattr::set(dst, LINKS_XATTR, &links).map_err(|e| io_error_to_libc(&e))?;
            }
        }

        if !is_symlink {
            let atime = TimeSpec::new(meta.atime(), meta.atime_nsec());
            let mtime = TimeSpec::new(meta.mtime(), meta.mtime_nsec());
            utimensat(None, dst, &atime, &mtime, UtimensatFlags::NoFollowSymlink)
                .map_err(|e| e as i32)?;
        }
        Ok(())
    }

    fn discard_partial(&self, dst: &Path, is_dir: bool) {
        let result = if is_dir {
            fs::remove_dir(dst)
        } else {
            fs::remove_file(dst)
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to discard partial copy-up at {}: {}", dst.display(), e);
            }
        }
    }

    pub fn read_link(&self, layer: usize, id: &ObjectId) -> Result<PathBuf, i32> {
        fs::read_link(self.path(layer, id)).map_err(|e| io_error_to_libc(&e))
    }

    /// Filesystem statistics of the top (writable) layer.
    pub fn statvfs_top(&self) -> Result<Statvfs, i32> {
        statvfs(self.top()).map_err(|e| e as i32)
    }
}
