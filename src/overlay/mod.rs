mod convert;
pub mod direntry;
pub mod fd;
pub mod ident;
pub mod inode;
pub mod merge;
pub mod mount;
pub mod store;
mod utils;

use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{
    chown, fchown, lchown, symlink, DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt,
    PermissionsExt,
};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use fuser::{
    consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE},
    FileAttr, Filesystem, KernelConfig, Notifier, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use nix::sys::stat::{mknod, utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;

use convert::{io_error_to_libc, metadata_to_fileattr};
use direntry::DirentSink;
use fd::{Descriptor, FdState, FdTable};
use ident::ROOT_ID;
use inode::{Inode, InodeTable};
use store::LayerStore;

/// Entry and attribute validity advertised to the kernel. Long, to keep
/// lookup chatter down; mutations go through us, so staleness only
/// matters for out-of-band edits to the layer directories.
pub const TTL: Duration = Duration::from_secs(1000);

/// removexattr on this name dumps table statistics instead of ENOSYS.
const DIAG_XATTR: &str = "stratafs.tables";

pub struct StrataFs {
    store: LayerStore,
    inodes: InodeTable,
    fds: FdTable,
    notifier: Arc<OnceLock<Notifier>>,
}

impl StrataFs {
    pub fn new(store: LayerStore) -> Self {
        StrataFs {
            store,
            inodes: InodeTable::new(),
            fds: FdTable::new(),
            notifier: Arc::new(OnceLock::new()),
        }
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    /// Slot the mount code fills in once the session exists; used to push
    /// entry invalidations to the kernel after a rename replaces a name.
    pub fn notifier_handle(&self) -> Arc<OnceLock<Notifier>> {
        Arc::clone(&self.notifier)
    }

    /// Copy the object up into the writable layer if it is not already
    /// there, and record the new layer. A record with no layer yet (the
    /// root before its first getattr) is resolved with a locate first.
    fn ensure_top(&self, inode: &Inode) -> Result<(), i32> {
        let layer = match inode.layer {
            Some(layer) => layer,
            None => self.store.locate(&inode.id).ok_or(libc::ENOENT)?,
        };
        if layer != 0 {
            self.store.copy_up(&inode.id, layer)?;
        }
        self.inodes.set_layer(&inode.id, Some(0));
        Ok(())
    }

    fn open_backing(&self, path: &Path, flags: i32, mode: Option<u32>) -> io::Result<std::fs::File> {
        let access = flags & libc::O_ACCMODE;
        let mut opts = OpenOptions::new();
        opts.read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .append(flags & libc::O_APPEND != 0)
            .create(flags & libc::O_CREAT != 0)
            .create_new(flags & libc::O_EXCL != 0 && flags & libc::O_CREAT != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .custom_flags(
                flags & !(libc::O_ACCMODE
                    | libc::O_APPEND
                    | libc::O_CREAT
                    | libc::O_EXCL
                    | libc::O_TRUNC),
            );
        if let Some(mode) = mode {
            opts.mode(mode);
        }
        opts.open(path)
    }

    /// Re-plumb a descriptor onto the top-layer copy of its object. The
    /// caller holds the descriptor state lock, so no I/O can slip in
    /// between the close and the reopen. Creation and truncation flags
    /// must not fire a second time here.
    fn reopen_top(&self, desc: &Descriptor, state: &mut FdState) -> Result<(), i32> {
        let flags = desc.flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
        let path = self.store.path(0, &desc.id);
        let file = self
            .open_backing(&path, flags, None)
            .map_err(|e| io_error_to_libc(&e))?;
        state.file = file;
        state.layer = 0;
        tracing::debug!("reset fd for {}", path.display());
        Ok(())
    }

    /// Copy-up the parent directory and clear any whiteout occupying the
    /// name, returning the top-layer child entry path ready for reuse.
    fn prepare_child_entry(&self, parent: &Inode, name: &OsStr) -> Result<std::path::PathBuf, i32> {
        self.ensure_top(parent)?;
        let entry = self.store.entry_path(0, &parent.id, name);
        if self.store.is_deleted(&entry) {
            fs::remove_file(&entry).map_err(|e| io_error_to_libc(&e))?;
        }
        Ok(entry)
    }

    fn schedule_entry_invalidation(&self, targets: Vec<(u64, OsString)>) {
        let handle = Arc::clone(&self.notifier);
        // Invalidations must not run on the thread serving this request;
        // the kernel may hold the dentry lock until our reply lands.
        std::thread::spawn(move || {
            let Some(notifier) = handle.get() else { return };
            for (parent, name) in targets {
                if let Err(e) = notifier.inval_entry(parent, &name) {
                    tracing::debug!("entry invalidation for {:?} failed: {}", name, e);
                }
            }
        });
    }

    // Per-operation logic, kept off the reply types so it can be driven
    // directly by tests and reused across operations.

    pub fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        if name.as_bytes().len() > 255 {
            return Err(libc::ENAMETOOLONG);
        }
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let id = self.store.child_id(&parent_inode.id, name, None)?;

        let layer = match self.inodes.find_by_id(&id) {
            Some(existing) => existing.layer,
            None => self.store.locate(&id),
        };
        let Some(layer) = layer else {
            tracing::error!("no layer holds {} ({:?} in {})", id, name, parent_inode.id);
            return Err(libc::ENOENT);
        };
        let attr = self.store.lstat(layer, &id)?;
        self.inodes.register_lookup(id, Some(layer));
        Ok(attr)
    }

    pub fn do_forget(&self, handle: u64, nlookup: u64) {
        self.inodes.forget(handle, nlookup);
    }

    pub fn do_getattr(&self, handle: u64, pid: u32) -> Result<FileAttr, i32> {
        let mut inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        if inode.id.is_root() && inode.layer.is_none() {
            let layer = self.store.locate(&ROOT_ID).ok_or(libc::ENOENT)?;
            self.inodes.set_layer(&ROOT_ID, Some(layer));
            inode.layer = Some(layer);
        }

        if let Some(desc) = self.fds.find_by_owner(&inode.id, pid) {
            if let Some(state) = desc.file_state() {
                let state = state.lock();
                let meta = state.file.metadata().map_err(|e| io_error_to_libc(&e))?;
                return Ok(metadata_to_fileattr(&meta, inode.id.to_ino()));
            }
        }

        let Some(layer) = inode.layer else {
            tracing::error!("no layer recorded for {}", inode.id);
            return Err(libc::ENOENT);
        };
        self.store.lstat(layer, &inode.id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_setattr(
        &self,
        handle: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr, i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;

        // Truncation through an open handle works on the fd, re-plumbing
        // it onto the top layer first if needed.
        if let (Some(fh), Some(_)) = (fh, size) {
            let desc = self.fds.get(fh).ok_or(libc::EIO)?;
            let state_lock = desc.file_state().ok_or(libc::EIO)?;
            let mut state = state_lock.lock();

            if state.layer != 0 {
                match inode.layer {
                    None => {
                        // Opened on a lower layer, then deleted; nothing
                        // to re-plumb onto.
                        tracing::error!(
                            "fd on layer {} but {} is gone",
                            state.layer,
                            inode.id
                        );
                        return Err(libc::EIO);
                    }
                    Some(layer) => {
                        if layer != 0 {
                            self.store.copy_up(&inode.id, layer)?;
                            self.inodes.set_layer(&inode.id, Some(0));
                        }
                        self.reopen_top(&desc, &mut state)?;
                    }
                }
            }
            if state.layer != 0 {
                return Err(libc::EIO);
            }

            if let Some(mode) = mode {
                state
                    .file
                    .set_permissions(Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| io_error_to_libc(&e))?;
            }
            if uid.is_some() || gid.is_some() {
                fchown(&state.file, uid, gid).map_err(|e| io_error_to_libc(&e))?;
            }
            if let Some(size) = size {
                state.file.set_len(size).map_err(|e| io_error_to_libc(&e))?;
            }
            if atime.is_some() || mtime.is_some() {
                state
                    .file
                    .set_times(file_times(atime, mtime))
                    .map_err(|e| io_error_to_libc(&e))?;
            }

            let meta = state.file.metadata().map_err(|e| io_error_to_libc(&e))?;
            return Ok(metadata_to_fileattr(&meta, inode.id.to_ino()));
        }

        // Path-based: everything happens on the top-layer copy.
        self.ensure_top(&inode)?;
        let path = self.store.path(0, &inode.id);

        if let Some(mode) = mode {
            fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777))
                .map_err(|e| io_error_to_libc(&e))?;
        }
        if uid.is_some() || gid.is_some() {
            lchown(&path, uid, gid).map_err(|e| io_error_to_libc(&e))?;
        }
        if let Some(size) = size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| io_error_to_libc(&e))?;
            file.set_len(size).map_err(|e| io_error_to_libc(&e))?;
        }
        if atime.is_some() || mtime.is_some() {
            let now = SystemTime::now();
            let atime_ts = to_timespec(resolve_time(atime, now));
            let mtime_ts = to_timespec(resolve_time(mtime, now));
            utimensat(
                None,
                &path,
                &atime_ts,
                &mtime_ts,
                UtimensatFlags::NoFollowSymlink,
            )
            .map_err(|e| e as i32)?;
        }

        self.store.lstat(0, &inode.id)
    }

    pub fn do_readlink(&self, handle: u64) -> Result<Vec<u8>, i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        let layer = inode.layer.ok_or(libc::ENOENT)?;
        let target = self.store.read_link(layer, &inode.id)?;
        Ok(target.into_os_string().into_vec())
    }

    pub fn do_mknod(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileAttr, i32> {
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let entry = self.prepare_child_entry(&parent_inode, name)?;

        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        mknod(&entry, kind, perm, rdev as nix::libc::dev_t).map_err(|e| e as i32)?;
        let id = self.store.set_child_id(&entry, None)?;

        let path = self.store.path(0, &id);
        mknod(&path, kind, perm, rdev as nix::libc::dev_t).map_err(|e| e as i32)?;
        chown(&path, Some(uid), Some(gid)).map_err(|e| io_error_to_libc(&e))?;

        self.do_lookup(parent, name)
    }

    pub fn do_mkdir(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileAttr, i32> {
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let entry = self.prepare_child_entry(&parent_inode, name)?;

        DirBuilder::new()
            .mode(mode)
            .create(&entry)
            .map_err(|e| io_error_to_libc(&e))?;
        let id = self.store.set_child_id(&entry, None)?;

        let path = self.store.path(0, &id);
        DirBuilder::new()
            .mode(mode)
            .create(&path)
            .map_err(|e| io_error_to_libc(&e))?;
        chown(&path, Some(uid), Some(gid)).map_err(|e| io_error_to_libc(&e))?;

        self.do_lookup(parent, name)
    }

    pub fn do_symlink(
        &self,
        parent: u64,
        name: &OsStr,
        target: &Path,
        uid: u32,
        gid: u32,
    ) -> Result<FileAttr, i32> {
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let entry = self.prepare_child_entry(&parent_inode, name)?;

        symlink(target, &entry).map_err(|e| io_error_to_libc(&e))?;
        let id = self.store.set_child_id(&entry, None)?;

        let path = self.store.path(0, &id);
        symlink(target, &path).map_err(|e| io_error_to_libc(&e))?;
        lchown(&path, Some(uid), Some(gid)).map_err(|e| io_error_to_libc(&e))?;

        self.do_lookup(parent, name)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
        uid: u32,
        gid: u32,
        pid: u32,
    ) -> Result<(FileAttr, u64, u32), i32> {
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let entry = self.prepare_child_entry(&parent_inode, name)?;

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & 0o7777)
            .open(&entry)
            .map_err(|e| io_error_to_libc(&e))?;
        let id = self.store.set_child_id(&entry, None)?;

        let open_flags = if flags != 0 {
            flags | libc::O_CREAT
        } else {
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL
        };
        let path = self.store.path(0, &id);
        let file = self
            .open_backing(&path, open_flags, Some(mode & 0o7777))
            .map_err(|e| io_error_to_libc(&e))?;
        chown(&path, Some(uid), Some(gid)).map_err(|e| io_error_to_libc(&e))?;

        let attr = self.do_lookup(parent, name)?;
        let fh = self.fds.put(Descriptor::open_file(id, pid, open_flags, file, 0));
        let reply_flags = if open_flags & libc::O_DIRECT != 0 {
            FOPEN_DIRECT_IO
        } else {
            FOPEN_KEEP_CACHE
        };
        Ok((attr, fh, reply_flags))
    }

    pub fn do_unlink(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let id = self.store.child_id(&parent_inode.id, name, None)?;
        let inode = self.inodes.find_by_id(&id).ok_or(libc::ENOENT)?;

        if inode.layer == Some(0) {
            let links = self.store.dec_links(&id)?;
            if links == 0 {
                fs::remove_file(self.store.path(0, &id)).map_err(|e| io_error_to_libc(&e))?;
                self.inodes.set_layer(&id, None);
            }
        }

        self.ensure_top(&parent_inode)?;
        let entry = self.store.entry_path(0, &parent_inode.id, name);
        if fs::symlink_metadata(&entry).is_ok() {
            fs::remove_file(&entry).map_err(|e| io_error_to_libc(&e))?;
        }
        // A deeper layer still resolves the name: leave a whiteout.
        if self.store.child_id(&parent_inode.id, name, None).is_ok() {
            self.store.mark_deleted(&entry)?;
        }
        Ok(())
    }

    pub fn do_rmdir(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let parent_inode = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let id = self.store.child_id(&parent_inode.id, name, None)?;
        let inode = self.inodes.find_by_id(&id).ok_or(libc::ENOENT)?;

        if !merge::is_empty(&self.store, &id)? {
            return Err(libc::ENOTEMPTY);
        }

        if inode.layer == Some(0) {
            fs::remove_dir_all(self.store.path(0, &id)).map_err(|e| io_error_to_libc(&e))?;
        }

        self.ensure_top(&parent_inode)?;
        let entry = self.store.entry_path(0, &parent_inode.id, name);
        if fs::symlink_metadata(&entry).is_ok() {
            fs::remove_dir(&entry).map_err(|e| io_error_to_libc(&e))?;
        }
        if self.store.child_id(&parent_inode.id, name, None).is_ok() {
            self.store.mark_deleted(&entry)?;
        }
        self.inodes.set_layer(&id, None);
        Ok(())
    }

    /// Rename preserves the moved object's identity: only the child
    /// entries change, so descriptors open on the object stay valid.
    /// The destination entry is written before the source entry is
    /// removed, keeping the object reachable by a name at every step.
    /// Returns the (parent handle, name) pairs whose kernel dentries
    /// need invalidating.
    pub fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<Vec<(u64, OsString)>, i32> {
        let old_parent = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        let new_parent = self.inodes.get(newparent).ok_or(libc::ENOENT)?;

        self.ensure_top(&new_parent)?;
        let new_entry = self.store.entry_path(0, &new_parent.id, newname);

        // Retire whatever the destination name resolved to.
        if let Ok(dest_id) = self.store.child_id(&new_parent.id, newname, None) {
            let dest_inode = self.inodes.find_by_id(&dest_id).ok_or(libc::EIO)?;
            if dest_inode.layer == Some(0) {
                let links = self.store.dec_links(&dest_id)?;
                if links == 0 {
                    let dest_path = self.store.path(0, &dest_id);
                    let meta =
                        fs::symlink_metadata(&dest_path).map_err(|e| io_error_to_libc(&e))?;
                    if meta.is_dir() {
                        // No recursive replace of directories.
                        return Err(libc::EEXIST);
                    }
                    fs::remove_file(&dest_path).map_err(|e| io_error_to_libc(&e))?;
                    self.inodes.set_layer(&dest_id, None);
                }
            }
            if let Ok(meta) = fs::symlink_metadata(&new_entry) {
                if meta.is_dir() {
                    return Err(libc::EEXIST);
                }
                fs::remove_file(&new_entry).map_err(|e| io_error_to_libc(&e))?;
            }
        }
        if self.store.is_deleted(&new_entry) {
            fs::remove_file(&new_entry).map_err(|e| io_error_to_libc(&e))?;
        }

        let src_id = self.store.child_id(&old_parent.id, name, None)?;
        let src_inode = self.inodes.find_by_id(&src_id).ok_or(libc::ENOENT)?;
        let src_layer = src_inode.layer.ok_or(libc::ENOENT)?;
        let meta = fs::symlink_metadata(self.store.path(src_layer, &src_id))
            .map_err(|e| io_error_to_libc(&e))?;

        // Destination entry first. The placeholder's kind mirrors the
        // object; its content is irrelevant, the id pointer is the link.
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            symlink("placeholder", &new_entry).map_err(|e| io_error_to_libc(&e))?;
        } else if file_type.is_dir() {
            DirBuilder::new()
                .mode(meta.mode() & 0o7777)
                .create(&new_entry)
                .map_err(|e| io_error_to_libc(&e))?;
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(meta.mode() & 0o7777)
                .open(&new_entry)
                .map_err(|e| io_error_to_libc(&e))?;
        }
        self.store.set_child_id(&new_entry, Some(src_id))?;

        // Now retire the source entry.
        self.ensure_top(&old_parent)?;
        let old_entry = self.store.entry_path(0, &old_parent.id, name);
        if let Ok(old_meta) = fs::symlink_metadata(&old_entry) {
            if old_meta.is_dir() {
                fs::remove_dir(&old_entry).map_err(|e| io_error_to_libc(&e))?;
            } else {
                fs::remove_file(&old_entry).map_err(|e| io_error_to_libc(&e))?;
            }
        }
        if self.store.child_id(&old_parent.id, name, None).is_ok() {
            self.store.mark_deleted(&old_entry)?;
        }

        Ok(vec![
            (newparent, newname.to_os_string()),
            (parent, name.to_os_string()),
        ])
    }

    pub fn do_link(&self, handle: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr, i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        let new_parent = self.inodes.get(newparent).ok_or(libc::ENOENT)?;

        // Both the target object and the new parent must live on the top
        // layer before the link count can be tracked there.
        self.ensure_top(&inode)?;
        let entry = self.prepare_child_entry(&new_parent, newname)?;

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0)
            .open(&entry)
            .map_err(|e| io_error_to_libc(&e))?;
        self.store.set_child_id(&entry, Some(inode.id))?;
        self.store.inc_links(&inode.id)?;

        self.do_lookup(newparent, newname)
    }

    pub fn do_open(&self, handle: u64, flags: i32, pid: u32) -> Result<(u64, u32), i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        let layer = inode.layer.ok_or(libc::ENOENT)?;
        let path = self.store.path(layer, &inode.id);
        let file = self
            .open_backing(&path, flags, None)
            .map_err(|e| io_error_to_libc(&e))?;
        let fh = self
            .fds
            .put(Descriptor::open_file(inode.id, pid, flags, file, layer));
        let reply_flags = if flags & libc::O_DIRECT != 0 {
            FOPEN_DIRECT_IO
        } else {
            FOPEN_KEEP_CACHE
        };
        Ok((fh, reply_flags))
    }

    pub fn do_read(&self, handle: u64, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        let desc = self.fds.get(fh).ok_or(libc::EIO)?;
        let state_lock = desc.file_state().ok_or(libc::EIO)?;
        let mut state = state_lock.lock();

        match inode.layer {
            Some(0) if state.layer != 0 => self.reopen_top(&desc, &mut state)?,
            Some(layer) if state.layer != layer => {
                tracing::error!("stale fd for {}: fd layer {}, object layer {}", desc.id, state.layer, layer);
                return Err(libc::EBADF);
            }
            // Object gone but the fd is still open: reads keep working
            // against the old backing file, as plain unlink semantics go.
            _ => {}
        }

        let mut buf = vec![0u8; size as usize];
        let n = state
            .file
            .read_at(&mut buf, offset)
            .map_err(|e| io_error_to_libc(&e))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn do_write(&self, handle: u64, fh: u64, offset: u64, data: &[u8]) -> Result<u32, i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        let desc = self.fds.get(fh).ok_or(libc::EIO)?;
        let state_lock = desc.file_state().ok_or(libc::EIO)?;
        let mut state = state_lock.lock();

        if state.layer != 0 {
            if inode.layer != Some(0) {
                let layer = inode.layer.ok_or(libc::ENOENT)?;
                self.store.copy_up(&inode.id, layer)?;
                self.inodes.set_layer(&inode.id, Some(0));
            }
            self.reopen_top(&desc, &mut state)?;
        }

        let n = if desc.flags & libc::O_DIRECT != 0 {
            let bounce = utils::AlignedBuf::copy_of(data);
            state
                .file
                .write_at(bounce.as_slice(), offset)
                .map_err(|e| io_error_to_libc(&e))?
        } else {
            state
                .file
                .write_at(data, offset)
                .map_err(|e| io_error_to_libc(&e))?
        };
        Ok(n as u32)
    }

    pub fn do_opendir(&self, handle: u64, pid: u32) -> Result<u64, i32> {
        let inode = self.inodes.get(handle).ok_or(libc::ENOENT)?;
        let stream = merge::merged_entries(&self.store, &inode.id)?;
        Ok(self.fds.put(Descriptor::open_dir(inode.id, pid, stream)))
    }

    pub fn do_readdir(
        &self,
        fh: u64,
        offset: i64,
        sink: &mut impl DirentSink,
    ) -> Result<(), i32> {
        let desc = self.fds.get(fh).ok_or(libc::EIO)?;
        let stream = desc.stream().ok_or(libc::EIO)?;
        direntry::fill(stream, offset, sink)
    }

    pub fn do_release(&self, fh: u64) {
        // Dropping the descriptor closes its kernel fd.
        self.fds.remove(fh);
    }

    fn dump_tables(&self) {
        tracing::info!(
            inodes = self.inodes.len(),
            descriptors = self.fds.len(),
            "table dump"
        );
    }
}

fn resolve_time(t: Option<TimeOrNow>, now: SystemTime) -> SystemTime {
    match t {
        Some(TimeOrNow::SpecificTime(t)) => t,
        _ => now,
    }
}

fn file_times(atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> fs::FileTimes {
    let now = SystemTime::now();
    let mut times = fs::FileTimes::new();
    if atime.is_some() {
        times = times.set_accessed(resolve_time(atime, now));
    }
    if mtime.is_some() {
        times = times.set_modified(resolve_time(mtime, now));
    }
    times
}

fn to_timespec(t: SystemTime) -> TimeSpec {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(_) => TimeSpec::new(0, 0),
    }
}

impl Filesystem for StrataFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("stratafs initialized over {} layers", self.store.num_layers());
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("stratafs destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            // Misses are routine; no error-level noise.
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        tracing::debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.do_forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::debug!("getattr(ino={})", ino);
        match self.do_getattr(ino, req.pid()) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!("setattr(ino={}, size={:?}, fh={:?})", ino, size, fh);
        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_mknod(parent, name, mode, rdev, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_mkdir(parent, name, mode, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        tracing::debug!("symlink(parent={}, name={:?} -> {:?})", parent, link_name, target);
        match self.do_symlink(parent, link_name, target, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename({}/{:?} -> {}/{:?})",
            parent,
            name,
            newparent,
            newname
        );
        match self.do_rename(parent, name, newparent, newname) {
            Ok(invalidate) => {
                reply.ok();
                self.schedule_entry_invalidation(invalidate);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        tracing::debug!("link(ino={} -> {}/{:?})", ino, newparent, newname);
        match self.do_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        match self.do_open(ino, flags, req.pid()) {
            Ok((fh, reply_flags)) => reply.opened(fh, reply_flags),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.do_read(ino, fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.do_write(ino, fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        tracing::debug!("release(fh={})", fh);
        self.do_release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        tracing::debug!("opendir(ino={})", ino);
        match self.do_opendir(ino, req.pid()) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        match self.do_readdir(fh, offset, &mut reply) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdirplus(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        tracing::debug!("readdirplus(ino={}, fh={}, offset={})", ino, fh, offset);
        let Some(desc) = self.fds.get(fh) else {
            reply.error(libc::EIO);
            return;
        };
        let Some(stream) = desc.stream() else {
            reply.error(libc::EIO);
            return;
        };
        if offset < 0 || offset as usize > stream.len() {
            reply.error(libc::EINVAL);
            return;
        }
        for entry in &stream[offset as usize..] {
            // Same masking as the cached stream; each visible entry goes
            // through the lookup path so the kernel gets a counted
            // reference alongside its attributes.
            let attr = if entry.name == "." {
                match self.do_getattr(ino, req.pid()) {
                    Ok(attr) => attr,
                    Err(_) => continue,
                }
            } else {
                match self.do_lookup(ino, &entry.name) {
                    Ok(attr) => attr,
                    Err(_) => continue,
                }
            };
            if reply.add(attr.ino, entry.offset, &entry.name, &TTL, &attr, 0) {
                if entry.name != "." {
                    // The refused entry never reaches the kernel; give
                    // back the lookup count it will never forget.
                    self.do_forget(attr.ino, 1);
                }
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        tracing::debug!("releasedir(fh={})", fh);
        self.do_release(fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.store.statvfs_top() {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn getxattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn listxattr(&mut self, _req: &Request, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOSYS);
    }

    fn removexattr(&mut self, _req: &Request, _ino: u64, name: &OsStr, reply: ReplyEmpty) {
        if name == DIAG_XATTR {
            self.dump_tables();
            reply.ok();
        } else {
            reply.error(libc::ENOSYS);
        }
    }

    fn access(&mut self, _req: &Request, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.error(libc::ENOSYS);
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o}, flags={:#x})", parent, name, mode, flags);
        match self.do_create(parent, name, mode, flags, req.uid(), req.gid(), req.pid()) {
            Ok((attr, fh, reply_flags)) => reply.created(&TTL, &attr, 0, fh, reply_flags),
            Err(errno) => reply.error(errno),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOSYS);
    }
}
