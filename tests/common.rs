use std::fs;
use std::path::{Path, PathBuf};

use stratafs::overlay::ident::{ObjectId, ROOT_ID};
use stratafs::overlay::store::{LayerStore, ID_XATTR};
use stratafs::overlay::StrataFs;

/// The reserved xattrs live in the trusted namespace, which requires
/// CAP_SYS_ADMIN. When the test environment cannot write them, skip the
/// test instead of failing it.
pub fn xattrs_available(dir: &Path) -> bool {
    let probe = dir.join("xattr-probe");
    if fs::write(&probe, b"").is_err() {
        return false;
    }
    let ok = xattr::set(&probe, ID_XATTR, b"0").is_ok();
    let _ = fs::remove_file(&probe);
    if !ok {
        eprintln!("skipping: trusted xattrs not supported here");
    }
    ok
}

/// A two-layer engine under test, driven directly without a kernel
/// mount: the top layer starts empty, the bottom layer is seeded in the
/// on-disk format (id-named backing objects, id-xattr-tagged entries).
pub struct Harness {
    pub upper: PathBuf,
    pub lower: PathBuf,
    _dirs: Vec<tempfile::TempDir>,
    pub fs: StrataFs,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Option<Self> {
        let upper_dir = tempfile::tempdir().unwrap();
        let lower_dir = tempfile::tempdir().unwrap();
        if !xattrs_available(upper_dir.path()) || !xattrs_available(lower_dir.path()) {
            return None;
        }
        let upper = upper_dir.path().to_path_buf();
        let lower = lower_dir.path().to_path_buf();

        // Bottom-layer root backing dir, so seeded entries have a home.
        fs::create_dir(lower.join(ROOT_ID.hex())).unwrap();

        Some(Harness {
            fs: Self::build(&upper, &lower),
            upper,
            lower,
            _dirs: vec![upper_dir, lower_dir],
        })
    }

    fn build(upper: &Path, lower: &Path) -> StrataFs {
        let store = LayerStore::new(vec![upper.to_path_buf(), lower.to_path_buf()]);
        store.ensure_root().unwrap();
        StrataFs::new(store)
    }

    /// Tear the engine down and bring a fresh one up over the same
    /// layer directories, as an unmount/remount would.
    pub fn remount(&mut self) {
        self.fs = Self::build(&self.upper, &self.lower);
    }

    /// Seed a regular file into the bottom layer under `parent`.
    pub fn seed_lower_file(&self, parent: &ObjectId, name: &str, content: &[u8]) -> ObjectId {
        let id = ObjectId::new_v4();
        let entry = self.lower.join(parent.hex()).join(name);
        fs::write(&entry, b"").unwrap();
        xattr::set(&entry, ID_XATTR, id.hex().as_bytes()).unwrap();
        fs::write(self.lower.join(id.hex()), content).unwrap();
        id
    }

    /// Seed a directory object into the bottom layer under `parent`.
    pub fn seed_lower_dir(&self, parent: &ObjectId, name: &str) -> ObjectId {
        let id = ObjectId::new_v4();
        let entry = self.lower.join(parent.hex()).join(name);
        fs::create_dir(&entry).unwrap();
        xattr::set(&entry, ID_XATTR, id.hex().as_bytes()).unwrap();
        fs::create_dir(self.lower.join(id.hex())).unwrap();
        id
    }

    /// Seed a directory object into the TOP layer under `parent`,
    /// reusing an existing id (for pre-copied-up fixtures).
    pub fn seed_upper_dir_object(&self, id: &ObjectId) {
        fs::create_dir(self.upper.join(id.hex())).unwrap();
    }

    pub fn upper_object(&self, id: &ObjectId) -> PathBuf {
        self.upper.join(id.hex())
    }

    pub fn lower_object(&self, id: &ObjectId) -> PathBuf {
        self.lower.join(id.hex())
    }

    pub fn upper_entry(&self, parent: &ObjectId, name: &str) -> PathBuf {
        self.upper.join(parent.hex()).join(name)
    }
}
