use std::path::{Path, PathBuf};

use fuser::{MountOption, Session};
use nix::sys::stat::{umask, Mode};

use crate::error::{Result, StrataError};
use crate::overlay::store::LayerStore;
use crate::overlay::StrataFs;

fn mount_options(store: &LayerStore) -> Vec<MountOption> {
    vec![
        MountOption::FSName(store.top().display().to_string()),
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
        MountOption::CUSTOM("nonempty".to_string()),
        MountOption::CUSTOM("user_id=0".to_string()),
        MountOption::CUSTOM("group_id=0".to_string()),
    ]
}

/// Mount the layer stack at `mountpoint` and serve requests until the
/// filesystem is unmounted. The root backing directory is pre-created
/// under the top layer so a fresh stack is immediately usable.
pub fn serve(layers: Vec<PathBuf>, mountpoint: &Path) -> Result<()> {
    let store = LayerStore::new(layers);
    store
        .ensure_root()
        .map_err(|e| StrataError::Layer(store.top().to_path_buf(), e))?;

    let fs = StrataFs::new(store);
    let notifier_slot = fs.notifier_handle();
    let options = mount_options(fs.store());

    // Requested modes reach the backing filesystem unmodified; the
    // kernel already applied the caller's umask.
    umask(Mode::empty());

    let mut session = Session::new(fs, mountpoint, &options)
        .map_err(|e| StrataError::Mount(e.to_string()))?;
    let _ = notifier_slot.set(session.notifier());

    tracing::info!("mounted at {}", mountpoint.display());
    session
        .run()
        .map_err(|e| StrataError::Mount(e.to_string()))?;
    tracing::info!("unmounted {}", mountpoint.display());
    Ok(())
}
