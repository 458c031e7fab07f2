//! Permanent GC roots. A root is a pair: a direct symlink owned by the
//! client (result link in a project directory, profile generation) pointing
//! at a store path, plus an indirect registry entry under the store's state
//! directory pointing back at the direct symlink. The collector follows
//! registry entries; an entry whose direct symlink has disappeared is stale
//! and simply skipped, so deleting the client symlink is all it takes to
//! release the root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::caps::{FilesystemAccess, GcRootStore};
use crate::error::StoreError;
use crate::path::StorePath;

const AUTO_ROOTS_SUBPATH: &str = "gcroots/auto";

/// Backends that keep the indirect half of a root pair. The direct symlink
/// is always created client-side; only the back-reference registration
/// differs between a local registry write and a daemon round-trip.
pub trait IndirectRootStore: FilesystemAccess {
    /// Record a back-reference to the client-owned symlink at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error when the registration cannot be recorded.
    fn add_indirect_root(&self, root: &Path) -> Result<()>;
}

impl<T: IndirectRootStore> GcRootStore for T {
    fn add_perm_root(&self, store_path: &StorePath, gc_root: &Path) -> Result<PathBuf> {
        if !gc_root.is_absolute() {
            return Err(StoreError::RootRegistration {
                root: gc_root.to_path_buf(),
                message: "root location must be an absolute path".to_string(),
            }
            .into());
        }
        if self.is_in_store(gc_root) {
            return Err(StoreError::RootRegistration {
                root: gc_root.to_path_buf(),
                message: "root location must live outside the store namespace".to_string(),
            }
            .into());
        }
        // The symlink must resolve to the bytes, so it targets the physical
        // store directory, not the logical namespace.
        let target = self.real_store_dir().join(store_path.name());
        create_direct_root(gc_root, &target)?;
        self.add_indirect_root(gc_root)
            .with_context(|| format!("failed to register root {}", gc_root.display()))?;
        debug!(root = %gc_root.display(), target = %target.display(), "registered GC root");
        Ok(gc_root.to_path_buf())
    }
}

/// The indirect-root registry under a store's state directory. One symlink
/// per registered root, named by the hash of the root's location so
/// re-registration is a plain overwrite.
pub struct RootsRegistry {
    roots_dir: PathBuf,
    real_store_dir: PathBuf,
}

impl RootsRegistry {
    /// # Errors
    ///
    /// Returns an error when the registry directory cannot be created.
    pub fn open(state_dir: &Path, real_store_dir: &Path) -> Result<Self> {
        let roots_dir = state_dir.join(AUTO_ROOTS_SUBPATH);
        fs::create_dir_all(&roots_dir).with_context(|| {
            format!("failed to create roots registry {}", roots_dir.display())
        })?;
        Ok(Self {
            roots_dir,
            real_store_dir: real_store_dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn roots_dir(&self) -> &Path {
        &self.roots_dir
    }

    /// Record `root`. Registering the same location twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry entry cannot be written.
    pub fn register(&self, root: &Path) -> Result<()> {
        let entry = self.roots_dir.join(entry_name(root));
        replace_symlink(root, &entry)
            .with_context(|| format!("failed to record root {}", root.display()))
    }

    /// Every registered root whose direct symlink still exists and resolves
    /// into the store. Entries whose symlink has been deleted, or repointed
    /// somewhere outside the store, are stale; they are skipped here and
    /// reaped by the collector, never reported as an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry directory cannot be read.
    pub fn live_roots(&self) -> Result<Vec<PathBuf>> {
        let mut roots = Vec::new();
        for entry in fs::read_dir(&self.roots_dir).with_context(|| {
            format!("failed to read roots registry {}", self.roots_dir.display())
        })? {
            let entry = entry?;
            let Ok(root) = fs::read_link(entry.path()) else {
                continue;
            };
            let Ok(target) = fs::read_link(&root) else {
                continue;
            };
            if target.starts_with(&self.real_store_dir) && target != self.real_store_dir {
                roots.push(root);
            }
        }
        roots.sort();
        Ok(roots)
    }
}

fn entry_name(root: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.as_os_str().as_encoded_bytes());
    hex::encode(hasher.finalize())
}

/// Create the client-owned direct symlink at `root` pointing at `target`.
/// Creation is atomic and idempotent; a symlink already pointing at `target`
/// is left alone, anything else at that location is an error.
fn create_direct_root(root: &Path, target: &Path) -> Result<()> {
    match fs::read_link(root) {
        Ok(existing) if existing == target => return Ok(()),
        Ok(existing) => {
            return Err(StoreError::RootRegistration {
                root: root.to_path_buf(),
                message: format!("already points at {}", existing.display()),
            }
            .into());
        }
        Err(_) if root.symlink_metadata().is_ok() => {
            return Err(StoreError::RootRegistration {
                root: root.to_path_buf(),
                message: "location exists and is not a symlink".to_string(),
            }
            .into());
        }
        Err(_) => {}
    }
    if let Some(parent) = root.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    replace_symlink(target, root)
        .with_context(|| format!("failed to create root symlink {}", root.display()))
}

/// Atomically (re)point the symlink at `link` to `target`.
fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link
        .parent()
        .context("symlink location has no parent directory")?;
    let name = link
        .file_name()
        .context("symlink location has no file name")?
        .to_string_lossy();
    let tmp = parent.join(format!(".{name}.tmp"));
    let _ = fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)
        .with_context(|| format!("failed to create symlink {}", tmp.display()))?;
    fs::rename(&tmp, link)
        .with_context(|| format!("failed to move symlink into place at {}", link.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Store;
    use crate::config::{StoreDefaults, StoreParams};
    use crate::local::LocalFsStore;

    fn rooted_store(root: &Path) -> LocalFsStore {
        let params: StoreParams = [("root", root.to_string_lossy().to_string())]
            .into_iter()
            .collect();
        LocalFsStore::open(&params, &StoreDefaults::system()).expect("open store")
    }

    fn registry_for(store: &LocalFsStore) -> RootsRegistry {
        RootsRegistry::open(store.state_dir(), store.real_store_dir()).expect("registry")
    }

    #[test]
    fn add_perm_root_creates_both_halves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = rooted_store(dir.path());
        let store_path = StorePath::new("abc123-hello").expect("store path");
        let object = store.real_store_dir().join("abc123-hello");
        fs::create_dir_all(&object).expect("mkdir");
        let gc_root = dir.path().join("result");

        let registered = store
            .add_perm_root(&store_path, &gc_root)
            .expect("register");
        assert_eq!(registered, gc_root);
        // The direct symlink resolves to the real on-disk object, not the
        // logical namespace.
        assert_eq!(fs::read_link(&gc_root).expect("direct symlink"), object);
        assert!(gc_root.exists(), "direct root must resolve");

        let registry = registry_for(&store);
        assert_eq!(registry.live_roots().expect("roots"), vec![gc_root.clone()]);

        // Re-registering the same pair is a no-op.
        store
            .add_perm_root(&store_path, &gc_root)
            .expect("idempotent");
        assert_eq!(registry.live_roots().expect("roots").len(), 1);
    }

    #[test]
    fn roots_must_be_absolute_and_outside_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = rooted_store(dir.path());
        let store_path = StorePath::new("abc123-hello").expect("store path");

        let err = store
            .add_perm_root(&store_path, Path::new("result"))
            .expect_err("relative roots are rejected");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RootRegistration { .. })
        ));

        let inside = store.store_dir().join("abc123-hello-root");
        let err = store
            .add_perm_root(&store_path, &inside)
            .expect_err("in-store roots are rejected");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RootRegistration { .. })
        ));
    }

    #[test]
    fn rooting_over_a_foreign_symlink_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = rooted_store(dir.path());
        let store_path = StorePath::new("abc123-hello").expect("store path");

        let gc_root = dir.path().join("result");
        std::os::unix::fs::symlink("/somewhere/else", &gc_root).expect("symlink");
        let err = store
            .add_perm_root(&store_path, &gc_root)
            .expect_err("foreign symlink is not overwritten");
        assert!(err.to_string().contains("already points at"));
    }

    #[test]
    fn deleted_direct_symlinks_make_roots_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = rooted_store(dir.path());
        let store_path = StorePath::new("abc123-hello").expect("store path");
        let gc_root = dir.path().join("result");

        store
            .add_perm_root(&store_path, &gc_root)
            .expect("register");
        fs::remove_file(&gc_root).expect("drop the direct symlink");

        assert!(registry_for(&store).live_roots().expect("roots").is_empty());
    }

    #[test]
    fn retargeted_direct_symlinks_make_roots_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = rooted_store(dir.path());
        let store_path = StorePath::new("abc123-hello").expect("store path");
        let gc_root = dir.path().join("result");

        store
            .add_perm_root(&store_path, &gc_root)
            .expect("register");
        assert_eq!(registry_for(&store).live_roots().expect("roots").len(), 1);

        // An external actor repoints the symlink outside the store; the
        // entry no longer roots anything even though the symlink exists.
        fs::remove_file(&gc_root).expect("drop");
        std::os::unix::fs::symlink("/somewhere/else", &gc_root).expect("repoint");
        assert!(registry_for(&store).live_roots().expect("roots").is_empty());

        // A plain file at the root location is just as inert.
        fs::remove_file(&gc_root).expect("drop");
        fs::write(&gc_root, b"not a symlink").expect("write");
        assert!(registry_for(&store).live_roots().expect("roots").is_empty());
    }

    #[test]
    fn registry_overwrites_entries_for_the_same_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real_store_dir = dir.path().join("store");
        fs::create_dir_all(&real_store_dir).expect("mkdir");
        let registry =
            RootsRegistry::open(&dir.path().join("state"), &real_store_dir).expect("registry");
        let root = dir.path().join("result");
        std::os::unix::fs::symlink(real_store_dir.join("abc123-hello"), &root).expect("symlink");

        registry.register(&root).expect("first");
        registry.register(&root).expect("second");
        assert_eq!(registry.live_roots().expect("roots"), vec![root]);
    }
}
