//! Capability composition. A backend is a bundle of orthogonal interfaces:
//! every backend implements [`Store`], and overrides exactly the `as_*`
//! accessors for the capabilities it supports. The accessors make the
//! supported/unsupported split typed: a caller cannot reach an optional
//! operation without handling the `None` arm, and the free helpers below
//! turn that arm into a [`StoreError::Unsupported`] with the operation name
//! and backend URI.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::StoreError;
use crate::local::FsAccessor;
use crate::path::StorePath;
use crate::remote::RemoteHandle;

/// Base contract shared by every backend.
pub trait Store: Send + Sync {
    /// Render this backend's URI, scheme included.
    fn uri(&self) -> String;

    /// The logical store namespace (not necessarily where the bytes live).
    fn store_dir(&self) -> &Path;

    /// Stream a store object as a canonical archive. Local backends answer
    /// from disk; pure-remote backends answer over the worker protocol.
    ///
    /// # Errors
    ///
    /// Returns an error when the object is missing or the transport fails.
    fn nar_from_path(&self, store_path: &StorePath) -> Result<Vec<u8>>;

    /// Whether `path` lies inside the logical store namespace.
    fn is_in_store(&self, path: &Path) -> bool {
        path.starts_with(self.store_dir()) && path != self.store_dir()
    }

    /// Recover the store path named by an absolute path inside the store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotInStore` outside the namespace and
    /// `StoreError::BadStorePath` for a malformed object name.
    fn parse_store_path(&self, path: &Path) -> Result<StorePath, StoreError> {
        let rel = path
            .strip_prefix(self.store_dir())
            .map_err(|_| StoreError::NotInStore {
                path: path.to_path_buf(),
                store_dir: self.store_dir().to_path_buf(),
            })?;
        let name = rel
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .ok_or(StoreError::NotInStore {
                path: path.to_path_buf(),
                store_dir: self.store_dir().to_path_buf(),
            })?;
        StorePath::new(name)
    }

    fn as_filesystem(&self) -> Option<&dyn FilesystemAccess> {
        None
    }

    fn as_gc_root_store(&self) -> Option<&dyn GcRootStore> {
        None
    }

    fn as_log_access(&self) -> Option<&dyn LogAccess> {
        None
    }

    fn as_remote(&self) -> Option<&dyn RemoteProtocol> {
        None
    }
}

impl std::fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("uri", &self.uri())
            .finish_non_exhaustive()
    }
}

/// The store directory is visible in the local filesystem namespace.
pub trait FilesystemAccess: Store {
    /// Physical location of store objects on disk.
    fn real_store_dir(&self) -> &Path;

    /// Map a path in the logical store namespace to its on-disk location.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotInStore` when `path` is outside the store
    /// namespace; that is a precondition violation in the caller, never
    /// retried.
    fn to_real_path(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let rel = path
            .strip_prefix(self.store_dir())
            .map_err(|_| StoreError::NotInStore {
                path: path.to_path_buf(),
                store_dir: self.store_dir().to_path_buf(),
            })?;
        if rel.as_os_str().is_empty() {
            return Err(StoreError::NotInStore {
                path: path.to_path_buf(),
                store_dir: self.store_dir().to_path_buf(),
            });
        }
        Ok(self.real_store_dir().join(rel))
    }

    /// Random access into store object contents.
    fn fs_accessor(&self) -> FsAccessor;
}

/// The backend can register permanent GC roots.
pub trait GcRootStore: Store {
    /// Root `store_path` at the caller-owned symlink location `gc_root`.
    /// Returns the direct root location actually registered.
    ///
    /// # Errors
    ///
    /// Returns an error when the symlink cannot be created or the
    /// registration fails.
    fn add_perm_root(&self, store_path: &StorePath, gc_root: &Path) -> Result<PathBuf>;
}

/// The backend can retrieve build logs.
pub trait LogAccess: Store {
    /// Fetch the build log for exactly this store path. `Ok(None)` when no
    /// log exists; absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the lookup itself fails.
    fn build_log_exact(&self, store_path: &StorePath) -> Result<Option<String>>;
}

/// The backend speaks the worker protocol over pooled connections.
pub trait RemoteProtocol: Store {
    fn remote(&self) -> &RemoteHandle;
}

/// Register a permanent root via any backend, or fail with a typed
/// unsupported error when the backend has no rooting capability.
///
/// # Errors
///
/// Returns `StoreError::Unsupported` for backends without the capability,
/// otherwise whatever the backend's `add_perm_root` returns.
pub fn add_perm_root(
    store: &dyn Store,
    store_path: &StorePath,
    gc_root: &Path,
) -> Result<PathBuf> {
    match store.as_gc_root_store() {
        Some(gc) => gc.add_perm_root(store_path, gc_root),
        None => Err(StoreError::Unsupported {
            operation: "add-perm-root",
            store: store.uri(),
        }
        .into()),
    }
}

/// Fetch a build log via any backend, or fail with a typed unsupported
/// error — without ever touching the transport.
///
/// # Errors
///
/// Returns `StoreError::Unsupported` for backends without the capability,
/// otherwise whatever the backend's `build_log_exact` returns.
pub fn build_log_exact(store: &dyn Store, store_path: &StorePath) -> Result<Option<String>> {
    match store.as_log_access() {
        Some(log) => log.build_log_exact(store_path),
        None => Err(StoreError::Unsupported {
            operation: "build-log-exact",
            store: store.uri(),
        }
        .into()),
    }
}
