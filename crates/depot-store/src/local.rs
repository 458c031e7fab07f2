//! Local filesystem backend: store objects live in a directory this process
//! can read directly, so archives and build logs are answered from disk
//! without any daemon involved.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::debug;

use crate::caps::{FilesystemAccess, LogAccess, Store};
use crate::config::{LocalStoreConfig, StoreDefaults, StoreParams};
use crate::error::StoreError;
use crate::nar;
use crate::path::StorePath;
use crate::roots::{IndirectRootStore, RootsRegistry};

/// Random access into store object contents, detached from the backend that
/// produced it.
#[derive(Debug, Clone)]
pub struct FsAccessor {
    store_dir: PathBuf,
    real_store_dir: PathBuf,
}

impl FsAccessor {
    #[must_use]
    pub fn new(store_dir: PathBuf, real_store_dir: PathBuf) -> Self {
        Self {
            store_dir,
            real_store_dir,
        }
    }

    /// Map a logical store path to its on-disk location.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotInStore` when `path` is outside the store
    /// namespace.
    pub fn to_real(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let rel = path
            .strip_prefix(&self.store_dir)
            .map_err(|_| StoreError::NotInStore {
                path: path.to_path_buf(),
                store_dir: self.store_dir.clone(),
            })?;
        if rel.as_os_str().is_empty() {
            return Err(StoreError::NotInStore {
                path: path.to_path_buf(),
                store_dir: self.store_dir.clone(),
            });
        }
        Ok(self.real_store_dir.join(rel))
    }

    /// # Errors
    ///
    /// Returns an error when the file is missing or unreadable.
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let real = self.to_real(path)?;
        fs::read(&real).with_context(|| format!("failed to read {}", real.display()))
    }

    /// Sorted entry names of a directory inside a store object.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be listed.
    pub fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let real = self.to_real(path)?;
        let mut names = Vec::new();
        for entry in
            fs::read_dir(&real).with_context(|| format!("failed to list {}", real.display()))?
        {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.to_real(path)
            .map(|real| real.symlink_metadata().is_ok())
            .unwrap_or(false)
    }
}

/// Store backend over a directly readable filesystem.
pub struct LocalFsStore {
    config: LocalStoreConfig,
}

impl LocalFsStore {
    #[must_use]
    pub fn new(config: LocalStoreConfig) -> Self {
        Self { config }
    }

    /// Open a local store, creating its physical directories when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the store or state directories cannot be
    /// created.
    pub fn open(params: &StoreParams, defaults: &StoreDefaults) -> Result<Self> {
        let config = LocalStoreConfig::from_params(params, defaults);
        fs::create_dir_all(&config.real_store_dir).with_context(|| {
            format!(
                "failed to create store directory {}",
                config.real_store_dir.display()
            )
        })?;
        fs::create_dir_all(&config.state_dir).with_context(|| {
            format!(
                "failed to create state directory {}",
                config.state_dir.display()
            )
        })?;
        debug!(
            store_dir = %config.store_dir.display(),
            real_store_dir = %config.real_store_dir.display(),
            "opened local store"
        );
        Ok(Self::new(config))
    }

    #[must_use]
    pub fn config(&self) -> &LocalStoreConfig {
        &self.config
    }

    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }
}

/// Look up a build log under `log_dir/drvs/<xx>/<rest>`, falling back to the
/// gzip-compressed variant. Absence is `Ok(None)`.
pub(crate) fn read_build_log(log_dir: &Path, store_path: &StorePath) -> Result<Option<String>> {
    let name = store_path.name();
    if name.len() < 3 {
        return Ok(None);
    }
    let (prefix, rest) = name.split_at(2);
    let dir = log_dir.join("drvs").join(prefix);
    let plain = dir.join(rest);
    if plain.is_file() {
        let log = fs::read_to_string(&plain)
            .with_context(|| format!("failed to read build log {}", plain.display()))?;
        return Ok(Some(log));
    }
    let gz = dir.join(format!("{rest}.gz"));
    if gz.is_file() {
        let file = fs::File::open(&gz)
            .with_context(|| format!("failed to open build log {}", gz.display()))?;
        let mut log = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut log)
            .with_context(|| format!("failed to decompress build log {}", gz.display()))?;
        return Ok(Some(log));
    }
    Ok(None)
}

impl Store for LocalFsStore {
    fn uri(&self) -> String {
        match &self.config.root_dir {
            Some(root) => format!("local://{}", root.display()),
            None => "local://".to_string(),
        }
    }

    fn store_dir(&self) -> &Path {
        &self.config.store_dir
    }

    fn nar_from_path(&self, store_path: &StorePath) -> Result<Vec<u8>> {
        let real = self.config.real_store_dir.join(store_path.name());
        nar::dump_path(&real)
            .with_context(|| format!("failed to archive store object {store_path}"))
    }

    fn as_filesystem(&self) -> Option<&dyn FilesystemAccess> {
        Some(self)
    }

    fn as_gc_root_store(&self) -> Option<&dyn crate::caps::GcRootStore> {
        Some(self)
    }

    fn as_log_access(&self) -> Option<&dyn LogAccess> {
        Some(self)
    }
}

impl FilesystemAccess for LocalFsStore {
    fn real_store_dir(&self) -> &Path {
        &self.config.real_store_dir
    }

    fn fs_accessor(&self) -> FsAccessor {
        FsAccessor::new(
            self.config.store_dir.clone(),
            self.config.real_store_dir.clone(),
        )
    }
}

impl IndirectRootStore for LocalFsStore {
    fn add_indirect_root(&self, root: &Path) -> Result<()> {
        RootsRegistry::open(&self.config.state_dir, &self.config.real_store_dir)?.register(root)
    }
}

impl LogAccess for LocalFsStore {
    fn build_log_exact(&self, store_path: &StorePath) -> Result<Option<String>> {
        read_build_log(&self.config.log_dir, store_path)
    }
}
