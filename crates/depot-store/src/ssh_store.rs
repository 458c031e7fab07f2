//! Daemon backends over SSH. `SshStore` runs every operation through the
//! remote daemon's stdio. `MountedSshStore` assumes the remote store
//! directory is also mounted locally, so reads are answered from the mount
//! and only mutations cross the wire.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::caps::{FilesystemAccess, GcRootStore, LogAccess, RemoteProtocol, Store};
use crate::config::{RemoteStoreConfig, SshConfig, StoreDefaults, StoreParams};
use crate::local::LocalFsStore;
use crate::path::StorePath;
use crate::remote::{RemoteHandle, RemoteStoreConnection};
use crate::ssh::{shell_quote, SshMaster};

/// Pure-remote store reached by running the daemon on another host.
pub struct SshStore {
    store_dir: std::path::PathBuf,
    master: Arc<SshMaster>,
    remote: RemoteHandle,
}

impl SshStore {
    /// Open an `ssh-ng://` store.
    ///
    /// # Errors
    ///
    /// Returns an error when the SSH configuration is invalid. The
    /// connection itself is established lazily.
    pub fn open(host: &str, params: &StoreParams, defaults: &StoreDefaults) -> Result<Self> {
        Self::open_internal("ssh-ng", host, params, defaults, &[])
    }

    fn open_internal(
        scheme: &str,
        host: &str,
        params: &StoreParams,
        defaults: &StoreDefaults,
        extra_args: &[&str],
    ) -> Result<Self> {
        let remote_config = RemoteStoreConfig::from_params(params);
        let ssh_config = SshConfig::from_params(params);
        // A master connection only pays off when several logical
        // connections would otherwise each pay full session setup.
        let use_master = remote_config.max_connections > 1;
        let master = Arc::new(
            SshMaster::new(host, &ssh_config, use_master)
                .with_context(|| format!("failed to configure ssh to {host}"))?,
        );
        let command = remote_command(&remote_config, extra_args);
        let uri = format!("{scheme}://{host}");
        debug!(%uri, %command, use_master, "configured ssh store");

        let factory_master = Arc::clone(&master);
        let factory_uri = uri.clone();
        let remote = RemoteHandle::new(uri, remote_config.max_connections, move || {
            let channel = factory_master.start_command(&command)?;
            RemoteStoreConnection::open(Box::new(channel), &factory_uri)
        });
        Ok(Self {
            store_dir: defaults.store_dir.clone(),
            master,
            remote,
        })
    }

    #[must_use]
    pub fn master(&self) -> &SshMaster {
        &self.master
    }
}

/// The command executed on the remote host to serve the daemon protocol on
/// its stdio.
fn remote_command(config: &RemoteStoreConfig, extra_args: &[&str]) -> String {
    let mut command = format!("{} --stdio", config.remote_program);
    if let Some(remote_store) = &config.remote_store {
        command.push_str(" --store ");
        command.push_str(&shell_quote(remote_store));
    }
    for arg in extra_args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

impl Store for SshStore {
    fn uri(&self) -> String {
        self.remote.uri().to_string()
    }

    fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    fn nar_from_path(&self, store_path: &StorePath) -> Result<Vec<u8>> {
        self.remote
            .with_conn("nar-from-path", |conn| conn.nar_from_path(store_path))
    }

    // No log access: the worker protocol does not carry a build-log
    // operation, so the capability is absent rather than best-effort.

    fn as_gc_root_store(&self) -> Option<&dyn GcRootStore> {
        Some(self)
    }

    fn as_remote(&self) -> Option<&dyn RemoteProtocol> {
        Some(self)
    }
}

/// Rooting over SSH is not a filesystem capability but a wire one: the
/// worker protocol carries an `add-perm-root` operation, so this store stays
/// protocol-only while still offering roots.
impl GcRootStore for SshStore {
    /// Both halves of the root live on the remote host, so the daemon
    /// creates them; `gc_root` is a path in the remote filesystem.
    fn add_perm_root(&self, store_path: &StorePath, gc_root: &Path) -> Result<std::path::PathBuf> {
        self.remote.with_conn("add-perm-root", |conn| {
            conn.add_perm_root(store_path, gc_root)
        })
    }
}

impl RemoteProtocol for SshStore {
    fn remote(&self) -> &RemoteHandle {
        &self.remote
    }
}

/// Remote daemon store whose store directory is also mounted in the local
/// filesystem (NFS or similar). Reads short-circuit to the mount; root
/// registration still goes through the daemon, which owns the registry.
pub struct MountedSshStore {
    ssh: SshStore,
    local: LocalFsStore,
}

impl MountedSshStore {
    /// Open a `mounted-ssh://` store. Local directory parameters (`root`,
    /// `real`, `state`, `log`) describe where the remote store is mounted.
    ///
    /// # Errors
    ///
    /// Returns an error when the SSH configuration is invalid or the mount
    /// directories cannot be prepared.
    pub fn open(host: &str, params: &StoreParams, defaults: &StoreDefaults) -> Result<Self> {
        // The remote daemon must create roots itself; this client cannot
        // write symlinks on the far side of the mount with the daemon's
        // privileges.
        let ssh = SshStore::open_internal(
            "mounted-ssh",
            host,
            params,
            defaults,
            &["--process-ops", "--allow-perm-roots"],
        )?;
        let local = LocalFsStore::open(params, defaults)
            .context("failed to open the mounted side of the store")?;
        Ok(Self { ssh, local })
    }
}

impl Store for MountedSshStore {
    fn uri(&self) -> String {
        self.ssh.remote.uri().to_string()
    }

    fn store_dir(&self) -> &Path {
        self.local.store_dir()
    }

    fn nar_from_path(&self, store_path: &StorePath) -> Result<Vec<u8>> {
        // The mount answers reads without a round-trip.
        self.local.nar_from_path(store_path)
    }

    fn as_filesystem(&self) -> Option<&dyn FilesystemAccess> {
        Some(&self.local)
    }

    fn as_gc_root_store(&self) -> Option<&dyn GcRootStore> {
        Some(self)
    }

    fn as_log_access(&self) -> Option<&dyn LogAccess> {
        Some(&self.local)
    }

    fn as_remote(&self) -> Option<&dyn RemoteProtocol> {
        Some(&self.ssh)
    }
}

impl GcRootStore for MountedSshStore {
    fn add_perm_root(&self, store_path: &StorePath, gc_root: &Path) -> Result<std::path::PathBuf> {
        self.ssh.add_perm_root(store_path, gc_root)
    }
}
