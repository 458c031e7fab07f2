//! Daemon backend over a Unix domain socket. The daemon and this process
//! share one filesystem, so the store directory is read directly; only
//! privileged mutations (root registration) go through the socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::caps::{FilesystemAccess, GcRootStore, LogAccess, RemoteProtocol, Store};
use crate::channel::UnixSocketChannel;
use crate::config::{LocalStoreConfig, RemoteStoreConfig, StoreDefaults, StoreParams};
use crate::local::{self, FsAccessor};
use crate::nar;
use crate::path::StorePath;
use crate::remote::{RemoteHandle, RemoteStoreConnection};
use crate::roots::IndirectRootStore;

const DEFAULT_SOCKET_SUBPATH: &str = "daemon-socket/socket";

/// Store reached through a local daemon listening on a Unix socket.
pub struct UnixDaemonStore {
    config: LocalStoreConfig,
    socket_path: PathBuf,
    remote: RemoteHandle,
}

impl UnixDaemonStore {
    /// Open a daemon-backed store. `socket` overrides the conventional
    /// socket location under the state directory; connections are
    /// established lazily, so opening never touches the socket.
    #[must_use]
    pub fn open(socket: Option<PathBuf>, params: &StoreParams, defaults: &StoreDefaults) -> Self {
        let config = LocalStoreConfig::from_params(params, defaults);
        let remote_config = RemoteStoreConfig::from_params(params);
        let uri = match &socket {
            Some(path) => format!("unix://{}", path.display()),
            None => "unix://".to_string(),
        };
        let socket_path =
            socket.unwrap_or_else(|| config.state_dir.join(DEFAULT_SOCKET_SUBPATH));
        debug!(
            socket = %socket_path.display(),
            max_connections = remote_config.max_connections,
            "configured unix daemon store"
        );
        let factory_socket = socket_path.clone();
        let factory_uri = uri.clone();
        let remote = RemoteHandle::new(uri, remote_config.max_connections, move || {
            let channel = UnixSocketChannel::connect(&factory_socket)?;
            RemoteStoreConnection::open(Box::new(channel), &factory_uri)
        });
        Self {
            config,
            socket_path,
            remote,
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Store for UnixDaemonStore {
    fn uri(&self) -> String {
        self.remote.uri().to_string()
    }

    fn store_dir(&self) -> &Path {
        &self.config.store_dir
    }

    fn nar_from_path(&self, store_path: &StorePath) -> Result<Vec<u8>> {
        // The daemon's store directory is this filesystem; no round-trip.
        let real = self.config.real_store_dir.join(store_path.name());
        nar::dump_path(&real)
            .with_context(|| format!("failed to archive store object {store_path}"))
    }

    fn as_filesystem(&self) -> Option<&dyn FilesystemAccess> {
        Some(self)
    }

    fn as_gc_root_store(&self) -> Option<&dyn GcRootStore> {
        Some(self)
    }

    fn as_log_access(&self) -> Option<&dyn LogAccess> {
        Some(self)
    }

    fn as_remote(&self) -> Option<&dyn RemoteProtocol> {
        Some(self)
    }
}

impl FilesystemAccess for UnixDaemonStore {
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

impl IndirectRootStore for UnixDaemonStore {
    /// The direct symlink is created client-side; the daemon only records
    /// the back-reference, under its own privileges.
    fn add_indirect_root(&self, root: &Path) -> Result<()> {
        self.remote
            .with_conn("add-indirect-root", |conn| conn.add_indirect_root(root))
    }
}

impl LogAccess for UnixDaemonStore {
    fn build_log_exact(&self, store_path: &StorePath) -> Result<Option<String>> {
        local::read_build_log(&self.config.log_dir, store_path)
    }
}

impl RemoteProtocol for UnixDaemonStore {
    fn remote(&self) -> &RemoteHandle {
        &self.remote
    }
}
