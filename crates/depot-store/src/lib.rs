#![deny(clippy::all, warnings)]

//! Store backends and the transport plumbing underneath them. A backend is
//! opened from a URI, queried for the capabilities it supports, and used
//! through those capability traits; nothing outside this crate knows which
//! concrete backend it is holding.

mod caps;
mod channel;
mod config;
mod error;
mod local;
mod nar;
mod open;
mod path;
mod pool;
mod protocol;
mod remote;
mod roots;
mod ssh;
mod ssh_store;
mod uds;

pub use crate::caps::{
    add_perm_root, build_log_exact, FilesystemAccess, GcRootStore, LogAccess, RemoteProtocol,
    Store,
};
pub use crate::channel::{CommandChannel, ProcessChannel, UnixSocketChannel};
pub use crate::config::{
    LocalStoreConfig, RemoteStoreConfig, SshConfig, StoreDefaults, StoreParams,
};
pub use crate::error::StoreError;
pub use crate::local::{FsAccessor, LocalFsStore};
pub use crate::nar::dump_path;
pub use crate::open::open_store;
pub use crate::path::StorePath;
pub use crate::pool::{ConnectionPool, PooledConn};
pub use crate::protocol::{
    HelloPayload, NarPayload, PermRootPayload, Request, Response, PROTOCOL_VERSION,
};
pub use crate::remote::{RemoteHandle, RemoteStoreConnection};
pub use crate::roots::{IndirectRootStore, RootsRegistry};
pub use crate::ssh::SshMaster;
pub use crate::ssh_store::{MountedSshStore, SshStore};
pub use crate::uds::UnixDaemonStore;
