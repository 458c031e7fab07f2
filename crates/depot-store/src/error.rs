use std::path::PathBuf;

/// Errors surfaced by store backends and the transport layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[DP100] path {path} is outside the store namespace {store_dir}")]
    NotInStore { path: PathBuf, store_dir: PathBuf },
    #[error("[DP110] invalid store path name '{name}': {reason}")]
    BadStorePath { name: String, reason: &'static str },
    #[error("[DP200] {operation} failed against {store}: {error}")]
    Transport {
        operation: &'static str,
        store: String,
        error: String,
    },
    #[error("[DP210] protocol version mismatch with {store}: client speaks {client}, daemon speaks {daemon}")]
    ProtocolMismatch {
        store: String,
        client: u32,
        daemon: u32,
    },
    #[error("[DP220] daemon at {store} refused {operation}: {message}")]
    Daemon {
        store: String,
        operation: &'static str,
        message: String,
    },
    #[error("[DP300] operation {operation} is not supported by store {store}")]
    Unsupported {
        operation: &'static str,
        store: String,
    },
    #[error("[DP400] unknown store URI scheme '{scheme}' in '{uri}'")]
    UnknownScheme { scheme: String, uri: String },
    #[error("[DP500] cannot register GC root at {root}: {message}")]
    RootRegistration { root: PathBuf, message: String },
}
