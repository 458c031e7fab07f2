use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const STORE_SUBPATH: &str = "depot/store";
const STATE_SUBPATH: &str = "depot/var/depot";
const LOG_SUBPATH: &str = "depot/var/log/depot";

pub(crate) const DEFAULT_REMOTE_PROGRAM: &str = "depot-daemon";
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 1;

/// Process-wide default directories, resolved once at startup and passed in
/// explicitly. The library never reads them from ambient global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDefaults {
    pub store_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl StoreDefaults {
    /// Conventional system-wide layout (`/depot/store` and friends).
    #[must_use]
    pub fn system() -> Self {
        Self {
            store_dir: PathBuf::from("/").join(STORE_SUBPATH),
            state_dir: PathBuf::from("/").join(STATE_SUBPATH),
            log_dir: PathBuf::from("/").join(LOG_SUBPATH),
        }
    }

    /// Layout rooted under the caller's home directory, for single-user
    /// setups where the system prefix is not writable.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be resolved.
    pub fn per_user() -> Result<Self> {
        let home = dirs_next::home_dir().context("failed to resolve HOME for store defaults")?;
        Ok(Self::rooted(&home.join(".depot")))
    }

    /// Layout with every directory placed under `root`.
    #[must_use]
    pub fn rooted(root: &Path) -> Self {
        Self {
            store_dir: root.join(STORE_SUBPATH),
            state_dir: root.join(STATE_SUBPATH),
            log_dir: root.join(LOG_SUBPATH),
        }
    }
}

/// String key/value options supplied alongside a store URI.
#[derive(Debug, Clone, Default)]
pub struct StoreParams(BTreeMap<String, String>);

impl StoreParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Non-empty string value, if present.
    #[must_use]
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|v| !v.is_empty()).map(PathBuf::from)
    }

    #[must_use]
    pub fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true"))
    }

    #[must_use]
    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StoreParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Immutable per-backend directory configuration. Derived fields are
/// computed once from `root` at construction and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStoreConfig {
    /// Logical store namespace; independent of where the bytes live.
    pub store_dir: PathBuf,
    /// Optional prefix for every derived directory.
    pub root_dir: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Physical on-disk location of store objects.
    pub real_store_dir: PathBuf,
}

impl LocalStoreConfig {
    #[must_use]
    pub fn from_params(params: &StoreParams, defaults: &StoreDefaults) -> Self {
        let root_dir = params.get_path("root");
        let under_root = |subpath: &str, fallback: &Path| match &root_dir {
            Some(root) => root.join(subpath),
            None => fallback.to_path_buf(),
        };
        Self {
            store_dir: defaults.store_dir.clone(),
            state_dir: params
                .get_path("state")
                .unwrap_or_else(|| under_root(STATE_SUBPATH, &defaults.state_dir)),
            log_dir: params
                .get_path("log")
                .unwrap_or_else(|| under_root(LOG_SUBPATH, &defaults.log_dir)),
            real_store_dir: params
                .get_path("real")
                .unwrap_or_else(|| under_root(STORE_SUBPATH, &defaults.store_dir)),
            root_dir,
        }
    }
}

/// Settings shared by every daemon-backed store.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Maximum simultaneous connections; fixes the pool capacity.
    pub max_connections: usize,
    /// Remote daemon executable name or path.
    pub remote_program: String,
    /// URI of a sub-store the remote daemon should operate against.
    pub remote_store: Option<String>,
}

impl RemoteStoreConfig {
    #[must_use]
    pub fn from_params(params: &StoreParams) -> Self {
        Self {
            max_connections: params.get_usize("max-connections", DEFAULT_MAX_CONNECTIONS),
            remote_program: params
                .get("remote-program")
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_REMOTE_PROGRAM)
                .to_string(),
            remote_store: params
                .get("remote-store")
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned),
        }
    }
}

/// SSH channel settings.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    /// Path to a private key handed to `ssh -i`.
    pub key: Option<PathBuf>,
    /// Base64-encoded public host key pinned for verification.
    pub host_public_key: Option<String>,
    /// Whether to compress the connection.
    pub compress: bool,
}

impl SshConfig {
    #[must_use]
    pub fn from_params(params: &StoreParams) -> Self {
        Self {
            key: params.get_path("ssh-key"),
            host_public_key: params
                .get("base64-ssh-public-host-key")
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned),
            compress: params.flag_is_enabled("compress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_falls_back_to_defaults() {
        let defaults = StoreDefaults::system();
        let config = LocalStoreConfig::from_params(&StoreParams::new(), &defaults);
        assert_eq!(config.root_dir, None);
        assert_eq!(config.store_dir, defaults.store_dir);
        assert_eq!(config.state_dir, defaults.state_dir);
        assert_eq!(config.log_dir, defaults.log_dir);
        assert_eq!(config.real_store_dir, defaults.store_dir);
    }

    #[test]
    fn non_empty_root_prefixes_every_derived_dir() {
        let defaults = StoreDefaults::system();
        let params: StoreParams = [("root", "/mnt/chroot")].into_iter().collect();
        let config = LocalStoreConfig::from_params(&params, &defaults);
        let root = Path::new("/mnt/chroot");
        assert!(config.state_dir.starts_with(root));
        assert!(config.log_dir.starts_with(root));
        assert!(config.real_store_dir.starts_with(root));
        // The logical namespace stays put even when the bytes move.
        assert_eq!(config.store_dir, defaults.store_dir);
    }

    #[test]
    fn explicit_overrides_win_over_root_prefixing() {
        let defaults = StoreDefaults::system();
        let params: StoreParams = [("root", "/mnt/chroot"), ("state", "/elsewhere/state")]
            .into_iter()
            .collect();
        let config = LocalStoreConfig::from_params(&params, &defaults);
        assert_eq!(config.state_dir, PathBuf::from("/elsewhere/state"));
        assert!(config.log_dir.starts_with("/mnt/chroot"));
    }

    #[test]
    fn remote_config_defaults_and_parsing() {
        let config = RemoteStoreConfig::from_params(&StoreParams::new());
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.remote_program, DEFAULT_REMOTE_PROGRAM);
        assert_eq!(config.remote_store, None);

        let params: StoreParams = [
            ("max-connections", "4"),
            ("remote-program", "/opt/depot/bin/depot-daemon"),
            ("remote-store", "local://"),
        ]
        .into_iter()
        .collect();
        let config = RemoteStoreConfig::from_params(&params);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.remote_program, "/opt/depot/bin/depot-daemon");
        assert_eq!(config.remote_store.as_deref(), Some("local://"));
    }

    #[test]
    fn ssh_config_parsing() {
        let params: StoreParams = [
            ("ssh-key", "/home/op/.ssh/id_ed25519"),
            ("compress", "true"),
        ]
        .into_iter()
        .collect();
        let config = SshConfig::from_params(&params);
        assert_eq!(config.key, Some(PathBuf::from("/home/op/.ssh/id_ed25519")));
        assert!(config.compress);
        assert_eq!(config.host_public_key, None);
    }
}
