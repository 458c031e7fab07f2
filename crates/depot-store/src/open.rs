//! Backend selection. A store URI names a scheme and an authority; the
//! scheme picks the backend, the authority and the key/value parameters
//! configure it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::caps::Store;
use crate::config::{StoreDefaults, StoreParams};
use crate::error::StoreError;
use crate::local::LocalFsStore;
use crate::ssh_store::{MountedSshStore, SshStore};
use crate::uds::UnixDaemonStore;

/// Open the backend named by `uri`.
///
/// Recognized schemes:
///
/// * `local://[root]` reads and writes the filesystem directly.
/// * `unix://[socket]` talks to a daemon on a Unix socket.
/// * `ssh-ng://host` runs the daemon on a remote host.
/// * `mounted-ssh://host` like `ssh-ng`, with the store also mounted
///   locally so reads skip the wire.
///
/// # Errors
///
/// Returns `StoreError::UnknownScheme` for anything else, or the backend's
/// own error when its configuration is invalid.
pub fn open_store(
    uri: &str,
    params: &StoreParams,
    defaults: &StoreDefaults,
) -> Result<Arc<dyn Store>> {
    let (scheme, rest) = uri.split_once("://").ok_or_else(|| StoreError::UnknownScheme {
        scheme: uri.to_string(),
        uri: uri.to_string(),
    })?;
    debug!(%scheme, authority = %rest, "opening store");
    let store: Arc<dyn Store> = match scheme {
        "local" => {
            let mut params = params.clone();
            if !rest.is_empty() {
                params.set("root", rest);
            }
            Arc::new(
                LocalFsStore::open(&params, defaults)
                    .with_context(|| format!("failed to open {uri}"))?,
            )
        }
        "unix" => {
            let socket = (!rest.is_empty()).then(|| PathBuf::from(rest));
            Arc::new(UnixDaemonStore::open(socket, params, defaults))
        }
        "ssh-ng" => {
            let host = require_host(scheme, rest, uri)?;
            Arc::new(
                SshStore::open(host, params, defaults)
                    .with_context(|| format!("failed to open {uri}"))?,
            )
        }
        "mounted-ssh" => {
            let host = require_host(scheme, rest, uri)?;
            Arc::new(
                MountedSshStore::open(host, params, defaults)
                    .with_context(|| format!("failed to open {uri}"))?,
            )
        }
        _ => {
            return Err(StoreError::UnknownScheme {
                scheme: scheme.to_string(),
                uri: uri.to_string(),
            }
            .into())
        }
    };
    Ok(store)
}

fn require_host<'a>(scheme: &str, rest: &'a str, uri: &str) -> Result<&'a str, StoreError> {
    if rest.is_empty() {
        return Err(StoreError::UnknownScheme {
            scheme: format!("{scheme} (missing host)"),
            uri: uri.to_string(),
        });
    }
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_schemes_are_typed_errors() {
        let defaults = StoreDefaults::system();
        let err = open_store("https://example.org", &StoreParams::new(), &defaults)
            .expect_err("unknown scheme");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnknownScheme { scheme, .. }) if scheme == "https"
        ));

        let err = open_store("not-a-uri", &StoreParams::new(), &defaults)
            .expect_err("missing scheme separator");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnknownScheme { .. })
        ));
    }

    #[test]
    fn local_uri_authority_sets_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uri = format!("local://{}", dir.path().display());
        let store =
            open_store(&uri, &StoreParams::new(), &StoreDefaults::system()).expect("open");
        assert_eq!(store.uri(), uri);
        assert!(store.as_filesystem().is_some());
        assert!(store
            .as_filesystem()
            .expect("filesystem capability")
            .real_store_dir()
            .starts_with(dir.path()));
    }

    #[test]
    fn unix_uri_selects_the_daemon_backend() {
        let store = open_store(
            "unix:///run/depot.sock",
            &StoreParams::new(),
            &StoreDefaults::system(),
        )
        .expect("open");
        assert_eq!(store.uri(), "unix:///run/depot.sock");
        assert!(store.as_remote().is_some());
        assert!(store.as_filesystem().is_some());
    }

    #[test]
    fn ssh_schemes_require_a_host() {
        let defaults = StoreDefaults::system();
        let err = open_store("ssh-ng://", &StoreParams::new(), &defaults)
            .expect_err("missing host");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnknownScheme { .. })
        ));

        let store =
            open_store("ssh-ng://build@example.org", &StoreParams::new(), &defaults)
                .expect("open");
        assert_eq!(store.uri(), "ssh-ng://build@example.org");
        assert!(store.as_filesystem().is_none());
        assert!(store.as_log_access().is_none());
        assert!(store.as_remote().is_some());
    }
}
