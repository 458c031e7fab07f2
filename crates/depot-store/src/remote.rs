use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::channel::CommandChannel;
use crate::error::StoreError;
use crate::path::StorePath;
use crate::pool::ConnectionPool;
use crate::protocol::{
    HelloPayload, NarPayload, PermRootPayload, Request, Response, PROTOCOL_VERSION,
};

/// One live worker-protocol session over a command channel. Exclusively
/// owned by a pool slot while checked out, so requests on a connection are
/// strictly ordered with one round-trip in flight at a time.
pub struct RemoteStoreConnection {
    channel: Box<dyn CommandChannel>,
    store_uri: String,
    daemon_version: u32,
}

impl std::fmt::Debug for RemoteStoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreConnection")
            .field("store_uri", &self.store_uri)
            .field("daemon_version", &self.daemon_version)
            .finish_non_exhaustive()
    }
}

impl RemoteStoreConnection {
    /// Perform the version handshake and forward client options.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the channel fails and a
    /// `StoreError::ProtocolMismatch` when the daemon speaks a different
    /// protocol version.
    pub fn open(channel: Box<dyn CommandChannel>, store_uri: &str) -> Result<Self> {
        let mut conn = Self {
            channel,
            store_uri: store_uri.to_string(),
            daemon_version: 0,
        };
        let value = conn.round_trip(
            "hello",
            &Request::Hello {
                version: PROTOCOL_VERSION,
            },
        )?;
        let hello: HelloPayload =
            serde_json::from_value(value).context("malformed hello reply from daemon")?;
        if hello.version != PROTOCOL_VERSION {
            return Err(StoreError::ProtocolMismatch {
                store: conn.store_uri.clone(),
                client: PROTOCOL_VERSION,
                daemon: hello.version,
            }
            .into());
        }
        conn.daemon_version = hello.version;
        debug!(store = %conn.store_uri, version = hello.version, "daemon handshake complete");
        conn.set_options()?;
        Ok(conn)
    }

    #[must_use]
    pub fn daemon_version(&self) -> u32 {
        self.daemon_version
    }

    /// Forward client-chosen settings to the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error when the round-trip fails.
    pub fn set_options(&mut self) -> Result<()> {
        // TODO: decide which client settings are worth forwarding and send
        // them here; the op already exists so older daemons keep working.
        let _ = self.round_trip(
            "set-options",
            &Request::SetOptions {
                options: BTreeMap::new(),
            },
        )?;
        Ok(())
    }

    /// Register a weak back-reference to a client-owned direct root.
    ///
    /// # Errors
    ///
    /// Returns an error when the round-trip fails or the daemon refuses.
    pub fn add_indirect_root(&mut self, root: &Path) -> Result<()> {
        let _ = self.round_trip(
            "add-indirect-root",
            &Request::AddIndirectRoot {
                root: root.display().to_string(),
            },
        )?;
        Ok(())
    }

    /// Ask the daemon to create and register a permanent root in one step.
    ///
    /// # Errors
    ///
    /// Returns an error when the round-trip fails or the daemon refuses.
    pub fn add_perm_root(&mut self, store_path: &StorePath, gc_root: &Path) -> Result<PathBuf> {
        let value = self.round_trip(
            "add-perm-root",
            &Request::AddPermRoot {
                store_path: store_path.name().to_string(),
                gc_root: gc_root.display().to_string(),
            },
        )?;
        let payload: PermRootPayload =
            serde_json::from_value(value).context("malformed add-perm-root reply from daemon")?;
        Ok(PathBuf::from(payload.gc_root))
    }

    /// Fetch a store object as a canonical archive.
    ///
    /// # Errors
    ///
    /// Returns an error when the round-trip fails or the daemon refuses.
    pub fn nar_from_path(&mut self, store_path: &StorePath) -> Result<Vec<u8>> {
        let value = self.round_trip(
            "nar-from-path",
            &Request::NarFromPath {
                store_path: store_path.name().to_string(),
            },
        )?;
        let payload: NarPayload =
            serde_json::from_value(value).context("malformed nar-from-path reply from daemon")?;
        Ok(payload.nar)
    }

    /// Half-close the session: the daemon sees end-of-input but can still
    /// flush a final response.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel shutdown fails.
    pub fn close_write(&mut self) -> Result<()> {
        self.channel
            .close_write()
            .context("failed to half-close daemon channel")
    }

    fn round_trip(&mut self, operation: &'static str, request: &Request) -> Result<serde_json::Value> {
        let mut frame = serde_json::to_vec(request).context("failed to encode request frame")?;
        frame.push(b'\n');
        self.channel
            .send(&frame)
            .with_context(|| format!("failed to send {operation} request"))?;
        let line = self
            .channel
            .recv_line()
            .with_context(|| format!("failed to read {operation} reply"))?
            .ok_or_else(|| anyhow!("daemon closed the connection during {operation}"))?;
        let response: Response = serde_json::from_str(&line)
            .with_context(|| format!("malformed {operation} reply frame"))?;
        if response.ok {
            Ok(response.value)
        } else {
            Err(StoreError::Daemon {
                store: self.store_uri.clone(),
                operation,
                message: response.error.unwrap_or_else(|| "unspecified error".to_string()),
            }
            .into())
        }
    }
}

/// A connection pool plus the backend URI for error context. Every remote
/// operation checks out one connection, runs against it, and returns it; a
/// connection that fails mid-operation is marked dead and evicted, never
/// silently retried.
pub struct RemoteHandle {
    uri: String,
    pool: ConnectionPool<RemoteStoreConnection>,
}

impl RemoteHandle {
    pub fn new<F>(uri: String, max_connections: usize, factory: F) -> Self
    where
        F: Fn() -> Result<RemoteStoreConnection> + Send + Sync + 'static,
    {
        Self {
            uri,
            pool: ConnectionPool::new(max_connections, factory),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.pool.live_count()
    }

    /// Run one operation against a checked-out connection.
    ///
    /// # Errors
    ///
    /// Transport failures are wrapped with the backend URI and mark the
    /// connection dead; daemon refusals pass through unchanged and leave the
    /// connection in the pool.
    pub fn with_conn<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut RemoteStoreConnection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.pool.acquire().map_err(|err| {
            anyhow::Error::from(StoreError::Transport {
                operation,
                store: self.uri.clone(),
                error: format!("{err:#}"),
            })
        })?;
        match f(&mut conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                if matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Daemon { .. })) {
                    // A refusal is a clean protocol exchange; the session is
                    // still usable.
                    return Err(err);
                }
                conn.mark_dead();
                Err(anyhow::Error::from(StoreError::Transport {
                    operation,
                    store: self.uri.clone(),
                    error: format!("{err:#}"),
                }))
            }
        }
    }
}
