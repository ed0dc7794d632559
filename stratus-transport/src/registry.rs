//! Shared connections keyed by endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use stratus_core::{BrokerClient, TransportError};

use crate::config::{EndpointConfig, EndpointKey};
use crate::shared::SharedConnection;

/// Creates the broker client for a new endpoint.
pub type Connector = Arc<dyn Fn(&EndpointConfig) -> Arc<dyn BrokerClient> + Send + Sync>;

struct Entry {
    connection: SharedConnection,
    leases: usize,
}

struct RegistryInner {
    connector: Connector,
    entries: DashMap<EndpointKey, Entry>,
    closed: AtomicBool,
}

// Leased connections outlive the registry; their holders still use them.
impl Drop for RegistryInner {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for entry in self.entries.iter().filter(|entry| entry.leases == 0) {
            let connection = entry.connection.clone();
            if connection.is_connected() {
                handle.spawn(async move {
                    let _ = connection.disconnect().await;
                });
            }
        }
    }
}

/// Registry of shared broker connections, one per endpoint.
///
/// `acquire` returns the same [`SharedConnection`] for every configuration
/// with the same host and port, creating and connecting it on first use.
/// Each acquisition is a lease; the connection is disconnected when its
/// last lease is released or the registry shuts down.
///
/// A connect failure is reported to the caller that triggered it and
/// recorded on the connection, so later callers see the same failure until
/// someone retries with [`SharedConnection::connect`].
///
/// ## Example
///
/// ```rust
/// use stratus_transport::{ConnectionRegistry, EndpointConfig, MemoryBroker};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let broker = MemoryBroker::new();
/// let registry = ConnectionRegistry::new(broker.connector());
///
/// let a = registry.acquire(&EndpointConfig::default()).await.unwrap();
/// let b = registry.acquire(&EndpointConfig::default()).await.unwrap();
/// assert!(a.same_connection(&b));
/// assert_eq!(broker.connect_count(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(connector: Connector) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                entries: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lease the connection for an endpoint.
    pub async fn acquire(&self, config: &EndpointConfig) -> Result<SharedConnection, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let key = config.key();
        let mut created = false;
        let connection = {
            let mut entry = self.inner.entries.entry(key.clone()).or_insert_with(|| {
                created = true;
                Entry {
                    connection: SharedConnection::new(config.clone(), (self.inner.connector)(config)),
                    leases: 0,
                }
            });
            entry.leases += 1;
            entry.connection.clone()
        };

        let connected = if created {
            tracing::debug!(endpoint = %key, "Creating shared connection");
            connection.connect().await
        } else {
            connection.ensure_connected().await
        };

        if let Err(e) = connected {
            if let Some(mut entry) = self.inner.entries.get_mut(&key) {
                entry.leases = entry.leases.saturating_sub(1);
            }
            return Err(e);
        }
        Ok(connection)
    }

    /// Return a lease. The last release disconnects the endpoint.
    pub async fn release(&self, connection: &SharedConnection) -> Result<(), TransportError> {
        let key = connection.config().key();
        let remaining = {
            let Some(mut entry) = self.inner.entries.get_mut(&key) else {
                return Ok(());
            };
            if !entry.connection.same_connection(connection) {
                return Ok(());
            }
            entry.leases = entry.leases.saturating_sub(1);
            entry.leases
        };
        if remaining > 0 {
            return Ok(());
        }

        match self.inner.entries.remove_if(&key, |_, entry| entry.leases == 0) {
            Some((_, entry)) => {
                tracing::debug!(endpoint = %key, "Last lease released");
                entry.connection.disconnect().await
            }
            None => Ok(()),
        }
    }

    /// Number of outstanding leases for an endpoint.
    #[must_use]
    pub fn leases(&self, config: &EndpointConfig) -> usize {
        self.inner
            .entries
            .get(&config.key())
            .map_or(0, |entry| entry.leases)
    }

    /// Number of endpoints with a shared connection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Disconnect every connected endpoint and refuse new leases.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let connections: Vec<SharedConnection> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.connection.clone())
            .collect();
        self.inner.entries.clear();

        for connection in connections {
            if !connection.is_connected() {
                continue;
            }
            if let Err(e) = connection.disconnect().await {
                tracing::warn!(endpoint = %connection.config().key(), error = %e, "Disconnect failed");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("endpoints", &self.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
