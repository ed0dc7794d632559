//! Reference-counted subscriptions over one broker connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use stratus_core::{BrokerClient, InboundMessage, MessageSink, Metadata, QoS, TransportError};

use crate::config::EndpointConfig;
use crate::topic::{normalize_filter, topic_matches, validate_topic};

/// Callback invoked for every message matching a subscribed filter.
pub type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Identifies one logical subscription on a [`SharedConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Connection state as observed by callers sharing the handle.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connection attempt failed after exhausting retries.
    Failed(TransportError),
}

type ListenerTable = RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>;

/// One physical broker connection shared by many publishers, subscribers,
/// servers, and clients.
///
/// Each topic filter carries a reference count. The real broker subscribe
/// is issued only when a filter goes from zero to one logical subscriber,
/// and the real unsubscribe only when it drops back to zero. Every logical
/// subscriber registers its own [`Listener`]; delivered messages fan out to
/// all listeners whose filter matches the topic.
///
/// Refcount changes and the broker calls they trigger happen under one
/// async mutex, so concurrent callers never lose a transition.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    config: EndpointConfig,
    client: Arc<dyn BrokerClient>,
    subscriptions: async_lock::Mutex<HashMap<String, usize>>,
    listeners: Arc<ListenerTable>,
    next_listener: AtomicU64,
    state: Mutex<ConnectionState>,
    connect_lock: async_lock::Mutex<()>,
}

impl SharedConnection {
    /// Wrap a broker client. Nothing is connected until [`connect`](Self::connect).
    pub fn new(config: EndpointConfig, client: Arc<dyn BrokerClient>) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                config,
                client,
                subscriptions: async_lock::Mutex::new(HashMap::new()),
                listeners: Arc::new(RwLock::new(HashMap::new())),
                next_listener: AtomicU64::new(1),
                state: Mutex::new(ConnectionState::Disconnected),
                connect_lock: async_lock::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    /// Whether two handles share the same physical connection.
    #[must_use]
    pub fn same_connection(&self, other: &SharedConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connect, retrying per the endpoint's [`ReconnectPolicy`].
    ///
    /// A previous failure is retried. Filters still referenced from an
    /// earlier session are subscribed again after a successful connect.
    ///
    /// [`ReconnectPolicy`]: crate::ReconnectPolicy
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.connect_inner(true).await
    }

    /// Connect unless already connected, reporting a recorded failure
    /// instead of retrying it.
    pub async fn ensure_connected(&self) -> Result<(), TransportError> {
        self.connect_inner(false).await
    }

    async fn connect_inner(&self, retry_failed: bool) -> Result<(), TransportError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.inner.client.is_connected() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            if let (ConnectionState::Failed(err), false) = (&*state, retry_failed) {
                return Err(err.clone());
            }
            *state = ConnectionState::Connecting;
        }

        let key = self.inner.config.key();
        let policy = &self.inner.config.reconnect;
        let mut attempt = 0;
        let err = loop {
            let sink = dispatcher(&self.inner.listeners);
            let result =
                tokio::time::timeout(self.inner.config.connect_timeout, self.inner.client.connect(sink))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportError::ConnectionFailed(format!(
                            "connect to {key} timed out after {:?}",
                            self.inner.config.connect_timeout
                        )))
                    });

            match result {
                Ok(()) => break None,
                Err(e) if attempt < policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(endpoint = %key, attempt, ?delay, error = %e, "Connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Some(e),
            }
        };

        if let Some(err) = err {
            tracing::error!(endpoint = %key, error = %err, "Connect failed");
            *self.inner.state.lock() = ConnectionState::Failed(err.clone());
            return Err(err);
        }

        *self.inner.state.lock() = ConnectionState::Connected;
        tracing::info!(endpoint = %key, "Connected to broker");
        self.resubscribe().await;
        Ok(())
    }

    async fn resubscribe(&self) {
        let subscriptions = self.inner.subscriptions.lock().await;
        for filter in subscriptions.keys() {
            if let Err(e) = self.inner.client.subscribe(filter, QoS::ExactlyOnce).await {
                tracing::warn!(filter = %filter, error = %e, "Resubscribe failed");
            }
        }
    }

    /// Add a logical subscriber for `filter`.
    ///
    /// The listener is installed before the broker confirms, so no message
    /// delivered right after confirmation is missed. If the real subscribe
    /// fails or is not confirmed within `timeout`, the listener is removed,
    /// the refcount is left untouched, and the error is returned.
    pub async fn subscribe(
        &self,
        filter: &str,
        listener: Listener,
        timeout: Duration,
    ) -> Result<ListenerId, TransportError> {
        let filter = normalize_filter(filter)?;
        self.ensure_connected().await?;

        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self.inner.subscriptions.lock().await;
        self.add_listener(&filter, id, listener);

        let count = subscriptions.get(&filter).copied().unwrap_or(0);
        if count == 0 {
            let confirmed = tokio::time::timeout(
                timeout,
                self.inner.client.subscribe(&filter, QoS::ExactlyOnce),
            )
            .await;

            match confirmed {
                Ok(Ok(())) => tracing::debug!(filter = %filter, "Subscribed"),
                Ok(Err(e)) => {
                    self.remove_listener(&filter, id);
                    return Err(e);
                }
                Err(_) => {
                    self.remove_listener(&filter, id);
                    // The broker may still complete the abandoned request.
                    if let Err(e) = self.inner.client.unsubscribe(&filter).await {
                        tracing::debug!(filter = %filter, error = %e, "Rollback unsubscribe failed");
                    }
                    return Err(TransportError::SubscribeTimeout { filter, timeout });
                }
            }
        }

        subscriptions.insert(filter, count + 1);
        Ok(id)
    }

    /// Remove a logical subscriber.
    ///
    /// Unknown filters and listener ids are a no-op, so releasing twice is
    /// safe.
    pub async fn unsubscribe(&self, filter: &str, id: ListenerId) -> Result<(), TransportError> {
        let filter = normalize_filter(filter)?;
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if !self.remove_listener(&filter, id) {
            return Ok(());
        }

        match subscriptions.get_mut(&filter) {
            None => Ok(()),
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                subscriptions.remove(&filter);
                if !self.inner.client.is_connected() {
                    return Ok(());
                }
                tracing::debug!(filter = %filter, "Unsubscribed");
                self.inner.client.unsubscribe(&filter).await
            }
        }
    }

    /// Publish at the strongest delivery guarantee.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        properties: Metadata,
    ) -> Result<(), TransportError> {
        validate_topic(topic)?;
        self.ensure_connected().await?;
        self.inner
            .client
            .publish(topic, payload, QoS::ExactlyOnce, properties)
            .await
    }

    /// Disconnect if connected. Idempotent.
    ///
    /// The refcount table is kept so a later [`connect`](Self::connect)
    /// restores existing subscriptions.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let _guard = self.inner.connect_lock.lock().await;
        if !self.inner.client.is_connected() {
            return Ok(());
        }
        let result = self.inner.client.disconnect().await;
        *self.inner.state.lock() = ConnectionState::Disconnected;
        tracing::info!(endpoint = %self.inner.config.key(), "Disconnected from broker");
        result
    }

    /// Number of logical subscribers for a filter.
    pub async fn subscription_count(&self, filter: &str) -> usize {
        let Ok(filter) = normalize_filter(filter) else {
            return 0;
        };
        self.inner
            .subscriptions
            .lock()
            .await
            .get(&filter)
            .copied()
            .unwrap_or(0)
    }

    fn add_listener(&self, filter: &str, id: ListenerId, listener: Listener) {
        self.inner
            .listeners
            .write()
            .entry(filter.to_string())
            .or_default()
            .push((id, listener));
    }

    fn remove_listener(&self, filter: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let Some(entries) = listeners.get_mut(filter) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(filter);
        }
        removed
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("endpoint", &self.inner.config.key())
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

/// Sink that fans a delivered message out to every matching listener.
///
/// Listeners are snapshotted before being called, so a listener may
/// subscribe or unsubscribe without deadlocking delivery.
fn dispatcher(listeners: &Arc<ListenerTable>) -> MessageSink {
    let listeners = Arc::clone(listeners);
    Arc::new(move |message: InboundMessage| {
        let matched: Vec<Listener> = listeners
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .flat_map(|(_, entries)| entries.iter().map(|(_, l)| Arc::clone(l)))
            .collect();

        if matched.is_empty() {
            tracing::trace!(topic = %message.topic, "No listener for message");
            return;
        }
        for listener in matched {
            listener(&message);
        }
    })
}
