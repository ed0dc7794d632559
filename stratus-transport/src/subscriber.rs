//! Scope-addressed subscriber with handler fan-out.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use stratus_codec::WireMessage;
use stratus_core::{InboundMessage, Metadata, Scope, StratusError};

use crate::shared::{ListenerId, SharedConnection};

/// Callback receiving a decoded message and its transport properties.
pub type Handler<M> = Arc<dyn Fn(&M, &Metadata) + Send + Sync>;

/// Identifies a handler registered on a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Configuration for subscribers.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// How long `activate` waits for the broker to confirm.
    pub activation_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(3),
        }
    }
}

impl SubscriberConfig {
    #[must_use]
    pub fn activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }
}

/// Delivers messages published on a scope's topic to registered handlers.
///
/// Handlers may be added or removed at any time, including from inside a
/// handler; each delivery works on a snapshot of the handler list.
pub struct Subscriber<M> {
    inner: Arc<SubscriberInner<M>>,
}

struct SubscriberInner<M> {
    connection: SharedConnection,
    topic: String,
    config: SubscriberConfig,
    handlers: RwLock<Vec<(HandlerId, Handler<M>)>>,
    next_handler: AtomicU64,
    listener: async_lock::Mutex<Option<ListenerId>>,
    active: AtomicBool,
    _marker: PhantomData<fn(M)>,
}

impl<M: WireMessage> Subscriber<M> {
    #[must_use]
    pub fn new(connection: SharedConnection, scope: &Scope, config: SubscriberConfig) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                connection,
                topic: scope.topic(),
                config,
                handlers: RwLock::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                listener: async_lock::Mutex::new(None),
                active: AtomicBool::new(false),
                _marker: PhantomData,
            }),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Subscribe and wait for the broker to confirm.
    ///
    /// Activating an active subscriber is a no-op. On timeout or transport
    /// error nothing stays subscribed.
    pub async fn activate(&self) -> Result<(), StratusError> {
        let mut listener = self.inner.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .connection
            .subscribe(
                &self.inner.topic,
                Arc::new(move |message: &InboundMessage| deliver(&weak, message)),
                self.inner.config.activation_timeout,
            )
            .await?;

        *listener = Some(id);
        self.inner.active.store(true, Ordering::Release);
        tracing::debug!(topic = %self.inner.topic, "Subscriber activated");
        Ok(())
    }

    /// Unsubscribe. Deactivating an inactive subscriber is a no-op.
    pub async fn deactivate(&self) -> Result<(), StratusError> {
        let mut listener = self.inner.listener.lock().await;
        let Some(id) = listener.take() else {
            return Ok(());
        };
        self.inner.active.store(false, Ordering::Release);
        self.inner
            .connection
            .unsubscribe(&self.inner.topic, id)
            .await?;
        tracing::debug!(topic = %self.inner.topic, "Subscriber deactivated");
        Ok(())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Register a handler for every message delivered while active.
    pub fn register_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&M, &Metadata) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

fn deliver<M: WireMessage>(inner: &Weak<SubscriberInner<M>>, message: &InboundMessage) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if !inner.active.load(Ordering::Acquire) {
        return;
    }

    let decoded = match M::decode_message(&message.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(topic = %message.topic, error = %e, "Dropping undecodable message");
            return;
        }
    };

    let snapshot: Vec<Handler<M>> = inner
        .handlers
        .read()
        .iter()
        .map(|(_, handler)| Arc::clone(handler))
        .collect();
    for handler in snapshot {
        handler(&decoded, &message.properties);
    }
}

impl<M> Drop for Subscriber<M> {
    fn drop(&mut self) {
        let Some(id) = self.inner.listener.try_lock().and_then(|mut l| l.take()) else {
            return;
        };
        self.inner.active.store(false, Ordering::Release);
        let connection = self.inner.connection.clone();
        let topic = self.inner.topic.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = connection.unsubscribe(&topic, id).await;
                });
            }
            Err(_) => tracing::warn!(topic = %topic, "Subscriber dropped outside a runtime; subscription leaked"),
        }
    }
}

impl<M> std::fmt::Debug for Subscriber<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.inner.topic)
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, ReconnectPolicy};
    use crate::memory::{MemoryBroker, SubscribeFault};
    use crate::publisher::Publisher;
    use parking_lot::Mutex;
    use stratus_core::TransportError;

    fn setup() -> (MemoryBroker, SharedConnection, Scope) {
        let broker = MemoryBroker::new();
        let config = EndpointConfig::new().reconnect(ReconnectPolicy::never());
        let connection = SharedConnection::new(config, Arc::new(broker.client()));
        (broker, connection, Scope::parse("/sensors/temp/").unwrap())
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let (broker, connection, scope) = setup();
        let subscriber: Subscriber<Vec<u8>> =
            Subscriber::new(connection, &scope, SubscriberConfig::default());

        assert!(!subscriber.is_active());
        subscriber.activate().await.unwrap();
        subscriber.activate().await.unwrap();
        assert!(subscriber.is_active());
        assert_eq!(broker.subscribe_count(), 1);

        subscriber.deactivate().await.unwrap();
        subscriber.deactivate().await.unwrap();
        assert!(!subscriber.is_active());
        assert_eq!(broker.unsubscribe_count(), 1);

        subscriber.activate().await.unwrap();
        assert!(subscriber.is_active());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (broker, connection, scope) = setup();
        let subscriber: Subscriber<Vec<u8>> =
            Subscriber::new(connection.clone(), &scope, SubscriberConfig::default());
        subscriber.activate().await.unwrap();
        assert_eq!(broker.active_filters(), ["sensors/temp"]);

        drop(subscriber);
        for _ in 0..50 {
            if broker.active_filters().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(broker.active_filters().is_empty());
        assert_eq!(connection.subscription_count("sensors/temp").await, 0);
    }

    #[tokio::test]
    async fn test_activation_timeout() {
        let (broker, connection, scope) = setup();
        connection.connect().await.unwrap();
        broker.set_subscribe_fault(Some(SubscribeFault::Stall));

        let subscriber: Subscriber<Vec<u8>> = Subscriber::new(
            connection.clone(),
            &scope,
            SubscriberConfig::default().activation_timeout(Duration::from_millis(50)),
        );
        let err = subscriber.activate().await.unwrap_err();
        assert!(matches!(
            err,
            StratusError::Transport(TransportError::SubscribeTimeout { .. })
        ));
        assert!(!subscriber.is_active());
        assert_eq!(connection.subscription_count(subscriber.topic()).await, 0);
    }

    #[tokio::test]
    async fn test_timestamp_reaches_handlers() {
        let (broker, connection, scope) = setup();
        let subscriber: Subscriber<Vec<u8>> =
            Subscriber::new(connection.clone(), &scope, SubscriberConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        subscriber.register_handler(move |payload, properties| {
            handler_seen
                .lock()
                .push((payload.clone(), properties.contains_key("timestamp")));
        });
        subscriber.activate().await.unwrap();

        let publisher: Publisher<Vec<u8>> = Publisher::new(connection, &scope);
        assert_eq!(publisher.topic(), "sensors/temp");
        let echoed = publisher.publish(vec![21], true).await.unwrap();
        assert_eq!(echoed, vec![21]);
        publisher.publish(vec![22], false).await.unwrap();
        broker.flush().await;

        assert_eq!(*seen.lock(), vec![(vec![21], true), (vec![22], false)]);
    }

    #[tokio::test]
    async fn test_handler_may_remove_itself() {
        let (broker, connection, scope) = setup();
        let subscriber: Arc<Subscriber<Vec<u8>>> = Arc::new(Subscriber::new(
            connection.clone(),
            &scope,
            SubscriberConfig::default(),
        ));
        let calls = Arc::new(AtomicU64::new(0));

        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let (sub, handler_calls, handler_slot) =
            (Arc::downgrade(&subscriber), Arc::clone(&calls), Arc::clone(&slot));
        let id = subscriber.register_handler(move |_, _| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            if let (Some(sub), Some(id)) = (sub.upgrade(), *handler_slot.lock()) {
                sub.remove_handler(id);
            }
        });
        *slot.lock() = Some(id);
        subscriber.activate().await.unwrap();

        let publisher: Publisher<Vec<u8>> = Publisher::new(connection, &scope);
        publisher.publish(vec![1], false).await.unwrap();
        publisher.publish(vec![2], false).await.unwrap();
        broker.flush().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.handler_count(), 0);
    }
}
