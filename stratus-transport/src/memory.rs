//! In-process broker.
//!
//! `MemoryBroker` implements topic-addressed delivery with MQTT wildcard
//! filters entirely in memory. Each connected client gets its own delivery
//! task, so messages reach a client in publish order and never on the
//! publisher's task. Faults can be injected to exercise failure paths, and
//! every real transport call is counted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use stratus_core::{
    BrokerClient, BrokerFuture, InboundMessage, MessageSink, Metadata, QoS, TransportError,
};
use tokio::sync::{mpsc, oneshot};

use crate::config::EndpointConfig;
use crate::registry::Connector;
use crate::topic::topic_matches;

/// Injected behavior for subscribe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFault {
    /// Reject the subscription.
    Fail,
    /// Never confirm the subscription.
    Stall,
}

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub properties: Metadata,
}

enum Delivery {
    Message(InboundMessage),
    Flush(oneshot::Sender<()>),
}

struct Session {
    deliveries: mpsc::UnboundedSender<Delivery>,
    filters: HashSet<String>,
}

#[derive(Default)]
struct Stats {
    connects: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    publishes: AtomicUsize,
}

#[derive(Default)]
struct BrokerInner {
    sessions: RwLock<HashMap<u64, Session>>,
    next_session: AtomicU64,
    subscribe_fault: Mutex<Option<SubscribeFault>>,
    connect_fault: Mutex<bool>,
    published: Mutex<Vec<PublishedMessage>>,
    stats: Stats,
}

/// In-process publish/subscribe broker.
///
/// ```rust
/// use stratus_transport::{EndpointConfig, MemoryBroker, SharedConnection};
/// use std::sync::Arc;
///
/// let broker = MemoryBroker::new();
/// let connection = SharedConnection::new(EndpointConfig::default(), Arc::new(broker.client()));
/// assert!(!connection.is_connected());
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, unconnected client of this broker.
    #[must_use]
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            broker: Arc::clone(&self.inner),
            session: Mutex::new(None),
        }
    }

    /// Connector for a [`ConnectionRegistry`](crate::ConnectionRegistry)
    /// that creates clients of this broker.
    #[must_use]
    pub fn connector(&self) -> Connector {
        let broker = self.clone();
        Arc::new(move |_: &EndpointConfig| Arc::new(broker.client()) as Arc<dyn BrokerClient>)
    }

    /// Make later subscribe requests fail or stall. `None` clears the fault.
    pub fn set_subscribe_fault(&self, fault: Option<SubscribeFault>) {
        *self.inner.subscribe_fault.lock() = fault;
    }

    /// Make later connect attempts fail.
    pub fn set_connect_fault(&self, fail: bool) {
        *self.inner.connect_fault.lock() = fail;
    }

    /// Wait until every message published so far has been handed to its
    /// subscribers' sinks.
    pub async fn flush(&self) {
        let acks: Vec<oneshot::Receiver<()>> = self
            .inner
            .sessions
            .read()
            .values()
            .filter_map(|session| {
                let (tx, rx) = oneshot::channel();
                session.deliveries.send(Delivery::Flush(tx)).ok().map(|()| rx)
            })
            .collect();
        for ack in acks {
            let _ = ack.await;
        }
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.stats.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.inner.stats.subscribes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unsubscribe_count(&self) -> usize {
        self.inner.stats.unsubscribes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.inner.stats.publishes.load(Ordering::SeqCst)
    }

    /// Every message accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().clone()
    }

    /// Messages accepted on exactly this topic.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Filters subscribed by any connected client, sorted.
    #[must_use]
    pub fn active_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .inner
            .sessions
            .read()
            .values()
            .flat_map(|s| s.filters.iter().cloned())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// Number of connected clients.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("sessions", &self.session_count())
            .field("publishes", &self.publish_count())
            .finish_non_exhaustive()
    }
}

/// A client connection to a [`MemoryBroker`].
pub struct MemoryClient {
    broker: Arc<BrokerInner>,
    session: Mutex<Option<u64>>,
}

impl MemoryClient {
    fn session_id(&self) -> Result<u64, TransportError> {
        (*self.session.lock()).ok_or(TransportError::NotConnected)
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Result<T, TransportError> {
        let id = self.session_id()?;
        let mut sessions = self.broker.sessions.write();
        sessions
            .get_mut(&id)
            .map(f)
            .ok_or(TransportError::ConnectionClosed)
    }
}

impl BrokerClient for MemoryClient {
    fn connect(&self, sink: MessageSink) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.broker.stats.connects.fetch_add(1, Ordering::SeqCst);
            if *self.broker.connect_fault.lock() {
                return Err(TransportError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    match delivery {
                        Delivery::Message(message) => sink(message),
                        Delivery::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });

            let id = self.broker.next_session.fetch_add(1, Ordering::Relaxed);
            self.broker.sessions.write().insert(
                id,
                Session {
                    deliveries: tx,
                    filters: HashSet::new(),
                },
            );
            *self.session.lock() = Some(id);
            Ok(())
        })
    }

    fn disconnect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if let Some(id) = self.session.lock().take() {
                self.broker.sessions.write().remove(&id);
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    fn subscribe<'a>(&'a self, filter: &'a str, _qos: QoS) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.broker.stats.subscribes.fetch_add(1, Ordering::SeqCst);
            let fault = *self.broker.subscribe_fault.lock();
            match fault {
                Some(SubscribeFault::Fail) => {
                    return Err(TransportError::SubscribeFailed {
                        filter: filter.to_string(),
                        reason: "rejected by broker".to_string(),
                    });
                }
                Some(SubscribeFault::Stall) => futures::future::pending::<()>().await,
                None => {}
            }
            self.with_session(|session| {
                session.filters.insert(filter.to_string());
            })
        })
    }

    fn unsubscribe<'a>(&'a self, filter: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.broker.stats.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.with_session(|session| {
                session.filters.remove(filter);
            })
        })
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        qos: QoS,
        properties: Metadata,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.session_id()?;
            self.broker.stats.publishes.fetch_add(1, Ordering::SeqCst);
            self.broker.published.lock().push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                properties: properties.clone(),
            });

            let sessions = self.broker.sessions.read();
            for session in sessions.values() {
                if session.filters.iter().any(|f| topic_matches(f, topic)) {
                    let message = InboundMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                        properties: properties.clone(),
                    };
                    // A closed channel means the session is going away.
                    let _ = session.deliveries.send(Delivery::Message(message));
                }
            }
            Ok(())
        })
    }
}
