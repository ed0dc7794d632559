//! Broker client trait definitions.
//!
//! The `BrokerClient` trait abstracts over publish/subscribe transports
//! (an MQTT driver, the in-process broker, ...). Stratus only relies on
//! topic-addressed delivery, subscription confirmation, and QoS.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Metadata;
use crate::error::TransportError;

/// User property carrying the publish wall-clock time in Unix milliseconds.
pub const TIMESTAMP_PROPERTY: &str = "timestamp";

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Callback receiving every message the broker delivers to this client.
pub type MessageSink = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Delivery guarantee for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce = 1,
    /// Strongest guarantee; used for all RPC control messages.
    #[default]
    ExactlyOnce = 2,
}

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Concrete topic the message was published to.
    pub topic: String,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Transport user properties (not part of the payload).
    pub properties: Metadata,
}

impl InboundMessage {
    /// Publish timestamp attached by the sender, if any.
    #[must_use]
    pub fn timestamp_millis(&self) -> Option<u64> {
        self.properties
            .get(TIMESTAMP_PROPERTY)
            .and_then(|v| v.parse().ok())
    }
}

/// Client side of one physical broker connection.
///
/// Implementations deliver inbound messages to the sink handed to
/// [`connect`](BrokerClient::connect), off the caller's task.
/// `subscribe` resolves only once the broker has confirmed the subscription.
pub trait BrokerClient: Send + Sync + 'static {
    /// Open the connection and start delivering messages to `sink`.
    fn connect(&self, sink: MessageSink) -> BrokerFuture<'_, ()>;

    /// Close the connection.
    fn disconnect(&self) -> BrokerFuture<'_, ()>;

    /// Check if the connection is established.
    fn is_connected(&self) -> bool;

    /// Subscribe to a topic filter and wait for the broker's confirmation.
    fn subscribe<'a>(&'a self, filter: &'a str, qos: QoS) -> BrokerFuture<'a, ()>;

    /// Remove a subscription.
    fn unsubscribe<'a>(&'a self, filter: &'a str) -> BrokerFuture<'a, ()>;

    /// Publish a payload with user properties.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        qos: QoS,
        properties: Metadata,
    ) -> BrokerFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_qos_is_strongest() {
        assert_eq!(QoS::default(), QoS::ExactlyOnce);
        assert!(QoS::ExactlyOnce > QoS::AtLeastOnce);
    }

    #[test]
    fn test_timestamp_property() {
        let mut msg = InboundMessage {
            topic: "a/b".into(),
            payload: vec![1],
            properties: Metadata::new(),
        };
        assert_eq!(msg.timestamp_millis(), None);

        msg.properties
            .insert(TIMESTAMP_PROPERTY.into(), "1700000000000".into());
        assert_eq!(msg.timestamp_millis(), Some(1_700_000_000_000));
    }
}
