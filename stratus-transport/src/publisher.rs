//! Scope-addressed publisher.

use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};

use stratus_codec::WireMessage;
use stratus_core::{Metadata, Scope, StratusError, TIMESTAMP_PROPERTY};

use crate::shared::SharedConnection;

/// Publishes messages of type `M` on the topic of a scope.
///
/// Payloads are sent verbatim at the strongest delivery guarantee. Use
/// `Vec<u8>` as `M` for opaque bytes.
pub struct Publisher<M> {
    connection: SharedConnection,
    topic: String,
    _marker: PhantomData<fn(M)>,
}

impl<M: WireMessage> Publisher<M> {
    #[must_use]
    pub fn new(connection: SharedConnection, scope: &Scope) -> Self {
        Self {
            connection,
            topic: scope.topic(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a message and hand it back.
    ///
    /// With `attach_timestamp`, the publish time in Unix milliseconds is
    /// sent as the `timestamp` user property; it is not part of the payload.
    pub async fn publish(&self, message: M, attach_timestamp: bool) -> Result<M, StratusError> {
        let payload = message.encode_message()?;
        let mut properties = Metadata::new();
        if attach_timestamp {
            properties.insert(TIMESTAMP_PROPERTY.to_string(), now_millis().to_string());
        }

        self.connection
            .publish(&self.topic, payload, properties)
            .await?;
        tracing::trace!(topic = %self.topic, "Published");
        Ok(message)
    }
}

impl<M> std::fmt::Debug for Publisher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}
