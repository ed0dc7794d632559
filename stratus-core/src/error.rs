//! Error types for the Stratus RPC framework.

use std::time::Duration;

use uuid::Uuid;

use crate::message::FailureKind;

/// Main error type for Stratus operations.
///
/// Every call outcome is reported through this type, whether the failure
/// came from marshalling, the remote callable, or the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StratusError {
    /// Transport-level error (connect, subscribe, publish).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Marshalling error (value codec or envelope codec).
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The remote server has no method registered under this name.
    #[error("method not available: {0}")]
    MethodNotFound(String),

    /// A failure raised on the remote side, with its cause chain.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Request timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// A call with this correlation id is already pending.
    #[error("call {0} is already pending")]
    DuplicateCall(Uuid),

    /// Inbound message could not be interpreted as a request or response.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Method registration was rejected.
    #[error("registration error: {0}")]
    Registration(String),

    /// Unexpected failure inside a dispatcher.
    #[error("server error: {0}")]
    Server(String),

    /// Operation requires an active server, client, or subscriber.
    #[error("not active")]
    Inactive,
}

/// Transport-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying broker client.
    #[error("io error: {0}")]
    Io(std::sync::Arc<std::io::Error>),

    /// Connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to connect to the broker.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation attempted on a connection that is not connected.
    #[error("not connected")]
    NotConnected,

    /// The broker rejected a subscription.
    #[error("subscribe to {filter} failed: {reason}")]
    SubscribeFailed {
        /// Topic filter that was being subscribed.
        filter: String,
        /// Reason reported by the broker client.
        reason: String,
    },

    /// No subscription confirmation arrived in time.
    #[error("subscribe to {filter} not confirmed within {timeout:?}")]
    SubscribeTimeout {
        /// Topic filter that was being subscribed.
        filter: String,
        /// Confirmation timeout that elapsed.
        timeout: Duration,
    },

    /// The broker rejected an unsubscribe.
    #[error("unsubscribe from {filter} failed: {reason}")]
    UnsubscribeFailed {
        /// Topic filter that was being released.
        filter: String,
        /// Reason reported by the broker client.
        reason: String,
    },

    /// A publish was not accepted.
    #[error("publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Destination topic.
        topic: String,
        /// Reason reported by the broker client.
        reason: String,
    },

    /// Topic or scope string is malformed.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Endpoint configuration could not be parsed.
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),
}

/// Codec errors for value marshalling and envelope encoding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// A wire value of one kind was read as another kind.
    #[error("cannot decode {found} wire value as {expected}")]
    TypeMismatch {
        /// Kind the receiver asked for.
        expected: String,
        /// Kind that was populated on the wire.
        found: String,
    },

    /// The declared type has no wire representation.
    #[error("cannot parse class {0} to/from wire value")]
    Unsupported(String),

    /// Enumeration number does not resolve to a constant.
    #[error("{number} is not a valid number for enum {type_name}")]
    UnknownEnumNumber {
        /// Target enumeration type.
        type_name: String,
        /// Number that failed to resolve.
        number: i32,
    },

    /// Wrong argument count for a method.
    #[error("expected {expected} but got {got} arguments")]
    ArityMismatch {
        /// Declared parameter count.
        expected: usize,
        /// Received argument count.
        got: usize,
    },

    /// Payload exceeds the configured maximum.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// rkyv serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// rkyv deserialization/validation failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Error raised on the remote side of a call, rebuilt on the caller.
///
/// The outermost error comes first; each deeper cause is reachable through
/// [`std::error::Error::source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    kind: FailureKind,
    type_name: String,
    message: String,
    cause: Option<Box<RemoteError>>,
}

impl RemoteError {
    /// Create a remote error without a cause.
    #[must_use]
    pub fn new(kind: FailureKind, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the next error in the chain.
    #[must_use]
    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Failure classification reported by the server.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Type name of the original error, empty when unknown.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Message of the original error, unchanged.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The next error in the chain.
    #[must_use]
    pub fn cause(&self) -> Option<&RemoteError> {
        self.cause.as_deref()
    }

    /// Iterate the chain from this error down to the root cause.
    pub fn chain(&self) -> impl Iterator<Item = &RemoteError> {
        std::iter::successors(Some(self), |e| e.cause())
    }

    /// The innermost cause.
    #[must_use]
    pub fn root_cause(&self) -> &RemoteError {
        self.chain().last().unwrap_or(self)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(std::sync::Arc::new(e))
    }
}

impl StratusError {
    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::Io(_)
                    | TransportError::ConnectionClosed
                    | TransportError::NotConnected
                    | TransportError::SubscribeTimeout { .. }
            ) | Self::Timeout(_)
        )
    }

    /// Check if this error indicates the connection should be re-established.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::ConnectionClosed
                    | TransportError::Io(_)
                    | TransportError::NotConnected
                    | TransportError::Protocol(_)
            )
        )
    }

    /// The remote cause chain, if the failure originated on the server.
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}
