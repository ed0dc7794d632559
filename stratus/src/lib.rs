//! # Stratus
//!
//! Remote procedure calls over a publish/subscribe broker.
//!
//! Stratus provides:
//! - **Typed calls** over topics: arguments and results are marshalled
//!   through a small tagged [`WireValue`] union, checked on both sides
//! - **Liveness**: every request is acknowledged before it runs, and long
//!   calls report progress until exactly one FINISHED response arrives
//! - **Structured errors**: a remote failure's cause chain is rebuilt on
//!   the caller as a [`RemoteError`]
//! - **Shared connections**: many servers, clients, and subscribers reuse
//!   one broker connection per endpoint, with refcounted subscriptions
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use stratus::prelude::*;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let broker = MemoryBroker::new();
//! let registry = ConnectionRegistry::new(broker.connector());
//! let connection = registry.acquire(&EndpointConfig::new()).await?;
//! let scope = Scope::parse("/calc/")?;
//!
//! let server = RpcServer::new(connection.clone(), scope.clone(), ServerConfig::new());
//! server
//!     .registry()
//!     .register("add", Priority::Normal, |(a, b): (i32, i32)| Ok::<_, Infallible>(a + b))?;
//! server.activate().await?;
//!
//! let client = RpcClient::new(connection, scope, ClientConfig::new());
//! let sum: i32 = client.call("add", (3, 42)).await?;
//! assert_eq!(sum, 45);
//! # Ok::<(), StratusError>(())
//! # }).unwrap();
//! ```
//!
//! ## Architecture
//!
//! Stratus is composed of several crates:
//!
//! - [`stratus-core`] - Core types, wire messages, and the broker client trait
//! - [`stratus-codec`] - Value marshalling and the request/response envelope codec
//! - [`stratus-transport`] - Shared connections, pub/sub primitives, call correlation
//! - [`stratus-rpc`] - Method registry, RPC server, and RPC client
//!
//! The broker itself is external: anything implementing [`BrokerClient`]
//! can carry Stratus traffic. [`MemoryBroker`] is bundled for tests and
//! single-process use.

// Re-export core types
pub use stratus_core::{
    BrokerClient, BrokerFuture, CONTEXT_ID_PROPERTY, CodecError, Context, InboundMessage,
    MessageSink, Metadata, QoS, RPC_SUFFIX, RemoteError, Scope, StratusError, TIMESTAMP_PROPERTY,
    TransportError, Uuid,
};

// Re-export wire messages
pub use stratus_core::{CallStatus, ErrorEnvelope, ErrorFrame, FailureKind, Request, Response, WireValue};

// Re-export codec
pub use stratus_codec::{
    AlignedBufferPool, AlignedVec, EnvelopeCodec, Params, PooledBuffer, TypeDescriptor, WireEnum,
    WireMessage, WireType, decode, encode, wire_enum, wire_message,
};

// Re-export transport
pub use stratus_transport::{
    ConnectionRegistry, ConnectionState, Connector, EndpointConfig, EndpointKey, Handler,
    HandlerId, MemoryBroker, MemoryClient, PendingCalls, PublishedMessage, Publisher,
    ReconnectPolicy, SharedConnection, SubscribeFault, Subscriber, SubscriberConfig,
};

// Re-export RPC
pub use stratus_rpc::{
    ClientConfig, DEFAULT_ASYNC_CEILING, MethodRegistration, MethodRegistry, MethodSignature,
    PendingCall, Priority, RpcClient, RpcServer, ServerConfig,
};

// Re-export rkyv for message types
pub use rkyv::{Archive, Deserialize, Serialize};

/// Prelude module for convenient imports.
///
/// ```rust
/// use stratus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ClientConfig, ConnectionRegistry, Context, EndpointConfig, MemoryBroker, Priority,
        Publisher, RpcClient, RpcServer, Scope, ServerConfig, StratusError, Subscriber,
        SubscriberConfig,
    };

    pub use stratus_core::BrokerClient;
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
