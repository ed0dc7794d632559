//! # stratus-transport
//!
//! Broker-facing plumbing for the Stratus RPC framework.
//!
//! This crate provides:
//! - `SharedConnection` - one broker connection with refcounted subscriptions
//! - `ConnectionRegistry` - shared connections keyed by endpoint, with leases
//! - `Publisher` / `Subscriber` - scope-addressed pub/sub primitives
//! - `PendingCalls` - correlation of in-flight calls with their responses
//! - `MemoryBroker` - an in-process broker with fault injection
//!
//! ## Architecture Note
//!
//! Broker clients deliver messages through the sink handed to
//! `BrokerClient::connect`, on their own tasks. `SharedConnection` installs
//! a single sink per physical connection and fans every message out to the
//! listeners whose filter matches, so listeners must not block.

mod config;
mod memory;
mod pending;
mod publisher;
mod registry;
mod shared;
mod subscriber;
mod topic;

pub use config::{
    DEFAULT_HOST, DEFAULT_PORT, EndpointConfig, EndpointKey, HOST_ENV, PORT_ENV, ReconnectPolicy,
};
pub use memory::{MemoryBroker, MemoryClient, PublishedMessage, SubscribeFault};
pub use pending::{PendingCalls, ResultReceiver};
pub use publisher::Publisher;
pub use registry::{ConnectionRegistry, Connector};
pub use shared::{ConnectionState, Listener, ListenerId, SharedConnection};
pub use subscriber::{Handler, HandlerId, Subscriber, SubscriberConfig};
pub use topic::{normalize_filter, topic_matches, validate_topic};
