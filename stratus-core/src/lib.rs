//! # stratus-core
//!
//! Core types, traits, and error definitions for the Stratus RPC framework.
//!
//! This crate provides:
//! - Error types (`StratusError`, `TransportError`, `CodecError`, `RemoteError`)
//! - Scopes and the topics derived from them (`Scope`)
//! - Per-call context (`Context`)
//! - The broker client trait (`BrokerClient`)
//! - RPC wire messages (`Request`, `Response`, `WireValue`, `ErrorEnvelope`)

mod context;
mod error;
mod message;
mod scope;
mod transport;

pub use context::{CONTEXT_ID_PROPERTY, Context, Metadata};
pub use error::{CodecError, RemoteError, StratusError, TransportError};
pub use message::{
    ArchivedCallStatus, ArchivedRequest, ArchivedResponse, ArchivedWireValue, CallStatus,
    ErrorEnvelope, ErrorFrame, FailureKind, Request, Response, WireValue,
};
pub use scope::{RPC_SUFFIX, Scope};
pub use transport::{
    BrokerClient, BrokerFuture, InboundMessage, MessageSink, QoS, TIMESTAMP_PROPERTY,
};

pub use uuid::Uuid;
