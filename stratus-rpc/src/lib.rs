//! # stratus-rpc
//!
//! Request/response calls on top of Stratus publish/subscribe.
//!
//! This crate provides:
//! - `MethodRegistry` - name-keyed table of typed callables
//! - `RpcServer` - serves a registry on `{scope}/rpc`
//! - `RpcClient` - calls methods and correlates their responses
//!
//! ## Protocol
//!
//! A client subscribes to `{scope}/rpc/{id}`, then publishes a `Request`
//! to `{scope}/rpc`. The server answers on the response topic with
//! ACKNOWLEDGED, zero or more PROGRESSING heartbeats, and exactly one
//! FINISHED carrying the result or an `ErrorEnvelope`. The client releases
//! its response subscription once, when the call resolves or is cancelled.

mod client;
mod registry;
mod server;

pub use client::{ClientConfig, PendingCall, RpcClient};
pub use registry::{
    DEFAULT_ASYNC_CEILING, InvokeFuture, MethodRegistration, MethodRegistry, MethodSignature,
    Priority,
};
pub use server::{RpcServer, ServerConfig};
