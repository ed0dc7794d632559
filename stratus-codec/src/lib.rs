//! # stratus-codec
//!
//! Marshalling for the Stratus RPC framework.
//!
//! This crate provides:
//! - `WireType` - conversion between Rust values and `WireValue`
//! - `WireMessage` / `WireEnum` with the `wire_message!` / `wire_enum!` macros
//! - `Params` - positional argument tuples with arity checking
//! - `EnvelopeCodec` - rkyv payload codec for `Request` and `Response`
//!
//! ## Value mapping
//!
//! ```text
//! i32 -> int     f32 -> float    f64 -> double    i64 -> long
//! String -> string               bool -> bool     () -> void
//! WireEnum -> enum (by number)   WireMessage -> message (type tag + bytes)
//! ```

mod aligned;
mod envelope;
mod params;
mod value;

pub use aligned::{AlignedBufferPool, PooledBuffer};
pub use envelope::{DEFAULT_MAX_PAYLOAD_SIZE, EnvelopeCodec};
pub use params::{Params, check_arity};
pub use value::{
    TypeDescriptor, WireEnum, WireMessage, WireType, decode, encode, enum_from_wire,
    enum_into_wire, message_from_wire, message_into_wire,
};

pub use stratus_core::{CodecError, WireValue};

// Used by the exported macros.
#[doc(hidden)]
pub use rkyv;
pub use rkyv::util::AlignedVec;
