//! Conversion between Rust values and [`WireValue`].
//!
//! Every type that crosses the wire implements [`WireType`]. Primitives and
//! `()` are covered here; structured messages and enumerations opt in through
//! [`wire_message!`](crate::wire_message) and [`wire_enum!`](crate::wire_enum).
//! Declared types without a wire form are rejected at compile time:
//!
//! ```compile_fail
//! // u64 has no lossless wire representation.
//! let _ = stratus_codec::encode(5u64);
//! ```

use std::fmt;

use stratus_core::{CodecError, WireValue};

/// Declared wire type of a parameter or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Void,
    Int,
    Float,
    Double,
    Long,
    String,
    Bool,
    /// Enumeration, by type name.
    Enum(&'static str),
    /// Structured message, by type name.
    Message(&'static str),
}

impl TypeDescriptor {
    /// Check that a wire value can be decoded as this type.
    pub fn check(&self, value: &WireValue) -> Result<(), CodecError> {
        match (self, value) {
            (Self::Void, WireValue::Void)
            | (Self::Int, WireValue::Int(_))
            | (Self::Float, WireValue::Float(_))
            | (Self::Double, WireValue::Double(_))
            | (Self::Long, WireValue::Long(_))
            | (Self::String, WireValue::String(_))
            | (Self::Bool, WireValue::Bool(_)) => Ok(()),
            (Self::Enum(name), WireValue::Enum { type_name, .. })
            | (Self::Message(name), WireValue::Message { type_name, .. }) => {
                if *name == type_name.as_str() {
                    Ok(())
                } else {
                    Err(CodecError::Unsupported(type_name.clone()))
                }
            }
            (expected, found) => Err(CodecError::TypeMismatch {
                expected: expected.to_string(),
                found: found.kind().to_string(),
            }),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Void => "void",
            Self::Int => "int",
            Self::Float => "float",
            Self::Double => "double",
            Self::Long => "long",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Enum(name) | Self::Message(name) => *name,
        };
        f.write_str(name)
    }
}

/// A type with a wire representation.
pub trait WireType: Sized + Send + 'static {
    /// Declared wire type.
    fn descriptor() -> TypeDescriptor;

    /// Encode into a wire value.
    fn into_wire(self) -> Result<WireValue, CodecError>;

    /// Decode from a wire value, failing if the populated kind differs.
    fn from_wire(value: WireValue) -> Result<Self, CodecError>;
}

/// Encode a value.
pub fn encode<T: WireType>(value: T) -> Result<WireValue, CodecError> {
    value.into_wire()
}

/// Decode a value.
pub fn decode<T: WireType>(value: WireValue) -> Result<T, CodecError> {
    T::from_wire(value)
}

fn mismatch<T: WireType>(found: &WireValue) -> CodecError {
    match T::descriptor().check(found) {
        Err(e) => e,
        Ok(()) => CodecError::TypeMismatch {
            expected: T::descriptor().to_string(),
            found: found.kind().to_string(),
        },
    }
}

macro_rules! primitive_wire_type {
    ($ty:ty, $variant:ident) => {
        impl WireType for $ty {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::$variant
            }

            fn into_wire(self) -> Result<WireValue, CodecError> {
                Ok(WireValue::$variant(self))
            }

            fn from_wire(value: WireValue) -> Result<Self, CodecError> {
                match value {
                    WireValue::$variant(v) => Ok(v),
                    other => Err(mismatch::<Self>(&other)),
                }
            }
        }
    };
}

primitive_wire_type!(i32, Int);
primitive_wire_type!(f32, Float);
primitive_wire_type!(f64, Double);
primitive_wire_type!(i64, Long);
primitive_wire_type!(String, String);
primitive_wire_type!(bool, Bool);

impl WireType for () {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::Void
    }

    fn into_wire(self) -> Result<WireValue, CodecError> {
        Ok(WireValue::Void)
    }

    fn from_wire(value: WireValue) -> Result<Self, CodecError> {
        match value {
            WireValue::Void => Ok(()),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

/// A structured message carried as opaque bytes plus a type tag.
pub trait WireMessage: Sized + Send + 'static {
    /// Type tag written next to the payload.
    const TYPE_NAME: &'static str;

    fn encode_message(&self) -> Result<Vec<u8>, CodecError>;

    fn decode_message(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// An enumeration carried by number.
pub trait WireEnum: Sized + Send + 'static {
    const TYPE_NAME: &'static str;

    fn number(&self) -> i32;

    /// Resolve a number back to its constant.
    fn from_number(number: i32) -> Option<Self>;
}

/// [`WireType::into_wire`] for message types.
pub fn message_into_wire<T: WireMessage>(value: &T) -> Result<WireValue, CodecError> {
    Ok(WireValue::Message {
        type_name: T::TYPE_NAME.to_string(),
        payload: value.encode_message()?,
    })
}

/// [`WireType::from_wire`] for message types.
pub fn message_from_wire<T: WireMessage>(value: WireValue) -> Result<T, CodecError> {
    match value {
        WireValue::Message { type_name, payload } if type_name == T::TYPE_NAME => {
            T::decode_message(&payload)
        }
        WireValue::Message { type_name, .. } => Err(CodecError::Unsupported(type_name)),
        other => Err(CodecError::TypeMismatch {
            expected: T::TYPE_NAME.to_string(),
            found: other.kind().to_string(),
        }),
    }
}

/// [`WireType::into_wire`] for enum types.
pub fn enum_into_wire<T: WireEnum>(value: &T) -> WireValue {
    WireValue::Enum {
        type_name: T::TYPE_NAME.to_string(),
        number: value.number(),
    }
}

/// [`WireType::from_wire`] for enum types.
pub fn enum_from_wire<T: WireEnum>(value: WireValue) -> Result<T, CodecError> {
    match value {
        WireValue::Enum { type_name, number } if type_name == T::TYPE_NAME => {
            T::from_number(number).ok_or(CodecError::UnknownEnumNumber { type_name, number })
        }
        WireValue::Enum { type_name, .. } => Err(CodecError::Unsupported(type_name)),
        other => Err(CodecError::TypeMismatch {
            expected: T::TYPE_NAME.to_string(),
            found: other.kind().to_string(),
        }),
    }
}

/// Raw bytes travel as a message tagged `bytes`.
impl WireMessage for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn encode_message(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.clone())
    }

    fn decode_message(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

crate::wire_message!(Vec<u8>);

/// Implement [`WireType`] (and optionally [`WireMessage`]) for a message type.
///
/// `wire_message!(MyType => "my.Type")` implements both traits using rkyv;
/// the type must derive `rkyv::{Archive, Serialize, Deserialize}`.
/// `wire_message!(MyType)` only adds [`WireType`] on top of a hand-written
/// [`WireMessage`] impl.
#[macro_export]
macro_rules! wire_message {
    ($ty:ty => $name:literal) => {
        impl $crate::WireMessage for $ty {
            const TYPE_NAME: &'static str = $name;

            fn encode_message(&self) -> ::core::result::Result<Vec<u8>, $crate::CodecError> {
                $crate::rkyv::to_bytes::<$crate::rkyv::rancor::Error>(self)
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| $crate::CodecError::Serialization(e.to_string()))
            }

            fn decode_message(bytes: &[u8]) -> ::core::result::Result<Self, $crate::CodecError> {
                let mut aligned: $crate::AlignedVec = $crate::AlignedVec::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                $crate::rkyv::from_bytes::<$ty, $crate::rkyv::rancor::Error>(&aligned)
                    .map_err(|e| $crate::CodecError::Deserialization(e.to_string()))
            }
        }

        $crate::wire_message!($ty);
    };
    ($ty:ty) => {
        impl $crate::WireType for $ty {
            fn descriptor() -> $crate::TypeDescriptor {
                $crate::TypeDescriptor::Message(<$ty as $crate::WireMessage>::TYPE_NAME)
            }

            fn into_wire(self) -> ::core::result::Result<$crate::WireValue, $crate::CodecError> {
                $crate::message_into_wire(&self)
            }

            fn from_wire(value: $crate::WireValue) -> ::core::result::Result<Self, $crate::CodecError> {
                $crate::message_from_wire(value)
            }
        }
    };
}

/// Implement [`WireType`] (and optionally [`WireEnum`]) for an enumeration.
///
/// `wire_enum!(Color => "demo.Color" { Red = 0, Green = 1 })` implements
/// both traits for a fieldless enum; `wire_enum!(Color)` only adds
/// [`WireType`] on top of a hand-written [`WireEnum`] impl.
#[macro_export]
macro_rules! wire_enum {
    ($ty:ident => $name:literal { $($variant:ident = $number:literal),+ $(,)? }) => {
        impl $crate::WireEnum for $ty {
            const TYPE_NAME: &'static str = $name;

            fn number(&self) -> i32 {
                match self {
                    $(Self::$variant => $number,)+
                }
            }

            fn from_number(number: i32) -> ::core::option::Option<Self> {
                match number {
                    $($number => ::core::option::Option::Some(Self::$variant),)+
                    _ => ::core::option::Option::None,
                }
            }
        }

        $crate::wire_enum!($ty);
    };
    ($ty:ty) => {
        impl $crate::WireType for $ty {
            fn descriptor() -> $crate::TypeDescriptor {
                $crate::TypeDescriptor::Enum(<$ty as $crate::WireEnum>::TYPE_NAME)
            }

            fn into_wire(self) -> ::core::result::Result<$crate::WireValue, $crate::CodecError> {
                Ok($crate::enum_into_wire(&self))
            }

            fn from_wire(value: $crate::WireValue) -> ::core::result::Result<Self, $crate::CodecError> {
                $crate::enum_from_wire(value)
            }
        }
    };
}
