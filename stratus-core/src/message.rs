//! RPC wire message types.
//!
//! Requests travel on `{scope}/rpc`, responses on `{scope}/rpc/{id}`.
//! All types are rkyv-serializable; see `stratus-codec` for the payload codec.

use rkyv::{Archive, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;

/// Tagged, transport-portable encoding of a single typed value.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum WireValue {
    /// Explicit empty value for unit results.
    Void,
    /// 32-bit signed integer.
    Int(i32),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// 64-bit signed integer.
    Long(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean.
    Bool(bool),
    /// Enumeration constant, resolved by the receiver through its number.
    Enum {
        /// Name of the enumeration type.
        type_name: String,
        /// Number of the constant.
        number: i32,
    },
    /// Structured message payload plus its type tag.
    Message {
        /// Name of the message type.
        type_name: String,
        /// Encoded message bytes.
        payload: Vec<u8>,
    },
}

impl WireValue {
    /// Short name of the populated variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Void => "void",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Long(_) => "long",
            Self::String(_) => "string",
            Self::Bool(_) => "bool",
            Self::Enum { type_name, .. } | Self::Message { type_name, .. } => type_name,
        }
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }
}

/// Status carried by a [`Response`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum CallStatus {
    /// The server received the request.
    Acknowledged = 1,

    /// The server is still executing the request.
    Progressing = 2,

    /// Terminal: carries either a result or an error.
    Finished = 3,
}

impl CallStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Classification of a failed call.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum FailureKind {
    /// No method registered under the requested name.
    MethodNotFound = 1,
    /// Arguments or result could not be marshalled.
    Marshalling = 2,
    /// The invoked callable returned an error.
    Application = 3,
    /// Unexpected failure inside the dispatcher.
    Server = 4,
}

/// One entry of a serialized error chain.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct ErrorFrame {
    /// Type name of the error, empty when unknown.
    pub type_name: String,
    /// Display text of the error.
    pub message: String,
}

/// Structured error carried by a FINISHED response.
///
/// Frames are ordered outermost first.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct ErrorEnvelope {
    pub kind: FailureKind,
    pub frames: Vec<ErrorFrame>,
}

impl ErrorEnvelope {
    /// Envelope with a single frame.
    #[must_use]
    pub fn new(kind: FailureKind, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            frames: vec![ErrorFrame {
                type_name: type_name.into(),
                message: message.into(),
            }],
        }
    }

    /// Capture an error and every error reachable through `source()`.
    ///
    /// `type_name` names the outermost error; the type of deeper causes is
    /// not recoverable through `dyn Error` and is left empty.
    #[must_use]
    pub fn from_error(
        kind: FailureKind,
        type_name: impl Into<String>,
        error: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut frames = vec![ErrorFrame {
            type_name: type_name.into(),
            message: error.to_string(),
        }];
        let mut source = error.source();
        while let Some(cause) = source {
            frames.push(ErrorFrame {
                type_name: String::new(),
                message: cause.to_string(),
            });
            source = cause.source();
        }
        Self { kind, frames }
    }

    /// Message of the outermost frame.
    #[must_use]
    pub fn message(&self) -> &str {
        self.frames.first().map_or("", |f| f.message.as_str())
    }

    /// Rebuild the nested cause chain.
    #[must_use]
    pub fn to_remote_error(&self) -> RemoteError {
        let kind = self.kind;
        self.frames
            .iter()
            .rev()
            .fold(None::<RemoteError>, |cause, frame| {
                let err = RemoteError::new(kind, frame.type_name.clone(), frame.message.clone());
                Some(match cause {
                    Some(cause) => err.with_cause(cause),
                    None => err,
                })
            })
            .unwrap_or_else(|| RemoteError::new(kind, "", ""))
    }
}

/// A call request published on the base request topic.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Request {
    /// Correlation id (UUID string).
    pub id: String,

    /// Target method name.
    pub method: String,

    /// Positional arguments.
    pub params: Vec<WireValue>,
}

impl Request {
    /// Create a new request.
    #[must_use]
    pub fn new(id: Uuid, method: impl Into<String>, params: Vec<WireValue>) -> Self {
        Self {
            id: id.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Parse the correlation id.
    pub fn correlation_id(&self) -> Result<Uuid, uuid::Error> {
        Uuid::parse_str(&self.id)
    }
}

/// A status update published on the per-call response topic.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Response {
    /// Correlation id of the request being answered.
    pub id: String,

    pub status: CallStatus,

    /// Present only when finished successfully.
    pub result: Option<WireValue>,

    /// Present only when finished with a failure.
    pub error: Option<ErrorEnvelope>,
}

impl Response {
    #[must_use]
    pub fn acknowledged(id: impl Into<String>) -> Self {
        Self::transient(id, CallStatus::Acknowledged)
    }

    #[must_use]
    pub fn progressing(id: impl Into<String>) -> Self {
        Self::transient(id, CallStatus::Progressing)
    }

    /// Terminal success response.
    #[must_use]
    pub fn finished(id: impl Into<String>, result: WireValue) -> Self {
        Self {
            id: id.into(),
            status: CallStatus::Finished,
            result: Some(result),
            error: None,
        }
    }

    /// Terminal failure response.
    #[must_use]
    pub fn failed(id: impl Into<String>, error: ErrorEnvelope) -> Self {
        Self {
            id: id.into(),
            status: CallStatus::Finished,
            result: None,
            error: Some(error),
        }
    }

    fn transient(id: impl Into<String>, status: CallStatus) -> Self {
        Self {
            id: id.into(),
            status,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
