use memchr::memchr;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Correlation identifier drawn from a channel's bounded id pool.
pub type CorrelationId = u32;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TRANSACTION_REJECTED: i64 = -32003;
pub const LIMIT_EXCEEDED: i64 = -32005;
pub const USER_REJECTED_REQUEST: i64 = 4001;
pub const UNSUPPORTED_METHOD: i64 = 4200;
pub const DISCONNECTED: i64 = 4900;

#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("frame exceeds {max_bytes} bytes before JSON parse (got {frame_bytes})")]
    FrameTooLarge {
        frame_bytes: usize,
        max_bytes: usize,
    },
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Newline-delimited JSON encoding for transports that carry bytes.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameCodecError> {
    let mut encoded = serde_json::to_vec(message)?;
    if encoded.len() > MAX_FRAME_BYTES {
        return Err(FrameCodecError::FrameTooLarge {
            frame_bytes: encoded.len(),
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Decodes the first complete frame in `input`, returning it with the number
/// of bytes consumed. `Ok(None)` means more bytes are needed.
pub fn decode_frame<T: DeserializeOwned>(
    input: &[u8],
) -> Result<Option<(T, usize)>, FrameCodecError> {
    match memchr(b'\n', input) {
        Some(newline_idx) => {
            if newline_idx > MAX_FRAME_BYTES {
                return Err(FrameCodecError::FrameTooLarge {
                    frame_bytes: newline_idx,
                    max_bytes: MAX_FRAME_BYTES,
                });
            }
            let decoded = serde_json::from_slice::<T>(&input[..newline_idx])?;
            Ok(Some((decoded, newline_idx + 1)))
        }
        None => {
            if input.len() > MAX_FRAME_BYTES {
                return Err(FrameCodecError::FrameTooLarge {
                    frame_bytes: input.len(),
                    max_bytes: MAX_FRAME_BYTES,
                });
            }
            Ok(None)
        }
    }
}

/// A frame as it travels over the page <-> extension transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    /// Out-of-band push from the extension; carries a [`PushMessage`].
    Message(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub ident: CorrelationId,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    pub ident: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorPayload>,
}

/// Error shape carried inside a response frame. `code` and `data` are only
/// present when the failing side attached them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&RpcError> for ErrorPayload {
    fn from(err: &RpcError) -> Self {
        Self {
            message: err.message.clone(),
            stack: err.stack.clone(),
            code: Some(err.code),
            data: err.data.clone(),
        }
    }
}

impl From<RpcError> for ErrorPayload {
    fn from(err: RpcError) -> Self {
        Self {
            message: err.message,
            stack: err.stack,
            code: Some(err.code),
            data: err.data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestPayload {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestPayload {
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Reply to the privileged `getProviderState` handshake call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderStateSnapshot {
    pub chain_id: Option<String>,
    pub accounts: Option<Vec<String>>,
    pub network_version: Option<String>,
    pub is_unlocked: bool,
}

/// Page metadata sent once with the `tabCheckin` notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub name: String,
    pub origin: String,
}

/// Structured EIP-1193 / JSON-RPC error as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl RpcError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            stack: None,
        }
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, default_message(INVALID_REQUEST))
    }

    #[must_use]
    pub fn limit_exceeded() -> Self {
        Self::new(LIMIT_EXCEEDED, default_message(LIMIT_EXCEEDED))
    }

    #[must_use]
    pub fn transaction_rejected(message: impl Into<String>) -> Self {
        Self::new(TRANSACTION_REJECTED, message)
    }

    #[must_use]
    pub fn user_rejected_request() -> Self {
        Self::new(USER_REJECTED_REQUEST, default_message(USER_REJECTED_REQUEST))
    }

    #[must_use]
    pub fn unsupported_method() -> Self {
        Self::new(UNSUPPORTED_METHOD, default_message(UNSUPPORTED_METHOD))
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(DISCONNECTED, default_message(DISCONNECTED))
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Normalizes an error payload received from the peer.
    ///
    /// A payload with a code keeps code, message, data and stack. Anything
    /// else becomes an internal error carrying the payload as
    /// `data.originalError`.
    #[must_use]
    pub fn from_payload(payload: ErrorPayload) -> Self {
        match payload.code {
            Some(code) => Self {
                code,
                message: if payload.message.is_empty() {
                    default_message(code).to_string()
                } else {
                    payload.message
                },
                data: payload.data,
                stack: payload.stack,
            },
            None => {
                let stack = payload.stack.clone();
                let original = serde_json::to_value(&payload).unwrap_or(Value::Null);
                Self {
                    code: INTERNAL_ERROR,
                    message: default_message(INTERNAL_ERROR).to_string(),
                    data: Some(json!({ "originalError": original })),
                    stack,
                }
            }
        }
    }
}

fn default_message(code: i64) -> &'static str {
    match code {
        INVALID_REQUEST => "Invalid request.",
        -32700 => "Invalid JSON was received by the server.",
        -32601 => "The method does not exist / is not available.",
        -32602 => "Invalid method parameter(s).",
        TRANSACTION_REJECTED => "Transaction rejected.",
        LIMIT_EXCEEDED => "Request limit exceeded.",
        USER_REJECTED_REQUEST => "User rejected the request.",
        4100 => "The requested account and/or method has not been authorized by the user.",
        UNSUPPORTED_METHOD => "The requested method is not supported by this Ethereum provider.",
        DISCONNECTED => "The provider is disconnected from all chains.",
        4901 => "The provider is disconnected from the specified chain.",
        _ => "Internal JSON-RPC error.",
    }
}
