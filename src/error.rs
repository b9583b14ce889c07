//! Client error taxonomy
//!
//! A flat tagged set of failure kinds shared by every component. Kinds
//! that surface after network activity carry the response envelope that
//! produced them so callers can diagnose root cause (attempt count,
//! last connection, decoded body).

use crate::types::ApiResponse;
use serde_json::Value;
use thiserror::Error;

pub(crate) const NO_LIVING_CONNECTIONS_MESSAGE: &str =
    "Given the configuration, the ConnectionPool was not able to find a usable Connection for this request.";
pub(crate) const NOT_COMPATIBLE_MESSAGE: &str =
    "The client noticed that the server is not a supported distribution";

/// Failures a logical request can resolve with
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid construction input: bad URL scheme, unknown role, bad option
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket-level failure during a request
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        meta: Option<Box<ApiResponse>>,
    },

    /// Request exceeded its timeout
    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        meta: Option<Box<ApiResponse>>,
    },

    /// The pool had no eligible connection for this request
    #[error("{message}")]
    NoLivingConnections {
        message: String,
        meta: Option<Box<ApiResponse>>,
    },

    /// A body could not be encoded, or a non-sequence was passed where
    /// a sequence was required
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A response body could not be decoded, or failed the
    /// poisoned-key policy. Carries the offending input.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, data: String },

    /// The server returned a non-ignored error status
    #[error("{message}")]
    Response {
        message: String,
        meta: Box<ApiResponse>,
    },

    /// The caller cancelled the request
    #[error("{message}")]
    RequestAborted {
        message: String,
        meta: Option<Box<ApiResponse>>,
    },

    /// The server identified as an unsupported distribution or version
    #[error("{NOT_COMPATIBLE_MESSAGE}")]
    NotCompatible { meta: Box<ApiResponse> },

    /// The memory circuit breaker refused to dispatch
    #[error("Memory circuit breaker open: {0}")]
    CircuitBreaking(String),
}

impl ClientError {
    /// Error kind as a string, used for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClientError::Configuration(_) => "configuration",
            ClientError::Connection { .. } => "connection",
            ClientError::Timeout { .. } => "timeout",
            ClientError::NoLivingConnections { .. } => "no_living_connections",
            ClientError::Serialization(_) => "serialization",
            ClientError::Deserialization { .. } => "deserialization",
            ClientError::Response { .. } => "response",
            ClientError::RequestAborted { .. } => "request_aborted",
            ClientError::NotCompatible { .. } => "not_compatible",
            ClientError::CircuitBreaking(_) => "circuit_breaking",
        }
    }

    /// Whether the transport may recover this failure by retrying the
    /// call on another connection. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { .. } | ClientError::Timeout { .. }
        )
    }

    /// Build a connection failure without envelope metadata
    pub fn connection(message: impl Into<String>) -> Self {
        ClientError::Connection {
            message: message.into(),
            meta: None,
        }
    }

    /// Build a timeout failure without envelope metadata
    pub fn timeout(message: impl Into<String>) -> Self {
        ClientError::Timeout {
            message: message.into(),
            meta: None,
        }
    }

    /// Build an aborted failure without envelope metadata
    pub fn aborted() -> Self {
        ClientError::RequestAborted {
            message: "Request aborted".to_string(),
            meta: None,
        }
    }

    /// Build a no-living-connections failure with the default message
    pub fn no_living_connections(meta: Option<Box<ApiResponse>>) -> Self {
        ClientError::NoLivingConnections {
            message: NO_LIVING_CONNECTIONS_MESSAGE.to_string(),
            meta,
        }
    }

    /// Wrap a server error response. When the body carries a structured
    /// root-cause list, the message joins each entry as
    /// `[type] Reason: reason` with `; ` separators, prefixed by the
    /// top-level error type.
    pub fn response(meta: ApiResponse) -> Self {
        let message = response_message(&meta);
        ClientError::Response {
            message,
            meta: Box::new(meta),
        }
    }

    /// Build a not-compatible failure from the offending envelope
    pub fn not_compatible(meta: ApiResponse) -> Self {
        ClientError::NotCompatible {
            meta: Box::new(meta),
        }
    }

    /// The response envelope that produced this failure, if any
    pub fn meta(&self) -> Option<&ApiResponse> {
        match self {
            ClientError::Connection { meta, .. }
            | ClientError::Timeout { meta, .. }
            | ClientError::NoLivingConnections { meta, .. }
            | ClientError::RequestAborted { meta, .. } => meta.as_deref(),
            ClientError::Response { meta, .. } | ClientError::NotCompatible { meta } => {
                Some(meta.as_ref())
            }
            _ => None,
        }
    }

    /// Effective status code of a response failure. A numeric `status`
    /// field in the body wins over the wire status, matching how the
    /// server reports per-item failures inside a 200 envelope.
    pub fn status_code(&self) -> Option<u16> {
        let meta = self.meta()?;
        if let ClientError::Response { .. } = self {
            let body_status = meta
                .body
                .as_ref()
                .and_then(|body| body.as_json())
                .and_then(|json| json.get("status"))
                .and_then(Value::as_u64);
            if let Some(status) = body_status {
                return u16::try_from(status).ok().or(meta.status_code);
            }
        }
        meta.status_code
    }

    /// Attach (or replace) the envelope on kinds that carry an optional one
    pub(crate) fn with_meta(self, envelope: ApiResponse) -> Self {
        let boxed = Some(Box::new(envelope));
        match self {
            ClientError::Connection { message, .. } => ClientError::Connection {
                message,
                meta: boxed,
            },
            ClientError::Timeout { message, .. } => ClientError::Timeout {
                message,
                meta: boxed,
            },
            ClientError::NoLivingConnections { message, .. } => ClientError::NoLivingConnections {
                message,
                meta: boxed,
            },
            ClientError::RequestAborted { message, .. } => ClientError::RequestAborted {
                message,
                meta: boxed,
            },
            other => other,
        }
    }
}

fn response_message(meta: &ApiResponse) -> String {
    let error = meta
        .body
        .as_ref()
        .and_then(|body| body.as_json())
        .and_then(|json| json.get("error"));

    let Some(error) = error else {
        return "Response Error".to_string();
    };
    let Some(error_type) = error.get("type").and_then(Value::as_str) else {
        return "Response Error".to_string();
    };

    match error.get("root_cause").and_then(Value::as_array) {
        Some(causes) => {
            let joined = causes
                .iter()
                .map(|entry| {
                    format!(
                        "[{}] Reason: {}",
                        entry.get("type").and_then(Value::as_str).unwrap_or("unknown"),
                        entry.get("reason").and_then(Value::as_str).unwrap_or("unknown"),
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            format!("{}: {}", error_type, joined)
        }
        None => error_type.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
