//! Error types for the Stratum protocol engine.

use thiserror::Error;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Incoming data violated the Stratum wire grammar, or was not a
    /// message the active marshaller accepts.
    #[error("unknown or malformed Stratum message{}{}: {payload}", fmt_method(.method), fmt_detail(.detail))]
    MalformedMessage {
        /// Method name, when the failure occurred interpreting a request
        method: Option<String>,
        /// Human description of what was wrong
        detail: Option<String>,
        /// The offending wire payload
        payload: String,
    },

    /// A request with this identifier is already awaiting a response
    #[error("a request with id #{0} is already pending")]
    DuplicatePendingRequest(String),

    /// A handler is already registered for this method or response kind
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(String),

    /// The request carries no identifier, so no response can be correlated
    #[error("request has no id; cannot expect a response")]
    MissingRequestId,

    /// A request was constructed with an empty method name
    #[error("method name cannot be empty")]
    EmptyMethodName,

    /// Operation requires an open connection
    #[error("the connection is not open")]
    NotConnected,

    /// The transport is already bound to a connection
    #[error("the connection is already open")]
    AlreadyConnected,

    /// The transport was closed and cannot be reused
    #[error("the transport has been closed")]
    Closed,
}

fn fmt_method(method: &Option<String>) -> String {
    match method {
        Some(name) => format!(" for method \"{name}\""),
        None => String::new(),
    }
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(text) => format!(" ({text})"),
        None => String::new(),
    }
}

impl StratumError {
    /// Malformed-message error with only the offending payload.
    pub fn malformed(payload: impl ToString) -> Self {
        StratumError::MalformedMessage {
            method: None,
            detail: None,
            payload: payload.to_string(),
        }
    }

    /// Malformed-message error with a description of the problem.
    pub fn malformed_detail(detail: impl Into<String>, payload: impl ToString) -> Self {
        StratumError::MalformedMessage {
            method: None,
            detail: Some(detail.into()),
            payload: payload.to_string(),
        }
    }

    /// Malformed-message error tied to a specific request method.
    pub fn malformed_method(method: impl Into<String>, payload: impl ToString) -> Self {
        StratumError::MalformedMessage {
            method: Some(method.into()),
            detail: None,
            payload: payload.to_string(),
        }
    }
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
