//! Stratum message types and JSON conversion.
//!
//! Stratum is a line-oriented JSON dialect: either side may send requests
//! at any time, and responses are correlated to requests by identifier.
//! This module defines the typed message model; the wire-level
//! classification and dispatch live in [`crate::marshaller`].
//!
//! ## Why not use a JSON-RPC library?
//!
//! Stratum predates JSON-RPC 2.0 and uses non-standard conventions:
//!
//! - fire-and-forget requests carry `id: null` instead of omitting the field
//! - responses always emit both `result` and `error` slots
//! - array results may lead with a subject tuple (see [`SubjectTuple`])
//! - no version field
//!
//! Standard JSON-RPC libraries expect conforming peers, so forcing
//! Stratum through one means an adapter layer on both sides. These types
//! fit the dialect's quirks directly.

mod request;
mod response;
mod result;

pub use request::{next_request_id, Request};
pub use response::Response;
pub use result::{ArrayResult, ResultData, SubjectTuple};

use serde_json::Value;

/// A typed Stratum message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A method invocation (or the distinguished poll request)
    Request(Request),

    /// A reply correlated to an earlier request by identifier
    Response(Response),
}

impl Message {
    /// The message identifier, if one is present.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.id(),
            Message::Response(res) => Some(res.id()),
        }
    }

    /// Render the message as a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Message::Request(req) => req.to_json(),
            Message::Response(res) => res.to_json(),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}
