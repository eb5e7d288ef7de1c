//! Transport-agnostic engine for the Stratum protocol.
//!
//! Stratum is a lightweight line-oriented JSON RPC dialect used by (but
//! not tied to) cryptocurrency mining pools and wallet servers: each side
//! may send requests at any time, responses are correlated to requests by
//! identifier, and results may be either a single value or an array with
//! an optional subject-tuple context header.
//!
//! This crate is the protocol core, not a dialect:
//!
//! - [`message`]: typed [`Request`]/[`Response`]/[`ResultData`] entities
//!   with JSON conversion and invariant enforcement;
//! - [`marshaller`]: turns wire lines into typed messages (and back)
//!   against a per-state vocabulary, and tracks outstanding requests in a
//!   correlation table with timed expiry;
//! - [`transport`]: the stateful transport facade and the
//!   [`ConnectionState`] machine that lets higher layers negotiate
//!   multi-phase conversations (subscribe, then authorize, then work)
//!   without the core knowing any specific method;
//! - [`transport::tcp`]: a reference TCP driver (reader/writer workers,
//!   client, server with idle eviction) any byte channel can replicate.
//!
//! Method names, request shapes, and response shapes are all supplied by
//! the embedder through registration, so mining, Electrum, or any other
//! Stratum dialect layers on top without core changes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stratum_core::{
//!     ConnectionState, Request, ResponseKind, ResponseVariant, TcpClient,
//!     generic_request_parser, next_request_id,
//! };
//!
//! # async fn run() -> stratum_core::StratumResult<()> {
//! const SUBSCRIBE: ResponseKind = ResponseKind("mining.subscribe");
//!
//! // The post-connect vocabulary: which methods and response shapes are
//! // legal, and who handles them.
//! let subscribing = ConnectionState::builder("subscribing")
//!     .request_handler(
//!         "mining.notify",
//!         generic_request_parser(),
//!         Arc::new(|_transport, request| {
//!             println!("new work: {:?}", request.params());
//!         }),
//!     )?
//!     .response_handler(
//!         SUBSCRIBE,
//!         Arc::new(|_transport, response| {
//!             println!("subscribed: {:?}", response.result());
//!         }),
//!     )?
//!     .build();
//!
//! let client = TcpClient::new();
//! client.connect("pool.example.com:3333", subscribing).await?;
//!
//! let request = Request::new(Some(next_request_id()), "mining.subscribe", vec![])?;
//! client
//!     .transport()
//!     .send_request_expecting(request, ResponseVariant::generic(SUBSCRIBE))?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod marshaller;
pub mod message;
pub mod transport;

pub use error::{StratumError, StratumResult};
pub use marshaller::{
    DEFAULT_IGNORED_REQUEST_TIMEOUT, ExpiryCallback, Marshaller, RequestParser, ResponseKind,
    ResponseParser, ResponseVariant, generic_request_parser,
};
pub use message::{
    ArrayResult, Message, Request, Response, ResultData, SubjectTuple, next_request_id,
};
pub use transport::state::{
    ConnectionState, ConnectionStateBuilder, RequestHandler, ResponseHandler,
};
pub use transport::tcp::{
    ConnectionId, ConnectionRegistry, ServerConfig, StateFactory, TcpClient, TcpServer, attach,
};
pub use transport::{DeliveryMode, RequestListener, ResponseListener, StatefulTransport};
