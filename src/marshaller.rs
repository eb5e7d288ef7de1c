//! Conversion between wire lines and typed messages.
//!
//! The marshaller owns two tables that together define the vocabulary of a
//! conversation phase:
//!
//! - the *method table*, mapping request method names to parser functions;
//!   an inbound request naming an unregistered method is malformed.
//! - the *correlation table*, mapping identifiers of outstanding outbound
//!   requests to the [`ResponseVariant`] expected back; an inbound
//!   response with no pending entry is malformed (unsolicited).
//!
//! Correlation entries are short-lived: they are invalidated when the
//! matching response arrives, and expire after the *ignored-request*
//! window (ten minutes by default) with an observable callback.
//!
//! Each connection state owns a fresh marshaller, so the set of messages a
//! transport accepts changes with the conversation (see
//! [`crate::transport::state`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::error;

use crate::error::{StratumError, StratumResult};
use crate::message::{Message, Request, Response};

/// How long a pending request may wait for its response before it is
/// considered ignored and evicted from the correlation table.
pub const DEFAULT_IGNORED_REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Parser turning a raw JSON request object into a [`Request`].
///
/// Registered per method; use [`generic_request_parser`] when the plain
/// request grammar is enough, or supply a closure that additionally
/// validates the method's parameter shape so handlers only ever see cooked
/// messages.
pub type RequestParser = Arc<dyn Fn(&Value) -> StratumResult<Request> + Send + Sync>;

/// Parser turning a raw JSON response object into a [`Response`].
pub type ResponseParser = Arc<dyn Fn(&Value) -> StratumResult<Response> + Send + Sync>;

/// Callback invoked when a pending request expires without a reply.
pub type ExpiryCallback = Arc<dyn Fn(&str, ResponseKind) + Send + Sync>;

/// The parser for the plain request grammar, with no method-specific
/// parameter validation.
pub fn generic_request_parser() -> RequestParser {
    Arc::new(Request::from_json)
}

/// Opaque key identifying a concrete response shape.
///
/// Embedders define one per response variant they register; the engine
/// uses it to route matched responses to the right handler and to report
/// which expectation an expired request carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseKind(pub &'static str);

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The response shape expected back from an outbound request: a routing
/// [`ResponseKind`] paired with the parser that builds the typed response.
#[derive(Clone)]
pub struct ResponseVariant {
    kind: ResponseKind,
    parser: ResponseParser,
}

impl ResponseVariant {
    /// A variant with a custom parser.
    pub fn new(kind: ResponseKind, parser: ResponseParser) -> Self {
        Self { kind, parser }
    }

    /// A variant using the plain response grammar.
    pub fn generic(kind: ResponseKind) -> Self {
        Self {
            kind,
            parser: Arc::new(Response::from_json),
        }
    }

    /// The routing kind of this variant.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }
}

impl fmt::Debug for ResponseVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseVariant")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct PendingEntry {
    variant: ResponseVariant,
    registered_at: Instant,
}

/// Marshals Stratum messages into and out of their JSON wire form.
pub struct Marshaller {
    methods: Mutex<HashMap<String, RequestParser>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    ignored_request_timeout: Duration,
    on_request_expired: Mutex<ExpiryCallback>,
}

impl Marshaller {
    /// A marshaller with the default ignored-request timeout.
    pub fn new() -> Self {
        Self::with_ignored_request_timeout(DEFAULT_IGNORED_REQUEST_TIMEOUT)
    }

    /// A marshaller whose pending requests expire after `timeout`.
    pub fn with_ignored_request_timeout(timeout: Duration) -> Self {
        Self {
            methods: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            ignored_request_timeout: timeout,
            on_request_expired: Mutex::new(Arc::new(default_expiry_callback)),
        }
    }

    /// Replace the callback invoked when a pending request expires.
    ///
    /// The default logs the expiry at error level. The callback runs with
    /// no engine locks held, so it may safely re-enter the transport.
    pub fn set_on_request_expired(&self, callback: ExpiryCallback) {
        *self.on_request_expired.lock() = callback;
    }

    /// Register `parser` as the interpreter for inbound requests naming
    /// `method`. Re-registering a method replaces its parser.
    pub fn register_method(&self, method: impl Into<String>, parser: RequestParser) {
        self.methods.lock().insert(method.into(), parser);
    }

    /// Whether inbound requests naming `method` are accepted.
    pub fn accepts_method(&self, method: &str) -> bool {
        self.methods.lock().contains_key(method)
    }

    /// Snapshot of the method table, used to merge a parent state's
    /// vocabulary into a derived state's marshaller.
    pub(crate) fn method_entries(&self) -> Vec<(String, RequestParser)> {
        self.methods
            .lock()
            .iter()
            .map(|(name, parser)| (name.clone(), Arc::clone(parser)))
            .collect()
    }

    /// Register the request with identifier `id` as awaiting a response of
    /// the given variant.
    ///
    /// An identifier may be pending at most once concurrently; registering
    /// it again before the first registration resolves is an error.
    pub fn register_pending_request(
        &self,
        id: impl Into<String>,
        variant: ResponseVariant,
    ) -> StratumResult<()> {
        let id = id.into();
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut pending = self.pending.lock();

            let stale = pending.get(&id).map(|entry| self.is_expired(entry, now));
            match stale {
                Some(false) => return Err(StratumError::DuplicatePendingRequest(id)),
                Some(true) => {
                    // The previous registration was already ignored; evict
                    // it and let the new one through.
                    if let Some(entry) = pending.remove(&id) {
                        expired.push((id.clone(), entry.variant.kind()));
                    }
                }
                None => {}
            }

            pending.insert(
                id,
                PendingEntry {
                    variant,
                    registered_at: now,
                },
            );
        }

        self.notify_expired(expired);
        Ok(())
    }

    /// Number of requests currently awaiting responses.
    pub fn pending_request_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Evict pending requests older than the ignored-request timeout,
    /// invoking the expiry callback for each. Returns how many expired.
    ///
    /// Drivers call this periodically; lookups and registrations also
    /// evict lazily, so a sweep is a backstop rather than a requirement
    /// for correctness.
    pub fn expire_ignored_requests(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut pending = self.pending.lock();
            pending.retain(|id, entry| {
                if self.is_expired(entry, now) {
                    expired.push((id.clone(), entry.variant.kind()));
                    false
                } else {
                    true
                }
            });
        }

        let count = expired.len();
        self.notify_expired(expired);
        count
    }

    /// Marshal one wire line into typed messages.
    ///
    /// A line beginning with `[` is a batch: a JSON array whose elements
    /// are independent messages. Anything else is a single JSON object.
    pub fn marshal_messages(&self, line: &str) -> StratumResult<Vec<Message>> {
        let json: Value = serde_json::from_str(line)
            .map_err(|err| StratumError::malformed_detail(err.to_string(), line))?;

        if line.starts_with('[') {
            let batch = json
                .as_array()
                .ok_or_else(|| StratumError::malformed(line))?;

            batch.iter().map(|item| self.marshal_message(item)).collect()
        } else {
            Ok(vec![self.marshal_message(&json)?])
        }
    }

    /// Marshal a single JSON message object.
    ///
    /// Presence of the `result` key, even with a null value, is what
    /// classifies an object as a response: Stratum responses always emit
    /// `result`, and requests never do.
    pub fn marshal_message(&self, json: &Value) -> StratumResult<Message> {
        let object = json
            .as_object()
            .ok_or_else(|| StratumError::malformed_detail("message is not an object", json))?;

        if object.contains_key("result") {
            self.marshal_response(json)
        } else {
            self.marshal_request(json)
        }
    }

    /// Serialise a message to its single-line JSON wire form.
    ///
    /// No trailing newline; line framing is the driver's concern.
    pub fn unmarshal(&self, message: &Message) -> String {
        message.to_json().to_string()
    }

    fn marshal_request(&self, json: &Value) -> StratumResult<Message> {
        // The generic parse extracts (and validates) the method name; the
        // registered parser then builds the cooked request from the raw
        // object, applying any method-specific validation.
        let generic = Request::from_json(json)?;
        let method = generic.method().unwrap_or_default();

        let parser = self
            .methods
            .lock()
            .get(method)
            .map(Arc::clone)
            .ok_or_else(|| StratumError::malformed_method(method, json))?;

        Ok(Message::Request(parser(json)?))
    }

    fn marshal_response(&self, json: &Value) -> StratumResult<Message> {
        let generic = Response::from_json(json)?;
        let id = generic.id();

        let Some(variant) = self.lookup_pending(id) else {
            return Err(StratumError::malformed_detail(
                format!("unsolicited response for id #{id}"),
                json,
            ));
        };

        let response = (variant.parser)(json)?.with_kind(variant.kind());

        // Only a successfully parsed response resolves the entry; a
        // variant parser rejecting the object leaves the request pending.
        self.pending.lock().remove(id);

        Ok(Message::Response(response))
    }

    /// Find the pending variant for `id`, lazily evicting it if it has
    /// already outlived the ignored-request window.
    fn lookup_pending(&self, id: &str) -> Option<ResponseVariant> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let variant = {
            let mut pending = self.pending.lock();

            let found = pending
                .get(id)
                .map(|entry| (self.is_expired(entry, now), entry.variant.clone()));

            match found {
                Some((true, variant)) => {
                    pending.remove(id);
                    expired.push((id.to_string(), variant.kind()));
                    None
                }
                Some((false, variant)) => Some(variant),
                None => None,
            }
        };

        self.notify_expired(expired);
        variant
    }

    fn is_expired(&self, entry: &PendingEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.registered_at) >= self.ignored_request_timeout
    }

    /// Run the expiry callback outside all engine locks.
    fn notify_expired(&self, expired: Vec<(String, ResponseKind)>) {
        if expired.is_empty() {
            return;
        }

        let callback = Arc::clone(&self.on_request_expired.lock());
        for (id, kind) in expired {
            callback(&id, kind);
        }
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Marshaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marshaller")
            .field("methods", &self.methods.lock().keys().collect::<Vec<_>>())
            .field("pending", &self.pending.lock().keys().collect::<Vec<_>>())
            .field("ignored_request_timeout", &self.ignored_request_timeout)
            .finish_non_exhaustive()
    }
}

fn default_expiry_callback(id: &str, kind: ResponseKind) {
    error!(
        id,
        kind = %kind,
        "pending request expired without receiving a reply"
    );
}
