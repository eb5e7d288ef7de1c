//! Per-connection conversational states.
//!
//! A connection state is a named vocabulary: it decides which request
//! methods and which response shapes are legal right now, and who handles
//! each. Each state owns a fresh [`Marshaller`], so transitioning rewires
//! what the transport will accept before the next line is parsed.
//!
//! States compose through an optional *parent*: a derived state consults
//! the parent for messages it does not handle itself, so a family of
//! states can share a base vocabulary (the `process_*` methods return
//! `bool` for exactly this chain-of-responsibility use). Building a state
//! with a parent also merges the parent's method vocabulary into the
//! child's marshaller, keeping inherited methods parseable.
//!
//! Handlers receive the transport alongside the message, so they can reply
//! or transition (`transport.set_state(next)`) without the state itself
//! holding a transport reference; a state is reusable across transports.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{StratumError, StratumResult};
use crate::marshaller::{Marshaller, RequestParser, ResponseKind};
use crate::message::{Request, Response};

use super::{RequestListener, ResponseListener, StatefulTransport};

/// Handler invoked for an inbound request dispatched to this state.
pub type RequestHandler = Arc<dyn Fn(&Arc<StatefulTransport>, &Request) + Send + Sync>;

/// Handler invoked for an inbound response dispatched to this state.
pub type ResponseHandler = Arc<dyn Fn(&Arc<StatefulTransport>, &Response) + Send + Sync>;

/// The forwarding listeners a started state has registered on a
/// transport, kept so `end` can unregister the same instances.
struct ActiveListeners {
    request: RequestListener,
    response: ResponseListener,
}

/// A named conversational phase and its dispatch tables.
///
/// Built with [`ConnectionState::builder`]; handler registration happens
/// at build time and the tables are immutable afterwards.
pub struct ConnectionState {
    name: &'static str,
    marshaller: Arc<Marshaller>,
    request_handlers: HashMap<String, RequestHandler>,
    response_handlers: HashMap<ResponseKind, ResponseHandler>,
    parent: Option<Arc<ConnectionState>>,
    active: Mutex<Option<ActiveListeners>>,
}

impl ConnectionState {
    /// Start building a state.
    pub fn builder(name: &'static str) -> ConnectionStateBuilder {
        ConnectionStateBuilder {
            name,
            marshaller: Marshaller::new(),
            request_handlers: HashMap::new(),
            response_handlers: HashMap::new(),
            parent: None,
        }
    }

    /// The state's name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The marshaller readers and writers use while this state is active.
    pub fn marshaller(&self) -> &Arc<Marshaller> {
        &self.marshaller
    }

    /// Subscribe this state's forwarding listeners to the transport.
    ///
    /// Invoked by [`StatefulTransport::set_state`] when the state becomes
    /// current.
    pub fn start(self: &Arc<Self>, transport: &Arc<StatefulTransport>) {
        let mut active = self.active.lock();
        if active.is_some() {
            debug!(state = self.name, "state already started; ignoring");
            return;
        }

        let request: RequestListener = {
            let state = Arc::clone(self);
            let transport: Weak<StatefulTransport> = Arc::downgrade(transport);
            Arc::new(move |request| {
                if let Some(transport) = transport.upgrade() {
                    state.process_request(&transport, request);
                }
            })
        };

        let response: ResponseListener = {
            let state = Arc::clone(self);
            let transport: Weak<StatefulTransport> = Arc::downgrade(transport);
            Arc::new(move |response| {
                if let Some(transport) = transport.upgrade() {
                    state.process_response(&transport, response);
                }
            })
        };

        transport.register_request_listener(Arc::clone(&request));
        transport.register_response_listener(Arc::clone(&response));
        *active = Some(ActiveListeners { request, response });
        debug!(state = self.name, "state started");
    }

    /// Unsubscribe this state's listeners ahead of a transition.
    pub fn end(&self, transport: &StatefulTransport) {
        if let Some(listeners) = self.active.lock().take() {
            transport.unregister_request_listener(&listeners.request);
            transport.unregister_response_listener(&listeners.response);
            debug!(state = self.name, "state ended");
        }
    }

    /// Dispatch an inbound request to the handler registered for its
    /// method, consulting the parent chain on a miss.
    ///
    /// Returns whether any state in the chain handled the message;
    /// unhandled requests are logged and dropped.
    pub fn process_request(&self, transport: &Arc<StatefulTransport>, request: &Request) -> bool {
        let handled = self.dispatch_request(transport, request);

        if !handled {
            error!(
                method = request.method().unwrap_or("<poll>"),
                state = self.name,
                "request ignored; no handler registered"
            );
        }

        handled
    }

    /// Dispatch an inbound response by its resolved kind, consulting the
    /// parent chain on a miss.
    pub fn process_response(&self, transport: &Arc<StatefulTransport>, response: &Response) -> bool {
        let handled = self.dispatch_response(transport, response);

        if !handled {
            error!(
                id = response.id(),
                kind = response.kind().map(|k| k.0),
                state = self.name,
                "response ignored; no handler registered"
            );
        }

        handled
    }

    fn dispatch_request(&self, transport: &Arc<StatefulTransport>, request: &Request) -> bool {
        let handler = request
            .method()
            .and_then(|method| self.request_handlers.get(method));

        match handler {
            Some(handler) => {
                handler(transport, request);
                true
            }
            None => self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.dispatch_request(transport, request)),
        }
    }

    fn dispatch_response(&self, transport: &Arc<StatefulTransport>, response: &Response) -> bool {
        let handler = response
            .kind()
            .and_then(|kind| self.response_handlers.get(&kind));

        match handler {
            Some(handler) => {
                handler(transport, response);
                true
            }
            None => self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.dispatch_response(transport, response)),
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("name", &self.name)
            .field("methods", &self.request_handlers.keys().collect::<Vec<_>>())
            .field(
                "response_kinds",
                &self.response_handlers.keys().collect::<Vec<_>>(),
            )
            .field("parent", &self.parent.as_ref().map(|p| p.name))
            .finish_non_exhaustive()
    }
}

/// Builder populating a [`ConnectionState`]'s dispatch tables.
pub struct ConnectionStateBuilder {
    name: &'static str,
    marshaller: Marshaller,
    request_handlers: HashMap<String, RequestHandler>,
    response_handlers: HashMap<ResponseKind, ResponseHandler>,
    parent: Option<Arc<ConnectionState>>,
}

impl std::fmt::Debug for ConnectionStateBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateBuilder")
            .field("name", &self.name)
            .field("methods", &self.request_handlers.keys().collect::<Vec<_>>())
            .field(
                "response_kinds",
                &self.response_handlers.keys().collect::<Vec<_>>(),
            )
            .field("parent", &self.parent.as_ref().map(|p| p.name))
            .finish_non_exhaustive()
    }
}

impl ConnectionStateBuilder {
    /// Use a customised marshaller (e.g. a different ignored-request
    /// timeout) instead of the default.
    pub fn marshaller(mut self, marshaller: Marshaller) -> Self {
        self.marshaller = marshaller;
        self
    }

    /// Consult `parent` for messages this state does not handle itself.
    pub fn parent(mut self, parent: Arc<ConnectionState>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Accept inbound requests naming `method`: teach the state's
    /// marshaller to parse them with `parser`, and dispatch the cooked
    /// request to `handler`.
    ///
    /// Registering a method twice is an error; use
    /// [`replace_request_handler`](Self::replace_request_handler) to
    /// override an earlier registration deliberately.
    pub fn request_handler(
        mut self,
        method: impl Into<String>,
        parser: RequestParser,
        handler: RequestHandler,
    ) -> StratumResult<Self> {
        let method = method.into();

        if self.request_handlers.contains_key(&method) {
            return Err(StratumError::DuplicateHandler(format!(
                "request method \"{method}\""
            )));
        }

        self.marshaller.register_method(&method, parser);
        self.request_handlers.insert(method, handler);
        Ok(self)
    }

    /// Like [`request_handler`](Self::request_handler), but replaces any
    /// earlier registration for the method.
    pub fn replace_request_handler(
        mut self,
        method: impl Into<String>,
        parser: RequestParser,
        handler: RequestHandler,
    ) -> Self {
        let method = method.into();
        self.marshaller.register_method(&method, parser);
        self.request_handlers.insert(method, handler);
        self
    }

    /// Dispatch inbound responses resolved to `kind` to `handler`.
    ///
    /// Response shapes are keyed by the pending-request table, so this has
    /// no marshaller-side effect. Registering a kind twice is an error.
    pub fn response_handler(
        mut self,
        kind: ResponseKind,
        handler: ResponseHandler,
    ) -> StratumResult<Self> {
        if self.response_handlers.contains_key(&kind) {
            return Err(StratumError::DuplicateHandler(format!(
                "response kind \"{kind}\""
            )));
        }

        self.response_handlers.insert(kind, handler);
        Ok(self)
    }

    /// Finish building.
    ///
    /// When a parent is set, its method vocabulary is merged into this
    /// state's marshaller (without overriding the child's own
    /// registrations) so inherited methods remain parseable while the
    /// child is active.
    pub fn build(self) -> Arc<ConnectionState> {
        if let Some(parent) = &self.parent {
            for (method, parser) in parent.marshaller.method_entries() {
                if !self.marshaller.accepts_method(&method) {
                    self.marshaller.register_method(method, parser);
                }
            }
        }

        Arc::new(ConnectionState {
            name: self.name,
            marshaller: Arc::new(self.marshaller),
            request_handlers: self.request_handlers,
            response_handlers: self.response_handlers,
            parent: self.parent,
            active: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::marshaller::{ResponseVariant, generic_request_parser};
    use crate::message::{Message, ResultData};
    use crate::transport::DeliveryMode;
    use tokio::sync::mpsc;

    fn noop_request_handler() -> RequestHandler {
        Arc::new(|_, _| {})
    }

    fn recording_request_handler(seen: &Arc<Mutex<Vec<String>>>, tag: &str) -> RequestHandler {
        let seen = Arc::clone(seen);
        let tag = tag.to_string();
        Arc::new(move |_, req| {
            seen.lock()
                .push(format!("{tag}:{}", req.method().unwrap_or_default()))
        })
    }

    fn bound_transport() -> (
        Arc<StatefulTransport>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let transport = StatefulTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.bind(tx, DeliveryMode::Direct).unwrap();
        (transport, rx)
    }

    fn inbound_request(method: &str) -> Request {
        Request::new(None, method, vec![]).unwrap()
    }

    #[test]
    fn duplicate_request_registration_is_rejected() {
        let err = ConnectionState::builder("s")
            .request_handler("foo", generic_request_parser(), noop_request_handler())
            .unwrap()
            .request_handler("foo", generic_request_parser(), noop_request_handler())
            .unwrap_err();

        assert!(matches!(err, StratumError::DuplicateHandler(_)));
    }

    #[test]
    fn replace_overrides_an_earlier_registration() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (transport, _rx) = bound_transport();

        let state = ConnectionState::builder("s")
            .request_handler("foo", generic_request_parser(), noop_request_handler())
            .unwrap()
            .replace_request_handler(
                "foo",
                generic_request_parser(),
                recording_request_handler(&seen, "replacement"),
            )
            .build();

        assert!(state.process_request(&transport, &inbound_request("foo")));
        assert_eq!(&*seen.lock(), &["replacement:foo"]);
    }

    #[test]
    fn duplicate_response_registration_is_rejected() {
        let kind = ResponseKind("sub");
        let err = ConnectionState::builder("s")
            .response_handler(kind, Arc::new(|_, _| {}))
            .unwrap()
            .response_handler(kind, Arc::new(|_, _| {}))
            .unwrap_err();

        assert!(matches!(err, StratumError::DuplicateHandler(_)));
    }

    #[test]
    fn unhandled_request_reports_false() {
        let (transport, _rx) = bound_transport();
        let state = ConnectionState::builder("empty").build();

        assert!(!state.process_request(&transport, &inbound_request("anything")));
    }

    #[test]
    fn parent_handles_what_the_child_does_not() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (transport, _rx) = bound_transport();

        let base = ConnectionState::builder("base")
            .request_handler(
                "common.ping",
                generic_request_parser(),
                recording_request_handler(&seen, "base"),
            )
            .unwrap()
            .build();

        let child = ConnectionState::builder("child")
            .parent(Arc::clone(&base))
            .request_handler(
                "child.only",
                generic_request_parser(),
                recording_request_handler(&seen, "child"),
            )
            .unwrap()
            .build();

        assert!(child.process_request(&transport, &inbound_request("child.only")));
        assert!(child.process_request(&transport, &inbound_request("common.ping")));
        assert!(!child.process_request(&transport, &inbound_request("nobody.home")));
        assert_eq!(&*seen.lock(), &["child:child.only", "base:common.ping"]);
    }

    #[test]
    fn child_marshaller_inherits_parent_vocabulary() {
        let base = ConnectionState::builder("base")
            .request_handler("common.ping", generic_request_parser(), noop_request_handler())
            .unwrap()
            .build();

        let child = ConnectionState::builder("child")
            .parent(base)
            .request_handler("child.only", generic_request_parser(), noop_request_handler())
            .unwrap()
            .build();

        assert!(child.marshaller().accepts_method("common.ping"));
        assert!(child.marshaller().accepts_method("child.only"));
    }

    #[test]
    fn responses_dispatch_by_resolved_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (transport, _rx) = bound_transport();
        let kind = ResponseKind("mining.subscribe");

        let state = ConnectionState::builder("s")
            .response_handler(kind, {
                let seen = Arc::clone(&seen);
                Arc::new(move |_, res: &Response| seen.lock().push(res.id().to_string()))
            })
            .unwrap()
            .build();

        let tagged = Response::success("4", ResultData::Value(json!(true))).with_kind(kind);
        assert!(state.process_response(&transport, &tagged));

        // A response with no resolved kind has nothing to dispatch on.
        let untagged = Response::success("5", ResultData::Value(json!(true)));
        assert!(!state.process_response(&transport, &untagged));

        assert_eq!(&*seen.lock(), &["4"]);
    }

    #[test]
    fn started_state_receives_transport_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (transport, _rx) = bound_transport();

        let state = ConnectionState::builder("s")
            .request_handler(
                "foo",
                generic_request_parser(),
                recording_request_handler(&seen, "s"),
            )
            .unwrap()
            .build();

        transport.set_state(Arc::clone(&state));
        transport.receive_messages(vec![Message::Request(inbound_request("foo"))]);
        assert_eq!(&*seen.lock(), &["s:foo"]);
    }

    #[test]
    fn ended_state_receives_nothing_further() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (transport, _rx) = bound_transport();

        let first = ConnectionState::builder("first")
            .request_handler(
                "foo",
                generic_request_parser(),
                recording_request_handler(&seen, "first"),
            )
            .unwrap()
            .build();
        let second = ConnectionState::builder("second")
            .request_handler(
                "foo",
                generic_request_parser(),
                recording_request_handler(&seen, "second"),
            )
            .unwrap()
            .build();

        transport.set_state(first);
        transport.set_state(second);

        transport.receive_messages(vec![Message::Request(inbound_request("foo"))]);
        assert_eq!(&*seen.lock(), &["second:foo"]);
    }

    #[test]
    fn handler_may_transition_state_mid_dispatch() {
        let (transport, _rx) = bound_transport();

        let next = ConnectionState::builder("next").build();
        let first = ConnectionState::builder("first")
            .request_handler("advance", generic_request_parser(), {
                let next = Arc::clone(&next);
                Arc::new(move |transport: &Arc<StatefulTransport>, _req: &Request| {
                    transport.set_state(Arc::clone(&next));
                })
            })
            .unwrap()
            .build();

        transport.set_state(first);
        transport.receive_messages(vec![Message::Request(inbound_request("advance"))]);

        assert_eq!(transport.current_state().unwrap().name(), "next");
    }

    #[test]
    fn handler_may_send_mid_dispatch() {
        let (transport, mut rx) = bound_transport();

        let state = ConnectionState::builder("s")
            .request_handler(
                "ping",
                generic_request_parser(),
                Arc::new(|transport: &Arc<StatefulTransport>, req: &Request| {
                    let id = req.id().unwrap_or("0").to_string();
                    transport
                        .send_response(Response::success(id, ResultData::Value(json!("pong"))))
                        .unwrap();
                }),
            )
            .unwrap()
            .build();

        transport.set_state(state);

        let ping = Request::new(Some("11".into()), "ping", vec![]).unwrap();
        transport.receive_messages(vec![Message::Request(ping)]);

        let Message::Response(res) = rx.try_recv().unwrap() else {
            panic!("expected queued response");
        };
        assert_eq!(res.id(), "11");
    }

    #[test]
    fn state_isolation_between_phases() {
        // A method registered only in state B is rejected while A parses.
        let state_a = ConnectionState::builder("a").build();
        let state_b = ConnectionState::builder("b")
            .request_handler("b.only", generic_request_parser(), noop_request_handler())
            .unwrap()
            .build();

        let line = r#"{"id":"1","method":"b.only","params":[]}"#;
        assert!(state_a.marshaller().marshal_messages(line).is_err());
        assert!(state_b.marshaller().marshal_messages(line).is_ok());
    }

    #[test]
    fn send_request_expecting_uses_active_state() {
        let (transport, _rx) = bound_transport();
        let kind = ResponseKind("sub");

        let state = ConnectionState::builder("s")
            .response_handler(kind, Arc::new(|_, _| {}))
            .unwrap()
            .build();
        transport.set_state(Arc::clone(&state));

        let req = Request::new(Some("21".into()), "subscribe", vec![]).unwrap();
        transport
            .send_request_expecting(req, ResponseVariant::generic(kind))
            .unwrap();

        // The response now routes through the state's marshaller and
        // dispatch table.
        let messages = state
            .marshaller()
            .marshal_messages(r#"{"id":"21","result":true,"error":null}"#)
            .unwrap();
        let Message::Response(res) = &messages[0] else {
            panic!("expected response");
        };
        assert_eq!(res.kind(), Some(kind));
    }
}
