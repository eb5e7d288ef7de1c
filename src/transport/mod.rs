//! Message transports and the per-connection state machine.
//!
//! A [`StatefulTransport`] is the engine a concrete driver embeds: it
//! tracks the active [`ConnectionState`](state::ConnectionState), fans
//! incoming messages out to registered listeners, and queues outgoing
//! messages for the driver's writer. The reference TCP driver lives in
//! [`tcp`]; any full-duplex byte channel can drive the same engine.

pub mod state;
pub mod tcp;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{StratumError, StratumResult};
use crate::marshaller::ResponseVariant;
use crate::message::{Message, Request, Response};

use state::ConnectionState;

/// Listener notified for every inbound request, in registration order.
pub type RequestListener = Arc<dyn Fn(&Request) + Send + Sync>;

/// Listener notified for every inbound response, in registration order.
pub type ResponseListener = Arc<dyn Fn(&Response) + Send + Sync>;

/// How messages reach this transport from the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The remote end pushes messages as soon as they are ready (TCP).
    /// Polling is a no-op.
    Direct,

    /// The remote end must be asked for pending messages;
    /// [`StatefulTransport::poll_for_messages`] sends the distinguished
    /// poll request.
    Polled,
}

struct Core {
    state: Option<Arc<ConnectionState>>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    mode: DeliveryMode,
    bound: bool,
    closed: bool,
}

/// A message transport that varies the messages it accepts with the state
/// of its conversation.
///
/// Created detached; a driver binds it to a byte channel with
/// [`bind`](Self::bind), enters the post-connect state with
/// [`set_state`](Self::set_state), and then feeds parsed messages through
/// [`receive_messages`](Self::receive_messages). Once closed a transport
/// cannot be rebound.
pub struct StatefulTransport {
    me: Weak<StatefulTransport>,
    core: Mutex<Core>,
    request_listeners: Mutex<Vec<RequestListener>>,
    response_listeners: Mutex<Vec<ResponseListener>>,
    shutdown: CancellationToken,
}

impl StatefulTransport {
    /// Create a detached transport.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core: Mutex::new(Core {
                state: None,
                outbound: None,
                mode: DeliveryMode::Direct,
                bound: false,
                closed: false,
            }),
            request_listeners: Mutex::new(Vec::new()),
            response_listeners: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Attach the outbound queue of a connected byte channel.
    ///
    /// Called by the driver once its connection is established, before
    /// entering the post-connect state. A transport is single-shot:
    /// binding twice, or binding after close, is an error.
    pub fn bind(
        &self,
        outbound: mpsc::UnboundedSender<Message>,
        mode: DeliveryMode,
    ) -> StratumResult<()> {
        let mut core = self.core.lock();

        if core.closed {
            return Err(StratumError::Closed);
        }
        if core.bound {
            return Err(StratumError::AlreadyConnected);
        }

        core.bound = true;
        core.outbound = Some(outbound);
        core.mode = mode;
        Ok(())
    }

    /// Whether the transport is bound to a live connection.
    pub fn is_open(&self) -> bool {
        let core = self.core.lock();
        core.bound && !core.closed
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.lock().closed
    }

    /// The active connection state, or `None` while disconnected.
    pub fn current_state(&self) -> Option<Arc<ConnectionState>> {
        self.core.lock().state.clone()
    }

    /// Transition to `next`.
    ///
    /// The current state (if any) is ended, `next` becomes current, and
    /// its `start` hook runs, all under the transport lock, so the next
    /// line parsed off the wire is guaranteed to use `next`'s marshaller.
    /// Setting the already-active state is a no-op.
    pub fn set_state(&self, next: Arc<ConnectionState>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let mut core = self.core.lock();

        if let Some(current) = &core.state {
            if Arc::ptr_eq(current, &next) {
                debug!(state = next.name(), "state transition ignored; already active");
                return;
            }
        }

        debug!(
            from = core.state.as_ref().map(|s| s.name()),
            to = next.name(),
            "transitioning connection state"
        );

        if let Some(previous) = core.state.take() {
            previous.end(self);
        }

        core.state = Some(Arc::clone(&next));
        next.start(&me);
    }

    /// Queue a request for transmission, expecting no response.
    pub fn send_request(&self, request: Request) -> StratumResult<()> {
        self.enqueue(Message::Request(request))
    }

    /// Queue a request for transmission and register the response shape
    /// expected back in the current state's marshaller.
    ///
    /// The request must carry an identifier for its response to be
    /// correlated.
    pub fn send_request_expecting(
        &self,
        request: Request,
        expected: ResponseVariant,
    ) -> StratumResult<()> {
        let (state, sender) = {
            let core = self.core.lock();
            let sender = open_sender(&core)?;
            let state = core.state.clone().ok_or(StratumError::NotConnected)?;
            (state, sender)
        };

        let id = request.id().ok_or(StratumError::MissingRequestId)?;
        state.marshaller().register_pending_request(id, expected)?;

        sender
            .send(Message::Request(request))
            .map_err(|_| StratumError::NotConnected)
    }

    /// Queue a response for transmission.
    pub fn send_response(&self, response: Response) -> StratumResult<()> {
        self.enqueue(Message::Response(response))
    }

    /// Ask the remote end for pending messages.
    ///
    /// A no-op on direct transports; on polled transports this queues the
    /// distinguished poll request (`{}` on the wire).
    pub fn poll_for_messages(&self) -> StratumResult<()> {
        let (mode, sender) = {
            let core = self.core.lock();
            (core.mode, open_sender(&core)?)
        };

        match mode {
            DeliveryMode::Direct => Ok(()),
            DeliveryMode::Polled => sender
                .send(Message::Request(Request::poll()))
                .map_err(|_| StratumError::NotConnected),
        }
    }

    /// Close the transport. Idempotent.
    ///
    /// Releases the outbound queue, detaches the current state, and
    /// signals the driver's workers to exit at their next suspension
    /// point.
    pub fn close(&self) {
        let state = {
            let mut core = self.core.lock();
            if core.closed {
                return;
            }
            core.closed = true;
            core.outbound = None;
            core.state.take()
        };

        if let Some(state) = state {
            state.end(self);
        }

        self.shutdown.cancel();
        debug!("transport closed");
    }

    /// Token cancelled when the transport closes. Drivers select on this
    /// to end their reader and writer workers.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a listener for inbound requests. Listeners are notified in
    /// registration order; re-registering the same listener is absorbed.
    pub fn register_request_listener(&self, listener: RequestListener) {
        let mut listeners = self.request_listeners.lock();
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a previously registered request listener.
    pub fn unregister_request_listener(&self, listener: &RequestListener) {
        self.request_listeners
            .lock()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    /// Register a listener for inbound responses. Listeners are notified
    /// in registration order; re-registering the same listener is
    /// absorbed.
    pub fn register_response_listener(&self, listener: ResponseListener) {
        let mut listeners = self.response_listeners.lock();
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a previously registered response listener.
    pub fn unregister_response_listener(&self, listener: &ResponseListener) {
        self.response_listeners
            .lock()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    /// Dispatch messages parsed from a single input line to the
    /// registered listeners, in wire order.
    ///
    /// Listener sets are snapshotted per message, so a listener may
    /// mutate registrations or transition the connection state without
    /// deadlocking the dispatch.
    pub fn receive_messages(&self, messages: Vec<Message>) {
        for message in messages {
            match message {
                Message::Request(request) => {
                    let listeners: Vec<_> = self.request_listeners.lock().clone();
                    for listener in listeners {
                        listener(&request);
                    }
                }
                Message::Response(response) => {
                    let listeners: Vec<_> = self.response_listeners.lock().clone();
                    for listener in listeners {
                        listener(&response);
                    }
                }
            }
        }
    }

    fn enqueue(&self, message: Message) -> StratumResult<()> {
        let sender = {
            let core = self.core.lock();
            open_sender(&core)?
        };

        sender.send(message).map_err(|_| StratumError::NotConnected)
    }
}

fn open_sender(core: &Core) -> StratumResult<mpsc::UnboundedSender<Message>> {
    if core.closed {
        return Err(StratumError::Closed);
    }

    core.outbound.clone().ok_or(StratumError::NotConnected)
}
