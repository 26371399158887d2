//! Channel lifecycle and token/command correlation.
//!
//! A channel is an open, service-negotiated connection to one peer. Every
//! outgoing command is assigned a token unique within the channel's lifetime;
//! the matching reply is routed back to the registered completion handler on
//! the dispatch thread. When the channel closes, every still-pending handler
//! resolves with a channel-closed error, exactly once.

pub mod manager;

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::peer::Peer;
use crate::transport::{FrameSink, Transport, TransportEvent};
use crate::wire::{Frame, Token, HELLO_EVENT, LOCATOR_SERVICE};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Completion handler for one outstanding command.
pub type ReplyHandler = Box<dyn FnOnce(Result<Vec<Value>, Error>) + Send>;

/// Listener for unsolicited service events: `(service, event, args)`.
pub type EventListener = Arc<dyn Fn(&str, &str, &[Value]) + Send + Sync>;

type OpenWaiter = Box<dyn FnOnce(Result<(), Error>) + Send>;
type CloseHook = Box<dyn FnOnce(Option<Error>) + Send>;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Transport connected, handshake not finished.
    Opening,
    /// A proxy hop was taken during the open phase.
    Redirecting,
    /// Handshake done; commands may be sent.
    Open,
    /// Teardown in progress.
    Closing,
    /// Fully closed; terminal.
    Closed,
}

struct ChannelInner {
    state: ChannelState,
    services: HashSet<String>,
    local_services: Vec<String>,
    next_token: Token,
    pending: HashMap<Token, ReplyHandler>,
    transport: Option<Box<dyn Transport>>,
    on_open: Option<OpenWaiter>,
    close_hook: Option<CloseHook>,
    event_listeners: Vec<EventListener>,
}

/// An open, bidirectional, framed connection to one remote peer.
///
/// Shared behind an `Arc`; the channel manager owns the reference count that
/// decides when a shared channel actually closes. All state transitions and
/// handler invocations happen on the dispatch thread.
pub struct Channel {
    peer: Peer,
    dispatcher: Arc<Dispatcher>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    /// Create a channel over an already-connected transport.
    ///
    /// The channel starts in [`ChannelState::Opening`]; call [`Channel::open`]
    /// to run the handshake.
    pub fn new(peer: Peer, dispatcher: Arc<Dispatcher>, transport: Box<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            dispatcher,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Opening,
                services: HashSet::new(),
                local_services: Vec::new(),
                next_token: 1,
                pending: HashMap::new(),
                transport: Some(transport),
                on_open: None,
                close_hook: None,
                event_listeners: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The peer this channel is connected to.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// Whether commands may currently be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The service names the remote side announced in its Hello.
    pub fn remote_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().services.iter().cloned().collect();
        names.sort();
        names
    }

    /// Number of commands still waiting for a reply.
    pub fn pending_commands(&self) -> usize {
        self.lock().pending.len()
    }

    /// Install a hook invoked exactly once when the channel reaches
    /// [`ChannelState::Closed`], with the causing error if any.
    pub fn set_close_hook(&self, hook: impl FnOnce(Option<Error>) + Send + 'static) {
        self.lock().close_hook = Some(Box::new(hook));
    }

    /// Register a listener for unsolicited service events.
    pub fn add_event_listener(&self, listener: impl Fn(&str, &str, &[Value]) + Send + Sync + 'static) {
        self.lock().event_listeners.push(Arc::new(listener));
    }

    /// Run the handshake: announce `local_services`, then wait for the
    /// remote Hello. `on_open` fires on the dispatch thread with `Ok` once
    /// the channel is open, or with [`Error::OpenChannel`] if the open phase
    /// fails.
    pub fn open<S: AsRef<str>>(
        self: &Arc<Self>,
        local_services: &[S],
        on_open: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) {
        let names: Vec<String> = local_services.iter().map(|s| s.as_ref().to_string()).collect();
        let channel = self.clone();
        let submitted = self.dispatcher.invoke_later(move || {
            channel.open_on_dispatch(names, Box::new(on_open));
        });
        if submitted.is_err() {
            log::warn!("open request dropped: dispatcher has shut down");
        }
    }

    fn open_on_dispatch(self: &Arc<Self>, local_services: Vec<String>, on_open: OpenWaiter) {
        let sink = self.make_sink();
        let hello;
        {
            let mut inner = self.lock();
            if inner.state != ChannelState::Opening {
                drop(inner);
                on_open(Err(Error::open_channel(self.peer.id(), Error::ChannelNotOpen)));
                return;
            }
            inner.local_services = local_services;
            inner.on_open = Some(on_open);
            hello = Frame::hello(&inner.local_services);
        }
        if let Err(e) = self.start_transport(sink, &hello) {
            self.close_internal(Some(e));
        }
    }

    fn start_transport(&self, sink: FrameSink, hello: &Frame) -> Result<(), Error> {
        let mut inner = self.lock();
        let transport = inner.transport.as_mut().ok_or(Error::ChannelClosed)?;
        transport.start(sink)?;
        transport.send(hello)
    }

    fn make_sink(self: &Arc<Self>) -> FrameSink {
        let weak = Arc::downgrade(self);
        let dispatcher = self.dispatcher.clone();
        Box::new(move |event| {
            let weak = weak.clone();
            let submitted = dispatcher.invoke_later(move || {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_transport_event(event);
                }
            });
            if submitted.is_err() {
                log::debug!("transport event dropped after dispatcher shutdown");
            }
        })
    }

    /// Redirect the open phase through another hop: the current transport is
    /// released and the handshake restarts on `transport`. Only meaningful
    /// while the channel is still opening.
    pub fn redirect(self: &Arc<Self>, transport: Box<dyn Transport>) {
        let channel = self.clone();
        let submitted = self.dispatcher.invoke_later(move || {
            channel.redirect_on_dispatch(transport);
        });
        if submitted.is_err() {
            log::warn!("redirect dropped: dispatcher has shut down");
        }
    }

    fn redirect_on_dispatch(self: &Arc<Self>, mut transport: Box<dyn Transport>) {
        let sink = self.make_sink();
        let hello;
        {
            let mut inner = self.lock();
            if !matches!(inner.state, ChannelState::Opening | ChannelState::Redirecting) {
                drop(inner);
                log::warn!("redirect ignored: channel to '{}' is not opening", self.peer.id());
                transport.close();
                return;
            }
            if let Some(mut old) = inner.transport.take() {
                old.close();
            }
            inner.state = ChannelState::Redirecting;
            inner.transport = Some(transport);
            hello = Frame::hello(&inner.local_services);
        }
        log::debug!("channel to '{}' redirecting through proxy hop", self.peer.id());
        if let Err(e) = self.start_transport(sink, &hello) {
            self.close_internal(Some(e));
        }
    }

    /// Send a command and register its completion handler.
    ///
    /// Returns the minted token immediately; the handler fires later on the
    /// dispatch thread, exactly once: with the decoded reply arguments, the
    /// remote error from the reply's error slot, or [`Error::ChannelClosed`]
    /// if the channel goes away first.
    pub fn send(
        self: &Arc<Self>,
        service: &str,
        command: &str,
        args: Vec<Value>,
        on_reply: impl FnOnce(Result<Vec<Value>, Error>) + Send + 'static,
    ) -> Result<Token, Error> {
        let mut inner = self.lock();
        if inner.state != ChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }
        if !inner.services.contains(service) {
            return Err(Error::ServiceNotAvailable(service.to_string()));
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.pending.insert(token, Box::new(on_reply));

        let frame = Frame::Command {
            token,
            service: service.to_string(),
            command: command.to_string(),
            args,
        };
        let sent = match inner.transport.as_mut() {
            Some(transport) => transport.send(&frame),
            None => Err(Error::ChannelClosed),
        };
        if let Err(e) = sent {
            // The handler just registered must not observe this failure
            // twice: drop it here, then tear the channel down, which fails
            // the remaining pending commands.
            inner.pending.remove(&token);
            drop(inner);
            let channel = self.clone();
            let cause = e.clone();
            let _ = self.dispatcher.invoke_later(move || {
                channel.close_internal(Some(cause));
            });
            return Err(e);
        }
        Ok(token)
    }

    /// Close the channel. Pending commands fail with
    /// [`Error::ChannelClosed`]; the close hook and listeners observe the
    /// close on the dispatch thread.
    pub fn close(self: &Arc<Self>) {
        let channel = self.clone();
        let submitted = self.dispatcher.invoke_later(move || {
            channel.close_internal(None);
        });
        if submitted.is_err() {
            log::debug!("close dropped: dispatcher has shut down");
        }
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Frame(Frame::Reply { token, error, args }) => {
                self.handle_reply(token, error, args);
            }
            TransportEvent::Frame(Frame::Event { service, event, args }) => {
                self.handle_event(&service, &event, args);
            }
            TransportEvent::Frame(Frame::Command { token, service, command, .. }) => {
                // This core issues commands; it does not serve them. Answer
                // so the remote's own token does not dangle.
                log::debug!("unsupported inbound command {service}.{command}");
                let reply = Frame::Reply {
                    token,
                    error: Some(json!({ "format": "command not supported" })),
                    args: vec![],
                };
                let mut inner = self.lock();
                if let Some(transport) = inner.transport.as_mut() {
                    let _ = transport.send(&reply);
                }
            }
            TransportEvent::Closed(error) => self.close_internal(error),
        }
    }

    fn handle_reply(&self, token: Token, error: Option<Value>, args: Vec<Value>) {
        let handler = self.lock().pending.remove(&token);
        match handler {
            Some(handler) => {
                let result = match error {
                    Some(e) => Err(Error::Remote(e)),
                    None => Ok(args),
                };
                handler(result);
            }
            // Stale or duplicate reply: the token was already consumed or
            // never existed. Discard, but leave a trace.
            None => log::debug!(
                "discarding stale reply with token {token} on channel to '{}'",
                self.peer.id()
            ),
        }
    }

    fn handle_event(self: &Arc<Self>, service: &str, event: &str, args: Vec<Value>) {
        if service == LOCATOR_SERVICE && event == HELLO_EVENT {
            let names = args
                .first()
                .and_then(Value::as_array)
                .map(|names| names.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default();
            self.handle_hello(names);
            return;
        }
        let listeners: Vec<EventListener> = self.lock().event_listeners.clone();
        for listener in listeners {
            listener(service, event, &args);
        }
    }

    fn handle_hello(&self, names: Vec<String>) {
        let on_open;
        {
            let mut inner = self.lock();
            match inner.state {
                ChannelState::Opening | ChannelState::Redirecting => {
                    inner.services = names.into_iter().collect();
                    inner.state = ChannelState::Open;
                    on_open = inner.on_open.take();
                }
                ChannelState::Open => {
                    // A second Hello updates the service set in place.
                    log::warn!("unexpected Hello on open channel to '{}'", self.peer.id());
                    inner.services = names.into_iter().collect();
                    return;
                }
                ChannelState::Closing | ChannelState::Closed => return,
            }
        }
        log::info!("channel to '{}' open", self.peer.id());
        if let Some(on_open) = on_open {
            on_open(Ok(()));
        }
    }

    fn close_internal(self: &Arc<Self>, error: Option<Error>) {
        let transport;
        let pending;
        let on_open;
        let close_hook;
        {
            let mut inner = self.lock();
            if matches!(inner.state, ChannelState::Closing | ChannelState::Closed) {
                return;
            }
            inner.state = ChannelState::Closing;
            transport = inner.transport.take();
            pending = std::mem::take(&mut inner.pending);
            on_open = inner.on_open.take();
            close_hook = inner.close_hook.take();
            inner.state = ChannelState::Closed;
        }
        if let Some(mut transport) = transport {
            transport.close();
        }
        if let Some(on_open) = on_open {
            // Closed before the handshake finished: the open itself failed.
            let cause = error.clone().unwrap_or(Error::ChannelClosed);
            on_open(Err(Error::open_channel(self.peer.id(), cause)));
        }
        for (_, handler) in pending {
            handler(Err(Error::ChannelClosed));
        }
        match &error {
            Some(e) => log::warn!("channel to '{}' closed: {e}", self.peer.id()),
            None => log::info!("channel to '{}' closed", self.peer.id()),
        }
        if let Some(hook) = close_hook {
            hook(error);
        }
    }
}
