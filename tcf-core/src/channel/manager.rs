//! Channel manager.
//!
//! Owns the peer-to-channel map with an at-most-one-open-channel-per-peer
//! reuse policy: multiple logical clients share one open channel through a
//! reference count, and concurrent opens targeting the same peer coalesce
//! behind the first in-flight open instead of issuing a duplicate connect.
//! All map mutations run on the dispatch thread.

use super::Channel;
use crate::collector::InvocationDelegate;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::peer::Peer;
use crate::transport::{Transport, TransportFactory};
use crate::wire::LOCATOR_SERVICE;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use tokio::sync::broadcast;

/// Lifecycle event of a managed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An open was started for the peer.
    Opening {
        /// Peer identifier.
        peer: String,
    },
    /// The open phase took a proxy hop.
    Redirect {
        /// Peer identifier.
        peer: String,
    },
    /// The handshake finished; the channel is usable.
    Open {
        /// Peer identifier.
        peer: String,
    },
    /// The channel reached its terminal state.
    Close {
        /// Peer identifier.
        peer: String,
        /// Rendered cause, if the close was forced by an error.
        error: Option<String>,
    },
    /// A host-defined mark on the channel (congestion, heartbeat, ...).
    Mark {
        /// Peer identifier.
        peer: String,
        /// Host-defined mark label.
        mark: String,
    },
}

/// Completion callback of [`ChannelManager::open_channel`].
pub type OpenCallback = Box<dyn FnOnce(Result<Arc<Channel>, Error>) + Send>;

/// Identifies a registered lifecycle listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    listener: Listener,
    // Listeners normally run on the dispatch thread; one with its own
    // delegate gets marshaled there instead.
    delegate: Option<Arc<dyn InvocationDelegate>>,
}

enum Entry {
    // The transport connect is still running on its worker thread.
    Connecting { waiters: Vec<OpenCallback> },
    Opening { channel: Arc<Channel>, waiters: Vec<OpenCallback> },
    Open { channel: Arc<Channel>, refs: usize },
}

struct ManagerInner {
    entries: HashMap<String, Entry>,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
    disposed: bool,
}

/// Opens, shares and closes channels to remote peers.
///
/// Explicit lifecycle: create with [`ChannelManager::new`], tear down with
/// [`ChannelManager::dispose`]. Not a process-wide singleton; collaborators
/// receive the manager by reference.
pub struct ChannelManager {
    dispatcher: Arc<Dispatcher>,
    factory: Arc<dyn TransportFactory>,
    events_tx: broadcast::Sender<ChannelEvent>,
    inner: Mutex<ManagerInner>,
}

impl ChannelManager {
    /// Create a manager connecting through `factory`.
    pub fn new(dispatcher: Arc<Dispatcher>, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            dispatcher,
            factory,
            events_tx,
            inner: Mutex::new(ManagerInner {
                entries: HashMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
                disposed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The dispatch context this manager runs on.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Subscribe to lifecycle events as a broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Register a lifecycle listener. With no delegate the listener runs on
    /// the dispatch thread; a delegate marshals it elsewhere (UI thread).
    pub fn add_listener(
        &self,
        listener: impl Fn(&ChannelEvent) + Send + Sync + 'static,
        delegate: Option<Arc<dyn InvocationDelegate>>,
    ) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push(ListenerEntry { id, listener: Arc::new(listener), delegate });
        ListenerId(id)
    }

    /// Remove a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|entry| entry.id != id.0);
    }

    fn emit(&self, event: &ChannelEvent) {
        let _ = self.events_tx.send(event.clone());
        let listeners: Vec<(Listener, Option<Arc<dyn InvocationDelegate>>)> = self
            .lock()
            .listeners
            .iter()
            .map(|entry| (entry.listener.clone(), entry.delegate.clone()))
            .collect();
        for (listener, delegate) in listeners {
            match delegate {
                Some(delegate) => {
                    let event = event.clone();
                    delegate.invoke(Box::new(move || listener(&event)));
                }
                None => listener(event),
            }
        }
    }

    /// Open a channel to `peer`, reusing an existing open channel when one
    /// is available and queueing behind an in-flight open to the same peer.
    ///
    /// `callback` fires on the dispatch thread with the shared channel or
    /// with [`Error::OpenChannel`] if the open phase failed.
    pub fn open_channel(
        self: &Arc<Self>,
        peer: Peer,
        callback: impl FnOnce(Result<Arc<Channel>, Error>) + Send + 'static,
    ) {
        let manager = self.clone();
        let submitted = self.dispatcher.invoke_later(move || {
            manager.open_on_dispatch(peer, Box::new(callback));
        });
        if submitted.is_err() {
            log::warn!("open request dropped: dispatcher has shut down");
        }
    }

    fn open_on_dispatch(self: &Arc<Self>, peer: Peer, callback: OpenCallback) {
        {
            let mut inner = self.lock();
            if inner.disposed {
                drop(inner);
                callback(Err(Error::Disposed));
                return;
            }
            match inner.entries.get_mut(peer.id()) {
                Some(Entry::Open { channel, refs }) => {
                    *refs += 1;
                    let channel = channel.clone();
                    drop(inner);
                    callback(Ok(channel));
                    return;
                }
                Some(Entry::Connecting { waiters } | Entry::Opening { waiters, .. }) => {
                    log::debug!("coalescing open to '{}' behind in-flight open", peer.id());
                    waiters.push(callback);
                    return;
                }
                None => {}
            }
            inner
                .entries
                .insert(peer.id().to_string(), Entry::Connecting { waiters: vec![callback] });
        }

        self.emit(&ChannelEvent::Opening { peer: peer.id().to_string() });

        // A connect can block on the network for a long time; run it on a
        // worker thread and marshal the outcome back, so the dispatch
        // thread keeps serving the other channels meanwhile.
        let manager = Arc::downgrade(self);
        let factory = self.factory.clone();
        let dispatcher = self.dispatcher.clone();
        thread::spawn(move || {
            let result = factory.connect(&peer);
            let submitted = dispatcher.invoke_later(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.finish_connect(peer, result);
                }
            });
            if submitted.is_err() {
                log::debug!("connect result dropped after dispatcher shutdown");
            }
        });
    }

    fn finish_connect(self: &Arc<Self>, peer: Peer, result: Result<Box<dyn Transport>, Error>) {
        let peer_id = peer.id().to_string();
        let Some(Entry::Connecting { waiters }) = self.lock().entries.remove(&peer_id) else {
            // Disposed while the connect was in flight; the waiters were
            // already failed, only the fresh transport needs releasing.
            if let Ok(mut transport) = result {
                transport.close();
            }
            return;
        };
        match result {
            Ok(transport) => {
                let channel = Channel::new(peer, self.dispatcher.clone(), transport);
                {
                    let hook_manager = Arc::downgrade(self);
                    let hook_channel = Arc::downgrade(&channel);
                    let hook_peer = peer_id.clone();
                    channel.set_close_hook(move |error| {
                        if let Some(manager) = hook_manager.upgrade() {
                            manager.on_channel_closed(&hook_peer, &hook_channel, error);
                        }
                    });
                }
                self.lock()
                    .entries
                    .insert(peer_id.clone(), Entry::Opening { channel: channel.clone(), waiters });

                let manager = Arc::downgrade(self);
                channel.open(&[LOCATOR_SERVICE], move |result| {
                    if let Some(manager) = manager.upgrade() {
                        manager.finish_open(&peer_id, result);
                    }
                });
            }
            Err(e) => {
                let error = Error::open_channel(&peer_id, e);
                self.emit(&ChannelEvent::Close {
                    peer: peer_id,
                    error: Some(error.to_string()),
                });
                for waiter in waiters {
                    waiter(Err(error.clone()));
                }
            }
        }
    }

    fn finish_open(self: &Arc<Self>, peer_id: &str, result: Result<(), Error>) {
        let entry = self.lock().entries.remove(peer_id);
        let Some(Entry::Opening { channel, waiters }) = entry else {
            // The entry can be gone if the channel errored out first.
            return;
        };
        match result {
            Ok(()) => {
                self.lock()
                    .entries
                    .insert(peer_id.to_string(), Entry::Open { channel: channel.clone(), refs: waiters.len() });
                self.emit(&ChannelEvent::Open { peer: peer_id.to_string() });
                for waiter in waiters {
                    waiter(Ok(channel.clone()));
                }
            }
            Err(e) => {
                for waiter in waiters {
                    waiter(Err(e.clone()));
                }
            }
        }
    }

    fn on_channel_closed(self: &Arc<Self>, peer_id: &str, channel: &Weak<Channel>, error: Option<Error>) {
        let waiters;
        {
            let mut inner = self.lock();
            let ours = match inner.entries.get(peer_id) {
                Some(Entry::Open { channel: c, .. } | Entry::Opening { channel: c, .. }) => {
                    channel.upgrade().is_some_and(|closed| Arc::ptr_eq(&closed, c))
                }
                Some(Entry::Connecting { .. }) | None => false,
            };
            waiters = if ours {
                match inner.entries.remove(peer_id) {
                    Some(Entry::Opening { waiters, .. }) => waiters,
                    _ => Vec::new(),
                }
            } else {
                Vec::new()
            };
        }
        for waiter in waiters {
            let cause = error.clone().unwrap_or(Error::ChannelClosed);
            waiter(Err(Error::open_channel(peer_id, cause)));
        }
        self.emit(&ChannelEvent::Close {
            peer: peer_id.to_string(),
            error: error.map(|e| e.to_string()),
        });
    }

    /// Release one reference to a shared channel. When the last reference is
    /// released the channel actually closes, failing its pending commands.
    pub fn close_channel(self: &Arc<Self>, channel: &Arc<Channel>) {
        let manager = self.clone();
        let channel = channel.clone();
        let submitted = self.dispatcher.invoke_later(move || {
            manager.close_on_dispatch(&channel);
        });
        if submitted.is_err() {
            log::debug!("close request dropped: dispatcher has shut down");
        }
    }

    fn close_on_dispatch(self: &Arc<Self>, channel: &Arc<Channel>) {
        let peer_id = channel.peer().id().to_string();
        let mut close_now = false;
        {
            let mut inner = self.lock();
            match inner.entries.get_mut(&peer_id) {
                Some(Entry::Open { channel: c, refs }) if Arc::ptr_eq(c, channel) => {
                    *refs -= 1;
                    if *refs == 0 {
                        // Remove before closing so a racing open creates a
                        // fresh channel instead of reusing a dying one.
                        inner.entries.remove(&peer_id);
                        close_now = true;
                    } else {
                        log::debug!("channel to '{peer_id}' still has {refs} references");
                    }
                }
                _ => log::debug!("close of unmanaged or already-closed channel to '{peer_id}'"),
            }
        }
        if close_now {
            channel.close();
        }
    }

    /// Redirect an in-flight open through `proxy`: connect to the proxy peer
    /// and restart the handshake on that hop. A failing proxy connect closes
    /// the channel, which fails the waiting open with [`Error::OpenChannel`].
    pub fn redirect_channel(self: &Arc<Self>, channel: &Arc<Channel>, proxy: Peer) {
        let manager = Arc::downgrade(self);
        let factory = self.factory.clone();
        let dispatcher = self.dispatcher.clone();
        let channel = channel.clone();
        // The proxy connect blocks like any other; keep it off the
        // dispatch thread.
        thread::spawn(move || {
            let peer_id = channel.peer().id().to_string();
            let result = factory.connect(&proxy);
            let submitted = dispatcher.invoke_later(move || match result {
                Ok(transport) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.emit(&ChannelEvent::Redirect { peer: peer_id });
                    }
                    channel.redirect(transport);
                }
                Err(e) => channel.close_internal(Some(Error::open_channel(&peer_id, e))),
            });
            if submitted.is_err() {
                log::debug!("redirect result dropped after dispatcher shutdown");
            }
        });
    }

    /// Emit a host-defined mark event for a channel.
    pub fn mark_channel(self: &Arc<Self>, channel: &Arc<Channel>, mark: impl Into<String>) {
        let manager = self.clone();
        let peer = channel.peer().id().to_string();
        let mark = mark.into();
        let submitted = self.dispatcher.invoke_later(move || {
            manager.emit(&ChannelEvent::Mark { peer, mark });
        });
        if submitted.is_err() {
            log::debug!("mark dropped: dispatcher has shut down");
        }
    }

    /// The tracked channel to `peer_id` (opening or open), if any.
    pub fn channel(&self, peer_id: &str) -> Option<Arc<Channel>> {
        match self.lock().entries.get(peer_id) {
            Some(Entry::Open { channel, .. } | Entry::Opening { channel, .. }) => {
                Some(channel.clone())
            }
            Some(Entry::Connecting { .. }) | None => None,
        }
    }

    /// Reference count of the open channel to `peer_id`, if any.
    pub fn reference_count(&self, peer_id: &str) -> Option<usize> {
        match self.lock().entries.get(peer_id) {
            Some(Entry::Open { refs, .. }) => Some(*refs),
            _ => None,
        }
    }

    /// Number of channels currently tracked (opening or open).
    pub fn channel_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Tear the manager down: close every channel, fail queued opens and
    /// reject all further requests with [`Error::Disposed`].
    pub fn dispose(self: &Arc<Self>) {
        let manager = self.clone();
        let submitted = self.dispatcher.invoke_later(move || {
            let entries;
            {
                let mut inner = manager.lock();
                inner.disposed = true;
                entries = std::mem::take(&mut inner.entries);
            }
            for (_, entry) in entries {
                match entry {
                    Entry::Open { channel, .. } => channel.close(),
                    Entry::Opening { channel, waiters } => {
                        for waiter in waiters {
                            waiter(Err(Error::Disposed));
                        }
                        channel.close();
                    }
                    Entry::Connecting { waiters } => {
                        for waiter in waiters {
                            waiter(Err(Error::Disposed));
                        }
                    }
                }
            }
            log::info!("channel manager disposed");
        });
        if submitted.is_err() {
            log::debug!("dispose dropped: dispatcher has shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::transport::{loopback_pair, LoopbackTransport, Transport, TransportEvent};
    use crate::wire::Frame;
    use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct PairFactory {
        remotes: Sender<LoopbackTransport>,
    }

    impl TransportFactory for PairFactory {
        fn connect(&self, peer: &Peer) -> Result<Box<dyn Transport>, Error> {
            peer.validate()?;
            let (local, remote) = loopback_pair();
            self.remotes
                .send(remote)
                .map_err(|_| Error::Transport("test harness gone".into()))?;
            Ok(Box::new(local))
        }
    }

    struct FailFactory;

    impl TransportFactory for FailFactory {
        fn connect(&self, _peer: &Peer) -> Result<Box<dyn Transport>, Error> {
            Err(Error::Transport("connection refused".into()))
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        manager: Arc<ChannelManager>,
        remotes: Receiver<LoopbackTransport>,
    }

    fn harness() -> Harness {
        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, rx) = unbounded();
        let manager = ChannelManager::new(dispatcher.clone(), Arc::new(PairFactory { remotes: tx }));
        Harness { dispatcher, manager, remotes: rx }
    }

    /// Pick up the remote half of the latest connect and complete the
    /// handshake, answering with the given service list.
    fn serve_handshake(harness: &Harness, services: &[&str]) -> (LoopbackTransport, Receiver<Frame>) {
        let mut remote = harness.remotes.recv_timeout(TIMEOUT).unwrap();
        let (tx, rx) = unbounded();
        remote
            .start(Box::new(move |event| {
                if let TransportEvent::Frame(frame) = event {
                    let _ = tx.send(frame);
                }
            }))
            .unwrap();
        let hello = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(hello.as_hello().is_some());
        remote.send(&Frame::hello(services)).unwrap();
        (remote, rx)
    }

    fn open(harness: &Harness, peer: &Peer) -> Receiver<Result<Arc<Channel>, Error>> {
        let (tx, rx) = bounded(1);
        harness.manager.open_channel(peer.clone(), move |result| {
            let _ = tx.send(result);
        });
        rx
    }

    /// Wait until the manager tracks a channel for the peer; the connect
    /// runs on a worker thread, so the entry appears asynchronously.
    fn wait_for_channel(manager: &Arc<ChannelManager>, peer_id: &str) -> Arc<Channel> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(channel) = manager.channel(peer_id) {
                return channel;
            }
            assert!(Instant::now() < deadline, "channel to '{peer_id}' never tracked");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Runs listener callbacks only when the test pumps its queue.
    struct QueueDelegate {
        tasks: Sender<Box<dyn FnOnce() + Send>>,
    }

    impl InvocationDelegate for QueueDelegate {
        fn invoke(&self, task: Box<dyn FnOnce() + Send>) {
            let _ = self.tasks.send(task);
        }
    }

    #[test]
    fn test_open_reuse_and_refcount() {
        let harness = harness();
        let peer = Peer::loopback("loop:agent");

        let rx1 = open(&harness, &peer);
        let _agent = serve_handshake(&harness, &["TimeService"]);
        let first = rx1.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(harness.manager.reference_count(peer.id()), Some(1));

        // Second open reuses the existing channel; no new connect happens.
        let rx2 = open(&harness, &peer);
        let second = rx2.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(harness.remotes.try_recv().is_err());
        assert_eq!(harness.manager.reference_count(peer.id()), Some(2));

        // First release keeps the channel open.
        harness.manager.close_channel(&first);
        harness.dispatcher.invoke_and_wait(|| ()).unwrap();
        assert!(first.is_open());
        assert_eq!(harness.manager.reference_count(peer.id()), Some(1));

        // Last release actually closes.
        harness.manager.close_channel(&second);
        harness.dispatcher.invoke_and_wait(|| ()).unwrap();
        harness.dispatcher.invoke_and_wait(|| ()).unwrap();
        assert_eq!(first.state(), ChannelState::Closed);
        assert_eq!(harness.manager.channel_count(), 0);
    }

    #[test]
    fn test_concurrent_opens_coalesce() {
        let harness = harness();
        let peer = Peer::loopback("loop:agent");

        // Both opens are queued before the handshake can complete.
        let rx1 = open(&harness, &peer);
        let rx2 = open(&harness, &peer);
        let _agent = serve_handshake(&harness, &["TimeService"]);

        let first = rx1.recv_timeout(TIMEOUT).unwrap().unwrap();
        let second = rx2.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // Exactly one connect was issued for the two callers.
        assert!(harness.remotes.try_recv().is_err());
        assert_eq!(harness.manager.reference_count(peer.id()), Some(2));
    }

    #[test]
    fn test_open_failure_surfaces_open_channel_error() {
        let dispatcher = Arc::new(Dispatcher::new());
        let manager = ChannelManager::new(dispatcher, Arc::new(FailFactory));
        let (tx, rx) = bounded(1);
        manager.open_channel(Peer::loopback("loop:agent"), move |result| {
            let _ = tx.send(result);
        });
        let result = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(result, Err(Error::OpenChannel { .. })));
    }

    #[test]
    fn test_lifecycle_listener_sees_opening_open_close() {
        let harness = harness();
        let (tx, rx) = unbounded();
        harness.manager.add_listener(
            move |event| {
                let _ = tx.send(event.clone());
            },
            None,
        );

        let peer = Peer::loopback("loop:agent");
        let opened = open(&harness, &peer);
        let _agent = serve_handshake(&harness, &["TimeService"]);
        let channel = opened.recv_timeout(TIMEOUT).unwrap().unwrap();

        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Opening { peer: "loop:agent".into() }
        );
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Open { peer: "loop:agent".into() }
        );

        harness.manager.close_channel(&channel);
        match rx.recv_timeout(TIMEOUT).unwrap() {
            ChannelEvent::Close { peer, error: None } => assert_eq!(peer, "loop:agent"),
            other => panic!("expected close event, got {other:?}"),
        }
    }

    #[test]
    fn test_listener_delegate_marshals_event_delivery() {
        let harness = harness();
        let (task_tx, task_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        harness.manager.add_listener(
            move |event| {
                let _ = event_tx.send(event.clone());
            },
            Some(Arc::new(QueueDelegate { tasks: task_tx })),
        );

        let opened = open(&harness, &Peer::loopback("loop:agent"));
        let _agent = serve_handshake(&harness, &["TimeService"]);
        let _channel = opened.recv_timeout(TIMEOUT).unwrap().unwrap();

        // Nothing reaches the listener until the delegate's queue is pumped.
        assert!(event_rx.try_recv().is_err());
        while let Ok(task) = task_rx.try_recv() {
            task();
        }
        assert_eq!(
            event_rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Opening { peer: "loop:agent".into() }
        );
        assert_eq!(
            event_rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Open { peer: "loop:agent".into() }
        );
    }

    #[test]
    fn test_redirect_through_proxy_completes_open() {
        let harness = harness();
        let peer = Peer::loopback("loop:agent");
        let opened = open(&harness, &peer);

        // First hop connects but never answers the Hello.
        let _first_hop = harness.remotes.recv_timeout(TIMEOUT).unwrap();
        let channel = wait_for_channel(&harness.manager, peer.id());
        assert_eq!(channel.state(), ChannelState::Opening);

        let (tx, rx) = unbounded();
        harness.manager.add_listener(
            move |event| {
                let _ = tx.send(event.clone());
            },
            None,
        );

        harness.manager.redirect_channel(&channel, Peer::loopback("loop:proxy"));
        // The proxy hop serves the handshake and the original open resolves.
        let _proxy = serve_handshake(&harness, &["TimeService"]);
        let shared = opened.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert!(Arc::ptr_eq(&shared, &channel));
        assert!(channel.is_open());

        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Redirect { peer: "loop:agent".into() }
        );
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Open { peer: "loop:agent".into() }
        );
    }

    #[test]
    fn test_redirect_proxy_connect_failure_fails_open() {
        // Succeeds on the first connect, refuses every later one.
        struct ProxyRefusingFactory {
            remotes: Sender<LoopbackTransport>,
            connects: AtomicUsize,
        }

        impl TransportFactory for ProxyRefusingFactory {
            fn connect(&self, _peer: &Peer) -> Result<Box<dyn Transport>, Error> {
                if self.connects.fetch_add(1, Ordering::SeqCst) > 0 {
                    return Err(Error::Transport("proxy unreachable".into()));
                }
                let (local, remote) = loopback_pair();
                self.remotes
                    .send(remote)
                    .map_err(|_| Error::Transport("test harness gone".into()))?;
                Ok(Box::new(local))
            }
        }

        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, remotes) = unbounded();
        let manager = ChannelManager::new(
            dispatcher,
            Arc::new(ProxyRefusingFactory { remotes: tx, connects: AtomicUsize::new(0) }),
        );
        let harness_like = Harness {
            dispatcher: manager.dispatcher().clone(),
            manager: manager.clone(),
            remotes,
        };

        let peer = Peer::loopback("loop:agent");
        let opened = open(&harness_like, &peer);
        let _first_hop = harness_like.remotes.recv_timeout(TIMEOUT).unwrap();
        let channel = wait_for_channel(&manager, peer.id());

        manager.redirect_channel(&channel, Peer::loopback("loop:proxy"));
        let result = opened.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(result, Err(Error::OpenChannel { .. })));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(manager.channel_count(), 0);
    }

    #[test]
    fn test_mark_event() {
        let harness = harness();
        let (tx, rx) = unbounded();
        harness.manager.add_listener(
            move |event| {
                if let ChannelEvent::Mark { mark, .. } = event {
                    let _ = tx.send(mark.clone());
                }
            },
            None,
        );
        let opened = open(&harness, &Peer::loopback("loop:agent"));
        let _agent = serve_handshake(&harness, &["TimeService"]);
        let channel = opened.recv_timeout(TIMEOUT).unwrap().unwrap();

        harness.manager.mark_channel(&channel, "congested");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "congested");
    }

    #[test]
    fn test_dispose_closes_channels_and_rejects_opens() {
        let harness = harness();
        let opened = open(&harness, &Peer::loopback("loop:agent"));
        let _agent = serve_handshake(&harness, &["TimeService"]);
        let channel = opened.recv_timeout(TIMEOUT).unwrap().unwrap();

        harness.manager.dispose();
        harness.dispatcher.invoke_and_wait(|| ()).unwrap();
        harness.dispatcher.invoke_and_wait(|| ()).unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);

        let late = open(&harness, &Peer::loopback("loop:other"));
        assert!(matches!(late.recv_timeout(TIMEOUT).unwrap(), Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn test_broadcast_subscription() {
        let harness = harness();
        let mut events = harness.manager.subscribe();

        let opened = open(&harness, &Peer::loopback("loop:agent"));
        let _agent = serve_handshake(&harness, &["TimeService"]);
        let _channel = opened.recv_timeout(TIMEOUT).unwrap().unwrap();

        let event = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, ChannelEvent::Opening { peer: "loop:agent".into() });
        let event = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, ChannelEvent::Open { peer: "loop:agent".into() });
    }
}
