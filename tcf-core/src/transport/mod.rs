//! Transports carrying framed messages.
//!
//! A transport is the byte-level half of a channel: it writes outgoing frames
//! and pushes inbound frames (decoded on a reader thread) into a sink. The
//! sink is installed by the channel and marshals every event onto the
//! dispatch thread, so transports never touch protocol state directly.

use crate::error::Error;
use crate::peer::{attrs, Peer, TransportKind};
use crate::wire::Frame;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// What a transport reports into its sink.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound frame.
    Frame(Frame),
    /// The transport is gone; `Some` carries the causing error, `None` is a
    /// clean remote close.
    Closed(Option<Error>),
}

/// Receives inbound transport events. Installed once via
/// [`Transport::start`]; may be called from any reader thread.
pub type FrameSink = Box<dyn Fn(TransportEvent) + Send + Sync>;

/// A framed, bidirectional byte transport to one remote peer.
pub trait Transport: Send {
    /// Begin delivering inbound events into `sink`. Events that arrived
    /// before the sink was installed are delivered first, in order.
    fn start(&mut self, sink: FrameSink) -> Result<(), Error>;

    /// Write one frame.
    fn send(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Release the transport. The remote side observes a clean close.
    fn close(&mut self);
}

/// Creates transports for peers; the channel manager holds one of these.
///
/// Hosts supply their own factory to add SSL, pipe or test transports.
pub trait TransportFactory: Send + Sync {
    /// Validate the peer and open a transport to it.
    fn connect(&self, peer: &Peer) -> Result<Box<dyn Transport>, Error>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Loopback

#[derive(Default)]
struct Endpoint {
    queue: VecDeque<TransportEvent>,
    sink: Option<FrameSink>,
    closed: bool,
}

impl Endpoint {
    fn deliver(&mut self, event: TransportEvent) {
        match &self.sink {
            Some(sink) => sink(event),
            None => self.queue.push_back(event),
        }
    }
}

/// One half of an in-process transport pair.
///
/// Frames sent on one half appear at the other half's sink; used by the
/// loopback peer transport and by tests standing in for a remote agent.
pub struct LoopbackTransport {
    inbound: Arc<Mutex<Endpoint>>,
    outbound: Arc<Mutex<Endpoint>>,
}

/// Create a connected pair of loopback transports.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let a = Arc::new(Mutex::new(Endpoint::default()));
    let b = Arc::new(Mutex::new(Endpoint::default()));
    (
        LoopbackTransport { inbound: a.clone(), outbound: b.clone() },
        LoopbackTransport { inbound: b, outbound: a },
    )
}

impl Transport for LoopbackTransport {
    fn start(&mut self, sink: FrameSink) -> Result<(), Error> {
        let mut endpoint = lock(&self.inbound);
        while let Some(event) = endpoint.queue.pop_front() {
            sink(event);
        }
        endpoint.sink = Some(sink);
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        let mut peer = lock(&self.outbound);
        if peer.closed {
            return Err(Error::Transport("loopback peer endpoint closed".into()));
        }
        peer.deliver(TransportEvent::Frame(frame.clone()));
        Ok(())
    }

    fn close(&mut self) {
        let mut peer = lock(&self.outbound);
        if !peer.closed {
            peer.closed = true;
            peer.deliver(TransportEvent::Closed(None));
        }
        drop(peer);
        lock(&self.inbound).closed = true;
    }
}

// ---------------------------------------------------------------------------
// TCP

/// TCP byte-stream transport with a dedicated reader thread.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to a remote agent.
    pub fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let stream =
            TcpStream::connect((host, port)).map_err(|e| Error::Transport(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        log::debug!("connected to {host}:{port}");
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn start(&mut self, sink: FrameSink) -> Result<(), Error> {
        let stream = self.stream.try_clone().map_err(|e| Error::Transport(e.to_string()))?;
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => {
                        sink(TransportEvent::Closed(None));
                        break;
                    }
                    Ok(_) => match Frame::from_bytes(line.trim_end().as_bytes()) {
                        Ok(frame) => sink(TransportEvent::Frame(frame)),
                        Err(e) => {
                            sink(TransportEvent::Closed(Some(e)));
                            break;
                        }
                    },
                    Err(e) => {
                        sink(TransportEvent::Closed(Some(Error::Transport(e.to_string()))));
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        let bytes = frame.to_bytes()?;
        self.stream.write_all(&bytes).map_err(|e| Error::Transport(e.to_string()))
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

// ---------------------------------------------------------------------------
// Default factory

/// Factory for the transports the core provides out of the box.
///
/// TCP connects directly; SSL and pipe peers need a host-supplied factory.
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn connect(&self, peer: &Peer) -> Result<Box<dyn Transport>, Error> {
        peer.validate()?;
        match peer.transport()? {
            TransportKind::Tcp => {
                // Both attributes are present after validate().
                let host = peer.attribute(attrs::HOST).unwrap_or_default();
                let port = peer
                    .attribute(attrs::PORT)
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(|| {
                        Error::Transport("peer has no port assigned yet".into())
                    })?;
                Ok(Box::new(TcpTransport::connect(host, port)?))
            }
            other => Err(Error::Transport(format!(
                "{} transport requires a host-supplied factory",
                other.as_str()
            ))),
        }
    }
}
