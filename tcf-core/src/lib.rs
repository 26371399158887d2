//! TCF Core - channel and dispatch machinery.
//!
//! This crate provides the communication core for talking to remote agents:
//! a single-threaded dispatcher that serializes all protocol state access,
//! token-correlated command channels over pluggable transports, a channel
//! manager with reference-counted sharing, and the asynchronous helpers
//! (callback collector, stepper engine) that host tooling builds launches on.

pub mod channel;
pub mod collector;
pub mod dispatch;
pub mod error;
pub mod peer;
pub mod properties;
pub mod stepper;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use channel::manager::{ChannelEvent, ChannelManager, ListenerId};
pub use channel::{Channel, ChannelState};
pub use collector::{
    AggregateError, CallbackCollector, CallingThread, CollectorHandle, DispatchThread,
    InvocationDelegate,
};
pub use dispatch::Dispatcher;
pub use error::Error;
pub use peer::{Peer, TransportKind};
pub use properties::PropertiesContainer;
pub use stepper::{
    FnStep, FullQualifiedId, RunState, SharedProperties, Step, StepContext, StepDone, StepGroup,
    StepGroupIterator, Stepper, ValueListIterator,
};
pub use transport::{
    loopback_pair, DefaultTransportFactory, LoopbackTransport, TcpTransport, Transport,
    TransportEvent, TransportFactory,
};
pub use wire::{Frame, Token};
