//! Error taxonomy for the channel and dispatch core.
//!
//! Token-layer errors are always delivered to the waiting completion handler,
//! never thrown across the dispatch boundary. Errors are `Clone` because a
//! single failure may have to be fanned out to several waiting callers
//! (coalesced opens, collector aggregation).

use std::sync::Arc;

/// Errors surfaced by the channel, dispatch and stepper layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A command was sent on a channel that is not in the `Open` state.
    #[error("channel is not open")]
    ChannelNotOpen,

    /// The channel closed while the command was still outstanding.
    #[error("channel closed")]
    ChannelClosed,

    /// The named service was not negotiated on this channel.
    #[error("service '{0}' is not available on this channel")]
    ServiceNotAvailable(String),

    /// Opening a channel failed before or during the handshake.
    ///
    /// Distinguishes "failed before the channel was usable" from a post-open
    /// step failure, which surfaces as the underlying error unchanged.
    #[error("failed to open channel to peer '{peer}': {source}")]
    OpenChannel {
        /// Identifier of the peer the open was targeting.
        peer: String,
        /// The underlying transport or handshake error.
        #[source]
        source: Box<Error>,
    },

    /// A malformed or unexpected frame was received.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote side reported an error in a reply's error slot.
    #[error("remote error: {0}")]
    Remote(serde_json::Value),

    /// A transport-level failure (connect, read or write).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer description is missing or has invalid attributes.
    #[error("invalid peer '{id}': {reason}")]
    InvalidPeer {
        /// Identifier of the offending peer.
        id: String,
        /// What was missing or malformed.
        reason: String,
    },

    /// The dispatcher's task queue is gone; no further tasks can run.
    #[error("dispatcher has shut down")]
    DispatcherShutDown,

    /// The channel manager has been disposed.
    #[error("channel manager disposed")]
    Disposed,

    /// A stepper run was canceled before it finished.
    #[error("run canceled")]
    Canceled,

    /// A stepper was asked to execute more than once.
    #[error("stepper already started")]
    AlreadyStarted,

    /// A step reported failure; the originating error is carried unchanged.
    #[error("step '{step}' failed: {cause}")]
    StepFailed {
        /// Full-qualified id of the failing step occurrence.
        step: String,
        /// The error the step reported.
        cause: Arc<anyhow::Error>,
    },
}

impl Error {
    /// Wrap an open-phase failure for the given peer.
    pub fn open_channel(peer: &str, source: Error) -> Self {
        Error::OpenChannel { peer: peer.to_string(), source: Box::new(source) }
    }

    /// Wrap a step failure with the failing step's full-qualified id.
    pub fn step_failed(step: impl Into<String>, cause: anyhow::Error) -> Self {
        Error::StepFailed { step: step.into(), cause: Arc::new(cause) }
    }
}
