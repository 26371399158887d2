//! Frame model and codec.
//!
//! Commands, replies and events are framed messages carrying a service name,
//! a command or event name, a JSON argument array and, for replies, the
//! correlation token and an optional error object. The byte-stream transports
//! encode one frame per JSON line.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation token for one outstanding request/reply pair.
///
/// Unique within a channel's lifetime; minted at send time and consumed when
/// the matching reply arrives or the channel closes.
pub type Token = u64;

/// Service name of the locator, which carries the handshake traffic.
pub const LOCATOR_SERVICE: &str = "Locator";

/// Event name of the service-negotiation handshake.
pub const HELLO_EVENT: &str = "Hello";

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// An outgoing request.
    Command {
        /// Correlation token minted by the sender.
        token: Token,
        /// Target service name.
        service: String,
        /// Command name within the service.
        command: String,
        /// JSON argument array.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// The reply to a command, matched by token.
    Reply {
        /// Token of the command this reply answers.
        token: Token,
        /// Error slot; `None` on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
        /// Result argument array.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// An unsolicited event from a service.
    Event {
        /// Originating service name.
        service: String,
        /// Event name within the service.
        event: String,
        /// JSON argument array.
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl Frame {
    /// Build the Hello handshake event announcing the given service names.
    pub fn hello<S: AsRef<str>>(services: &[S]) -> Self {
        let names = services.iter().map(|s| Value::from(s.as_ref())).collect();
        Frame::Event {
            service: LOCATOR_SERVICE.to_string(),
            event: HELLO_EVENT.to_string(),
            args: vec![Value::Array(names)],
        }
    }

    /// If this frame is a Hello event, return the announced service names.
    pub fn as_hello(&self) -> Option<Vec<String>> {
        let Frame::Event { service, event, args } = self else { return None };
        if service != LOCATOR_SERVICE || event != HELLO_EVENT {
            return None;
        }
        let names = args.first()?.as_array()?;
        Some(names.iter().filter_map(Value::as_str).map(String::from).collect())
    }

    /// Encode as one JSON line (terminated by `\n`).
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes =
            serde_json::to_vec(self).map_err(|e| Error::Protocol(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode one JSON line. A malformed frame is a protocol error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
    }
}
