//! Peer descriptions.
//!
//! A peer is a named, addressable description of a remote target agent:
//! a transport kind plus an attribute map. Peers come from the locator or
//! discovery services; the core only reads them and never persists them.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known peer attribute keys.
pub mod attrs {
    /// Transport name attribute (`"TCP"`, `"SSL"`, `"PIPE"`, `"LOOP"`).
    pub const TRANSPORT: &str = "transport";
    /// Network host attribute.
    pub const HOST: &str = "ip.host";
    /// Network port attribute.
    pub const PORT: &str = "ip.port";
    /// When `"true"`, the port may be chosen automatically.
    pub const AUTO_PORT: &str = "auto-port";
    /// Named-pipe path attribute.
    pub const PIPE_NAME: &str = "pipe.name";
    /// Human-readable peer name.
    pub const NAME: &str = "name";
}

/// Transport kind a peer is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Plain TCP byte stream.
    Tcp,
    /// TLS-wrapped TCP byte stream.
    Ssl,
    /// Named pipe.
    Pipe,
    /// In-process loopback.
    Loop,
}

impl TransportKind {
    /// Parse the `transport` attribute value.
    pub fn from_attr(value: &str) -> Option<Self> {
        match value {
            "TCP" => Some(Self::Tcp),
            "SSL" => Some(Self::Ssl),
            "PIPE" => Some(Self::Pipe),
            "LOOP" => Some(Self::Loop),
            _ => None,
        }
    }

    /// The canonical attribute value for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Ssl => "SSL",
            Self::Pipe => "PIPE",
            Self::Loop => "LOOP",
        }
    }
}

/// A named, addressable description of a remote target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    id: String,
    attributes: HashMap<String, String>,
}

impl Peer {
    /// Create a peer with the given identifier and no attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), attributes: HashMap::new() }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Convenience constructor for a TCP peer.
    pub fn tcp(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(id)
            .with_attr(attrs::TRANSPORT, TransportKind::Tcp.as_str())
            .with_attr(attrs::HOST, host)
            .with_attr(attrs::PORT, port.to_string())
    }

    /// Convenience constructor for an in-process loopback peer.
    pub fn loopback(id: impl Into<String>) -> Self {
        Self::new(id).with_attr(attrs::TRANSPORT, TransportKind::Loop.as_str())
    }

    /// The peer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read a raw attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// The full attribute map.
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// The peer's transport kind, if the attribute is present and known.
    pub fn transport(&self) -> Result<TransportKind, Error> {
        let value = self.attribute(attrs::TRANSPORT).ok_or_else(|| Error::InvalidPeer {
            id: self.id.clone(),
            reason: format!("missing required attribute '{}'", attrs::TRANSPORT),
        })?;
        TransportKind::from_attr(value).ok_or_else(|| Error::InvalidPeer {
            id: self.id.clone(),
            reason: format!("unknown transport '{value}'"),
        })
    }

    /// Validate that the transport-specific required attributes are present
    /// and well formed. Called before any connect attempt.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidPeer { id: self.id.clone(), reason };
        match self.transport()? {
            TransportKind::Tcp | TransportKind::Ssl => {
                if self.attribute(attrs::HOST).is_none() {
                    return Err(invalid(format!("missing required attribute '{}'", attrs::HOST)));
                }
                let auto = self.attribute(attrs::AUTO_PORT) == Some("true");
                match self.attribute(attrs::PORT) {
                    Some(port) => {
                        port.parse::<u16>().map_err(|_| {
                            invalid(format!("attribute '{}' is not a port number", attrs::PORT))
                        })?;
                    }
                    None if auto => {}
                    None => {
                        return Err(invalid(format!(
                            "missing required attribute '{}'",
                            attrs::PORT
                        )));
                    }
                }
                Ok(())
            }
            TransportKind::Pipe => {
                if self.attribute(attrs::PIPE_NAME).is_none() {
                    return Err(invalid(format!(
                        "missing required attribute '{}'",
                        attrs::PIPE_NAME
                    )));
                }
                Ok(())
            }
            TransportKind::Loop => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_peer_validates() {
        let peer = Peer::tcp("TCP:192.168.1.10:1534", "192.168.1.10", 1534);
        assert!(peer.validate().is_ok());
        assert_eq!(peer.transport().unwrap(), TransportKind::Tcp);
    }

    #[test]
    fn test_missing_transport_rejected() {
        let peer = Peer::new("anonymous");
        assert!(matches!(peer.transport(), Err(Error::InvalidPeer { .. })));
    }

    #[test]
    fn test_missing_port_rejected_unless_auto() {
        let peer = Peer::new("p")
            .with_attr(attrs::TRANSPORT, "TCP")
            .with_attr(attrs::HOST, "localhost");
        assert!(peer.validate().is_err());

        let peer = peer.with_attr(attrs::AUTO_PORT, "true");
        assert!(peer.validate().is_ok());
    }

    #[test]
    fn test_bad_port_rejected() {
        let peer = Peer::new("p")
            .with_attr(attrs::TRANSPORT, "TCP")
            .with_attr(attrs::HOST, "localhost")
            .with_attr(attrs::PORT, "not-a-port");
        assert!(matches!(peer.validate(), Err(Error::InvalidPeer { .. })));
    }

    #[test]
    fn test_pipe_requires_name() {
        let peer = Peer::new("p").with_attr(attrs::TRANSPORT, "PIPE");
        assert!(peer.validate().is_err());
        let peer = peer.with_attr(attrs::PIPE_NAME, "/tmp/tcf-agent");
        assert!(peer.validate().is_ok());
    }

    #[test]
    fn test_loopback_needs_nothing() {
        assert!(Peer::loopback("loop").validate().is_ok());
    }

    #[test]
    fn test_peer_serde_round_trip() {
        let peer = Peer::tcp("TCP:host:1534", "host", 1534);
        let json = serde_json::to_string(&peer).unwrap();
        let back: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }
}
