use thiserror::Error;

/// Top-level error returned by session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HuddleError {
    #[error("signaling: {0}")]
    Transport(#[from] TransportError),
    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("session error: {0}")]
    Session(String),
}

/// Connect/reconnect failures of the signaling channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("signaling not connected")]
    NotConnected,
    #[error("signaling unavailable after {secs}s without a connection")]
    SignalingUnavailable { secs: u64 },
    #[error("signaling transport closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(String),
}

/// Per-peer negotiation failures. Never fatal to the whole session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("peer backend error: {0}")]
    Backend(String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("no answer within {0}ms")]
    Timeout(u64),
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

/// Local capture device failures. The session continues with the track absent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no {0} device found")]
    DeviceNotFound(String),
    #[error("{0} is in use by another application")]
    DeviceInUse(String),
    #[error("device backend error: {0}")]
    Backend(String),
}

/// Malformed or unexpected signaling input. The message is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message addressed to {0}")]
    Misaddressed(String),
    #[error("message from unknown participant {0}")]
    UnknownSender(String),
    #[error("unexpected {kind} while {state}")]
    Unexpected { kind: &'static str, state: String },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
