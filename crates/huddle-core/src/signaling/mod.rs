//! Signaling: the out-of-band channel that carries descriptions, candidates
//! and membership events. No media flows through it.

pub mod backoff;
pub mod outbox;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use protocol::{Presence, SignalMessage};
pub use transport::{
    SignalingConnector, SignalingLink, SignalingTransport, TransportEvent, TransportEvents,
};
pub use websocket::WebSocketConnector;
