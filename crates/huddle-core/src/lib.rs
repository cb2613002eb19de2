//! Huddle meeting session core.
//!
//! Client-side logic for a multi-party video meeting: the signaling channel,
//! perfect-negotiation peer management, local capture devices, the remote
//! participant table and the render model handed to the UI.
//!
//! The WebRTC engine, capture devices and signaling server are reached through
//! traits (`RtcPeerFactory`, `MediaBackend`, `SignalingConnector`) so native
//! shells can plug in their platform implementations.

pub mod errors;
pub mod events;
pub mod hand_raise;
pub mod logging;
pub mod media;
pub mod participants;
pub mod peers;
pub mod projection;
pub mod session;
pub mod settings;
pub mod signaling;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{DeviceError, HuddleError, NegotiationError, ProtocolError, TransportError};
pub use events::{EventEmitter, EventLog, HuddleEvent, HuddleEventListener};
pub use media::{MediaBackend, MediaConstraints, MediaDeviceController};
pub use peers::{NegotiationState, PeerConnectionManager, RtcPeer, RtcPeerFactory};
pub use projection::{GridLayout, RenderModel, Tile};
pub use session::{JoinRequest, SessionBackends, SessionController, SessionHandle};
pub use settings::{SessionConfig, Settings, SettingsStore};
pub use signaling::{SignalMessage, SignalingConnector, SignalingTransport, WebSocketConnector};
pub use types::{ConnectionState, MediaFlags, ParticipantId, RoomId};
