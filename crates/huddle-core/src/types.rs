//! Identifiers, flags and media handles shared by every component.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable opaque participant identifier.
///
/// Ordering is lexicographic on the underlying string and drives the
/// polite/impolite role assignment, so both ends of a pair always agree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id for a local participant that was not given one.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// UI-relevant flags. Same shape for the local user and remote participants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFlags {
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub camera_off: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default)]
    pub hand_raised: bool,
}

/// Connection state of a participant (or of the signaling channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::ScreenShare => TrackKind::Video,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::ScreenShare => "screen",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TrackInfo {
    pub id: String,
    pub source: TrackSource,
}

/// Shared, read-only reference to a local capture track.
///
/// The hardware resource is owned by the MediaDeviceController; clones handed
/// to peers and to the rendering layer never release it.
pub type LocalTrack = Arc<TrackInfo>;

/// The local tracks currently held, as seen by peers and renderers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LocalStream {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
    pub screen: Option<LocalTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> Vec<LocalTrack> {
        [&self.audio, &self.video, &self.screen]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.screen.is_none()
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RemoteStreamInfo {
    pub id: String,
    pub participant_id: ParticipantId,
}

/// Shared reference to a remote media stream. Owned by the peer entry.
pub type RemoteStream = Arc<RemoteStreamInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Opaque session description blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionPayload(pub String);

/// Opaque ICE candidate blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_ids_order_lexicographically() {
        assert!(ParticipantId::from("alice") < ParticipantId::from("bob"));
        assert!(ParticipantId::from("b") > ParticipantId::from("a9"));
    }

    #[test]
    fn media_flags_use_camel_case_on_the_wire() {
        let flags = MediaFlags {
            audio_muted: true,
            hand_raised: true,
            ..Default::default()
        };
        let json = serde_json::to_value(flags).unwrap();
        assert_eq!(json["audioMuted"], true);
        assert_eq!(json["handRaised"], true);
        assert_eq!(json["cameraOff"], false);

        let parsed: MediaFlags = serde_json::from_str(r#"{"screenSharing":true}"#).unwrap();
        assert!(parsed.screen_sharing);
        assert!(!parsed.audio_muted);
    }

    #[test]
    fn local_stream_lists_held_tracks() {
        let stream = LocalStream {
            audio: Some(Arc::new(TrackInfo {
                id: "a1".into(),
                source: TrackSource::Microphone,
            })),
            ..Default::default()
        };
        assert_eq!(stream.tracks().len(), 1);
        assert!(!stream.is_empty());
        assert!(LocalStream::default().is_empty());
    }
}
