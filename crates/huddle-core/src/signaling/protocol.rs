//! Signaling wire format: JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::types::{IceCandidate, MediaFlags, ParticipantId, RoomId, SdpKind, SessionPayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Client → server: announce membership. Sent by connectors on every (re)connect.
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: RoomId,
        participant_id: ParticipantId,
        display_name: String,
    },
    /// Client → server: end membership.
    #[serde(rename_all = "camelCase")]
    Leave {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        participant_id: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    SessionDescription {
        from: ParticipantId,
        to: ParticipantId,
        sdp_type: SdpKind,
        payload: SessionPayload,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from: ParticipantId,
        to: ParticipantId,
        payload: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        from: ParticipantId,
        flags: MediaFlags,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        /// RFC 3339 time the hand was raised; absent when lowered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hand_raised_at: Option<String>,
    },
}

impl SignalMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Leave { .. } => "leave",
            SignalMessage::ParticipantJoined { .. } => "participant-joined",
            SignalMessage::ParticipantLeft { .. } => "participant-left",
            SignalMessage::SessionDescription { .. } => "session-description",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::StateUpdate { .. } => "state-update",
        }
    }

    /// Descriptions and candidates. Dropping one corrupts negotiation, so they
    /// are never queued while disconnected.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalMessage::SessionDescription { .. } | SignalMessage::IceCandidate { .. }
        )
    }

    /// Addressee of a peer-to-peer message.
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            SignalMessage::SessionDescription { to, .. } | SignalMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Idempotent, last-wins messages that may be dropped under queue pressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, SignalMessage::StateUpdate { .. })
    }
}

/// Identity a connector announces to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub display_name: String,
}

impl Presence {
    pub fn join_message(&self) -> SignalMessage {
        SignalMessage::Join {
            room_id: self.room_id.clone(),
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    pub fn leave_message(&self) -> SignalMessage {
        SignalMessage::Leave {
            room_id: self.room_id.clone(),
            participant_id: self.participant_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_description_wire_shape() {
        let msg = SignalMessage::SessionDescription {
            from: "alice".into(),
            to: "bob".into(),
            sdp_type: SdpKind::Offer,
            payload: SessionPayload("v=0".into()),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session-description");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["sdpType"], "offer");
        assert_eq!(json["payload"], "v=0");
    }

    #[test]
    fn parses_server_membership_events() {
        let joined =
            SignalMessage::parse(r#"{"type":"participant-joined","participantId":"bob","displayName":"Bob"}"#)
                .unwrap();
        assert_eq!(
            joined,
            SignalMessage::ParticipantJoined {
                participant_id: "bob".into(),
                display_name: Some("Bob".into()),
            }
        );

        let left = SignalMessage::parse(r#"{"type":"participant-left","participantId":"bob"}"#).unwrap();
        assert_eq!(left.kind(), "participant-left");
    }

    #[test]
    fn state_update_defaults_missing_fields() {
        let msg = SignalMessage::parse(
            r#"{"type":"state-update","from":"bob","flags":{"handRaised":true}}"#,
        )
        .unwrap();
        match msg {
            SignalMessage::StateUpdate {
                from,
                flags,
                display_name,
                hand_raised_at,
            } => {
                assert_eq!(from.as_str(), "bob");
                assert!(flags.hand_raised);
                assert!(!flags.audio_muted);
                assert!(display_name.is_none());
                assert!(hand_raised_at.is_none());
            }
            other => panic!("expected state-update, got {other:?}"),
        }
    }

    #[test]
    fn malformed_input_is_a_protocol_error() {
        assert!(matches!(
            SignalMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SignalMessage::parse(r#"{"type":"teleport","from":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn classification() {
        let candidate = SignalMessage::IceCandidate {
            from: "a".into(),
            to: "b".into(),
            payload: IceCandidate("c1".into()),
        };
        assert!(candidate.is_negotiation());
        assert!(!candidate.is_droppable());
        assert_eq!(candidate.recipient(), Some(&ParticipantId::from("b")));

        let update = SignalMessage::StateUpdate {
            from: "a".into(),
            flags: MediaFlags::default(),
            display_name: None,
            hand_raised_at: None,
        };
        assert!(update.is_droppable());
        assert!(!update.is_negotiation());
    }
}
