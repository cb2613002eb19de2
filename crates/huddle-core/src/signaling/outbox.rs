use std::collections::VecDeque;

use crate::errors::TransportError;
use crate::signaling::protocol::SignalMessage;

/// Messages held while the signaling channel is down.
///
/// Only idempotent traffic is accepted. When full, the oldest state-update is
/// discarded to make room; negotiation messages are refused outright. A leave
/// is held in its own slot outside the bounded queue and always drains last.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    queue: VecDeque<SignalMessage>,
    leave: Option<SignalMessage>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            leave: None,
        }
    }

    /// Queue `message`. Returns the message that was dropped to make room, if any.
    pub fn push(&mut self, message: SignalMessage) -> Result<Option<SignalMessage>, TransportError> {
        if message.is_negotiation() {
            return Err(TransportError::NotConnected);
        }
        if let SignalMessage::Leave { .. } = message {
            return Ok(self.leave.replace(message));
        }

        if self.queue.len() >= self.capacity {
            match self.queue.iter().position(SignalMessage::is_droppable) {
                Some(idx) => {
                    let dropped = self.queue.remove(idx);
                    self.queue.push_back(message);
                    return Ok(dropped);
                }
                None if message.is_droppable() => return Ok(Some(message)),
                None => return Err(TransportError::NotConnected),
            }
        }
        self.queue.push_back(message);
        Ok(None)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SignalMessage> + '_ {
        self.queue.drain(..).chain(self.leave.take())
    }

    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.leave.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.leave.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IceCandidate, MediaFlags, SdpKind, SessionPayload};

    fn update(n: usize) -> SignalMessage {
        SignalMessage::StateUpdate {
            from: "alice".into(),
            flags: MediaFlags::default(),
            display_name: Some(format!("update-{n}")),
            hand_raised_at: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_state_update() {
        let mut q = OutboundQueue::new(3);
        for n in 0..3 {
            assert_eq!(q.push(update(n)).unwrap(), None);
        }
        assert_eq!(q.push(update(3)).unwrap(), Some(update(0)));
        let kept: Vec<_> = q.drain().collect();
        assert_eq!(kept, vec![update(1), update(2), update(3)]);
    }

    #[test]
    fn negotiation_messages_are_refused() {
        let mut q = OutboundQueue::new(4);
        let offer = SignalMessage::SessionDescription {
            from: "a".into(),
            to: "b".into(),
            sdp_type: SdpKind::Offer,
            payload: SessionPayload("sdp".into()),
        };
        let candidate = SignalMessage::IceCandidate {
            from: "a".into(),
            to: "b".into(),
            payload: IceCandidate("c".into()),
        };
        assert_eq!(q.push(offer), Err(TransportError::NotConnected));
        assert_eq!(q.push(candidate), Err(TransportError::NotConnected));
        assert!(q.is_empty());
    }

    #[test]
    fn leave_is_held_outside_the_bound() {
        let mut q = OutboundQueue::new(2);
        let leave = SignalMessage::Leave {
            room_id: "r1".into(),
            participant_id: "alice".into(),
        };
        assert_eq!(q.push(leave.clone()).unwrap(), None);
        assert_eq!(q.push(update(0)).unwrap(), None);
        assert_eq!(q.push(update(1)).unwrap(), None);
        assert_eq!(q.push(update(2)).unwrap(), Some(update(0)));
        assert_eq!(q.len(), 3);

        // A second leave replaces the first rather than growing the queue.
        assert_eq!(q.push(leave.clone()).unwrap(), Some(leave.clone()));
        let kept: Vec<_> = q.drain().collect();
        assert_eq!(kept, vec![update(1), update(2), leave]);
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_of_control_messages_refuses_more() {
        let mut q = OutboundQueue::new(1);
        let joined = |id: &str| SignalMessage::ParticipantJoined {
            participant_id: id.into(),
            display_name: None,
        };
        q.push(joined("bob")).unwrap();
        assert_eq!(q.push(update(0)).unwrap(), Some(update(0)));
        assert_eq!(q.push(joined("carol")), Err(TransportError::NotConnected));
        assert_eq!(q.len(), 1);
    }
}
