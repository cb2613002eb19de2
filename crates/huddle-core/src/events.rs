use std::sync::{Arc, RwLock};

use crate::errors::{DeviceError, HuddleError};
use crate::peers::NegotiationState;
use crate::types::{ConnectionState, MediaFlags, ParticipantId};

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum HuddleEvent {
    /// State of the signaling channel.
    ConnectionStateChanged(ConnectionState),
    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: String,
    },
    ParticipantLeft(ParticipantId),
    ParticipantFlagsChanged {
        participant_id: ParticipantId,
        flags: MediaFlags,
    },
    LocalFlagsChanged(MediaFlags),
    PeerStateChanged {
        participant_id: ParticipantId,
        state: NegotiationState,
    },
    /// Negotiation with this peer gave up; its tile disappears.
    PeerFailed(ParticipantId),
    HandRaisedChanged {
        participant_id: ParticipantId,
        raised: bool,
        position: u32,
    },
    /// A capture device could not be used; the session continues without it.
    DeviceUnavailable(DeviceError),
    /// The session was torn down, by `leave()` (`None`) or a fatal error.
    SessionEnded(Option<HuddleError>),
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn HuddleEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: HuddleEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

/// Listener that records every event; handy for hosts that poll.
#[derive(Default)]
pub struct EventLog {
    events: std::sync::Mutex<Vec<HuddleEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<HuddleEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take(&self) -> Vec<HuddleEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl HuddleEventListener for EventLog {
    fn on_event(&self, event: HuddleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl HuddleEventListener for CountingListener {
        fn on_event(&self, _event: HuddleEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(HuddleEvent::ConnectionStateChanged(ConnectionState::Connected));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_log_delivers_correct_events() {
        let emitter = EventEmitter::new();
        let log = EventLog::new();
        emitter.add_listener(log.clone());
        emitter.emit(HuddleEvent::ParticipantLeft("p1".into()));

        let captured = log.take();
        assert_eq!(captured, vec![HuddleEvent::ParticipantLeft("p1".into())]);
        assert!(log.events().is_empty());
    }
}
