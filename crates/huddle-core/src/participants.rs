use tokio::sync::watch;

use crate::types::{ConnectionState, MediaFlags, ParticipantId, RemoteStream};

/// One remote member of the room.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub connection_state: ConnectionState,
    pub flags: MediaFlags,
    /// Shared reference; the stream itself is owned by the peer entry.
    pub remote_stream: Option<RemoteStream>,
    /// Join order, used to keep tile order stable.
    pub joined_seq: u64,
}

/// Field-wise update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantPatch {
    pub display_name: Option<String>,
    pub connection_state: Option<ConnectionState>,
    pub flags: Option<MediaFlags>,
    pub remote_stream: Option<Option<RemoteStream>>,
}

impl ParticipantPatch {
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn connection_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = Some(state);
        self
    }

    pub fn flags(mut self, flags: MediaFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn remote_stream(mut self, stream: Option<RemoteStream>) -> Self {
        self.remote_stream = Some(stream);
        self
    }

    /// Apply to `p`, returning whether anything changed.
    fn apply(self, p: &mut Participant) -> bool {
        let mut changed = false;
        changed |= set_field(&mut p.display_name, self.display_name);
        changed |= set_field(&mut p.connection_state, self.connection_state);
        changed |= set_field(&mut p.flags, self.flags);
        changed |= set_field(&mut p.remote_stream, self.remote_stream);
        changed
    }
}

fn set_field<T: PartialEq>(field: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) if *field != value => {
            *field = value;
            true
        }
        _ => false,
    }
}

/// Authoritative table of remote participants, in join order.
///
/// Mutated only on the session's dispatch sequence. Observers subscribe to a
/// revision counter that moves once per effective mutation (or batch).
#[derive(Debug)]
pub struct ParticipantStore {
    participants: Vec<Participant>,
    next_seq: u64,
    revision: watch::Sender<u64>,
    batching: bool,
    dirty: bool,
}

impl Default for ParticipantStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            participants: Vec::new(),
            next_seq: 0,
            revision,
            batching: false,
            dirty: false,
        }
    }

    /// Insert `id` or patch its fields. Returns true when the table changed.
    pub fn upsert(&mut self, id: &ParticipantId, patch: ParticipantPatch) -> bool {
        let changed = match self.participants.iter_mut().find(|p| &p.id == id) {
            Some(existing) => patch.apply(existing),
            None => {
                let mut participant = Participant {
                    id: id.clone(),
                    display_name: id.to_string(),
                    connection_state: ConnectionState::Connecting,
                    flags: MediaFlags::default(),
                    remote_stream: None,
                    joined_seq: self.next_seq,
                };
                self.next_seq += 1;
                patch.apply(&mut participant);
                self.participants.push(participant);
                true
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let idx = self.participants.iter().position(|p| &p.id == id)?;
        let removed = self.participants.remove(idx);
        self.notify();
        Some(removed)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.get(id).is_some()
    }

    /// Participants in join order.
    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.clone()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.participants.is_empty() {
            self.participants.clear();
            self.notify();
        }
    }

    /// Run several mutations and publish a single notification for them.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let outer = self.batching;
        self.batching = true;
        let result = f(self);
        self.batching = outer;
        if !outer && std::mem::take(&mut self.dirty) {
            self.publish();
        }
        result
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn notify(&mut self) {
        if self.batching {
            self.dirty = true;
        } else {
            self.publish();
        }
    }

    fn publish(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RemoteStreamInfo;
    use std::sync::Arc;

    fn joined(name: &str) -> ParticipantPatch {
        ParticipantPatch::default()
            .display_name(name)
            .connection_state(ConnectionState::Connecting)
    }

    #[test]
    fn add_and_retrieve_participant() {
        let mut store = ParticipantStore::new();
        assert!(store.upsert(&"p1".into(), joined("Alice")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&"p1".into()).unwrap().display_name, "Alice");
    }

    #[test]
    fn no_duplicate_participants() {
        let mut store = ParticipantStore::new();
        store.upsert(&"p1".into(), joined("Alice"));
        assert!(!store.upsert(&"p1".into(), joined("Alice")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_size_tracks_joins_minus_leaves() {
        let mut store = ParticipantStore::new();
        let events = [
            ("join", "a"),
            ("join", "b"),
            ("join", "a"),
            ("leave", "c"),
            ("join", "c"),
            ("leave", "a"),
            ("join", "d"),
            ("leave", "a"),
            ("join", "b"),
        ];
        for (kind, id) in events {
            match kind {
                "join" => {
                    store.upsert(&id.into(), joined(id));
                }
                _ => {
                    store.remove(&id.into());
                }
            }
            let snapshot = store.snapshot();
            let mut ids: Vec<_> = snapshot.iter().map(|p| p.id.clone()).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), snapshot.len(), "duplicate id in {snapshot:?}");
        }
        let ids: Vec<_> = store.snapshot().into_iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn snapshot_keeps_join_order() {
        let mut store = ParticipantStore::new();
        store.upsert(&"zed".into(), joined("Zed"));
        store.upsert(&"amy".into(), joined("Amy"));
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].id.as_str(), "zed");
        assert_eq!(snapshot[1].id.as_str(), "amy");
        assert!(snapshot[0].joined_seq < snapshot[1].joined_seq);
    }

    #[test]
    fn patches_are_last_writer_wins_per_field() {
        let mut store = ParticipantStore::new();
        let id: ParticipantId = "p1".into();
        store.upsert(&id, joined("Alice"));

        let stream = Arc::new(RemoteStreamInfo {
            id: "s1".into(),
            participant_id: id.clone(),
        });
        store.upsert(&id, ParticipantPatch::default().remote_stream(Some(stream.clone())));
        store.upsert(
            &id,
            ParticipantPatch::default().flags(MediaFlags {
                hand_raised: true,
                ..Default::default()
            }),
        );

        let p = store.get(&id).unwrap();
        assert!(p.flags.hand_raised);
        assert_eq!(p.remote_stream.as_ref(), Some(&stream));
        assert_eq!(p.display_name, "Alice");
    }

    #[test]
    fn unchanged_patch_does_not_notify() {
        let mut store = ParticipantStore::new();
        let rx = store.subscribe();
        store.upsert(&"p1".into(), joined("Alice"));
        assert_eq!(*rx.borrow(), 1);
        assert!(!store.upsert(&"p1".into(), ParticipantPatch::default().display_name("Alice")));
        assert!(store.remove(&"nobody".into()).is_none());
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn batch_notifies_once() {
        let mut store = ParticipantStore::new();
        let mut rx = store.subscribe();
        rx.mark_unchanged();
        store.batch(|s| {
            s.upsert(&"p1".into(), joined("Alice"));
            s.upsert(&"p2".into(), joined("Bob"));
            s.remove(&"p1".into());
        });
        assert!(rx.has_changed().unwrap());
        assert_eq!(store.revision(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = ParticipantStore::new();
        store.upsert(&"p1".into(), joined("Alice"));
        store.clear();
        assert!(store.is_empty());
        let rev = store.revision();
        store.clear();
        assert_eq!(store.revision(), rev);
    }
}
