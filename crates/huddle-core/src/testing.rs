//! In-memory backends for exercising a session without a network, a camera
//! or a WebRTC engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{DeviceError, NegotiationError, ProtocolError, TransportError};
use crate::media::MediaBackend;
use crate::peers::{PeerBackendEvent, PeerEventSender, RtcPeer, RtcPeerFactory};
use crate::signaling::protocol::{Presence, SignalMessage};
use crate::signaling::transport::{SignalingConnector, SignalingLink};
use crate::types::{
    IceCandidate, LocalTrack, ParticipantId, RemoteStreamInfo, RoomId, SdpKind, SessionPayload,
    TrackInfo, TrackSource,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

struct Member {
    id: ParticipantId,
    display_name: String,
}

struct LinkSlot {
    tx: mpsc::UnboundedSender<SignalMessage>,
    generation: u64,
}

struct RelayState {
    available: bool,
    stalled: bool,
    rooms: HashMap<RoomId, Vec<Member>>,
    links: HashMap<ParticipantId, LinkSlot>,
    next_generation: u64,
    sent: Vec<(ParticipantId, SignalMessage)>,
}

/// A signaling server in memory.
///
/// Membership survives a dropped link, like a server that resumes sessions by
/// participant id: a reconnect re-announces the member list to the client and
/// re-broadcasts its join to everyone else.
#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                available: true,
                stalled: false,
                rooms: HashMap::new(),
                links: HashMap::new(),
                next_generation: 0,
                sent: Vec::new(),
            })),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    /// Make connection attempts hang until they time out.
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    /// Drop the participant's link without ending its membership.
    pub fn sever(&self, id: &ParticipantId) {
        if lock(&self.state).links.remove(id).is_some() {
            tracing::debug!(participant = %id, "relay severed link");
        }
    }

    /// Members of `room` in join order.
    pub fn members(&self, room: &RoomId) -> Vec<ParticipantId> {
        lock(&self.state)
            .rooms
            .get(room)
            .map(|members| members.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliver `message` to `to` as if the server sent it.
    pub fn inject(&self, to: &ParticipantId, message: SignalMessage) {
        lock(&self.state).deliver(to, message);
    }

    /// Everything `id` has sent, in order.
    pub fn sent_by(&self, id: &ParticipantId) -> Vec<SignalMessage> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl RelayState {
    fn deliver(&self, to: &ParticipantId, message: SignalMessage) {
        if let Some(slot) = self.links.get(to) {
            let _ = slot.tx.send(message);
        }
    }

    fn broadcast(&self, room: &RoomId, except: &ParticipantId, message: &SignalMessage) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        for member in members.iter().filter(|m| &m.id != except) {
            self.deliver(&member.id, message.clone());
        }
    }

    fn room_of(&self, id: &ParticipantId) -> Option<RoomId> {
        self.rooms
            .iter()
            .find(|(_, members)| members.iter().any(|m| &m.id == id))
            .map(|(room, _)| room.clone())
    }
}

#[async_trait]
impl SignalingConnector for MemoryRelay {
    async fn connect(&self, presence: &Presence) -> Result<Box<dyn SignalingLink>, TransportError> {
        let stalled = {
            let state = lock(&self.state);
            if !state.available {
                return Err(TransportError::Connect("relay unavailable".into()));
            }
            state.stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = lock(&self.state);
        let (tx, rx) = mpsc::unbounded_channel();
        state.next_generation += 1;
        let generation = state.next_generation;

        let members = state.rooms.entry(presence.room_id.clone()).or_default();
        for member in members.iter().filter(|m| m.id != presence.participant_id) {
            let _ = tx.send(SignalMessage::ParticipantJoined {
                participant_id: member.id.clone(),
                display_name: Some(member.display_name.clone()),
            });
        }
        if !members.iter().any(|m| m.id == presence.participant_id) {
            members.push(Member {
                id: presence.participant_id.clone(),
                display_name: presence.display_name.clone(),
            });
        }
        state
            .links
            .insert(presence.participant_id.clone(), LinkSlot { tx, generation });
        state.broadcast(
            &presence.room_id,
            &presence.participant_id,
            &SignalMessage::ParticipantJoined {
                participant_id: presence.participant_id.clone(),
                display_name: Some(presence.display_name.clone()),
            },
        );

        Ok(Box::new(MemoryLink {
            relay: self.clone(),
            participant: presence.participant_id.clone(),
            generation,
            rx,
        }))
    }
}

struct MemoryLink {
    relay: MemoryRelay,
    participant: ParticipantId,
    generation: u64,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
}

#[async_trait]
impl SignalingLink for MemoryLink {
    async fn send(&mut self, message: &SignalMessage) -> Result<(), TransportError> {
        let mut state = lock(&self.relay.state);
        let current = state
            .links
            .get(&self.participant)
            .is_some_and(|slot| slot.generation == self.generation);
        if !current {
            return Err(TransportError::Io("link severed".into()));
        }
        state.sent.push((self.participant.clone(), message.clone()));

        match message {
            SignalMessage::SessionDescription { to, .. } | SignalMessage::IceCandidate { to, .. } => {
                state.deliver(to, message.clone());
            }
            SignalMessage::StateUpdate { from, .. } => {
                if let Some(room) = state.room_of(from) {
                    state.broadcast(&room, from, message);
                }
            }
            SignalMessage::Leave {
                room_id,
                participant_id,
            } => {
                if let Some(members) = state.rooms.get_mut(room_id) {
                    members.retain(|m| &m.id != participant_id);
                }
                state.links.remove(participant_id);
                state.broadcast(
                    room_id,
                    participant_id,
                    &SignalMessage::ParticipantLeft {
                        participant_id: participant_id.clone(),
                    },
                );
            }
            // Membership is announced on connect.
            SignalMessage::Join { .. }
            | SignalMessage::ParticipantJoined { .. }
            | SignalMessage::ParticipantLeft { .. } => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<SignalMessage, ProtocolError>> {
        self.rx.recv().await.map(Ok)
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeMediaState {
    denied: HashMap<TrackSource, DeviceError>,
    held: Vec<String>,
    acquired: usize,
    released: usize,
    enable_calls: usize,
    next_id: u32,
}

/// Capture devices that always work unless told otherwise.
#[derive(Default)]
pub struct FakeMedia {
    state: Mutex<FakeMediaState>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, source: TrackSource, error: DeviceError) {
        lock(&self.state).denied.insert(source, error);
    }

    pub fn allow(&self, source: TrackSource) {
        lock(&self.state).denied.remove(&source);
    }

    /// Tracks currently held.
    pub fn held(&self) -> usize {
        lock(&self.state).held.len()
    }

    pub fn acquired(&self) -> usize {
        lock(&self.state).acquired
    }

    pub fn released(&self) -> usize {
        lock(&self.state).released
    }

    pub fn enable_calls(&self) -> usize {
        lock(&self.state).enable_calls
    }
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn acquire(&self, source: TrackSource) -> Result<LocalTrack, DeviceError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.denied.get(&source) {
            return Err(err.clone());
        }
        state.next_id += 1;
        let id = format!("{}-{}", source.label(), state.next_id);
        state.held.push(id.clone());
        state.acquired += 1;
        Ok(Arc::new(TrackInfo { id, source }))
    }

    async fn set_enabled(&self, track: &LocalTrack, _enabled: bool) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if !state.held.contains(&track.id) {
            return Err(DeviceError::Backend(format!("{} is not held", track.id)));
        }
        state.enable_calls += 1;
        Ok(())
    }

    fn release(&self, track: &LocalTrack) {
        let mut state = lock(&self.state);
        match state.held.iter().position(|id| id == &track.id) {
            Some(idx) => {
                state.held.remove(idx);
                state.released += 1;
            }
            None => tracing::error!(track = %track.id, "released a track that is not held"),
        }
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// What a fake peer connection has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    pub offers: u32,
    pub answers: u32,
    pub rollbacks: u32,
    pub remote_descriptions: Vec<SdpKind>,
    pub applied_candidates: Vec<IceCandidate>,
    pub tracks: Vec<LocalTrack>,
    pub closed: bool,
}

#[derive(Default)]
struct FakePeerState {
    records: HashMap<ParticipantId, PeerRecord>,
    offer_failures: HashMap<ParticipantId, u32>,
}

/// Peer connections that succeed instantly, gather one candidate per local
/// description and surface a remote stream on the first remote description.
#[derive(Default)]
pub struct FakePeerFactory {
    state: Arc<Mutex<FakePeerState>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` offers towards `peer` fail.
    pub fn fail_offers(&self, peer: &ParticipantId, count: u32) {
        lock(&self.state).offer_failures.insert(peer.clone(), count);
    }

    pub fn record(&self, peer: &ParticipantId) -> Option<PeerRecord> {
        lock(&self.state).records.get(peer).cloned()
    }
}

impl RtcPeerFactory for FakePeerFactory {
    fn create(
        &self,
        peer: &ParticipantId,
        events: PeerEventSender,
    ) -> Result<Box<dyn RtcPeer>, NegotiationError> {
        lock(&self.state)
            .records
            .insert(peer.clone(), PeerRecord::default());
        Ok(Box::new(FakePeer {
            peer: peer.clone(),
            state: self.state.clone(),
            events,
            descriptions: 0,
            stream_sent: false,
        }))
    }
}

struct FakePeer {
    peer: ParticipantId,
    state: Arc<Mutex<FakePeerState>>,
    events: PeerEventSender,
    descriptions: u32,
    stream_sent: bool,
}

impl FakePeer {
    fn update(&self, f: impl FnOnce(&mut PeerRecord)) {
        let mut state = lock(&self.state);
        if let Some(record) = state.records.get_mut(&self.peer) {
            f(record);
        }
    }

    fn gather_candidate(&mut self) {
        self.descriptions += 1;
        let _ = self.events.send(PeerBackendEvent::LocalCandidate {
            peer: self.peer.clone(),
            candidate: IceCandidate(format!("candidate:{}:{}", self.peer, self.descriptions)),
        });
    }
}

#[async_trait]
impl RtcPeer for FakePeer {
    async fn create_offer(&mut self) -> Result<SessionPayload, NegotiationError> {
        {
            let mut state = lock(&self.state);
            if let Some(remaining) = state.offer_failures.get_mut(&self.peer) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(NegotiationError::Backend("injected offer failure".into()));
                }
            }
        }
        let mut offers = 0;
        self.update(|r| {
            r.offers += 1;
            offers = r.offers;
        });
        self.gather_candidate();
        Ok(SessionPayload(format!("offer-{offers}")))
    }

    async fn create_answer(&mut self) -> Result<SessionPayload, NegotiationError> {
        let mut answers = 0;
        self.update(|r| {
            r.answers += 1;
            answers = r.answers;
        });
        self.gather_candidate();
        Ok(SessionPayload(format!("answer-{answers}")))
    }

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        _payload: &SessionPayload,
    ) -> Result<(), NegotiationError> {
        self.update(|r| r.remote_descriptions.push(kind));
        if !self.stream_sent {
            self.stream_sent = true;
            let _ = self.events.send(PeerBackendEvent::RemoteStream {
                peer: self.peer.clone(),
                stream: Arc::new(RemoteStreamInfo {
                    id: format!("stream-{}", self.peer),
                    participant_id: self.peer.clone(),
                }),
            });
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        self.update(|r| r.rollbacks += 1);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.update(|r| r.applied_candidates.push(candidate.clone()));
        Ok(())
    }

    fn set_local_tracks(&mut self, tracks: &[LocalTrack]) {
        self.update(|r| r.tracks = tracks.to_vec());
    }

    fn close(&mut self) {
        self.update(|r| r.closed = true);
    }
}
