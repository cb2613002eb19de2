//! One negotiation state machine per remote participant.
//!
//! Glare is resolved by a fixed politeness rule: the local side is impolite
//! towards every participant whose id sorts after its own. The impolite side
//! offers first and ignores colliding offers; the polite side rolls back and
//! answers. Both ends compute the same roles, so the outcome does not depend on
//! message arrival order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{NegotiationError, ProtocolError};
use crate::settings::NegotiationConfig;
use crate::signaling::protocol::SignalMessage;
use crate::types::{IceCandidate, LocalTrack, ParticipantId, RemoteStream, SdpKind, SessionPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Stable,
    Failed,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Stable => "stable",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Asynchronous notifications from a peer connection backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerBackendEvent {
    /// A local ICE candidate to forward to the remote side.
    LocalCandidate {
        peer: ParticipantId,
        candidate: IceCandidate,
    },
    RemoteStream {
        peer: ParticipantId,
        stream: RemoteStream,
    },
    RemoteStreamEnded {
        peer: ParticipantId,
    },
    /// ICE/DTLS failure on an established connection.
    ConnectionFailed {
        peer: ParticipantId,
        reason: String,
    },
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerBackendEvent>;

/// Creates peer connections; implemented by the host's WebRTC engine.
pub trait RtcPeerFactory: Send + Sync {
    fn create(
        &self,
        peer: &ParticipantId,
        events: PeerEventSender,
    ) -> Result<Box<dyn RtcPeer>, NegotiationError>;
}

/// One peer connection. Descriptions and candidates are opaque to the core.
#[async_trait]
pub trait RtcPeer: Send {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&mut self) -> Result<SessionPayload, NegotiationError>;

    /// Create an answer to the applied remote offer and apply it locally.
    async fn create_answer(&mut self) -> Result<SessionPayload, NegotiationError>;

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        payload: &SessionPayload,
    ) -> Result<(), NegotiationError>;

    /// Discard a local offer that has not been answered.
    async fn rollback(&mut self) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    fn set_local_tracks(&mut self, tracks: &[LocalTrack]);

    fn close(&mut self);
}

/// Side effects requested by the manager. The session executes them; the
/// manager never touches the transport or timers itself.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    Send(SignalMessage),
    StateChanged {
        peer: ParticipantId,
        state: NegotiationState,
    },
    ScheduleRetry {
        peer: ParticipantId,
        cycle: u64,
        attempt: u32,
        delay: Duration,
    },
    ScheduleAnswerTimeout {
        peer: ParticipantId,
        cycle: u64,
        delay: Duration,
    },
    /// Retries exhausted; the entry has been closed and removed.
    Failed { peer: ParticipantId },
}

struct PeerEntry {
    rtc: Box<dyn RtcPeer>,
    state: NegotiationState,
    polite: bool,
    pending_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
    /// Reached `Stable` at least once.
    negotiated: bool,
    /// A renegotiation was requested while a cycle was in flight.
    follow_up: bool,
    retries: u32,
    /// Bumped on every new offer/answer cycle; stale timers carry an old value.
    cycle: u64,
    /// A description could not be sent; re-offer once signaling is back.
    needs_restart: bool,
    remote_stream: Option<RemoteStream>,
}

pub struct PeerConnectionManager {
    local_id: ParticipantId,
    config: NegotiationConfig,
    factory: Arc<dyn RtcPeerFactory>,
    events: PeerEventSender,
    local_tracks: Vec<LocalTrack>,
    peers: BTreeMap<ParticipantId, PeerEntry>,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: ParticipantId,
        config: NegotiationConfig,
        factory: Arc<dyn RtcPeerFactory>,
        events: PeerEventSender,
    ) -> Self {
        Self {
            local_id,
            config,
            factory,
            events,
            local_tracks: Vec::new(),
            peers: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Create the entry for a newly joined participant. The impolite side
    /// offers immediately. Adding a known peer is a no-op.
    pub async fn add_peer(&mut self, id: &ParticipantId) -> Result<Vec<PeerAction>, NegotiationError> {
        if id == &self.local_id {
            return Err(NegotiationError::InvalidState {
                action: "connect to self",
                state: "local".into(),
            });
        }
        if self.peers.contains_key(id) {
            return Ok(Vec::new());
        }

        let polite = id < &self.local_id;
        let mut rtc = self.factory.create(id, self.events.clone())?;
        rtc.set_local_tracks(&self.local_tracks);
        self.peers.insert(
            id.clone(),
            PeerEntry {
                rtc,
                state: NegotiationState::Idle,
                polite,
                pending_candidates: Vec::new(),
                has_remote_description: false,
                negotiated: false,
                follow_up: false,
                retries: 0,
                cycle: 0,
                needs_restart: false,
                remote_stream: None,
            },
        );
        tracing::info!(peer = %id, polite, "peer added");

        if polite {
            Ok(Vec::new())
        } else {
            Ok(self.start_offer(id).await)
        }
    }

    /// Close and drop the entry. Any in-flight negotiation is cancelled.
    pub fn remove_peer(&mut self, id: &ParticipantId) -> bool {
        match self.peers.remove(id) {
            Some(mut entry) => {
                entry.rtc.close();
                tracing::info!(peer = %id, "peer closed (was {})", entry.state);
                true
            }
            None => false,
        }
    }

    /// Apply a remote offer or answer.
    pub async fn handle_description(
        &mut self,
        from: &ParticipantId,
        kind: SdpKind,
        payload: &SessionPayload,
    ) -> Result<Vec<PeerAction>, ProtocolError> {
        let entry = self
            .peers
            .get_mut(from)
            .ok_or_else(|| ProtocolError::UnknownSender(from.to_string()))?;
        let state = entry.state;

        match (kind, state) {
            (SdpKind::Offer, NegotiationState::Offering) if !entry.polite => {
                tracing::debug!(peer = %from, "ignoring colliding offer (impolite)");
                Ok(Vec::new())
            }
            (SdpKind::Offer, NegotiationState::Offering) => {
                tracing::debug!(peer = %from, "colliding offer, rolling back ours (polite)");
                if let Err(e) = entry.rtc.rollback().await {
                    return Ok(self.fail_cycle(from, e).await);
                }
                // The discarded offer carried our track changes; send them again afterwards.
                if entry.negotiated {
                    entry.follow_up = true;
                }
                Ok(self.answer(from, payload).await)
            }
            (
                SdpKind::Offer,
                NegotiationState::Idle | NegotiationState::Stable | NegotiationState::Answering,
            ) => Ok(self.answer(from, payload).await),
            (SdpKind::Answer, NegotiationState::Offering) => Ok(self.accept_answer(from, payload).await),
            (kind, state) => Err(ProtocolError::Unexpected {
                kind: match kind {
                    SdpKind::Offer => "offer",
                    SdpKind::Answer => "answer",
                },
                state: state.to_string(),
            }),
        }
    }

    /// Apply a remote candidate, or buffer it until a remote description exists.
    pub async fn handle_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<(), ProtocolError> {
        let entry = self
            .peers
            .get_mut(from)
            .ok_or_else(|| ProtocolError::UnknownSender(from.to_string()))?;

        if !entry.has_remote_description {
            entry.pending_candidates.push(candidate);
            tracing::debug!(
                peer = %from,
                "buffered candidate ({} pending)",
                entry.pending_candidates.len()
            );
            return Ok(());
        }
        if let Err(e) = entry.rtc.add_ice_candidate(&candidate).await {
            tracing::warn!(peer = %from, "failed to add candidate: {e}");
        }
        Ok(())
    }

    /// Ask for a new offer/answer cycle, e.g. after the track set changed.
    /// Requests made while a cycle is in flight collapse into one follow-up.
    pub async fn request_renegotiation(&mut self, id: &ParticipantId) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        match entry.state {
            NegotiationState::Stable => self.start_offer(id).await,
            NegotiationState::Offering | NegotiationState::Answering => {
                entry.follow_up = true;
                Vec::new()
            }
            // Idle peers pick up the track set in their first cycle.
            NegotiationState::Idle | NegotiationState::Failed | NegotiationState::Closed => Vec::new(),
        }
    }

    /// Hand the current local tracks to every peer and renegotiate.
    pub async fn set_local_tracks(&mut self, tracks: Vec<LocalTrack>) -> Vec<PeerAction> {
        self.local_tracks = tracks;
        let ids: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        let mut actions = Vec::new();
        for id in ids {
            if let Some(entry) = self.peers.get_mut(&id) {
                entry.rtc.set_local_tracks(&self.local_tracks);
            }
            actions.extend(self.request_renegotiation(&id).await);
        }
        actions
    }

    /// Retry timer fired. Ignored when another cycle has started since.
    pub async fn retry(&mut self, id: &ParticipantId, cycle: u64) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get(id) else {
            return Vec::new();
        };
        if entry.cycle != cycle
            || !matches!(entry.state, NegotiationState::Idle | NegotiationState::Stable)
        {
            return Vec::new();
        }
        tracing::info!(peer = %id, "retrying negotiation (attempt {})", entry.retries);
        self.start_offer(id).await
    }

    /// Answer timer fired. Counts as a failed cycle if the offer is still open.
    pub async fn answer_timeout(&mut self, id: &ParticipantId, cycle: u64) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get(id) else {
            return Vec::new();
        };
        if entry.cycle != cycle || entry.state != NegotiationState::Offering {
            return Vec::new();
        }
        let err = NegotiationError::Timeout(self.config.answer_timeout_ms);
        self.fail_cycle(id, err).await
    }

    /// A description or candidate for `id` could not be sent because signaling
    /// is down. Not counted as a retry: the peer re-offers after reconnecting.
    pub async fn send_failed(&mut self, id: &ParticipantId) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        entry.needs_restart = true;
        if entry.state != NegotiationState::Offering {
            return Vec::new();
        }
        if let Err(e) = entry.rtc.rollback().await {
            tracing::warn!(peer = %id, "rollback after failed send: {e}");
        }
        entry.cycle += 1;
        let state = if entry.negotiated {
            NegotiationState::Stable
        } else {
            NegotiationState::Idle
        };
        entry.state = state;
        tracing::info!(peer = %id, "offer not sent, will restart after reconnect");
        vec![PeerAction::StateChanged {
            peer: id.clone(),
            state,
        }]
    }

    /// Re-offer to every peer whose negotiation was interrupted by a signaling outage.
    pub async fn restart_pending(&mut self) -> Vec<PeerAction> {
        let ids: Vec<ParticipantId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.needs_restart)
            .map(|(id, _)| id.clone())
            .collect();
        let mut actions = Vec::new();
        for id in ids {
            let Some(entry) = self.peers.get_mut(&id) else {
                continue;
            };
            entry.needs_restart = false;
            match entry.state {
                NegotiationState::Idle | NegotiationState::Stable => {
                    actions.extend(self.start_offer(&id).await);
                }
                NegotiationState::Offering | NegotiationState::Answering => entry.follow_up = true,
                NegotiationState::Failed | NegotiationState::Closed => {}
            }
        }
        actions
    }

    /// The backend reported a broken connection.
    pub async fn connection_failed(&mut self, id: &ParticipantId, reason: String) -> Vec<PeerAction> {
        if !self.peers.contains_key(id) {
            return Vec::new();
        }
        self.fail_cycle(id, NegotiationError::Backend(reason)).await
    }

    /// Close every peer; in-flight negotiations go straight to `Closed`.
    pub fn close_all(&mut self) -> Vec<ParticipantId> {
        let peers = std::mem::take(&mut self.peers);
        let ids: Vec<ParticipantId> = peers.keys().cloned().collect();
        for (id, mut entry) in peers {
            entry.rtc.close();
            tracing::debug!(peer = %id, "closed (was {})", entry.state);
        }
        if !ids.is_empty() {
            tracing::info!("closed {} peer connection(s)", ids.len());
        }
        ids
    }

    pub fn state(&self, id: &ParticipantId) -> Option<NegotiationState> {
        self.peers.get(id).map(|e| e.state)
    }

    pub fn is_polite(&self, id: &ParticipantId) -> Option<bool> {
        self.peers.get(id).map(|e| e.polite)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.peers.contains_key(id)
    }

    /// Record the remote stream owned by this entry. Returns false for unknown peers.
    pub fn set_remote_stream(&mut self, id: &ParticipantId, stream: Option<RemoteStream>) -> bool {
        match self.peers.get_mut(id) {
            Some(entry) => {
                entry.remote_stream = stream;
                true
            }
            None => false,
        }
    }

    pub fn remote_stream(&self, id: &ParticipantId) -> Option<RemoteStream> {
        self.peers.get(id).and_then(|e| e.remote_stream.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    async fn start_offer(&mut self, id: &ParticipantId) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        entry.cycle += 1;
        entry.follow_up = false;
        entry.state = NegotiationState::Offering;
        let cycle = entry.cycle;
        let mut actions = vec![PeerAction::StateChanged {
            peer: id.clone(),
            state: NegotiationState::Offering,
        }];

        match entry.rtc.create_offer().await {
            Ok(payload) => {
                tracing::debug!(peer = %id, cycle, "sending offer");
                actions.push(PeerAction::Send(SignalMessage::SessionDescription {
                    from: self.local_id.clone(),
                    to: id.clone(),
                    sdp_type: SdpKind::Offer,
                    payload,
                }));
                actions.push(PeerAction::ScheduleAnswerTimeout {
                    peer: id.clone(),
                    cycle,
                    delay: self.config.answer_timeout(),
                });
            }
            Err(e) => actions.extend(self.fail_cycle(id, e).await),
        }
        actions
    }

    async fn answer(&mut self, id: &ParticipantId, offer: &SessionPayload) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        entry.cycle += 1;
        entry.state = NegotiationState::Answering;
        let mut actions = vec![PeerAction::StateChanged {
            peer: id.clone(),
            state: NegotiationState::Answering,
        }];

        if let Err(e) = entry.rtc.set_remote_description(SdpKind::Offer, offer).await {
            actions.extend(self.fail_cycle(id, e).await);
            return actions;
        }
        flush_candidates(id, entry).await;

        match entry.rtc.create_answer().await {
            Ok(payload) => {
                tracing::debug!(peer = %id, "sending answer");
                actions.push(PeerAction::Send(SignalMessage::SessionDescription {
                    from: self.local_id.clone(),
                    to: id.clone(),
                    sdp_type: SdpKind::Answer,
                    payload,
                }));
                actions.extend(self.settle(id).await);
            }
            Err(e) => actions.extend(self.fail_cycle(id, e).await),
        }
        actions
    }

    async fn accept_answer(&mut self, id: &ParticipantId, answer: &SessionPayload) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        if let Err(e) = entry.rtc.set_remote_description(SdpKind::Answer, answer).await {
            return self.fail_cycle(id, e).await;
        }
        flush_candidates(id, entry).await;
        self.settle(id).await
    }

    /// Cycle completed: go `Stable`, then run a pending follow-up.
    async fn settle(&mut self, id: &ParticipantId) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        entry.state = NegotiationState::Stable;
        entry.negotiated = true;
        entry.retries = 0;
        tracing::info!(peer = %id, "negotiation stable");
        let mut actions = vec![PeerAction::StateChanged {
            peer: id.clone(),
            state: NegotiationState::Stable,
        }];
        if entry.follow_up {
            tracing::debug!(peer = %id, "running follow-up renegotiation");
            actions.extend(self.start_offer(id).await);
        }
        actions
    }

    /// Count a failed cycle: back off and retry, or give up on the peer.
    async fn fail_cycle(&mut self, id: &ParticipantId, err: NegotiationError) -> Vec<PeerAction> {
        let Some(entry) = self.peers.get_mut(id) else {
            return Vec::new();
        };
        entry.retries += 1;
        tracing::warn!(peer = %id, attempt = entry.retries, "negotiation failed: {err}");

        if entry.retries > self.config.max_retries {
            entry.state = NegotiationState::Failed;
            if let Some(mut entry) = self.peers.remove(id) {
                entry.rtc.close();
            }
            tracing::error!(peer = %id, "giving up after {} retries", self.config.max_retries);
            return vec![
                PeerAction::StateChanged {
                    peer: id.clone(),
                    state: NegotiationState::Failed,
                },
                PeerAction::Failed { peer: id.clone() },
            ];
        }

        if entry.state == NegotiationState::Offering {
            if let Err(e) = entry.rtc.rollback().await {
                tracing::debug!(peer = %id, "rollback failed: {e}");
            }
        }
        let state = if entry.negotiated {
            NegotiationState::Stable
        } else {
            NegotiationState::Idle
        };
        entry.state = state;
        vec![
            PeerAction::StateChanged {
                peer: id.clone(),
                state,
            },
            PeerAction::ScheduleRetry {
                peer: id.clone(),
                cycle: entry.cycle,
                attempt: entry.retries,
                delay: self.config.retry_delay(entry.retries),
            },
        ]
    }
}

/// Apply buffered candidates in arrival order once a remote description is set.
async fn flush_candidates(id: &ParticipantId, entry: &mut PeerEntry) {
    entry.has_remote_description = true;
    let pending = std::mem::take(&mut entry.pending_candidates);
    if !pending.is_empty() {
        tracing::debug!(peer = %id, "applying {} buffered candidate(s)", pending.len());
    }
    for candidate in pending {
        if let Err(e) = entry.rtc.add_ice_candidate(&candidate).await {
            tracing::warn!(peer = %id, "failed to add buffered candidate: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeerFactory;
    use std::collections::VecDeque;

    fn manager(local: &str, factory: &Arc<FakePeerFactory>) -> PeerConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerConnectionManager::new(local.into(), NegotiationConfig::default(), factory.clone(), tx)
    }

    fn sent(actions: &[PeerAction]) -> Vec<SignalMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                PeerAction::Send(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn larger_remote_id_makes_local_impolite_and_offering() {
        let factory = FakePeerFactory::new();
        let mut alice = manager("alice", &factory);
        let actions = alice.add_peer(&"bob".into()).await.unwrap();
        assert_eq!(alice.is_polite(&"bob".into()), Some(false));
        assert_eq!(alice.state(&"bob".into()), Some(NegotiationState::Offering));
        assert!(matches!(
            sent(&actions).as_slice(),
            [SignalMessage::SessionDescription { sdp_type: SdpKind::Offer, .. }]
        ));

        let factory = FakePeerFactory::new();
        let mut bob = manager("bob", &factory);
        assert!(bob.add_peer(&"alice".into()).await.unwrap().is_empty());
        assert_eq!(bob.is_polite(&"alice".into()), Some(true));
        assert_eq!(bob.state(&"alice".into()), Some(NegotiationState::Idle));
    }

    #[tokio::test]
    async fn adding_a_known_peer_is_a_no_op() {
        let factory = FakePeerFactory::new();
        let mut alice = manager("alice", &factory);
        alice.add_peer(&"bob".into()).await.unwrap();
        assert!(alice.add_peer(&"bob".into()).await.unwrap().is_empty());
        assert_eq!(alice.len(), 1);
        assert_eq!(factory.record(&"bob".into()).unwrap().offers, 1);
        assert!(alice.add_peer(&"alice".into()).await.is_err());
    }

    #[tokio::test]
    async fn candidates_before_description_are_applied_in_order() {
        let factory = FakePeerFactory::new();
        let mut bob = manager("bob", &factory);
        bob.add_peer(&"alice".into()).await.unwrap();

        for c in ["c1", "c2", "c3"] {
            bob.handle_candidate(&"alice".into(), IceCandidate(c.into()))
                .await
                .unwrap();
        }
        assert!(factory.record(&"alice".into()).unwrap().applied_candidates.is_empty());

        let actions = bob
            .handle_description(&"alice".into(), SdpKind::Offer, &SessionPayload("o1".into()))
            .await
            .unwrap();
        assert_eq!(bob.state(&"alice".into()), Some(NegotiationState::Stable));
        assert!(matches!(
            sent(&actions).as_slice(),
            [SignalMessage::SessionDescription { sdp_type: SdpKind::Answer, .. }]
        ));

        bob.handle_candidate(&"alice".into(), IceCandidate("c4".into()))
            .await
            .unwrap();
        let applied = factory.record(&"alice".into()).unwrap().applied_candidates;
        assert_eq!(
            applied,
            vec![
                IceCandidate("c1".into()),
                IceCandidate("c2".into()),
                IceCandidate("c3".into()),
                IceCandidate("c4".into()),
            ]
        );
    }

    #[tokio::test]
    async fn stray_answer_is_a_protocol_error() {
        let factory = FakePeerFactory::new();
        let mut bob = manager("bob", &factory);
        bob.add_peer(&"alice".into()).await.unwrap();
        let err = bob
            .handle_description(&"alice".into(), SdpKind::Answer, &SessionPayload("a".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected { kind: "answer", .. }));
        assert!(matches!(
            bob.handle_candidate(&"carol".into(), IceCandidate("c".into())).await,
            Err(ProtocolError::UnknownSender(_))
        ));
    }

    /// Two managers wired back to back, delivering messages in a chosen order.
    struct Pair {
        alice: PeerConnectionManager,
        bob: PeerConnectionManager,
        alice_factory: Arc<FakePeerFactory>,
        bob_factory: Arc<FakePeerFactory>,
        to_alice: VecDeque<SignalMessage>,
        to_bob: VecDeque<SignalMessage>,
    }

    impl Pair {
        async fn connected() -> Self {
            let alice_factory = FakePeerFactory::new();
            let bob_factory = FakePeerFactory::new();
            let mut pair = Pair {
                alice: manager("alice", &alice_factory),
                bob: manager("bob", &bob_factory),
                alice_factory,
                bob_factory,
                to_alice: VecDeque::new(),
                to_bob: VecDeque::new(),
            };
            let a = pair.alice.add_peer(&"bob".into()).await.unwrap();
            pair.route(a);
            let b = pair.bob.add_peer(&"alice".into()).await.unwrap();
            pair.route(b);
            pair.drain(true).await;
            pair
        }

        fn route(&mut self, actions: Vec<PeerAction>) {
            for message in sent(&actions) {
                match &message {
                    SignalMessage::SessionDescription { to, .. } if to.as_str() == "alice" => {
                        self.to_alice.push_back(message)
                    }
                    _ => self.to_bob.push_back(message),
                }
            }
        }

        async fn deliver_to_alice(&mut self) -> bool {
            let Some(SignalMessage::SessionDescription { sdp_type, payload, .. }) =
                self.to_alice.pop_front()
            else {
                return false;
            };
            let actions = self
                .alice
                .handle_description(&"bob".into(), sdp_type, &payload)
                .await
                .unwrap_or_default();
            self.route(actions);
            true
        }

        async fn deliver_to_bob(&mut self) -> bool {
            let Some(SignalMessage::SessionDescription { sdp_type, payload, .. }) =
                self.to_bob.pop_front()
            else {
                return false;
            };
            let actions = self
                .bob
                .handle_description(&"alice".into(), sdp_type, &payload)
                .await
                .unwrap_or_default();
            self.route(actions);
            true
        }

        async fn drain(&mut self, alice_first: bool) {
            loop {
                let progressed = if alice_first {
                    self.deliver_to_alice().await || self.deliver_to_bob().await
                } else {
                    self.deliver_to_bob().await || self.deliver_to_alice().await
                };
                if !progressed {
                    break;
                }
            }
        }

        fn states(&self) -> (Option<NegotiationState>, Option<NegotiationState>) {
            (self.alice.state(&"bob".into()), self.bob.state(&"alice".into()))
        }
    }

    async fn glare(alice_first: bool) -> Pair {
        let mut pair = Pair::connected().await;
        assert_eq!(
            pair.states(),
            (Some(NegotiationState::Stable), Some(NegotiationState::Stable))
        );
        // Both sides change tracks at the same time.
        let a = pair.alice.request_renegotiation(&"bob".into()).await;
        pair.route(a);
        let b = pair.bob.request_renegotiation(&"alice".into()).await;
        pair.route(b);
        assert_eq!(
            pair.states(),
            (Some(NegotiationState::Offering), Some(NegotiationState::Offering))
        );
        pair.drain(alice_first).await;
        pair
    }

    #[tokio::test]
    async fn glare_resolves_identically_under_either_arrival_order() {
        for alice_first in [true, false] {
            let pair = glare(alice_first).await;
            assert_eq!(
                pair.states(),
                (Some(NegotiationState::Stable), Some(NegotiationState::Stable)),
                "alice_first={alice_first}"
            );
            // bob sorts after alice, so bob is polite: he rolled back once and answered.
            let bob_side = pair.bob_factory.record(&"alice".into()).unwrap();
            let alice_side = pair.alice_factory.record(&"bob".into()).unwrap();
            assert_eq!(bob_side.rollbacks, 1);
            assert_eq!(alice_side.rollbacks, 0);
            // Initial cycle, colliding cycle, then bob's follow-up.
            assert_eq!(alice_side.offers, 2);
            assert_eq!(bob_side.offers, 2);
            assert_eq!(bob_side.answers, 2);
            assert_eq!(alice_side.answers, 1);
        }
    }

    #[tokio::test]
    async fn renegotiation_requests_coalesce_while_in_flight() {
        let mut pair = Pair::connected().await;
        let a = pair.alice.request_renegotiation(&"bob".into()).await;
        pair.route(a);
        for _ in 0..3 {
            assert!(pair.alice.request_renegotiation(&"bob".into()).await.is_empty());
        }
        pair.drain(true).await;
        assert_eq!(
            pair.states(),
            (Some(NegotiationState::Stable), Some(NegotiationState::Stable))
        );
        // Initial offer, the requested one, and a single follow-up.
        assert_eq!(pair.alice_factory.record(&"bob".into()).unwrap().offers, 3);
    }

    #[tokio::test]
    async fn failed_offers_retry_with_backoff_then_give_up() {
        let factory = FakePeerFactory::new();
        factory.fail_offers(&"bob".into(), 10);
        let mut alice = manager("alice", &factory);

        let mut actions = alice.add_peer(&"bob".into()).await.unwrap();
        let mut delays = Vec::new();
        loop {
            let retry = actions.iter().find_map(|a| match a {
                PeerAction::ScheduleRetry { cycle, delay, .. } => Some((*cycle, *delay)),
                _ => None,
            });
            match retry {
                Some((cycle, delay)) => {
                    delays.push(delay);
                    actions = alice.retry(&"bob".into(), cycle).await;
                }
                None => break,
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(actions.contains(&PeerAction::Failed { peer: "bob".into() }));
        assert!(!alice.contains(&"bob".into()));
        assert!(factory.record(&"bob".into()).unwrap().closed);
    }

    #[tokio::test]
    async fn answer_timeout_counts_as_failure_and_stale_timers_are_ignored() {
        let factory = FakePeerFactory::new();
        let mut alice = manager("alice", &factory);
        let actions = alice.add_peer(&"bob".into()).await.unwrap();
        let cycle = actions
            .iter()
            .find_map(|a| match a {
                PeerAction::ScheduleAnswerTimeout { cycle, delay, .. } => {
                    assert_eq!(*delay, Duration::from_secs(10));
                    Some(*cycle)
                }
                _ => None,
            })
            .unwrap();

        let actions = alice.answer_timeout(&"bob".into(), cycle).await;
        assert_eq!(alice.state(&"bob".into()), Some(NegotiationState::Idle));
        assert!(actions.iter().any(|a| matches!(a, PeerAction::ScheduleRetry { attempt: 1, .. })));
        assert_eq!(factory.record(&"bob".into()).unwrap().rollbacks, 1);

        // Same timer again: the offer is no longer open.
        assert!(alice.answer_timeout(&"bob".into(), cycle).await.is_empty());
        assert!(alice.retry(&"bob".into(), cycle + 5).await.is_empty());
    }

    #[tokio::test]
    async fn unsent_offer_restarts_after_reconnect_without_counting_a_retry() {
        let factory = FakePeerFactory::new();
        let mut alice = manager("alice", &factory);
        alice.add_peer(&"bob".into()).await.unwrap();

        let actions = alice.send_failed(&"bob".into()).await;
        assert_eq!(
            actions,
            vec![PeerAction::StateChanged {
                peer: "bob".into(),
                state: NegotiationState::Idle
            }]
        );
        let actions = alice.restart_pending().await;
        assert_eq!(sent(&actions).len(), 1);
        assert_eq!(alice.state(&"bob".into()), Some(NegotiationState::Offering));
        assert!(alice.restart_pending().await.is_empty());
        assert!(!actions.iter().any(|a| matches!(a, PeerAction::ScheduleRetry { .. })));
    }

    #[tokio::test]
    async fn close_all_closes_in_flight_negotiations() {
        let factory = FakePeerFactory::new();
        let mut alice = manager("alice", &factory);
        alice.add_peer(&"bob".into()).await.unwrap();
        alice.add_peer(&"aaron".into()).await.unwrap();

        let closed = alice.close_all();
        assert_eq!(closed, vec![ParticipantId::from("aaron"), ParticipantId::from("bob")]);
        assert!(alice.is_empty());
        assert!(factory.record(&"bob".into()).unwrap().closed);
        assert!(factory.record(&"aaron".into()).unwrap().closed);
        assert!(alice.close_all().is_empty());
        assert!(!alice.remove_peer(&"bob".into()));
    }
}
