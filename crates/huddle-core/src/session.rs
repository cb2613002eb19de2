//! Meeting lifecycle: join, the dispatch loop, local actions and teardown.
//!
//! A `SessionController` owns every component of one room session and is the
//! only thing that mutates them. Transport events, peer backend events and
//! timer expiries all arrive on channels and are handled one at a time, either
//! through [`SessionController::run`] or step by step with `pump`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::errors::{DeviceError, HuddleError, ProtocolError, TransportError};
use crate::events::{EventEmitter, HuddleEvent, HuddleEventListener};
use crate::hand_raise::HandRaiseQueue;
use crate::media::{MediaBackend, MediaConstraints, MediaDeviceController};
use crate::participants::{ParticipantPatch, ParticipantStore};
use crate::peers::{
    NegotiationState, PeerAction, PeerBackendEvent, PeerConnectionManager, RtcPeerFactory,
};
use crate::projection::{ProjectionInput, Projector, RenderModel};
use crate::settings::{SessionConfig, Settings};
use crate::signaling::{
    Presence, SignalMessage, SignalingConnector, SignalingTransport, TransportEvent, TransportEvents,
};
use crate::types::{ConnectionState, LocalTrack, MediaFlags, ParticipantId, RoomId};

/// Host-provided implementations of the outer boundaries.
#[derive(Clone)]
pub struct SessionBackends {
    pub signaling: Arc<dyn SignalingConnector>,
    pub media: Arc<dyn MediaBackend>,
    pub peers: Arc<dyn RtcPeerFactory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub room_id: RoomId,
    /// Generated when absent.
    pub participant_id: Option<ParticipantId>,
    pub display_name: String,
    pub constraints: MediaConstraints,
}

impl JoinRequest {
    pub fn new(room_id: RoomId, display_name: impl Into<String>) -> Self {
        Self {
            room_id,
            participant_id: None,
            display_name: display_name.into(),
            constraints: MediaConstraints::default(),
        }
    }

    /// Name and devices from the user's saved preferences.
    pub fn from_settings(room_id: RoomId, settings: &Settings) -> Self {
        Self {
            room_id,
            participant_id: None,
            display_name: settings
                .display_name
                .clone()
                .unwrap_or_else(|| "Guest".to_string()),
            constraints: MediaConstraints::from(settings),
        }
    }

    pub fn participant_id(mut self, id: impl Into<ParticipantId>) -> Self {
        self.participant_id = Some(id.into());
        self
    }

    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParticipant {
    pub id: ParticipantId,
    pub display_name: String,
    pub flags: MediaFlags,
}

/// Context of one joined room.
struct RoomSession {
    room_id: RoomId,
    local: LocalParticipant,
    transport: SignalingTransport,
    participants: ParticipantStore,
    hands: HandRaiseQueue,
}

#[derive(Debug)]
enum TimerEvent {
    Retry { peer: ParticipantId, cycle: u64 },
    AnswerTimeout { peer: ParticipantId, cycle: u64 },
}

enum Incoming {
    Transport(Option<TransportEvent>),
    Peer(PeerBackendEvent),
    Timer(TimerEvent),
}

pub struct SessionController {
    session: RoomSession,
    media: MediaDeviceController,
    peers: PeerConnectionManager,
    transport_events: TransportEvents,
    peer_events: mpsc::UnboundedReceiver<PeerBackendEvent>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    timers: Vec<JoinHandle<()>>,
    signaling_state: ConnectionState,
    emitter: EventEmitter,
    projector: Projector,
    render: watch::Sender<Arc<RenderModel>>,
    local_hand_raised_at: Option<String>,
    ended: bool,
}

impl SessionController {
    /// Acquire local media, connect signaling and announce presence.
    ///
    /// Missing devices do not fail the join. A signaling failure does, after
    /// releasing every device acquired so far.
    pub async fn join(
        config: SessionConfig,
        backends: SessionBackends,
        request: JoinRequest,
        emitter: EventEmitter,
    ) -> Result<Self, HuddleError> {
        Self::join_inner(config, backends, request, emitter, None).await
    }

    async fn join_inner(
        config: SessionConfig,
        backends: SessionBackends,
        request: JoinRequest,
        emitter: EventEmitter,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Self, HuddleError> {
        let local_id = request
            .participant_id
            .clone()
            .unwrap_or_else(ParticipantId::random);
        tracing::info!(room = %request.room_id, participant = %local_id, "joining room");
        emitter.emit(HuddleEvent::ConnectionStateChanged(ConnectionState::Connecting));

        let mut media = MediaDeviceController::new(backends.media.clone());
        let acquired = tokio::select! {
            result = media.acquire_local_media(&request.constraints) => Some(result),
            _ = cancelled(&mut cancel) => None,
        };
        match acquired {
            Some(Ok(_)) => {}
            Some(Err(e)) => tracing::warn!("joining without local media: {e}"),
            None => {
                media.release_all();
                emitter.emit(HuddleEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                return Err(join_cancelled());
            }
        }
        for report in media.take_reports() {
            emitter.emit(HuddleEvent::DeviceUnavailable(report));
        }

        let presence = Presence {
            room_id: request.room_id.clone(),
            participant_id: local_id.clone(),
            display_name: request.display_name.clone(),
        };
        let connected = tokio::select! {
            result = SignalingTransport::connect(
                backends.signaling.clone(),
                presence,
                config.signaling.clone(),
            ) => result.map_err(HuddleError::from),
            _ = cancelled(&mut cancel) => Err(join_cancelled()),
        };
        let (transport, transport_events) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                let released = media.release_all();
                tracing::error!("join failed, released {released} device(s): {e}");
                emitter.emit(HuddleEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                return Err(e);
            }
        };

        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let mut peers = PeerConnectionManager::new(
            local_id.clone(),
            config.negotiation.clone(),
            backends.peers.clone(),
            peer_tx,
        );
        // No peers yet; this only records the tracks new peers start with.
        peers.set_local_tracks(media.local_stream().tracks()).await;
        media.take_tracks_changed();

        let session = RoomSession {
            room_id: request.room_id,
            local: LocalParticipant {
                id: local_id,
                display_name: request.display_name,
                flags: media.flags(),
            },
            transport,
            participants: ParticipantStore::new(),
            hands: HandRaiseQueue::new(),
        };

        let mut projector = Projector::new();
        let initial = projector.project(projection_input(&session, &media, ConnectionState::Connected));
        let (render, _) = watch::channel(initial);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let controller = Self {
            session,
            media,
            peers,
            transport_events,
            peer_events,
            timer_tx,
            timer_rx,
            timers: Vec::new(),
            signaling_state: ConnectionState::Connected,
            emitter,
            projector,
            render,
            local_hand_raised_at: None,
            ended: false,
        };
        controller
            .emitter
            .emit(HuddleEvent::ConnectionStateChanged(ConnectionState::Connected));
        controller
            .emitter
            .emit(HuddleEvent::LocalFlagsChanged(controller.session.local.flags));
        controller.publish_local_state();
        tracing::info!(room = %controller.session.room_id, "joined room");
        Ok(controller)
    }

    pub fn local(&self) -> &LocalParticipant {
        &self.session.local
    }

    pub fn room_id(&self) -> &RoomId {
        &self.session.room_id
    }

    pub fn participants(&self) -> &ParticipantStore {
        &self.session.participants
    }

    pub fn peer_state(&self, id: &ParticipantId) -> Option<NegotiationState> {
        self.peers.state(id)
    }

    pub fn hand_position(&self, id: &ParticipantId) -> Option<u32> {
        self.session.hands.position(id)
    }

    pub fn signaling_state(&self) -> ConnectionState {
        self.signaling_state
    }

    pub fn render_model(&self) -> Arc<RenderModel> {
        self.render.borrow().clone()
    }

    /// Receives a new model after every update that changed it.
    pub fn subscribe_render(&self) -> watch::Receiver<Arc<RenderModel>> {
        self.render.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn is_active(&self) -> bool {
        !self.ended
    }

    /// Wait for the next event and handle it. Returns false once the session has ended.
    pub async fn pump(&mut self) -> bool {
        if self.ended {
            return false;
        }
        let incoming = self.next_incoming().await;
        self.dispatch(incoming).await;
        !self.ended
    }

    /// Handle one event if one is ready. Returns whether anything was handled.
    pub async fn try_pump(&mut self) -> bool {
        if self.ended {
            return false;
        }
        let incoming = if let Ok(timer) = self.timer_rx.try_recv() {
            Incoming::Timer(timer)
        } else if let Ok(event) = self.peer_events.try_recv() {
            Incoming::Peer(event)
        } else if let Some(event) = self.transport_events.try_recv() {
            Incoming::Transport(Some(event))
        } else {
            return false;
        };
        self.dispatch(incoming).await;
        true
    }

    /// Drive the session until it ends. Closing the command channel leaves the room.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        while !self.ended {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => self.leave().await,
                },
                incoming = self.next_incoming() => self.dispatch(incoming).await,
            }
        }
        tracing::debug!(room = %self.session.room_id, "dispatch loop stopped");
    }

    pub async fn set_audio_muted(&mut self, muted: bool) -> Result<bool, HuddleError> {
        self.ensure_active()?;
        let result = self.media.set_audio_muted(muted).await;
        self.after_media_change(result).await
    }

    pub async fn set_camera_off(&mut self, off: bool) -> Result<bool, HuddleError> {
        self.ensure_active()?;
        let result = self.media.set_camera_off(off).await;
        self.after_media_change(result).await
    }

    /// Start sharing the screen and renegotiate with every peer.
    pub async fn start_screen_share(&mut self) -> Result<LocalTrack, HuddleError> {
        self.ensure_active()?;
        let result = self.media.start_screen_share().await;
        self.after_media_change(result).await
    }

    pub async fn stop_screen_share(&mut self) -> Result<bool, HuddleError> {
        self.ensure_active()?;
        let stopped = self.media.stop_screen_share();
        self.after_media_change(Ok(stopped)).await
    }

    /// Returns the 1-based queue position. Raising twice keeps the place.
    pub fn raise_hand(&mut self) -> Result<u32, HuddleError> {
        self.ensure_active()?;
        let local = self.session.local.id.clone();
        if let Some(position) = self.session.hands.position(&local) {
            return Ok(position);
        }
        let raised_at = HandRaiseQueue::now_timestamp();
        let position = self.session.hands.raise(&local, Some(&raised_at));
        self.local_hand_raised_at = Some(raised_at);
        tracing::info!("hand raised (position {position})");
        self.emitter.emit(HuddleEvent::HandRaisedChanged {
            participant_id: local,
            raised: true,
            position,
        });
        self.sync_local_flags();
        self.refresh();
        Ok(position)
    }

    pub fn lower_hand(&mut self) -> Result<bool, HuddleError> {
        self.ensure_active()?;
        let local = self.session.local.id.clone();
        if !self.session.hands.lower(&local) {
            return Ok(false);
        }
        self.local_hand_raised_at = None;
        tracing::info!("hand lowered");
        self.emitter.emit(HuddleEvent::HandRaisedChanged {
            participant_id: local,
            raised: false,
            position: 0,
        });
        self.sync_local_flags();
        self.refresh();
        Ok(true)
    }

    /// Close peers, signaling and devices. Safe to call repeatedly.
    pub async fn leave(&mut self) {
        self.teardown(None).await;
    }

    async fn next_incoming(&mut self) -> Incoming {
        tokio::select! {
            biased;
            Some(timer) = self.timer_rx.recv() => Incoming::Timer(timer),
            Some(event) = self.peer_events.recv() => Incoming::Peer(event),
            event = self.transport_events.recv() => Incoming::Transport(event),
        }
    }

    async fn dispatch(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Transport(Some(TransportEvent::Message(message))) => {
                let kind = message.kind();
                if let Err(e) = self.handle_signal(message).await {
                    tracing::warn!("dropping {kind}: {e}");
                }
            }
            Incoming::Transport(Some(TransportEvent::Reconnecting { attempt })) => {
                self.set_signaling_state(ConnectionState::Reconnecting { attempt });
            }
            Incoming::Transport(Some(TransportEvent::Reconnected)) => {
                self.set_signaling_state(ConnectionState::Connected);
                self.publish_local_state();
                let actions = self.peers.restart_pending().await;
                self.apply(actions).await;
            }
            Incoming::Transport(Some(TransportEvent::Undelivered { to })) => {
                let actions = self.peers.send_failed(&to).await;
                self.apply(actions).await;
            }
            Incoming::Transport(Some(TransportEvent::Fatal(e))) => {
                self.teardown(Some(e.into())).await;
            }
            Incoming::Transport(None) => {
                self.teardown(Some(HuddleError::Session("signaling channel closed".into())))
                    .await;
            }
            Incoming::Peer(event) => self.handle_peer_event(event).await,
            Incoming::Timer(TimerEvent::Retry { peer, cycle }) => {
                let actions = self.peers.retry(&peer, cycle).await;
                self.apply(actions).await;
            }
            Incoming::Timer(TimerEvent::AnswerTimeout { peer, cycle }) => {
                let actions = self.peers.answer_timeout(&peer, cycle).await;
                self.apply(actions).await;
            }
        }
        self.refresh();
    }

    async fn handle_signal(&mut self, message: SignalMessage) -> Result<(), ProtocolError> {
        let local = self.session.local.id.clone();
        match message {
            SignalMessage::ParticipantJoined {
                participant_id,
                display_name,
            } => {
                if participant_id != local {
                    self.admit(&participant_id, display_name).await;
                }
            }
            SignalMessage::ParticipantLeft { participant_id } => self.dismiss(&participant_id),
            SignalMessage::SessionDescription {
                from,
                to,
                sdp_type,
                payload,
            } => {
                check_recipient(&local, &to, "session-description")?;
                // Peer entries only come from membership events; a removed or
                // failed participant stays out until it is announced again.
                let actions = self.peers.handle_description(&from, sdp_type, &payload).await?;
                self.apply(actions).await;
            }
            SignalMessage::IceCandidate { from, to, payload } => {
                check_recipient(&local, &to, "ice-candidate")?;
                self.peers.handle_candidate(&from, payload).await?;
            }
            SignalMessage::StateUpdate {
                from,
                flags,
                display_name,
                hand_raised_at,
            } => {
                if from != local {
                    self.apply_state_update(&from, flags, display_name, hand_raised_at)?;
                }
            }
            SignalMessage::Join { .. } | SignalMessage::Leave { .. } => {
                return Err(ProtocolError::Unexpected {
                    kind: message.kind(),
                    state: "client".into(),
                });
            }
        }
        Ok(())
    }

    /// Create the store row and peer entry for a member. Repeated
    /// announcements (e.g. after a reconnect) only refresh the name.
    async fn admit(&mut self, id: &ParticipantId, display_name: Option<String>) {
        let is_new = !self.session.participants.contains(id);
        let mut patch = ParticipantPatch::default();
        if let Some(name) = display_name {
            patch = patch.display_name(name);
        }
        self.session.participants.upsert(id, patch);

        match self.peers.add_peer(id).await {
            Ok(actions) => self.apply(actions).await,
            Err(e) => {
                tracing::warn!(participant = %id, "cannot connect to participant: {e}");
                if is_new {
                    self.session.participants.remove(id);
                }
                return;
            }
        }

        if is_new {
            let display_name = self
                .session
                .participants
                .get(id)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| id.to_string());
            tracing::info!(participant = %id, "participant joined: {display_name}");
            self.emitter.emit(HuddleEvent::ParticipantJoined {
                participant_id: id.clone(),
                display_name,
            });
            // Let the newcomer learn our flags.
            self.publish_local_state();
        }
    }

    fn dismiss(&mut self, id: &ParticipantId) {
        let had_peer = self.peers.remove_peer(id);
        let removed = self.session.participants.remove(id).is_some();
        self.session.hands.lower(id);
        if had_peer {
            self.emitter.emit(HuddleEvent::PeerStateChanged {
                participant_id: id.clone(),
                state: NegotiationState::Closed,
            });
        }
        if had_peer || removed {
            tracing::info!(participant = %id, "participant left");
            self.emitter.emit(HuddleEvent::ParticipantLeft(id.clone()));
        }
    }

    fn apply_state_update(
        &mut self,
        from: &ParticipantId,
        flags: MediaFlags,
        display_name: Option<String>,
        hand_raised_at: Option<String>,
    ) -> Result<(), ProtocolError> {
        if !self.session.participants.contains(from) {
            return Err(ProtocolError::UnknownSender(from.to_string()));
        }
        let mut patch = ParticipantPatch::default().flags(flags);
        if let Some(name) = display_name {
            patch = patch.display_name(name);
        }
        let changed = self.session.participants.upsert(from, patch);

        let was_raised = self.session.hands.is_raised(from);
        if flags.hand_raised && !was_raised {
            let position = self.session.hands.raise(from, hand_raised_at.as_deref());
            self.emitter.emit(HuddleEvent::HandRaisedChanged {
                participant_id: from.clone(),
                raised: true,
                position,
            });
        } else if !flags.hand_raised && was_raised {
            self.session.hands.lower(from);
            self.emitter.emit(HuddleEvent::HandRaisedChanged {
                participant_id: from.clone(),
                raised: false,
                position: 0,
            });
        }

        if changed {
            tracing::debug!(participant = %from, "state updated");
            self.emitter.emit(HuddleEvent::ParticipantFlagsChanged {
                participant_id: from.clone(),
                flags,
            });
        }
        Ok(())
    }

    async fn handle_peer_event(&mut self, event: PeerBackendEvent) {
        match event {
            PeerBackendEvent::LocalCandidate { peer, candidate } => {
                if !self.peers.contains(&peer) {
                    return;
                }
                let message = SignalMessage::IceCandidate {
                    from: self.session.local.id.clone(),
                    to: peer,
                    payload: candidate,
                };
                self.apply(vec![PeerAction::Send(message)]).await;
            }
            PeerBackendEvent::RemoteStream { peer, stream } => {
                if self.peers.set_remote_stream(&peer, Some(stream.clone())) {
                    tracing::info!(participant = %peer, stream = %stream.id, "remote stream received");
                    self.session
                        .participants
                        .upsert(&peer, ParticipantPatch::default().remote_stream(Some(stream)));
                }
            }
            PeerBackendEvent::RemoteStreamEnded { peer } => {
                if self.peers.set_remote_stream(&peer, None) {
                    self.session
                        .participants
                        .upsert(&peer, ParticipantPatch::default().remote_stream(None));
                }
            }
            PeerBackendEvent::ConnectionFailed { peer, reason } => {
                let actions = self.peers.connection_failed(&peer, reason).await;
                self.apply(actions).await;
            }
        }
    }

    /// Execute side effects requested by the peer manager.
    async fn apply(&mut self, actions: Vec<PeerAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                PeerAction::Send(message) => {
                    let recipient = message.recipient().cloned();
                    let kind = message.kind();
                    if let Err(e) = self.session.transport.send(message) {
                        tracing::warn!("could not send {kind}: {e}");
                        if e == TransportError::NotConnected {
                            if let Some(peer) = recipient {
                                queue.extend(self.peers.send_failed(&peer).await);
                            }
                        }
                    }
                }
                PeerAction::StateChanged { peer, state } => {
                    if state == NegotiationState::Stable && self.session.participants.contains(&peer) {
                        self.session.participants.upsert(
                            &peer,
                            ParticipantPatch::default().connection_state(ConnectionState::Connected),
                        );
                    }
                    self.emitter.emit(HuddleEvent::PeerStateChanged {
                        participant_id: peer,
                        state,
                    });
                }
                PeerAction::ScheduleRetry {
                    peer,
                    cycle,
                    attempt,
                    delay,
                } => {
                    tracing::debug!(participant = %peer, "retry {attempt} in {}ms", delay.as_millis());
                    self.schedule(delay, TimerEvent::Retry { peer, cycle });
                }
                PeerAction::ScheduleAnswerTimeout { peer, cycle, delay } => {
                    self.schedule(delay, TimerEvent::AnswerTimeout { peer, cycle });
                }
                PeerAction::Failed { peer } => {
                    tracing::warn!(participant = %peer, "dropping participant after failed negotiation");
                    self.session.participants.remove(&peer);
                    self.session.hands.lower(&peer);
                    self.emitter.emit(HuddleEvent::PeerFailed(peer));
                }
            }
        }
    }

    fn schedule(&mut self, delay: Duration, event: TimerEvent) {
        self.timers.retain(|timer| !timer.is_finished());
        let tx = self.timer_tx.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    async fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetAudioMuted { muted, reply } => {
                let _ = reply.send(self.set_audio_muted(muted).await);
            }
            SessionCommand::SetCameraOff { off, reply } => {
                let _ = reply.send(self.set_camera_off(off).await);
            }
            SessionCommand::StartScreenShare { reply } => {
                let _ = reply.send(self.start_screen_share().await);
            }
            SessionCommand::StopScreenShare { reply } => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            SessionCommand::RaiseHand { reply } => {
                let _ = reply.send(self.raise_hand());
            }
            SessionCommand::LowerHand { reply } => {
                let _ = reply.send(self.lower_hand());
            }
            SessionCommand::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
        }
    }

    async fn after_media_change<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, HuddleError> {
        for report in self.media.take_reports() {
            self.emitter.emit(HuddleEvent::DeviceUnavailable(report));
        }
        if self.media.take_tracks_changed() {
            let actions = self.peers.set_local_tracks(self.media.local_stream().tracks()).await;
            self.apply(actions).await;
        }
        self.sync_local_flags();
        self.refresh();
        Ok(result?)
    }

    /// Recompute local flags; announce them if they changed.
    fn sync_local_flags(&mut self) {
        let mut flags = self.media.flags();
        flags.hand_raised = self.session.hands.is_raised(&self.session.local.id);
        if flags != self.session.local.flags {
            self.session.local.flags = flags;
            self.emitter.emit(HuddleEvent::LocalFlagsChanged(flags));
            self.publish_local_state();
        }
    }

    fn publish_local_state(&self) {
        let message = SignalMessage::StateUpdate {
            from: self.session.local.id.clone(),
            flags: self.session.local.flags,
            display_name: Some(self.session.local.display_name.clone()),
            hand_raised_at: self.local_hand_raised_at.clone(),
        };
        if let Err(e) = self.session.transport.send(message) {
            tracing::debug!("state update not sent: {e}");
        }
    }

    fn set_signaling_state(&mut self, state: ConnectionState) {
        if self.signaling_state == state {
            return;
        }
        tracing::info!("signaling {:?} -> {:?}", self.signaling_state, state);
        self.signaling_state = state;
        self.emitter.emit(HuddleEvent::ConnectionStateChanged(state));
    }

    /// Re-project and publish the render model if it changed.
    fn refresh(&mut self) {
        let input = projection_input(&self.session, &self.media, self.signaling_state);
        let model = self.projector.project(input);
        self.render.send_if_modified(|current| {
            if Arc::ptr_eq(current, &model) {
                false
            } else {
                *current = model;
                true
            }
        });
    }

    fn ensure_active(&self) -> Result<(), HuddleError> {
        if self.ended {
            Err(HuddleError::Session("session has ended".into()))
        } else {
            Ok(())
        }
    }

    async fn teardown(&mut self, error: Option<HuddleError>) {
        if self.ended {
            return;
        }
        self.ended = true;
        match &error {
            Some(e) => tracing::error!(room = %self.session.room_id, "session ended: {e}"),
            None => tracing::info!(room = %self.session.room_id, "leaving room"),
        }

        for timer in self.timers.drain(..) {
            timer.abort();
        }
        for peer in self.peers.close_all() {
            self.emitter.emit(HuddleEvent::PeerStateChanged {
                participant_id: peer,
                state: NegotiationState::Closed,
            });
        }
        self.session.transport.close().await;
        self.media.release_all();
        self.session.participants.clear();
        self.session.hands.clear();
        self.local_hand_raised_at = None;
        self.session.local.flags = self.media.flags();

        self.set_signaling_state(ConnectionState::Disconnected);
        self.refresh();
        self.emitter.emit(HuddleEvent::SessionEnded(error));
    }
}

fn projection_input(
    session: &RoomSession,
    media: &MediaDeviceController,
    signaling: ConnectionState,
) -> ProjectionInput {
    ProjectionInput {
        local_id: session.local.id.clone(),
        local_name: session.local.display_name.clone(),
        local_flags: session.local.flags,
        local_stream: media.local_stream(),
        participants: session.participants.snapshot(),
        hand_raise: session.hands.positions(),
        signaling,
        notices: media.notices().to_vec(),
    }
}

fn check_recipient(
    local: &ParticipantId,
    to: &ParticipantId,
    kind: &'static str,
) -> Result<(), ProtocolError> {
    if to == local {
        Ok(())
    } else {
        Err(ProtocolError::Misaddressed(format!("{kind} for {to}")))
    }
}

fn join_cancelled() -> HuddleError {
    HuddleError::Session("join cancelled".into())
}

/// Resolves once `cancel` is set, or its sender is gone. Never resolves without one.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Requests accepted by a spawned session.
#[derive(Debug)]
pub enum SessionCommand {
    SetAudioMuted {
        muted: bool,
        reply: oneshot::Sender<Result<bool, HuddleError>>,
    },
    SetCameraOff {
        off: bool,
        reply: oneshot::Sender<Result<bool, HuddleError>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<LocalTrack, HuddleError>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<bool, HuddleError>>,
    },
    RaiseHand {
        reply: oneshot::Sender<Result<u32, HuddleError>>,
    },
    LowerHand {
        reply: oneshot::Sender<Result<bool, HuddleError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

type JoinOutcome = Result<watch::Receiver<Arc<RenderModel>>, HuddleError>;

/// A session running on its own task.
///
/// Dropping the handle leaves the room; cancelling it aborts a join in progress.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    cancel: watch::Sender<bool>,
    joined: Option<oneshot::Receiver<JoinOutcome>>,
    render: Option<watch::Receiver<Arc<RenderModel>>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn(
        config: SessionConfig,
        backends: SessionBackends,
        request: JoinRequest,
        emitter: EventEmitter,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(32);
        let (cancel, cancel_rx) = watch::channel(false);
        let (joined_tx, joined_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let joined =
                SessionController::join_inner(config, backends, request, emitter, Some(cancel_rx)).await;
            match joined {
                Ok(controller) => {
                    let _ = joined_tx.send(Ok(controller.subscribe_render()));
                    controller.run(command_rx).await;
                }
                Err(e) => {
                    let _ = joined_tx.send(Err(e));
                }
            }
        });

        Self {
            commands,
            cancel,
            joined: Some(joined_rx),
            render: None,
            task,
        }
    }

    /// Wait for the join to finish.
    pub async fn wait_joined(&mut self) -> Result<(), HuddleError> {
        if self.render.is_some() {
            return Ok(());
        }
        let Some(joined) = self.joined.take() else {
            return Err(HuddleError::Session("join already failed".into()));
        };
        match joined.await {
            Ok(Ok(render)) => {
                self.render = Some(render);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(session_gone()),
        }
    }

    /// Abort a join that is still in progress. No effect once joined.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Latest render model, once joined.
    pub fn render(&self) -> Option<Arc<RenderModel>> {
        self.render.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn subscribe_render(&self) -> Option<watch::Receiver<Arc<RenderModel>>> {
        self.render.clone()
    }

    pub async fn set_audio_muted(&self, muted: bool) -> Result<bool, HuddleError> {
        self.request(|reply| SessionCommand::SetAudioMuted { muted, reply })
            .await
    }

    pub async fn set_camera_off(&self, off: bool) -> Result<bool, HuddleError> {
        self.request(|reply| SessionCommand::SetCameraOff { off, reply })
            .await
    }

    pub async fn start_screen_share(&self) -> Result<LocalTrack, HuddleError> {
        self.request(|reply| SessionCommand::StartScreenShare { reply })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<bool, HuddleError> {
        self.request(|reply| SessionCommand::StopScreenShare { reply })
            .await
    }

    pub async fn raise_hand(&self) -> Result<u32, HuddleError> {
        self.request(|reply| SessionCommand::RaiseHand { reply }).await
    }

    pub async fn lower_hand(&self) -> Result<bool, HuddleError> {
        self.request(|reply| SessionCommand::LowerHand { reply }).await
    }

    /// Leave the room (or abandon the join) and wait for teardown to finish.
    pub async fn leave(self) {
        self.cancel.send_replace(true);
        let (reply, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Leave { reply }).await.is_ok() {
            let _ = done.await;
        }
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::warn!("session task ended abnormally: {e}");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, HuddleError>>) -> SessionCommand,
    ) -> Result<T, HuddleError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| session_gone())?;
        response.await.map_err(|_| session_gone())?
    }
}

fn session_gone() -> HuddleError {
    HuddleError::Session("session is not running".into())
}
