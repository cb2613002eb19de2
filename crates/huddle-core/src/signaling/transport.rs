//! Persistent signaling channel with automatic reconnect.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::{ProtocolError, TransportError};
use crate::settings::SignalingConfig;
use crate::signaling::backoff::Backoff;
use crate::signaling::outbox::OutboundQueue;
use crate::signaling::protocol::{Presence, SignalMessage};
use crate::types::ParticipantId;

/// Opens links to a signaling server.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Connect and announce `presence`. Reconnects reuse the same presence so
    /// the server resumes the membership.
    async fn connect(&self, presence: &Presence) -> Result<Box<dyn SignalingLink>, TransportError>;
}

/// One established connection.
#[async_trait]
pub trait SignalingLink: Send {
    async fn send(&mut self, message: &SignalMessage) -> Result<(), TransportError>;

    /// Next inbound message, `None` once the link is gone. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<SignalMessage, ProtocolError>>;

    async fn close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(SignalMessage),
    /// The link dropped; reconnect attempt `attempt` is scheduled.
    Reconnecting { attempt: u32 },
    /// A new link is up and accepting sends.
    Reconnected,
    /// A description or candidate for `to` was accepted by `send` but never
    /// written before the link dropped.
    Undelivered { to: ParticipantId },
    /// Reconnecting gave up. No further events follow.
    Fatal(TransportError),
}

/// Inbound side of the transport: an endless sequence that keeps delivering
/// across reconnects. History is not replayed; consumers must tolerate
/// duplicate membership events after a reconnect.
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportEvents {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

impl futures_util::Stream for TransportEvents {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// State shared between callers of `send` and the connection task.
struct Outbox {
    writer: Option<mpsc::UnboundedSender<SignalMessage>>,
    queue: OutboundQueue,
    closed: bool,
    fatal: Option<TransportError>,
}

impl Outbox {
    fn connected(&self) -> bool {
        self.writer.is_some()
    }
}

pub struct SignalingTransport {
    presence: Presence,
    shared: Arc<Mutex<Outbox>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingTransport {
    /// Open the first connection. A failure here is returned rather than retried.
    pub async fn connect(
        connector: Arc<dyn SignalingConnector>,
        presence: Presence,
        config: SignalingConfig,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let link = connect_once(connector.as_ref(), &presence, config.connect_timeout()).await?;
        tracing::info!(
            room = %presence.room_id,
            participant = %presence.participant_id,
            "signaling connected"
        );

        let shared = Arc::new(Mutex::new(Outbox {
            writer: None,
            queue: OutboundQueue::new(config.outbox_capacity),
            closed: false,
            fatal: None,
        }));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(connection_loop(
            connector,
            presence.clone(),
            config,
            shared.clone(),
            event_tx,
            link,
        ));

        // The writer is attached by the task; until then sends are queued.
        Ok((
            Self {
                presence,
                shared,
                task: Some(task),
            },
            TransportEvents { rx: event_rx },
        ))
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).connected()
    }

    /// Send a message, or queue it while disconnected.
    ///
    /// Descriptions and candidates are never queued: while disconnected they
    /// fail with `NotConnected` so the caller can restart negotiation.
    pub fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        let mut outbox = lock(&self.shared);
        if let Some(err) = &outbox.fatal {
            return Err(err.clone());
        }
        if outbox.closed {
            return Err(TransportError::Closed);
        }

        if let Some(writer) = &outbox.writer {
            match writer.send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(message)) => {
                    // Link task already gone; fall through to the disconnected path.
                    outbox.writer = None;
                    return queue_or_refuse(&mut outbox, message);
                }
            }
        }
        queue_or_refuse(&mut outbox, message)
    }

    /// Send `leave` if possible and stop the connection task. Idempotent.
    pub async fn close(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        {
            let mut outbox = lock(&self.shared);
            let leave = self.presence.leave_message();
            match outbox.writer.take() {
                Some(writer) => {
                    let _ = writer.send(leave);
                }
                None => {
                    let _ = outbox.queue.push(leave);
                }
            }
            outbox.closed = true;
        }
        // The task drains the writer, closes the link and exits.
        if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
            task.abort();
        }
        tracing::info!(room = %self.presence.room_id, "signaling closed");
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn lock(shared: &Mutex<Outbox>) -> MutexGuard<'_, Outbox> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

fn queue_or_refuse(outbox: &mut Outbox, message: SignalMessage) -> Result<(), TransportError> {
    let kind = message.kind();
    if let Some(dropped) = outbox.queue.push(message)? {
        tracing::debug!("outbox full, dropped queued {}", dropped.kind());
    }
    tracing::debug!("queued {kind} while disconnected ({} pending)", outbox.queue.len());
    Ok(())
}

async fn connect_once(
    connector: &dyn SignalingConnector,
    presence: &Presence,
    timeout: Duration,
) -> Result<Box<dyn SignalingLink>, TransportError> {
    match tokio::time::timeout(timeout, connector.connect(presence)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Connect(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Why a link stopped.
enum LinkEnd {
    Dropped,
    Closed,
}

async fn connection_loop(
    connector: Arc<dyn SignalingConnector>,
    presence: Presence,
    config: SignalingConfig,
    shared: Arc<Mutex<Outbox>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut link: Box<dyn SignalingLink>,
) {
    let mut backoff = Backoff::from_config(&config);
    let mut rng = StdRng::from_entropy();
    let max_down = config.max_reconnect_duration();

    let mut reconnected = false;
    loop {
        if let LinkEnd::Closed = pump(link.as_mut(), &shared, &event_tx, reconnected).await {
            link.close().await;
            return;
        }
        link.close().await;
        tracing::warn!(room = %presence.room_id, "signaling link dropped");

        let down_since = Instant::now();
        backoff.reset();
        link = loop {
            let attempt = backoff.attempt() + 1;
            let remaining = max_down.saturating_sub(down_since.elapsed());
            if remaining.is_zero() {
                give_up(&shared, &event_tx, max_down);
                return;
            }
            let _ = event_tx.send(TransportEvent::Reconnecting { attempt });
            let delay = backoff.next_delay(&mut rng).min(remaining);
            tracing::info!("reconnecting signaling in {}ms (attempt {attempt})", delay.as_millis());
            tokio::time::sleep(delay).await;

            if lock(&shared).closed {
                return;
            }
            match connect_once(connector.as_ref(), &presence, config.connect_timeout()).await {
                Ok(link) => {
                    tracing::info!(room = %presence.room_id, "signaling reconnected after {attempt} attempt(s)");
                    reconnected = true;
                    break link;
                }
                Err(e) => tracing::warn!("signaling reconnect attempt {attempt} failed: {e}"),
            }
        };
    }
}

fn give_up(
    shared: &Mutex<Outbox>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    max_down: Duration,
) {
    let err = TransportError::SignalingUnavailable {
        secs: max_down.as_secs(),
    };
    tracing::error!("{err}");
    lock(shared).fatal = Some(err.clone());
    let _ = event_tx.send(TransportEvent::Fatal(err));
}

/// Move messages over one link until it drops or the transport is closed.
async fn pump(
    link: &mut dyn SignalingLink,
    shared: &Mutex<Outbox>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    reconnected: bool,
) -> LinkEnd {
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    let pending_on_close = {
        let mut outbox = lock(shared);
        if outbox.closed {
            Some(outbox.queue.drain().collect::<Vec<_>>())
        } else {
            // Flush queued traffic ahead of anything sent from now on.
            for message in outbox.queue.drain() {
                let _ = writer_tx.send(message);
            }
            outbox.writer = Some(writer_tx);
            if reconnected {
                let _ = event_tx.send(TransportEvent::Reconnected);
            }
            None
        }
    };
    if let Some(pending) = pending_on_close {
        for message in pending {
            let _ = link.send(&message).await;
        }
        return LinkEnd::Closed;
    }

    let mut unwritten = None;
    let end = loop {
        tokio::select! {
            outbound = writer_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = link.send(&message).await {
                        tracing::warn!("failed to send {}: {e}", message.kind());
                        unwritten = Some(message);
                        break LinkEnd::Dropped;
                    }
                }
                None => break LinkEnd::Closed,
            },
            inbound = link.recv() => match inbound {
                Some(Ok(message)) => {
                    tracing::debug!("signaling <- {}", message.kind());
                    if event_tx.send(TransportEvent::Message(message)).is_err() {
                        break LinkEnd::Closed;
                    }
                }
                Some(Err(e)) => tracing::warn!("dropping signaling message: {e}"),
                None => break LinkEnd::Dropped,
            },
        }
    };

    if let LinkEnd::Dropped = end {
        let mut outbox = lock(shared);
        outbox.writer = None;
        let pending = unwritten
            .into_iter()
            .chain(std::iter::from_fn(|| writer_rx.try_recv().ok()));
        let mut reported = BTreeSet::new();
        for message in pending {
            requeue_or_report(&mut outbox, message, event_tx, &mut reported);
        }
        if outbox.closed {
            return LinkEnd::Closed;
        }
    } else {
        // Closed: flush what the caller handed over before closing (the leave).
        while let Ok(message) = writer_rx.try_recv() {
            let _ = link.send(&message).await;
        }
    }
    end
}

/// Put a message the dropped link never wrote back in the queue. Descriptions
/// and candidates cannot be queued, so their recipient is reported instead,
/// once per drop.
fn requeue_or_report(
    outbox: &mut Outbox,
    message: SignalMessage,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    reported: &mut BTreeSet<ParticipantId>,
) {
    if let Some(to) = message.recipient() {
        tracing::debug!(peer = %to, "{} not delivered before the link dropped", message.kind());
        if reported.insert(to.clone()) {
            let _ = event_tx.send(TransportEvent::Undelivered { to: to.clone() });
        }
        return;
    }
    match outbox.queue.push(message) {
        Ok(Some(dropped)) => tracing::debug!("outbox full, dropped queued {}", dropped.kind()),
        Ok(None) => {}
        Err(e) => tracing::debug!("discarding unsent message on link drop: {e}"),
    }
}
