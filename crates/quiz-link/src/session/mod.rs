//! One peer link: negotiation, liveness, recovery and reliable delivery,
//! driven by a single actor task.
//!
//! All session state lives inside the actor. Callers talk to it through a
//! [`LinkHandle`], observe it through [`LinkStatus`] and receive application
//! traffic as [`LinkEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::delivery::dedup::{InboundDeduplicator, InboundVerdict};
use crate::delivery::{DeliveryEvent, EnqueueOutcome, ReliableDeliveryEngine};
use crate::envelope::{Envelope, MessageKind, OutboundMessage};
use crate::error::{LinkError, LinkResult};
use crate::liveness::{LivenessMonitor, LivenessStatus};
use crate::peer::{ChannelState, ConnectionState, PeerEvent, PeerEvents, PeerTransport};
use crate::signaling::{Role, SignalingClient, SignalingEvent, SignalingRelay};

pub mod negotiation;

use negotiation::{Negotiator, StuckReason, Watchdog};

/// Observable state of a link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub connection: ConnectionState,
    pub channel: ChannelState,
    pub liveness: LivenessStatus,
    /// The polling window elapsed before the peer ever connected.
    pub expired: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            channel: ChannelState::Connecting,
            liveness: LivenessStatus::Connected,
            expired: false,
        }
    }
}

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// First delivery of an inbound application message.
    Message(Envelope),
    Delivery(DeliveryEvent),
}

enum Command {
    Send {
        message: OutboundMessage,
        reply: oneshot::Sender<LinkResult<EnqueueOutcome>>,
    },
    Reconnect {
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable command surface of a running link.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    /// Queue a message for delivery. Answer-class messages whose logical key
    /// already completed come back as [`EnqueueOutcome::AlreadyComplete`];
    /// ones whose previous answer is still awaiting its ack come back as
    /// [`EnqueueOutcome::AnswerInFlight`].
    pub async fn send(&self, message: OutboundMessage) -> LinkResult<EnqueueOutcome> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send { message, reply })
            .map_err(|_| LinkError::Closed)?;
        response.await.map_err(|_| LinkError::Closed)?
    }

    pub async fn send_unreliable(
        &self,
        kind: impl Into<MessageKind>,
        payload: Value,
    ) -> LinkResult<()> {
        self.send(OutboundMessage::new(kind, payload).unreliable())
            .await
            .map(|_| ())
    }

    pub async fn send_answer(
        &self,
        quiz_id: impl Into<String>,
        payload: Value,
    ) -> LinkResult<EnqueueOutcome> {
        self.send(OutboundMessage::answer(quiz_id, payload)).await
    }

    /// Renegotiate now, skipping the watchdog and its jitter.
    pub async fn reconnect(&self) -> LinkResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Reconnect { reply })
            .map_err(|_| LinkError::Closed)?;
        response.await.map_err(|_| LinkError::Closed)?
    }

    pub async fn close(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = response.await;
        }
    }
}

pub struct PeerLink {
    handle: LinkHandle,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    status: watch::Receiver<LinkStatus>,
    session_id: String,
    participant_id: Option<String>,
    establish_timeout: Duration,
    task: JoinHandle<()>,
}

impl PeerLink {
    /// Start as creator: publish the initial offer, then run the session.
    pub async fn create(
        config: LinkConfig,
        relay: Arc<dyn SignalingRelay>,
        transport: Arc<dyn PeerTransport>,
        peer_events: PeerEvents,
    ) -> LinkResult<Self> {
        let mut signaling = SignalingClient::new(relay, Role::Creator, None, None);
        let mut negotiator = Negotiator::new(Role::Creator);
        let session_id = negotiator
            .start_creator(&*transport, &mut signaling)
            .await?;
        Self::spawn(config, signaling, negotiator, transport, peer_events, session_id)
    }

    /// Start as participant of an existing (or soon to exist) session.
    pub async fn join(
        config: LinkConfig,
        relay: Arc<dyn SignalingRelay>,
        transport: Arc<dyn PeerTransport>,
        peer_events: PeerEvents,
        session_id: impl Into<String>,
    ) -> LinkResult<Self> {
        let session_id = session_id.into();
        let participant_id = uuid::Uuid::new_v4().to_string();
        let signaling = SignalingClient::new(
            relay,
            Role::Participant,
            Some(session_id.clone()),
            Some(participant_id),
        );
        let negotiator = Negotiator::new(Role::Participant);
        Self::spawn(config, signaling, negotiator, transport, peer_events, session_id)
    }

    fn spawn(
        config: LinkConfig,
        signaling: SignalingClient,
        negotiator: Negotiator,
        transport: Arc<dyn PeerTransport>,
        peer_events: PeerEvents,
        session_id: String,
    ) -> LinkResult<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let (connected_tx, connected_rx) = watch::channel(false);

        let poller = signaling.spawn_poller(config.polling.clone(), signal_tx, connected_rx)?;
        let role = signaling.role();
        let participant_id = signaling.participant_id().map(str::to_string);
        let now = Instant::now();

        info!(
            target = "quiz_link::session",
            session_id = %session_id,
            ?role,
            participant_id = ?participant_id,
            "session started"
        );

        let actor = SessionActor {
            session: PeerSession {
                role,
                session_id: session_id.clone(),
                participant_id: participant_id.clone(),
                connection_state: ConnectionState::New,
                channel_state: ChannelState::Connecting,
                last_state_change_at: now,
            },
            delivery: ReliableDeliveryEngine::new(config.delivery.clone(), participant_id.clone()),
            inbound: InboundDeduplicator::new(config.delivery.inbound_history),
            liveness: LivenessMonitor::new(config.liveness.clone()),
            watchdog: Watchdog::new(config.watchdog.clone(), now),
            config: config.clone(),
            transport,
            signaling,
            negotiator,
            events: event_tx,
            status: status_tx,
            connected: connected_tx,
            poller,
            recovery_at: None,
            established: false,
        };
        let task = tokio::spawn(actor.run(command_rx, peer_events, signal_rx));

        Ok(Self {
            handle: LinkHandle {
                commands: command_tx,
            },
            events: event_rx,
            status: status_rx,
            session_id,
            participant_id,
            establish_timeout: config.establish_timeout,
            task,
        })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Resolve once the data channel is open. Fails if the session cannot be
    /// established within the configured bound or the polling window ends
    /// first.
    pub async fn wait_until_open(&self) -> LinkResult<()> {
        let limit = self.establish_timeout;
        let mut status = self.status.clone();
        let wait = async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if current.channel == ChannelState::Open {
                        return Ok(());
                    }
                    if current.expired {
                        return Err(LinkError::EstablishTimeout(limit));
                    }
                    if current.connection == ConnectionState::Closed {
                        return Err(LinkError::Closed);
                    }
                }
                if status.changed().await.is_err() {
                    return Err(LinkError::Closed);
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| LinkError::EstablishTimeout(limit))?
    }

    /// Close the link and wait for the actor to finish.
    pub async fn close(self) {
        self.handle.close().await;
        let _ = self.task.await;
    }
}

struct PeerSession {
    role: Role,
    session_id: String,
    participant_id: Option<String>,
    connection_state: ConnectionState,
    channel_state: ChannelState,
    last_state_change_at: Instant,
}

struct SessionActor {
    session: PeerSession,
    config: LinkConfig,
    transport: Arc<dyn PeerTransport>,
    signaling: SignalingClient,
    negotiator: Negotiator,
    delivery: ReliableDeliveryEngine,
    inbound: InboundDeduplicator,
    liveness: LivenessMonitor,
    watchdog: Watchdog,
    events: mpsc::UnboundedSender<LinkEvent>,
    status: watch::Sender<LinkStatus>,
    connected: watch::Sender<bool>,
    poller: JoinHandle<()>,
    recovery_at: Option<Instant>,
    established: bool,
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peer_events: PeerEvents,
        mut signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let mut retry = interval(self.config.delivery.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(self.config.liveness.interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = interval(self.config.watchdog.check_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let ack_deadline = self.delivery.next_deadline();
            let recovery_at = self.recovery_at;
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Send { message, reply }) => {
                            let _ = reply.send(self.enqueue(message));
                        }
                        Some(Command::Reconnect { reply }) => {
                            self.recovery_at = None;
                            let _ = reply.send(self.recover().await);
                        }
                        Some(Command::Close { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        None => break,
                    }
                }
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                Some(event) = signaling_events.recv() => self.handle_signaling_event(event).await,
                _ = retry.tick() => self.retry_sweep(),
                _ = heartbeat.tick() => self.heartbeat_tick(),
                _ = watchdog.tick() => self.watchdog_tick().await,
                _ = sleep_until_some(ack_deadline) => {
                    self.delivery.expire_ack_timeouts(Instant::now());
                    self.forward_delivery_events();
                }
                _ = sleep_until_some(recovery_at) => {
                    self.recovery_at = None;
                    let _ = self.recover().await;
                }
            }
        }
        self.shutdown().await;
    }

    fn enqueue(&mut self, message: OutboundMessage) -> LinkResult<EnqueueOutcome> {
        let logical_key = message.logical_key().map(str::to_string);
        let outcome = self
            .delivery
            .enqueue(message, &*self.transport, Instant::now());
        match (&outcome, logical_key) {
            (Ok(EnqueueOutcome::AlreadyComplete), Some(key)) => debug!(
                target = "quiz_link::session",
                error = %LinkError::StaleOperation(key),
                "send skipped"
            ),
            (Ok(EnqueueOutcome::AnswerInFlight(id)), Some(key)) => debug!(
                target = "quiz_link::session",
                logical_key = %key,
                in_flight = %id,
                "answer awaiting ack; send skipped"
            ),
            _ => {}
        }
        self.forward_delivery_events();
        outcome
    }

    fn retry_sweep(&mut self) {
        let sent = self
            .delivery
            .retry_sweep(&*self.transport, Instant::now());
        if sent > 0 {
            trace!(target = "quiz_link::session", sent, "retry sweep transmitted");
        }
        self.forward_delivery_events();
    }

    fn forward_delivery_events(&mut self) {
        for event in self.delivery.drain_events() {
            if let DeliveryEvent::Exhausted { id, attempts } = &event {
                warn!(
                    target = "quiz_link::session",
                    error = %LinkError::DeliveryExhausted {
                        id: id.clone(),
                        attempts: *attempts,
                    },
                    "reliable delivery gave up"
                );
            }
            let _ = self.events.send(LinkEvent::Delivery(event));
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.negotiator
                    .publish_local_candidate(candidate, &mut self.signaling)
                    .await;
            }
            PeerEvent::ConnectionState(state) => self.set_connection_state(state),
            PeerEvent::IceFailed => {
                warn!(target = "quiz_link::session", "transport reported ICE failure");
                self.watchdog.mark_ice_failed();
            }
            PeerEvent::ChannelState(state) => self.set_channel_state(state).await,
            PeerEvent::Inbound(bytes) => self.handle_inbound(&bytes),
        }
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::RemoteDescription(description) => {
                if let Err(err) = self
                    .negotiator
                    .on_remote_description(description, &*self.transport, &mut self.signaling)
                    .await
                {
                    warn!(
                        target = "quiz_link::session",
                        error = %err,
                        "failed to apply remote description"
                    );
                }
            }
            SignalingEvent::RemoteCandidate(candidate) => {
                self.negotiator
                    .on_remote_candidate(candidate, &*self.transport)
                    .await;
            }
            SignalingEvent::Expired => {
                if !self.established {
                    warn!(
                        target = "quiz_link::session",
                        session_id = %self.session.session_id,
                        "session could not be established"
                    );
                    self.status.send_modify(|status| status.expired = true);
                }
            }
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        let now = Instant::now();
        self.watchdog.observe(state, now);
        let _ = self.connected.send_replace(state == ConnectionState::Connected);
        if self.session.connection_state == state {
            return;
        }
        info!(
            target = "quiz_link::session",
            session_id = %self.session.session_id,
            from = ?self.session.connection_state,
            to = ?state,
            held = ?now.duration_since(self.session.last_state_change_at),
            "connection state changed"
        );
        self.session.connection_state = state;
        self.session.last_state_change_at = now;
        self.publish_status();
    }

    async fn set_channel_state(&mut self, state: ChannelState) {
        let previous = self.session.channel_state;
        self.session.channel_state = state;
        if state == ChannelState::Open {
            self.liveness.reset();
        }
        self.publish_status();
        match state {
            ChannelState::Open if previous != ChannelState::Open => {
                info!(
                    target = "quiz_link::session",
                    session_id = %self.session.session_id,
                    role = ?self.session.role,
                    "data channel open"
                );
                self.established = true;
                self.retry_sweep();
            }
            ChannelState::Closed
                if self.transport.connection_state() == ConnectionState::Connected =>
            {
                info!(
                    target = "quiz_link::session",
                    "data channel closed under a live connection; replacing it"
                );
                self.replace_channel().await;
            }
            _ => {}
        }
    }

    /// A failure here is picked up again by the watchdog.
    async fn replace_channel(&mut self) {
        if let Err(err) = self.transport.recreate_channel().await {
            warn!(
                target = "quiz_link::session",
                session_id = %self.session.session_id,
                error = %err,
                "channel replacement failed"
            );
        }
    }

    fn handle_inbound(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    target = "quiz_link::session",
                    error = %LinkError::Codec(err),
                    "dropping undecodable frame"
                );
                return;
            }
        };

        match envelope.kind {
            MessageKind::Heartbeat => {
                if let Some(echo) = Envelope::heartbeat_response_to(&envelope) {
                    self.send_raw(&echo);
                }
            }
            MessageKind::HeartbeatResponse => {
                let Some(seq) = envelope.heartbeat_seq() else {
                    return;
                };
                if self.liveness.on_response(seq, Instant::now()) {
                    if self.session.connection_state == ConnectionState::Disconnected
                        && self.transport.is_open()
                    {
                        debug!(
                            target = "quiz_link::session",
                            "heartbeat answered while transport reports disconnected"
                        );
                        self.set_connection_state(ConnectionState::Connected);
                    }
                    self.publish_status();
                }
            }
            MessageKind::Ack => {
                if let Some(id) = envelope.correlation_id.as_deref() {
                    self.delivery.acknowledge(id);
                    self.forward_delivery_events();
                }
            }
            _ => {
                let verdict = self.inbound.observe(&envelope);
                let ack = verdict.ack().map(str::to_string);
                match verdict {
                    InboundVerdict::Deliver { .. } => {
                        let _ = self.events.send(LinkEvent::Message(envelope));
                    }
                    InboundVerdict::Duplicate { .. } => {
                        trace!(
                            target = "quiz_link::session",
                            error = %LinkError::DuplicateSuppressed(ack.clone().unwrap_or_default()),
                            "inbound duplicate"
                        );
                    }
                }
                if let Some(id) = ack {
                    self.send_raw(&Envelope::ack(id));
                }
            }
        }
    }

    /// Transmit link plumbing directly, outside the delivery queue.
    fn send_raw(&self, envelope: &Envelope) {
        let result = envelope
            .encode()
            .map_err(LinkError::from)
            .and_then(|bytes| self.transport.send(bytes));
        if let Err(err) = result {
            trace!(
                target = "quiz_link::session",
                kind = %envelope.kind,
                error = %err,
                "control frame not sent"
            );
        }
    }

    fn heartbeat_tick(&mut self) {
        if !self.established {
            return;
        }
        let before = self.liveness.status();
        let tick = self.liveness.tick(
            Instant::now(),
            self.transport.is_open(),
            self.transport.connection_state(),
        );
        if let Some(heartbeat) = &tick.heartbeat {
            self.send_raw(heartbeat);
        }
        if tick.status != before {
            self.publish_status();
        }
        if tick.escalate {
            self.set_connection_state(ConnectionState::Disconnected);
            self.schedule_recovery("liveness");
        }
    }

    async fn watchdog_tick(&mut self) {
        let now = Instant::now();
        self.watchdog.observe(self.transport.connection_state(), now);
        if self.established {
            self.watchdog.observe_channel(self.transport.channel_state(), now);
        }
        self.negotiator
            .flush_local_candidates(&mut self.signaling)
            .await;
        if let Some(reason) = self.watchdog.check(now) {
            let label = match reason {
                StuckReason::Disconnected(_) => "disconnected",
                StuckReason::Connecting(_) => "connecting",
                StuckReason::IceFailed => "ice_failed",
                StuckReason::Failed => "failed",
                StuckReason::ChannelLost(lost)
                    if lost <= self.config.watchdog.disconnected_threshold =>
                {
                    info!(
                        target = "quiz_link::session",
                        session_id = %self.session.session_id,
                        lost_for = ?lost,
                        "data channel still down under a live connection; retrying replacement"
                    );
                    self.replace_channel().await;
                    return;
                }
                StuckReason::ChannelLost(_) => "channel_lost",
            };
            self.schedule_recovery(label);
        }
    }

    fn schedule_recovery(&mut self, reason: &str) {
        if self.recovery_at.is_some() {
            return;
        }
        let delay = self.watchdog.jitter();
        info!(
            target = "quiz_link::session",
            session_id = %self.session.session_id,
            reason,
            delay = ?delay,
            "scheduling recovery"
        );
        self.recovery_at = Some(Instant::now() + delay);
    }

    async fn recover(&mut self) -> LinkResult<()> {
        match self
            .negotiator
            .recover(&*self.transport, &mut self.signaling)
            .await
        {
            Ok(()) => {
                self.watchdog.reset(Instant::now());
                info!(
                    target = "quiz_link::session",
                    session_id = %self.session.session_id,
                    role = ?self.session.role,
                    "recovery negotiation sent"
                );
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    LinkError::NegotiationFailed(_) => err,
                    other => LinkError::negotiation(other),
                };
                warn!(
                    target = "quiz_link::session",
                    error = %err,
                    "recovery attempt failed"
                );
                Err(err)
            }
        }
    }

    fn publish_status(&self) {
        let status = LinkStatus {
            connection: self.session.connection_state,
            channel: self.session.channel_state,
            liveness: self.liveness.status(),
            expired: self.status.borrow().expired,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        self.poller.abort();
        self.delivery.clear();
        self.transport.close().await;
        self.session.channel_state = ChannelState::Closed;
        self.session.connection_state = ConnectionState::Closed;
        let _ = self.connected.send_replace(false);
        self.publish_status();
        info!(
            target = "quiz_link::session",
            session_id = %self.session.session_id,
            participant_id = ?self.session.participant_id,
            "session closed"
        );
    }
}
