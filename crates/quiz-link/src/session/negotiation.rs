//! Offer/answer exchange, ICE candidate bookkeeping and the stuck-connection
//! watchdog.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::WatchdogConfig;
use crate::error::{LinkError, LinkResult};
use crate::peer::{ChannelState, ConnectionState, PeerTransport};
use crate::signaling::{IceCandidate, Role, SdpType, SessionDescription, SignalingClient};

/// Negotiation bookkeeping for one session.
///
/// Remote candidates are never applied before a remote description exists,
/// and a candidate key is applied at most once. Keys are marked processed
/// even if the transport rejects the candidate.
#[derive(Debug)]
pub struct Negotiator {
    role: Role,
    pending_remote: VecDeque<IceCandidate>,
    processed_keys: HashSet<String>,
    pending_local: Vec<IceCandidate>,
    awaiting_answer: bool,
    applied_answer: Option<String>,
    answered_offer: Option<String>,
}

impl Negotiator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            pending_remote: VecDeque::new(),
            processed_keys: HashSet::new(),
            pending_local: Vec::new(),
            awaiting_answer: false,
            applied_answer: None,
            answered_offer: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn is_processed(&self, candidate: &IceCandidate) -> bool {
        self.processed_keys.contains(&candidate.key())
    }

    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    /// Creator: generate and publish the initial offer, creating the relay
    /// session. Returns the session id.
    pub async fn start_creator(
        &mut self,
        transport: &dyn PeerTransport,
        signaling: &mut SignalingClient,
    ) -> LinkResult<String> {
        let offer = transport.create_offer(false).await?;
        transport.set_local_description(offer.clone()).await?;
        let session_id = signaling.create_session(&offer).await?;
        self.awaiting_answer = true;
        self.flush_local_candidates(signaling).await;
        Ok(session_id)
    }

    /// Apply a description delivered by the poller. Returns whether it was
    /// applied.
    pub async fn on_remote_description(
        &mut self,
        description: SessionDescription,
        transport: &dyn PeerTransport,
        signaling: &mut SignalingClient,
    ) -> LinkResult<bool> {
        match (self.role, description.sdp_type) {
            (Role::Creator, SdpType::Answer) => self.accept_answer(description, transport).await,
            (Role::Participant, SdpType::Offer) => {
                if self.answered_offer.as_deref() == Some(description.sdp.as_str()) {
                    trace!(target = "quiz_link::session", "offer already answered");
                    return Ok(false);
                }
                self.answer_offer(description, transport, signaling).await?;
                Ok(true)
            }
            (role, sdp_type) => {
                debug!(
                    target = "quiz_link::session",
                    ?role,
                    ?sdp_type,
                    "ignoring description of unexpected type"
                );
                Ok(false)
            }
        }
    }

    async fn accept_answer(
        &mut self,
        answer: SessionDescription,
        transport: &dyn PeerTransport,
    ) -> LinkResult<bool> {
        if !self.awaiting_answer {
            debug!(
                target = "quiz_link::session",
                "answer arrived with no offer outstanding; ignored"
            );
            return Ok(false);
        }
        if self.applied_answer.as_deref() == Some(answer.sdp.as_str()) {
            return Ok(false);
        }
        let sdp = answer.sdp.clone();
        transport.set_remote_description(answer).await?;
        self.applied_answer = Some(sdp);
        self.awaiting_answer = false;
        info!(target = "quiz_link::session", "remote answer applied");
        self.drain(transport).await;
        Ok(true)
    }

    async fn answer_offer(
        &mut self,
        offer: SessionDescription,
        transport: &dyn PeerTransport,
        signaling: &mut SignalingClient,
    ) -> LinkResult<()> {
        let offer_sdp = offer.sdp.clone();
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        signaling.submit_description(&answer).await?;
        self.answered_offer = Some(offer_sdp);
        info!(target = "quiz_link::session", "answer published");
        self.drain(transport).await;
        self.flush_local_candidates(signaling).await;
        Ok(())
    }

    pub async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        transport: &dyn PeerTransport,
    ) {
        let key = candidate.key();
        if self.processed_keys.contains(&key) {
            return;
        }
        if !transport.has_remote_description().await {
            if !self.pending_remote.iter().any(|queued| queued.key() == key) {
                trace!(
                    target = "quiz_link::session",
                    candidate = %candidate.candidate,
                    "buffering remote candidate until remote description is set"
                );
                self.pending_remote.push_back(candidate);
            }
            return;
        }
        self.apply(candidate, key, transport).await;
    }

    /// Apply buffered candidates in arrival order.
    pub async fn drain(&mut self, transport: &dyn PeerTransport) {
        while let Some(candidate) = self.pending_remote.pop_front() {
            let key = candidate.key();
            if self.processed_keys.contains(&key) {
                continue;
            }
            self.apply(candidate, key, transport).await;
        }
    }

    async fn apply(&mut self, candidate: IceCandidate, key: String, transport: &dyn PeerTransport) {
        self.processed_keys.insert(key);
        let text = candidate.candidate.clone();
        match transport.add_ice_candidate(candidate).await {
            Ok(()) => trace!(
                target = "quiz_link::session",
                candidate = %text,
                "remote candidate applied"
            ),
            Err(err) => warn!(
                target = "quiz_link::session",
                candidate = %text,
                error = %err,
                "failed to apply remote candidate"
            ),
        }
    }

    /// Publish a locally gathered candidate, holding it back until the relay
    /// session exists.
    pub async fn publish_local_candidate(
        &mut self,
        candidate: IceCandidate,
        signaling: &mut SignalingClient,
    ) {
        self.pending_local.push(candidate);
        if signaling.session_id().is_some() {
            self.flush_local_candidates(signaling).await;
        }
    }

    pub async fn flush_local_candidates(&mut self, signaling: &mut SignalingClient) {
        if signaling.session_id().is_none() {
            return;
        }
        let mut remaining = Vec::new();
        for candidate in std::mem::take(&mut self.pending_local) {
            if let Err(err) = signaling.submit_candidate(&candidate).await {
                warn!(
                    target = "quiz_link::session",
                    error = %err,
                    "failed to publish local candidate; will retry"
                );
                remaining.push(candidate);
            }
        }
        self.pending_local = remaining;
    }

    /// Renegotiate after the connection got stuck.
    pub async fn recover(
        &mut self,
        transport: &dyn PeerTransport,
        signaling: &mut SignalingClient,
    ) -> LinkResult<()> {
        match self.role {
            Role::Creator => {
                let offer = transport.create_offer(true).await?;
                transport.set_local_description(offer.clone()).await?;
                if signaling.session_id().is_some() {
                    signaling.submit_description(&offer).await?;
                } else {
                    signaling.create_session(&offer).await?;
                }
                self.awaiting_answer = true;
                info!(target = "quiz_link::session", "ice-restart offer published");
                self.flush_local_candidates(signaling).await;
            }
            Role::Participant => {
                let current = signaling.fetch_remote().await?;
                let offer = current
                    .remote_description
                    .filter(|description| description.sdp_type == SdpType::Offer)
                    .ok_or_else(|| LinkError::negotiation("no offer published to answer"))?;
                self.answer_offer(offer, transport, signaling).await?;
                for candidate in current.remote_ice_candidates {
                    self.on_remote_candidate(candidate, transport).await;
                }
            }
        }
        Ok(())
    }
}

/// Why the watchdog considers the connection stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    Disconnected(Duration),
    Connecting(Duration),
    IceFailed,
    Failed,
    /// The connection reports `Connected` but the data channel is not open.
    ChannelLost(Duration),
}

/// Tracks how long the connection has held its current state.
#[derive(Debug)]
pub struct Watchdog {
    config: WatchdogConfig,
    state: ConnectionState,
    since: Instant,
    ice_failed: bool,
    channel_lost_since: Option<Instant>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            config,
            state: ConnectionState::New,
            since: now,
            ice_failed: false,
            channel_lost_since: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn since(&self) -> Instant {
        self.since
    }

    pub fn observe(&mut self, state: ConnectionState, now: Instant) {
        if self.state != state {
            self.state = state;
            self.since = now;
            self.channel_lost_since = None;
        }
        if state == ConnectionState::Connected {
            self.ice_failed = false;
        }
    }

    /// Track how long the data channel has been down under a connection
    /// that still reports `Connected`.
    pub fn observe_channel(&mut self, channel: ChannelState, now: Instant) {
        let lost = channel != ChannelState::Open && self.state == ConnectionState::Connected;
        if !lost {
            self.channel_lost_since = None;
        } else if self.channel_lost_since.is_none() {
            self.channel_lost_since = Some(now);
        }
    }

    pub fn mark_ice_failed(&mut self) {
        self.ice_failed = true;
    }

    /// Restart the clock after a recovery attempt succeeded.
    pub fn reset(&mut self, now: Instant) {
        self.since = now;
        self.ice_failed = false;
        if self.channel_lost_since.is_some() {
            self.channel_lost_since = Some(now);
        }
    }

    pub fn check(&self, now: Instant) -> Option<StuckReason> {
        if self.ice_failed {
            return Some(StuckReason::IceFailed);
        }
        let held = now.duration_since(self.since);
        match self.state {
            ConnectionState::Failed => Some(StuckReason::Failed),
            ConnectionState::Disconnected if held > self.config.disconnected_threshold => {
                Some(StuckReason::Disconnected(held))
            }
            ConnectionState::Connecting if held > self.config.connecting_threshold => {
                Some(StuckReason::Connecting(held))
            }
            ConnectionState::Connected => self
                .channel_lost_since
                .map(|since| now.duration_since(since))
                .filter(|lost| *lost >= self.config.check_interval)
                .map(StuckReason::ChannelLost),
            _ => None,
        }
    }

    pub fn jitter(&self) -> Duration {
        use rand::Rng;
        let (low, high) = (*self.config.jitter_ms.start(), *self.config.jitter_ms.end());
        let millis = if low >= high {
            low
        } else {
            rand::thread_rng().gen_range(low..=high)
        };
        Duration::from_millis(millis)
    }
}
