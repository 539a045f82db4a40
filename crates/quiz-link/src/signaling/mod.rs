//! Client side of the signaling relay: session creation, description and ICE
//! candidate exchange, and an adaptive poller that feeds remote updates to
//! the session actor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::PollingConfig;

pub mod http;
pub mod memory;

pub use http::HttpSignalingRelay;
pub use memory::InMemoryRelay;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Participant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Identity of a candidate: its serialized value.
    pub fn key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.candidate.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<IceCandidate>,
    pub role: Role,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_description: Option<SessionDescription>,
    #[serde(default)]
    pub remote_ice_candidates: Vec<IceCandidate>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling session not found")]
    NotFound,
    #[error("signaling request rejected: {0}")]
    BadRequest(String),
    #[error("unexpected signaling status {0}")]
    Status(u16),
    #[error("signaling transport error: {0}")]
    Http(String),
    #[error("invalid signaling payload: {0}")]
    Decode(String),
    #[error("signaling session not created yet")]
    NoSession,
}

/// The relay a link negotiates through.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn create_session(&self, description: &SessionDescription)
        -> Result<String, SignalingError>;

    async fn submit_update(
        &self,
        session_id: &str,
        update: &SignalingUpdate,
    ) -> Result<(), SignalingError>;

    /// Remote view for the caller: the creator polls without a participant
    /// id, the participant with its own.
    async fn poll(
        &self,
        session_id: &str,
        participant_id: Option<&str>,
    ) -> Result<PollResponse, SignalingError>;
}

/// Remote updates discovered by the poller.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    RemoteDescription(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// Polling window elapsed without the peer ever connecting.
    Expired,
}

/// Adaptive poll interval.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    config: PollingConfig,
    interval: Duration,
    failures: u32,
    connected: bool,
}

impl PollBackoff {
    pub fn new(config: PollingConfig) -> Self {
        let interval = config.base_interval;
        Self {
            config,
            interval,
            failures: 0,
            connected: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn baseline(&self) -> Duration {
        if self.connected {
            self.config.connected_interval
        } else {
            self.config.base_interval
        }
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
        self.interval = self.baseline();
    }

    pub fn on_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.config.failure_threshold {
            let ceiling = self.config.max_interval.max(self.baseline());
            self.interval = self
                .interval
                .mul_f64(self.config.backoff_factor)
                .min(ceiling);
            self.failures = self.config.failure_threshold / 2;
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        if self.failures == 0 {
            self.interval = self.baseline();
        }
    }
}

/// Role-aware wrapper around a relay. Owned by the session actor.
pub struct SignalingClient {
    relay: Arc<dyn SignalingRelay>,
    role: Role,
    participant_id: Option<String>,
    session_id: Option<String>,
    submitted: HashSet<String>,
}

impl SignalingClient {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        role: Role,
        session_id: Option<String>,
        participant_id: Option<String>,
    ) -> Self {
        Self {
            relay,
            role,
            participant_id,
            session_id,
            submitted: HashSet::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub async fn create_session(
        &mut self,
        description: &SessionDescription,
    ) -> Result<String, SignalingError> {
        let session_id = self.relay.create_session(description).await?;
        info!(
            target = "quiz_link::signaling",
            session_id = %session_id,
            "signaling session created"
        );
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    pub async fn submit_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let session_id = self.session_id.as_deref().ok_or(SignalingError::NoSession)?;
        let update = SignalingUpdate {
            participant_id: self.participant_id.clone(),
            description: Some(description.clone()),
            ice_candidate: None,
            role: self.role,
        };
        debug!(
            target = "quiz_link::signaling",
            session_id,
            sdp_type = ?description.sdp_type,
            "publishing description"
        );
        self.relay.submit_update(session_id, &update).await
    }

    /// Publish a local candidate once. Returns `false` if it was already sent.
    pub async fn submit_candidate(
        &mut self,
        candidate: &IceCandidate,
    ) -> Result<bool, SignalingError> {
        let session_id = self.session_id.as_deref().ok_or(SignalingError::NoSession)?;
        let key = candidate.key();
        if self.submitted.contains(&key) {
            trace!(target = "quiz_link::signaling", "candidate already submitted");
            return Ok(false);
        }
        let update = SignalingUpdate {
            participant_id: self.participant_id.clone(),
            description: None,
            ice_candidate: Some(candidate.clone()),
            role: self.role,
        };
        self.relay.submit_update(session_id, &update).await?;
        self.submitted.insert(key);
        trace!(
            target = "quiz_link::signaling",
            session_id,
            candidate = %candidate.candidate,
            "local candidate published"
        );
        Ok(true)
    }

    /// One-shot poll, used by recovery to re-read the current remote state.
    pub async fn fetch_remote(&self) -> Result<PollResponse, SignalingError> {
        let session_id = self.session_id.as_deref().ok_or(SignalingError::NoSession)?;
        self.relay
            .poll(session_id, self.participant_id.as_deref())
            .await
    }

    /// Start the background poller. It stops once `events` is dropped, or
    /// after emitting [`SignalingEvent::Expired`].
    pub fn spawn_poller(
        &self,
        config: PollingConfig,
        events: mpsc::UnboundedSender<SignalingEvent>,
        connected: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SignalingError> {
        let session_id = self.session_id.clone().ok_or(SignalingError::NoSession)?;
        let poller = Poller {
            relay: Arc::clone(&self.relay),
            role: self.role,
            session_id,
            participant_id: self.participant_id.clone(),
            config,
            events,
            connected,
        };
        Ok(tokio::spawn(poller.run()))
    }
}

struct Poller {
    relay: Arc<dyn SignalingRelay>,
    role: Role,
    session_id: String,
    participant_id: Option<String>,
    config: PollingConfig,
    events: mpsc::UnboundedSender<SignalingEvent>,
    connected: watch::Receiver<bool>,
}

impl Poller {
    async fn run(self) {
        let started = Instant::now();
        let mut backoff = PollBackoff::new(self.config.clone());
        let mut ever_connected = false;
        let mut last_description: Option<String> = None;
        let mut seen_candidates: HashSet<String> = HashSet::new();

        loop {
            let connected = *self.connected.borrow();
            ever_connected |= connected;
            backoff.set_connected(connected);
            if !ever_connected && started.elapsed() >= self.config.unconnected_window {
                warn!(
                    target = "quiz_link::signaling",
                    session_id = %self.session_id,
                    window = ?self.config.unconnected_window,
                    "peer never connected; polling stopped"
                );
                let _ = self.events.send(SignalingEvent::Expired);
                return;
            }

            match self
                .relay
                .poll(&self.session_id, self.participant_id.as_deref())
                .await
            {
                Ok(response) => {
                    backoff.on_success();
                    if let Some(description) = response.remote_description {
                        if last_description.as_deref() != Some(description.sdp.as_str()) {
                            last_description = Some(description.sdp.clone());
                            if self
                                .events
                                .send(SignalingEvent::RemoteDescription(description))
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    for candidate in response.remote_ice_candidates {
                        if seen_candidates.insert(candidate.key())
                            && self
                                .events
                                .send(SignalingEvent::RemoteCandidate(candidate))
                                .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(SignalingError::NotFound) if self.role == Role::Participant => {
                    trace!(
                        target = "quiz_link::signaling",
                        session_id = %self.session_id,
                        "session not published yet"
                    );
                }
                Err(err) => {
                    backoff.on_failure();
                    warn!(
                        target = "quiz_link::signaling",
                        session_id = %self.session_id,
                        error = %err,
                        failures = backoff.failures(),
                        next_interval = ?backoff.interval(),
                        "poll failed"
                    );
                }
            }

            tokio::select! {
                _ = sleep(backoff.interval()) => {}
                _ = self.events.closed() => {
                    debug!(target = "quiz_link::signaling", "poller stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_poll_failures_back_off_and_partially_reset() {
        let mut backoff = PollBackoff::new(PollingConfig::default());
        for _ in 0..4 {
            backoff.on_failure();
        }
        assert_eq!(backoff.interval(), Duration::from_millis(1000));
        assert_eq!(backoff.failures(), 4);

        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_millis(1500));
        assert_eq!(backoff.failures(), 2);

        backoff.on_failure();
        assert_eq!(backoff.failures(), 3);
        assert_eq!(backoff.interval(), Duration::from_millis(1500));

        for _ in 0..30 {
            backoff.on_failure();
        }
        assert_eq!(backoff.interval(), Duration::from_millis(5000));

        backoff.on_success();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.interval(), Duration::from_millis(1000));
    }

    #[test]
    fn connected_cadence_is_slower() {
        let mut backoff = PollBackoff::new(PollingConfig::default());
        backoff.set_connected(true);
        assert_eq!(backoff.interval(), Duration::from_secs(5));
        backoff.set_connected(false);
        assert_eq!(backoff.interval(), Duration::from_secs(1));
    }

    #[test]
    fn wire_shapes_are_camel_case() {
        let update = SignalingUpdate {
            participant_id: Some("p-1".into()),
            description: None,
            ice_candidate: Some(IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
            role: Role::Participant,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["participantId"], "p-1");
        assert_eq!(json["role"], "participant");
        assert_eq!(json["iceCandidate"]["sdpMLineIndex"], 0);
        assert!(json.get("description").is_none());

        let poll: PollResponse = serde_json::from_str(
            r#"{"remoteDescription":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap();
        assert_eq!(poll.remote_description, Some(SessionDescription::offer("v=0")));
        assert!(poll.remote_ice_candidates.is_empty());
    }
}
