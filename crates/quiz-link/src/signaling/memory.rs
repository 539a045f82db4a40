use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    IceCandidate, PollResponse, Role, SessionDescription, SignalingError, SignalingRelay,
    SignalingUpdate,
};

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct RelaySession {
    offer: SessionDescription,
    answer: Option<SessionDescription>,
    participant_id: Option<String>,
    creator_candidates: Vec<IceCandidate>,
    participant_candidates: Vec<IceCandidate>,
    touched: Instant,
}

/// Simple in-process relay for tests and offline demos.
///
/// Follows the HTTP relay's rules: polls for unknown sessions return
/// `NotFound`, candidate lists are cumulative, a fresh creator offer clears
/// the stale answer, and sessions idle for longer than the TTL are dropped.
#[derive(Debug, Clone)]
pub struct InMemoryRelay {
    sessions: Arc<Mutex<HashMap<String, RelaySession>>>,
    ttl: Duration,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn session_count(&self) -> usize {
        let mut sessions = self.sessions.lock();
        Self::evict_expired(&mut sessions, self.ttl);
        sessions.len()
    }

    fn evict_expired(sessions: &mut HashMap<String, RelaySession>, ttl: Duration) {
        let now = Instant::now();
        sessions.retain(|_, session| now.duration_since(session.touched) < ttl);
    }
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn create_session(
        &self,
        description: &SessionDescription,
    ) -> Result<String, SignalingError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock();
        Self::evict_expired(&mut sessions, self.ttl);
        sessions.insert(
            session_id.clone(),
            RelaySession {
                offer: description.clone(),
                answer: None,
                participant_id: None,
                creator_candidates: Vec::new(),
                participant_candidates: Vec::new(),
                touched: Instant::now(),
            },
        );
        Ok(session_id)
    }

    async fn submit_update(
        &self,
        session_id: &str,
        update: &SignalingUpdate,
    ) -> Result<(), SignalingError> {
        let mut sessions = self.sessions.lock();
        Self::evict_expired(&mut sessions, self.ttl);
        let session = sessions
            .get_mut(session_id)
            .ok_or(SignalingError::NotFound)?;
        session.touched = Instant::now();

        match update.role {
            Role::Creator => {
                if let Some(description) = &update.description {
                    if description.sdp != session.offer.sdp {
                        session.answer = None;
                    }
                    session.offer = description.clone();
                }
                if let Some(candidate) = &update.ice_candidate {
                    session.creator_candidates.push(candidate.clone());
                }
            }
            Role::Participant => {
                let participant_id = update.participant_id.as_deref().ok_or_else(|| {
                    SignalingError::BadRequest("participantId is required".into())
                })?;
                match session.participant_id.as_deref() {
                    Some(existing) if existing != participant_id => {
                        return Err(SignalingError::BadRequest(
                            "session already has a participant".into(),
                        ));
                    }
                    Some(_) => {}
                    None => session.participant_id = Some(participant_id.to_string()),
                }
                if let Some(description) = &update.description {
                    session.answer = Some(description.clone());
                }
                if let Some(candidate) = &update.ice_candidate {
                    session.participant_candidates.push(candidate.clone());
                }
            }
        }
        Ok(())
    }

    async fn poll(
        &self,
        session_id: &str,
        participant_id: Option<&str>,
    ) -> Result<PollResponse, SignalingError> {
        let mut sessions = self.sessions.lock();
        Self::evict_expired(&mut sessions, self.ttl);
        let session = sessions.get(session_id).ok_or(SignalingError::NotFound)?;
        let response = match participant_id {
            None => PollResponse {
                remote_description: session.answer.clone(),
                remote_ice_candidates: session.participant_candidates.clone(),
            },
            Some(_) => PollResponse {
                remote_description: Some(session.offer.clone()),
                remote_ice_candidates: session.creator_candidates.clone(),
            },
        };
        Ok(response)
    }
}
