use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{PollResponse, SessionDescription, SignalingError, SignalingRelay, SignalingUpdate};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CreateSessionRequest {
    pub description: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionResponse {
    pub session_id: String,
}

/// Relay reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSignalingRelay {
    client: Client,
    base: Url,
}

impl HttpSignalingRelay {
    pub fn new(base: &str) -> Result<Self, SignalingError> {
        Self::with_client(Client::new(), base)
    }

    pub fn with_client(client: Client, base: &str) -> Result<Self, SignalingError> {
        let base = Url::parse(base)
            .map_err(|err| SignalingError::BadRequest(format!("invalid relay url: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(SignalingError::BadRequest(format!(
                "relay url {base} cannot carry a path"
            )));
        }
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Appends `segments` to the base path. Each segment is percent-encoded
    /// on its own, so a session id can never add path, query or fragment parts.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SignalingError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SignalingError::BadRequest(format!("relay url {} cannot carry a path", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl SignalingRelay for HttpSignalingRelay {
    async fn create_session(
        &self,
        description: &SessionDescription,
    ) -> Result<String, SignalingError> {
        let url = self.endpoint(&["sessions"])?;
        tracing::trace!(
            target = "quiz_link::signaling",
            phase = "create_session",
            await = "client.send",
            state = "start"
        );
        let response = self
            .client
            .post(url)
            .json(&CreateSessionRequest {
                description: description.clone(),
            })
            .send()
            .await
            .map_err(http_error)?;
        tracing::trace!(
            target = "quiz_link::signaling",
            phase = "create_session",
            await = "client.send",
            state = "end",
            status = %response.status()
        );
        let response = check_status(response).await?;
        let body = response
            .json::<CreateSessionResponse>()
            .await
            .map_err(decode_error)?;
        Ok(body.session_id)
    }

    async fn submit_update(
        &self,
        session_id: &str,
        update: &SignalingUpdate,
    ) -> Result<(), SignalingError> {
        let url = self.endpoint(&["sessions", session_id, "updates"])?;
        let response = self
            .client
            .post(url)
            .json(update)
            .send()
            .await
            .map_err(http_error)?;
        tracing::trace!(
            target = "quiz_link::signaling",
            phase = "submit_update",
            session_id,
            status = %response.status()
        );
        check_status(response).await?;
        Ok(())
    }

    async fn poll(
        &self,
        session_id: &str,
        participant_id: Option<&str>,
    ) -> Result<PollResponse, SignalingError> {
        let url = self.endpoint(&["sessions", session_id, "poll"])?;
        let mut request = self.client.get(url);
        if let Some(participant_id) = participant_id {
            request = request.query(&[("participantId", participant_id)]);
        }
        let response = request.send().await.map_err(http_error)?;
        tracing::trace!(
            target = "quiz_link::signaling",
            phase = "poll",
            session_id,
            status = %response.status()
        );
        let response = check_status(response).await?;
        response.json::<PollResponse>().await.map_err(decode_error)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SignalingError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(SignalingError::NotFound),
        StatusCode::BAD_REQUEST => {
            let body = response.text().await.unwrap_or_default();
            Err(SignalingError::BadRequest(body))
        }
        status => Err(SignalingError::Status(status.as_u16())),
    }
}

fn http_error(err: reqwest::Error) -> SignalingError {
    SignalingError::Http(err.to_string())
}

fn decode_error(err: reqwest::Error) -> SignalingError {
    SignalingError::Decode(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{IceCandidate, InMemoryRelay, Role};
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct PollQuery {
        participant_id: Option<String>,
    }

    fn status_of(err: SignalingError) -> AxumStatus {
        match err {
            SignalingError::NotFound => AxumStatus::NOT_FOUND,
            SignalingError::BadRequest(_) => AxumStatus::BAD_REQUEST,
            _ => AxumStatus::INTERNAL_SERVER_ERROR,
        }
    }

    async fn create(
        State(relay): State<Arc<InMemoryRelay>>,
        Json(request): Json<CreateSessionRequest>,
    ) -> Result<Json<CreateSessionResponse>, AxumStatus> {
        let session_id = relay
            .create_session(&request.description)
            .await
            .map_err(status_of)?;
        Ok(Json(CreateSessionResponse { session_id }))
    }

    async fn update(
        State(relay): State<Arc<InMemoryRelay>>,
        Path(session_id): Path<String>,
        Json(update): Json<SignalingUpdate>,
    ) -> AxumStatus {
        match relay.submit_update(&session_id, &update).await {
            Ok(()) => AxumStatus::NO_CONTENT,
            Err(err) => status_of(err),
        }
    }

    async fn poll(
        State(relay): State<Arc<InMemoryRelay>>,
        Path(session_id): Path<String>,
        Query(query): Query<PollQuery>,
    ) -> Result<Json<PollResponse>, AxumStatus> {
        relay
            .poll(&session_id, query.participant_id.as_deref())
            .await
            .map(Json)
            .map_err(status_of)
    }

    async fn flaky() -> AxumStatus {
        AxumStatus::SERVICE_UNAVAILABLE
    }

    async fn spawn_stub() -> String {
        let relay = Arc::new(InMemoryRelay::new());
        let app = Router::new()
            .route("/sessions", post(create))
            .route("/sessions/:id/updates", post(update))
            .route("/sessions/:id/poll", get(poll))
            .route("/broken/sessions", post(flaky))
            .with_state(relay);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn exchanges_descriptions_and_candidates_over_http() {
        let base = spawn_stub().await;
        let relay = HttpSignalingRelay::new(&base).unwrap();

        let session_id = relay
            .create_session(&SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();

        let participant = relay.poll(&session_id, Some("p-1")).await.unwrap();
        assert_eq!(
            participant.remote_description,
            Some(SessionDescription::offer("v=0 offer"))
        );

        relay
            .submit_update(
                &session_id,
                &SignalingUpdate {
                    participant_id: Some("p-1".into()),
                    description: Some(SessionDescription::answer("v=0 answer")),
                    ice_candidate: Some(IceCandidate::new("candidate:1")),
                    role: Role::Participant,
                },
            )
            .await
            .unwrap();

        let creator = relay.poll(&session_id, None).await.unwrap();
        assert_eq!(
            creator.remote_description,
            Some(SessionDescription::answer("v=0 answer"))
        );
        assert_eq!(creator.remote_ice_candidates, vec![IceCandidate::new("candidate:1")]);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn maps_error_statuses() {
        let base = spawn_stub().await;
        let relay = HttpSignalingRelay::new(&base).unwrap();
        assert_eq!(
            relay.poll("missing", Some("p-1")).await.unwrap_err(),
            SignalingError::NotFound
        );

        let broken = HttpSignalingRelay::new(&format!("{base}/broken")).unwrap();
        assert_eq!(
            broken
                .create_session(&SessionDescription::offer("v=0"))
                .await
                .unwrap_err(),
            SignalingError::Status(503)
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            HttpSignalingRelay::new("not a url"),
            Err(SignalingError::BadRequest(_))
        ));
        assert!(matches!(
            HttpSignalingRelay::new("mailto:relay@example.com"),
            Err(SignalingError::BadRequest(_))
        ));
    }

    #[test]
    fn session_id_stays_one_path_segment() {
        let relay = HttpSignalingRelay::new("http://relay.test/api/").unwrap();
        assert_eq!(
            relay.endpoint(&["sessions"]).unwrap().as_str(),
            "http://relay.test/api/sessions"
        );
        let url = relay
            .endpoint(&["sessions", "../admin/x?drop=1#frag", "poll"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://relay.test/api/sessions/..%2Fadmin%2Fx%3Fdrop=1%23frag/poll"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn hostile_session_id_does_not_reach_other_routes() {
        let base = spawn_stub().await;
        let relay = HttpSignalingRelay::new(&base).unwrap();
        let session_id = relay
            .create_session(&SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();

        let smuggled = format!("{session_id}/poll?participantId=p-1#");
        assert_eq!(
            relay.poll(&smuggled, None).await.unwrap_err(),
            SignalingError::NotFound
        );
        assert!(relay.poll(&session_id, Some("p-1")).await.is_ok());
    }
}
