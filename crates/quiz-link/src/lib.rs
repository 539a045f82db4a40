//! Direct peer-to-peer link between a quiz creator and one participant.
//!
//! A [`PeerLink`] negotiates a WebRTC data channel through a signaling relay,
//! keeps it alive across network churn (heartbeats, a stuck-state watchdog and
//! ICE-restart recovery) and layers reliable delivery on top: retried sends
//! with acknowledgments, duplicate suppression on receipt, and exactly-once
//! semantics for answer-class messages keyed by the quiz they answer.
//!
//! ```no_run
//! # async fn demo() -> quiz_link::LinkResult<()> {
//! use std::sync::Arc;
//! use quiz_link::{HttpSignalingRelay, LinkConfig, PeerLink, RtcConfig, RtcPeer};
//!
//! let relay = Arc::new(HttpSignalingRelay::new("http://127.0.0.1:8080")?);
//! let (peer, peer_events) = RtcPeer::new(RtcConfig::from_env()).await?;
//! let link = PeerLink::create(LinkConfig::from_env(), relay, peer, peer_events).await?;
//! println!("session {}", link.session_id());
//! link.wait_until_open().await?;
//! link.handle()
//!     .send_answer("q1", serde_json::json!({"choice": "B"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod liveness;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{DeliveryConfig, LinkConfig, LivenessConfig, PollingConfig, WatchdogConfig};
pub use delivery::{AckOutcome, DeliveryEvent, EnqueueOutcome, ReliableDeliveryEngine};
pub use envelope::{DeliveryClass, Envelope, MessageKind, OutboundMessage};
pub use error::{LinkError, LinkResult};
pub use liveness::LivenessStatus;
pub use peer::mock::MockPeer;
pub use peer::rtc::{RtcConfig, RtcPeer};
pub use peer::{ChannelState, ConnectionState, PeerEvent, PeerTransport};
pub use session::{LinkEvent, LinkHandle, LinkStatus, PeerLink};
pub use signaling::{
    HttpSignalingRelay, IceCandidate, InMemoryRelay, Role, SessionDescription, SignalingError,
    SignalingRelay,
};
