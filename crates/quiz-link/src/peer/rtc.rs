//! WebRTC-backed transport: one peer connection carrying one negotiated,
//! ordered data channel (stream id 0 on both ends).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{ChannelState, ConnectionState, OutboundChannel, PeerEvent, PeerEvents, PeerTransport};
use crate::error::{to_setup_error, LinkError, LinkResult};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
const CHANNEL_ID: u16 = 0;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
// SCTP releases a closed stream id asynchronously; creation is retried
// until the old stream is gone.
const REOPEN_ATTEMPTS: u32 = 5;
const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub ordered: bool,
    /// `None` makes the channel fully reliable at the SCTP layer.
    pub max_retransmits: Option<u16>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN.to_string()],
            channel_label: "quiz-link".to_string(),
            ordered: true,
            max_retransmits: Some(3),
        }
    }
}

impl RtcConfig {
    /// `QUIZLINK_ICE_SERVERS` (comma separated) replaces the default STUN
    /// server; `QUIZLINK_DISABLE_STUN` removes every server.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(servers) = std::env::var("QUIZLINK_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if env_flag("QUIZLINK_DISABLE_STUN") {
            config.ice_servers.clear();
        }
        config
    }

    fn channel_init(&self) -> RTCDataChannelInit {
        RTCDataChannelInit {
            ordered: Some(self.ordered),
            max_retransmits: self.max_retransmits,
            negotiated: Some(CHANNEL_ID),
            ..Default::default()
        }
    }
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn build_api() -> LinkResult<API> {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );

    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

struct ActiveChannel {
    channel: Arc<RTCDataChannel>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    config: RtcConfig,
    active: Mutex<Option<ActiveChannel>>,
    connection: Arc<AtomicU8>,
    channel_state: Arc<AtomicU8>,
    generation: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl RtcPeer {
    pub async fn new(config: RtcConfig) -> LinkResult<(Arc<Self>, PeerEvents)> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: if config.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        tracing::trace!(
            target = "quiz_link::rtc",
            await = "api.new_peer_connection",
            state = "start",
            ice_servers = ?config.ice_servers
        );
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );
        let (events, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(AtomicU8::new(ConnectionState::New.to_u8()));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(target = "quiz_link::rtc", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(from_init(init)));
                    }
                    Err(err) => tracing::warn!(
                        target = "quiz_link::rtc",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let state_events = events.clone();
        let state_slot = Arc::clone(&connection);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let slot = Arc::clone(&state_slot);
            Box::pin(async move {
                let state = map_connection_state(state);
                tracing::debug!(target = "quiz_link::rtc", ?state, "peer connection state");
                slot.store(state.to_u8(), Ordering::SeqCst);
                let _ = events.send(PeerEvent::ConnectionState(state));
            })
        }));

        let ice_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = ice_events.clone();
            Box::pin(async move {
                tracing::trace!(target = "quiz_link::rtc", ?state, "ice connection state");
                if state == RTCIceConnectionState::Failed {
                    let _ = events.send(PeerEvent::IceFailed);
                }
            })
        }));

        let peer = Arc::new(Self {
            pc,
            config,
            active: Mutex::new(None),
            connection,
            channel_state: Arc::new(AtomicU8::new(ChannelState::Connecting.to_u8())),
            generation: Arc::new(AtomicU64::new(0)),
            events,
        });
        peer.open_channel().await?;
        Ok((peer, events_rx))
    }

    async fn open_channel(&self) -> LinkResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.channel_state
            .store(ChannelState::Connecting.to_u8(), Ordering::SeqCst);
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            if let Err(err) = previous.channel.close().await {
                tracing::debug!(target = "quiz_link::rtc", error = %err, "closing replaced channel");
            }
        }
        let channel = match self.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.channel_state
                        .store(ChannelState::Closed.to_u8(), Ordering::SeqCst);
                }
                return Err(err);
            }
        };

        let open = self.channel_handler_context(generation);
        channel.on_open(Box::new(move || {
            let ctx = open.clone();
            Box::pin(async move {
                if ctx.is_current() {
                    tracing::debug!(target = "quiz_link::rtc", generation = ctx.generation, "data channel open");
                    ctx.set_state(ChannelState::Open);
                }
            })
        }));

        let close = self.channel_handler_context(generation);
        channel.on_close(Box::new(move || {
            let ctx = close.clone();
            Box::pin(async move {
                if ctx.is_current() {
                    tracing::debug!(target = "quiz_link::rtc", generation = ctx.generation, "data channel closed");
                    ctx.set_state(ChannelState::Closed);
                }
            })
        }));

        channel.on_error(Box::new(move |err| {
            Box::pin(async move {
                tracing::warn!(target = "quiz_link::rtc", error = %err, "data channel error");
            })
        }));

        let inbound = self.channel_handler_context(generation);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let ctx = inbound.clone();
            Box::pin(async move {
                tracing::trace!(target = "quiz_link::rtc", frame_len = message.data.len(), "received frame");
                let _ = ctx.events.send(PeerEvent::Inbound(message.data));
            })
        }));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let sender_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match String::from_utf8(frame.to_vec()) {
                    Ok(text) => timeout(SEND_TIMEOUT, sender_channel.send_text(text)).await,
                    Err(_) => timeout(SEND_TIMEOUT, sender_channel.send(&frame)).await,
                };
                match result {
                    Ok(Ok(written)) => {
                        tracing::trace!(target = "quiz_link::rtc", written, "sent frame")
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(target = "quiz_link::rtc", error = %err, "data channel send error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(target = "quiz_link::rtc", "data channel send timed out");
                        break;
                    }
                }
            }
            tracing::trace!(target = "quiz_link::rtc", generation, "sender loop ended");
        });

        let displaced = self.active.lock().replace(ActiveChannel { channel, outbound });
        if let Some(displaced) = displaced {
            let _ = displaced.channel.close().await;
        }
        Ok(())
    }

    async fn create_channel(&self) -> LinkResult<Arc<RTCDataChannel>> {
        let mut backoff = REOPEN_BACKOFF;
        let mut attempt = 1;
        loop {
            match self
                .pc
                .create_data_channel(&self.config.channel_label, Some(self.config.channel_init()))
                .await
            {
                Ok(channel) => return Ok(channel),
                Err(err) if attempt < REOPEN_ATTEMPTS && is_stream_in_use(&err.to_string()) => {
                    tracing::debug!(
                        target = "quiz_link::rtc",
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "stream id still registered; retrying channel creation"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(to_setup_error(err)),
            }
        }
    }

    fn channel_handler_context(&self, generation: u64) -> ChannelContext {
        ChannelContext {
            generation,
            current: Arc::clone(&self.generation),
            state: Arc::clone(&self.channel_state),
            events: self.events.clone(),
        }
    }
}

#[derive(Clone)]
struct ChannelContext {
    generation: u64,
    current: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl ChannelContext {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.swap(state.to_u8(), Ordering::SeqCst);
        if previous != state.to_u8() {
            let _ = self.events.send(PeerEvent::ChannelState(state));
        }
    }
}

impl OutboundChannel for RtcPeer {
    fn is_open(&self) -> bool {
        ChannelState::from_u8(self.channel_state.load(Ordering::SeqCst)) == ChannelState::Open
    }

    fn send(&self, bytes: Bytes) -> LinkResult<()> {
        if !self.is_open() {
            return Err(LinkError::TransportNotReady);
        }
        let active = self.active.lock();
        let active = active.as_ref().ok_or(LinkError::TransportNotReady)?;
        active
            .outbound
            .send(bytes)
            .map_err(|_| LinkError::TransportNotReady)
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> LinkResult<SessionDescription> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(LinkError::negotiation)?;
        Ok(to_description(&offer))
    }

    async fn create_answer(&self) -> LinkResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(LinkError::negotiation)?;
        Ok(to_description(&answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> LinkResult<()> {
        let description = from_description(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(LinkError::negotiation)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> LinkResult<()> {
        let description = from_description(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(LinkError::negotiation)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> LinkResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(LinkError::negotiation)
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection.load(Ordering::SeqCst))
    }

    fn channel_state(&self) -> ChannelState {
        ChannelState::from_u8(self.channel_state.load(Ordering::SeqCst))
    }

    async fn recreate_channel(&self) -> LinkResult<()> {
        tracing::info!(target = "quiz_link::rtc", "recreating data channel");
        self.open_channel().await
    }

    async fn close(&self) {
        let active = self.active.lock().take();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = active {
            let _ = active.channel.close().await;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "quiz_link::rtc", error = %err, "peer connection close");
        }
        self.channel_state
            .store(ChannelState::Closed.to_u8(), Ordering::SeqCst);
        self.connection
            .store(ConnectionState::Closed.to_u8(), Ordering::SeqCst);
    }
}

fn is_stream_in_use(message: &str) -> bool {
    message.contains("already exists a stream")
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_description(description: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        _ => SdpType::Answer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    }
}

fn from_description(description: &SessionDescription) -> LinkResult<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(LinkError::negotiation)
}
