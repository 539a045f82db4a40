//! Seam between the link logic and the peer connection that carries it.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LinkResult;
use crate::signaling::{IceCandidate, SessionDescription};

pub mod mock;
pub mod rtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConnectionState::New => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnected => 3,
            ConnectionState::Failed => 4,
            ConnectionState::Closed => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            4 => ConnectionState::Failed,
            5 => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl ChannelState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ChannelState::Connecting => 0,
            ChannelState::Open => 1,
            ChannelState::Closed => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Open,
            2 => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }
}

/// Notifications raised by a peer transport. Delivered in order on the
/// receiver handed out at construction.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    IceFailed,
    ChannelState(ChannelState),
    Inbound(Bytes),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Minimal send surface used by the delivery engine and heartbeats.
pub trait OutboundChannel {
    fn is_open(&self) -> bool;
    /// Queue bytes on the data channel without waiting for transmission.
    fn send(&self, bytes: Bytes) -> LinkResult<()>;
}

/// One peer connection carrying a single ordered data channel.
#[async_trait]
pub trait PeerTransport: OutboundChannel + Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> LinkResult<SessionDescription>;
    async fn create_answer(&self) -> LinkResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> LinkResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> LinkResult<()>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> LinkResult<()>;
    fn connection_state(&self) -> ConnectionState;
    fn channel_state(&self) -> ChannelState;
    /// Tear down the current data channel and open a replacement under the
    /// existing connection.
    async fn recreate_channel(&self) -> LinkResult<()>;
    async fn close(&self);
}
