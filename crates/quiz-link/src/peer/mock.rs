//! In-memory peer pair. Descriptions are opaque strings; the two sides become
//! connected with an open channel once each holds the other's local
//! description as its remote one. Sends are delivered to the partner as
//! `PeerEvent::Inbound`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ChannelState, ConnectionState, OutboundChannel, PeerEvent, PeerEvents, PeerTransport};
use crate::error::{LinkError, LinkResult};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

type OutboundFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct Side {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connection: ConnectionState,
    channel: ChannelState,
    applied: Vec<IceCandidate>,
    sent: Vec<Bytes>,
    generation: u32,
    events: mpsc::UnboundedSender<PeerEvent>,
    filter: Option<OutboundFilter>,
}

impl Side {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            local: None,
            remote: None,
            connection: ConnectionState::New,
            channel: ChannelState::Connecting,
            applied: Vec::new(),
            sent: Vec::new(),
            generation: 0,
            events,
            filter: None,
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            self.connection = state;
            let _ = self.events.send(PeerEvent::ConnectionState(state));
        }
    }

    fn set_channel(&mut self, state: ChannelState) {
        if self.channel != state {
            self.channel = state;
            let _ = self.events.send(PeerEvent::ChannelState(state));
        }
    }
}

struct Pair {
    sides: [Side; 2],
    failing_replacements: u32,
    replacements: u32,
}

impl Pair {
    fn descriptions_match(&self) -> bool {
        let [a, b] = &self.sides;
        match (&a.local, &a.remote, &b.local, &b.remote) {
            (Some(a_local), Some(a_remote), Some(b_local), Some(b_remote)) => {
                a_local == b_remote && b_local == a_remote
            }
            _ => false,
        }
    }

    fn settle(&mut self) {
        if !self.descriptions_match() {
            return;
        }
        for side in &mut self.sides {
            if matches!(side.connection, ConnectionState::Closed) {
                return;
            }
        }
        for side in &mut self.sides {
            side.set_connection(ConnectionState::Connected);
            side.set_channel(ChannelState::Open);
        }
    }
}

pub struct MockPeer {
    pair: Arc<Mutex<Pair>>,
    index: usize,
}

impl MockPeer {
    /// Two connected-on-negotiation peers and their event streams.
    pub fn pair() -> ((Arc<MockPeer>, PeerEvents), (Arc<MockPeer>, PeerEvents)) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let pair = Arc::new(Mutex::new(Pair {
            sides: [Side::new(a_tx), Side::new(b_tx)],
            failing_replacements: 0,
            replacements: 0,
        }));
        let a = Arc::new(MockPeer {
            pair: Arc::clone(&pair),
            index: 0,
        });
        let b = Arc::new(MockPeer { pair, index: 1 });
        ((a, a_rx), (b, b_rx))
    }

    fn partner(&self) -> usize {
        1 - self.index
    }

    /// Candidates applied through `add_ice_candidate`, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.pair.lock().sides[self.index].applied.clone()
    }

    /// Frames this side handed to the channel, including dropped ones.
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.pair.lock().sides[self.index].sent.clone()
    }

    /// Outbound frames for which `keep` returns `false` are silently lost.
    pub fn set_outbound_filter(&self, keep: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        self.pair.lock().sides[self.index].filter = Some(Box::new(keep));
    }

    pub fn clear_outbound_filter(&self) {
        self.pair.lock().sides[self.index].filter = None;
    }

    /// Close the data channel on both ends, leaving the connection up.
    pub fn simulate_channel_close(&self) {
        let mut pair = self.pair.lock();
        for side in &mut pair.sides {
            side.set_channel(ChannelState::Closed);
        }
    }

    /// Drop the network path: both ends report `Disconnected`.
    pub fn simulate_disconnect(&self) {
        let mut pair = self.pair.lock();
        for side in &mut pair.sides {
            side.set_channel(ChannelState::Closed);
            side.set_connection(ConnectionState::Disconnected);
        }
    }

    /// Only this side reports `Disconnected`; the channel keeps carrying
    /// frames.
    pub fn simulate_transport_flap(&self) {
        self.pair.lock().sides[self.index].set_connection(ConnectionState::Disconnected);
    }

    /// The next `times` calls to `recreate_channel`, on either side, fail the
    /// way a still-registered SCTP stream id does.
    pub fn fail_channel_replacement(&self, times: u32) {
        self.pair.lock().failing_replacements = times;
    }

    /// Calls to `recreate_channel` on either side, failed ones included.
    pub fn channel_replacements(&self) -> u32 {
        self.pair.lock().replacements
    }

    pub fn simulate_ice_failure(&self) {
        let pair = self.pair.lock();
        let _ = pair.sides[self.index].events.send(PeerEvent::IceFailed);
    }

    fn description(&self, sdp_type: SdpType, restart: bool) -> SessionDescription {
        let mut pair = self.pair.lock();
        let side = &mut pair.sides[self.index];
        side.generation += 1;
        let label = match sdp_type {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        };
        SessionDescription {
            sdp_type,
            sdp: format!(
                "mock-{label} peer={} gen={} restart={restart}",
                self.index, side.generation
            ),
        }
    }
}

impl OutboundChannel for MockPeer {
    fn is_open(&self) -> bool {
        self.pair.lock().sides[self.index].channel == ChannelState::Open
    }

    fn send(&self, bytes: Bytes) -> LinkResult<()> {
        let mut pair = self.pair.lock();
        let partner = self.partner();
        let side = &mut pair.sides[self.index];
        if side.channel != ChannelState::Open {
            return Err(LinkError::TransportNotReady);
        }
        side.sent.push(bytes.clone());
        let keep = side.filter.as_ref().map_or(true, |keep| keep(&bytes));
        if keep {
            let _ = pair.sides[partner].events.send(PeerEvent::Inbound(bytes));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self, ice_restart: bool) -> LinkResult<SessionDescription> {
        Ok(self.description(SdpType::Offer, ice_restart))
    }

    async fn create_answer(&self) -> LinkResult<SessionDescription> {
        let has_offer = self.pair.lock().sides[self.index]
            .remote
            .as_ref()
            .is_some_and(|remote| remote.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(LinkError::negotiation("no remote offer to answer"));
        }
        Ok(self.description(SdpType::Answer, false))
    }

    async fn set_local_description(&self, description: SessionDescription) -> LinkResult<()> {
        let mut pair = self.pair.lock();
        let side = &mut pair.sides[self.index];
        side.local = Some(description);
        if side.connection == ConnectionState::New {
            side.set_connection(ConnectionState::Connecting);
        }
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 10.0.0.{} 5000 typ host gen {}",
                self.index,
                self.index + 1,
                side.generation
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let _ = side.events.send(PeerEvent::LocalCandidate(candidate));
        pair.settle();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> LinkResult<()> {
        let mut pair = self.pair.lock();
        pair.sides[self.index].remote = Some(description);
        pair.settle();
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pair.lock().sides[self.index].remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> LinkResult<()> {
        let mut pair = self.pair.lock();
        let side = &mut pair.sides[self.index];
        if side.remote.is_none() {
            return Err(LinkError::negotiation(
                "remote description not set; cannot add candidate",
            ));
        }
        side.applied.push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.pair.lock().sides[self.index].connection
    }

    fn channel_state(&self) -> ChannelState {
        self.pair.lock().sides[self.index].channel
    }

    async fn recreate_channel(&self) -> LinkResult<()> {
        let mut pair = self.pair.lock();
        let both_connected = pair
            .sides
            .iter()
            .all(|side| side.connection == ConnectionState::Connected);
        if !both_connected {
            return Err(LinkError::Setup("connection not established".into()));
        }
        pair.replacements += 1;
        if pair.failing_replacements > 0 {
            pair.failing_replacements -= 1;
            return Err(LinkError::Setup(
                "there already exists a stream with identifier 0".into(),
            ));
        }
        for side in &mut pair.sides {
            side.set_channel(ChannelState::Open);
        }
        Ok(())
    }

    async fn close(&self) {
        let mut pair = self.pair.lock();
        let partner = self.partner();
        for index in [self.index, partner] {
            let side = &mut pair.sides[index];
            side.set_channel(ChannelState::Closed);
        }
        let side = &mut pair.sides[self.index];
        side.set_connection(ConnectionState::Closed);
        let peer = &mut pair.sides[partner];
        if peer.connection == ConnectionState::Connected {
            peer.set_connection(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_connects_after_offer_answer() {
        let ((a, mut a_events), (b, _b_events)) = MockPeer::pair();

        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        assert!(!a.is_open());
        a.set_remote_description(answer).await.unwrap();

        assert!(a.is_open() && b.is_open());
        assert_eq!(a.connection_state(), ConnectionState::Connected);

        let mut saw_open = false;
        while let Ok(event) = a_events.try_recv() {
            saw_open |= matches!(event, PeerEvent::ChannelState(ChannelState::Open));
        }
        assert!(saw_open);
    }

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let ((a, _a_events), _b) = MockPeer::pair();
        assert!(a.add_ice_candidate(IceCandidate::new("c")).await.is_err());
        a.set_remote_description(SessionDescription::offer("x"))
            .await
            .unwrap();
        a.add_ice_candidate(IceCandidate::new("c")).await.unwrap();
        assert_eq!(a.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn replacement_failures_are_consumed_in_order() {
        let ((a, _a_events), (b, _b_events)) = MockPeer::pair();
        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        a.simulate_channel_close();
        a.fail_channel_replacement(1);
        assert!(matches!(b.recreate_channel().await, Err(LinkError::Setup(_))));
        assert!(!a.is_open() && !b.is_open());
        a.recreate_channel().await.unwrap();
        assert!(a.is_open() && b.is_open());
        assert_eq!(b.channel_replacements(), 2);

        a.simulate_transport_flap();
        assert_eq!(a.connection_state(), ConnectionState::Disconnected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn filtered_frames_are_lost() {
        let ((a, _a_events), (b, mut b_events)) = MockPeer::pair();
        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        while b_events.try_recv().is_ok() {}

        a.set_outbound_filter(|frame| frame != b"drop");
        a.send(Bytes::from_static(b"drop")).unwrap();
        a.send(Bytes::from_static(b"keep")).unwrap();
        assert!(matches!(
            b_events.try_recv(),
            Ok(PeerEvent::Inbound(bytes)) if bytes.as_ref() == b"keep"
        ));
        assert_eq!(a.sent_frames().len(), 2);
    }
}
