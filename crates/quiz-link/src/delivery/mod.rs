//! Application-level reliable delivery over the data channel.
//!
//! Outbound messages are queued per link, sent while the channel is open,
//! and retried on a sweep until acknowledged or exhausted. Answer-class
//! messages are single-shot: acknowledged, or assumed delivered once their
//! timeout lapses, and their logical key is then marked complete so no later
//! enqueue for it ever transmits.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::DeliveryConfig;
use crate::envelope::{DeliveryClass, MessageKind, OutboundMessage};
use crate::error::LinkResult;
use crate::peer::OutboundChannel;

pub mod acks;
pub mod dedup;

use acks::BoundedIdSet;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    /// Correlation id carried on the wire: the caller's id when supplied,
    /// otherwise `id`.
    pub wire_id: String,
    pub kind: MessageKind,
    pub class: DeliveryClass,
    pub logical_key: Option<String>,
    pub encoded: Bytes,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: Instant,
    ack_deadline: Option<Instant>,
}

impl QueuedMessage {
    pub fn awaiting_ack(&self) -> bool {
        self.ack_deadline.is_some()
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(String),
    /// The logical key already reached a terminal outcome; nothing was queued.
    AlreadyComplete,
    /// An answer for this logical key is on the wire awaiting its ack; the
    /// new one was refused. Carries the in-flight message's local id.
    AnswerInFlight(String),
}

impl EnqueueOutcome {
    /// Local id of the queued message this outcome refers to.
    pub fn id(&self) -> Option<&str> {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::AnswerInFlight(id) => Some(id),
            EnqueueOutcome::AlreadyComplete => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged(String),
    AlreadyAcknowledged,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Acknowledged {
        id: String,
        logical_key: Option<String>,
    },
    AssumedDelivered {
        id: String,
        logical_key: Option<String>,
    },
    Exhausted {
        id: String,
        attempts: u32,
    },
    Superseded {
        id: String,
        logical_key: String,
    },
}

pub struct ReliableDeliveryEngine {
    config: DeliveryConfig,
    sender_participant_id: Option<String>,
    id_prefix: String,
    next_seq: u64,
    queue: Vec<QueuedMessage>,
    correlation: HashMap<String, String>,
    acked: BoundedIdSet,
    completed: HashSet<String>,
    events: Vec<DeliveryEvent>,
}

impl ReliableDeliveryEngine {
    pub fn new(config: DeliveryConfig, sender_participant_id: Option<String>) -> Self {
        let id_prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let acked = BoundedIdSet::new(config.ack_history);
        Self {
            config,
            sender_participant_id,
            id_prefix,
            next_seq: 0,
            queue: Vec::new(),
            correlation: HashMap::new(),
            acked,
            completed: HashSet::new(),
            events: Vec::new(),
        }
    }

    /// Record a message and attempt an immediate send.
    pub fn enqueue<C: OutboundChannel + ?Sized>(
        &mut self,
        message: OutboundMessage,
        channel: &C,
        now: Instant,
    ) -> LinkResult<EnqueueOutcome> {
        if let Some(key) = message.logical_key() {
            if self.completed.contains(key) {
                debug!(
                    target = "quiz_link::delivery",
                    logical_key = key,
                    kind = %message.kind(),
                    "logical key already complete; enqueue ignored"
                );
                return Ok(EnqueueOutcome::AlreadyComplete);
            }
            if let Some(in_flight) = self.transmitted_answer(key) {
                debug!(
                    target = "quiz_link::delivery",
                    logical_key = key,
                    in_flight = %in_flight,
                    "answer already transmitted for key; enqueue refused"
                );
                return Ok(EnqueueOutcome::AnswerInFlight(in_flight));
            }
            self.supersede(key);
        }

        let id = format!("{}-{}", self.id_prefix, self.next_seq);
        self.next_seq += 1;
        let wire_id = message
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let kind = message.kind().clone();
        let class = message.class();
        let logical_key = message.logical_key().map(str::to_string);
        let max_attempts = message.max_attempts().unwrap_or(self.config.max_attempts);
        let encoded = message
            .into_envelope(wire_id.clone(), self.sender_participant_id.clone())
            .encode()?;

        if wire_id != id {
            self.correlation.insert(wire_id.clone(), id.clone());
        }
        trace!(
            target = "quiz_link::delivery",
            id = %id,
            wire_id = %wire_id,
            kind = %kind,
            ?class,
            "message queued"
        );
        self.queue.push(QueuedMessage {
            id: id.clone(),
            wire_id,
            kind,
            class,
            logical_key,
            encoded,
            attempts: 0,
            max_attempts,
            created_at: now,
            ack_deadline: None,
        });
        self.try_send(&id, channel, now);
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Transmit a queued message if every precondition holds.
    pub fn try_send<C: OutboundChannel + ?Sized>(
        &mut self,
        id: &str,
        channel: &C,
        now: Instant,
    ) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let entry = &self.queue[pos];
        if self.acked.contains(&entry.id) || self.acked.contains(&entry.wire_id) {
            trace!(target = "quiz_link::delivery", id, "already acknowledged; purging");
            self.remove_at(pos);
            return false;
        }
        if let Some(key) = entry.logical_key.as_deref() {
            if self.completed.contains(key) {
                debug!(
                    target = "quiz_link::delivery",
                    id,
                    logical_key = key,
                    "logical key complete; dropping stale message"
                );
                self.remove_at(pos);
                return false;
            }
        }
        if !channel.is_open() {
            trace!(target = "quiz_link::delivery", id, "channel not open; send deferred");
            return false;
        }
        if entry.awaiting_ack() {
            return false;
        }
        if entry.attempts >= entry.max_attempts {
            let entry = self.remove_at(pos);
            self.report_exhausted(&entry);
            return false;
        }
        if entry.class == DeliveryClass::Answer && entry.attempts >= 1 {
            debug!(
                target = "quiz_link::delivery",
                id,
                "answer already transmitted once; refusing resend"
            );
            return false;
        }

        let entry = &mut self.queue[pos];
        entry.attempts += 1;
        entry.ack_deadline = entry
            .class
            .ack_timeout(self.config.answer_ack_timeout, self.config.standard_ack_timeout)
            .map(|timeout| now + timeout);
        if let Err(err) = channel.send(entry.encoded.clone()) {
            entry.attempts -= 1;
            entry.ack_deadline = None;
            debug!(
                target = "quiz_link::delivery",
                id,
                error = %err,
                "send failed; will retry on next sweep"
            );
            return false;
        }
        trace!(
            target = "quiz_link::delivery",
            id,
            attempt = entry.attempts,
            max_attempts = entry.max_attempts,
            "message transmitted"
        );
        if !entry.class.tracks_ack() {
            self.remove_at(pos);
        }
        true
    }

    /// Resolve an acknowledgment by local or caller-supplied id.
    pub fn acknowledge(&mut self, id: &str) -> AckOutcome {
        let local = self
            .correlation
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string());
        let Some(pos) = self
            .queue
            .iter()
            .position(|entry| entry.id == local || entry.wire_id == id)
        else {
            let known = self.acked.contains(id) || self.acked.contains(&local);
            self.acked.insert(id);
            self.acked.insert(&local);
            return if known {
                AckOutcome::AlreadyAcknowledged
            } else {
                trace!(target = "quiz_link::delivery", id, "ack for unknown message");
                AckOutcome::Unknown
            };
        };

        let entry = self.remove_at(pos);
        if entry.class == DeliveryClass::Answer {
            if let Some(key) = entry.logical_key.as_deref() {
                self.mark_complete(key);
            }
        }
        self.acked.insert(&entry.id);
        self.acked.insert(&entry.wire_id);
        self.acked.insert(id);
        debug!(
            target = "quiz_link::delivery",
            id = %entry.id,
            wire_id = %entry.wire_id,
            attempts = entry.attempts,
            "message acknowledged"
        );
        self.events.push(DeliveryEvent::Acknowledged {
            id: entry.id.clone(),
            logical_key: entry.logical_key.clone(),
        });
        AckOutcome::Acknowledged(entry.id)
    }

    /// Clear lapsed ack timers. Answer-class messages are assumed delivered
    /// and dropped; others become eligible for the next retry sweep.
    pub fn expire_ack_timeouts(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .queue
            .iter()
            .filter(|entry| entry.ack_deadline.is_some_and(|deadline| deadline <= now))
            .map(|entry| entry.id.clone())
            .collect();
        for id in expired {
            let Some(pos) = self.position(&id) else {
                continue;
            };
            self.queue[pos].ack_deadline = None;
            if self.queue[pos].class == DeliveryClass::Answer {
                let entry = self.remove_at(pos);
                if let Some(key) = entry.logical_key.as_deref() {
                    self.mark_complete(key);
                }
                info!(
                    target = "quiz_link::delivery",
                    id = %entry.id,
                    logical_key = ?entry.logical_key,
                    "answer unacknowledged; assuming delivered"
                );
                self.events.push(DeliveryEvent::AssumedDelivered {
                    id: entry.id,
                    logical_key: entry.logical_key,
                });
            } else {
                debug!(
                    target = "quiz_link::delivery",
                    id = %id,
                    attempts = self.queue[pos].attempts,
                    "ack timeout; eligible for retry"
                );
            }
        }
    }

    /// Periodic retry pass. Returns the number of messages transmitted.
    pub fn retry_sweep<C: OutboundChannel + ?Sized>(&mut self, channel: &C, now: Instant) -> usize {
        if self.queue.is_empty() || !channel.is_open() {
            return 0;
        }
        let ids: Vec<String> = self
            .queue
            .iter()
            .filter(|entry| !entry.awaiting_ack())
            .map(|entry| entry.id.clone())
            .collect();
        let mut sent = 0;
        for id in ids {
            if self.try_send(&id, channel, now) {
                sent += 1;
            }
        }
        sent
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|entry| entry.ack_deadline).min()
    }

    pub fn drain_events(&mut self) -> Vec<DeliveryEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn get(&self, id: &str) -> Option<&QueuedMessage> {
        self.queue.iter().find(|entry| entry.id == id)
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_complete(&self, logical_key: &str) -> bool {
        self.completed.contains(logical_key)
    }

    pub fn is_acknowledged(&self, id: &str) -> bool {
        self.acked.contains(id)
    }

    /// Drop every queued message; used when the session closes.
    pub fn clear(&mut self) {
        if !self.queue.is_empty() {
            debug!(
                target = "quiz_link::delivery",
                dropped = self.queue.len(),
                "clearing outbound queue"
            );
        }
        self.queue.clear();
        self.correlation.clear();
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|entry| entry.id == id)
    }

    fn remove_at(&mut self, pos: usize) -> QueuedMessage {
        let entry = self.queue.remove(pos);
        if entry.wire_id != entry.id {
            self.correlation.remove(&entry.wire_id);
        }
        entry
    }

    fn transmitted_answer(&self, key: &str) -> Option<String> {
        self.queue
            .iter()
            .find(|entry| {
                entry.class == DeliveryClass::Answer
                    && entry.attempts >= 1
                    && entry.logical_key.as_deref() == Some(key)
            })
            .map(|entry| entry.id.clone())
    }

    fn supersede(&mut self, key: &str) {
        while let Some(pos) = self
            .queue
            .iter()
            .position(|entry| entry.logical_key.as_deref() == Some(key))
        {
            let entry = self.remove_at(pos);
            debug!(
                target = "quiz_link::delivery",
                id = %entry.id,
                logical_key = key,
                "superseding queued message"
            );
            self.events.push(DeliveryEvent::Superseded {
                id: entry.id,
                logical_key: key.to_string(),
            });
        }
    }

    fn mark_complete(&mut self, key: &str) {
        self.completed.insert(key.to_string());
        self.queue
            .retain(|entry| entry.logical_key.as_deref() != Some(key));
        self.correlation
            .retain(|_, local| self.queue.iter().any(|entry| &entry.id == local));
    }

    fn report_exhausted(&mut self, entry: &QueuedMessage) {
        warn!(
            target = "quiz_link::delivery",
            id = %entry.id,
            kind = %entry.kind,
            attempts = entry.attempts,
            "delivery exhausted; message dropped"
        );
        self.events.push(DeliveryEvent::Exhausted {
            id: entry.id.clone(),
            attempts: entry.attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::error::LinkError;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeChannel {
        open: Cell<bool>,
        sent: RefCell<Vec<Envelope>>,
    }

    impl FakeChannel {
        fn open() -> Self {
            let channel = Self::default();
            channel.open.set(true);
            channel
        }

        fn sent_count(&self) -> usize {
            self.sent.borrow().len()
        }
    }

    impl OutboundChannel for FakeChannel {
        fn is_open(&self) -> bool {
            self.open.get()
        }

        fn send(&self, bytes: Bytes) -> LinkResult<()> {
            if !self.open.get() {
                return Err(LinkError::TransportNotReady);
            }
            self.sent.borrow_mut().push(Envelope::decode(&bytes).unwrap());
            Ok(())
        }
    }

    fn engine() -> ReliableDeliveryEngine {
        ReliableDeliveryEngine::new(DeliveryConfig::default(), Some("p1".into()))
    }

    #[test]
    fn scenario_a_ack_by_caller_id_empties_queue() {
        let channel = FakeChannel::open();
        let mut engine = engine();
        let now = Instant::now();

        let outcome = engine
            .enqueue(
                OutboundMessage::new("quiz", json!({"q": "capital of France"}))
                    .with_correlation_id("m1"),
                &channel,
                now,
            )
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        assert_eq!(channel.sent_count(), 1);
        let sent = channel.sent.borrow()[0].clone();
        assert_eq!(sent.correlation_id.as_deref(), Some("m1"));
        assert_eq!(sent.sender_participant_id.as_deref(), Some("p1"));

        let local = outcome.id().unwrap().to_string();
        assert!(matches!(engine.acknowledge("m1"), AckOutcome::Acknowledged(id) if id == local));
        assert!(engine.is_empty());
        assert!(engine.is_acknowledged("m1"));
        assert!(engine.is_acknowledged(&local));

        assert_eq!(engine.acknowledge("m1"), AckOutcome::AlreadyAcknowledged);
        assert_eq!(engine.retry_sweep(&channel, now + Duration::from_secs(5)), 0);
        assert_eq!(channel.sent_count(), 1);
    }

    #[test]
    fn scenario_b_answer_timeout_marks_key_complete() {
        let channel = FakeChannel::open();
        let mut engine = engine();
        let now = Instant::now();

        engine
            .enqueue(OutboundMessage::answer("q1", json!({"choice": 2})), &channel, now)
            .unwrap();
        assert_eq!(channel.sent_count(), 1);

        engine.expire_ack_timeouts(now + Duration::from_millis(999));
        assert_eq!(engine.len(), 1);

        engine.expire_ack_timeouts(now + Duration::from_millis(1000));
        assert!(engine.is_empty());
        assert!(engine.is_complete("q1"));
        assert!(matches!(
            engine.drain_events().as_slice(),
            [DeliveryEvent::AssumedDelivered { logical_key: Some(key), .. }] if key == "q1"
        ));

        let again = engine
            .enqueue(OutboundMessage::answer("q1", json!({"choice": 3})), &channel, now)
            .unwrap();
        assert_eq!(again, EnqueueOutcome::AlreadyComplete);
        assert_eq!(channel.sent_count(), 1);
    }

    #[test]
    fn scenario_c_closed_channel_keeps_attempts_at_zero() {
        let channel = FakeChannel::default();
        let mut engine = engine();
        let start = Instant::now();

        let id = engine
            .enqueue(OutboundMessage::new("quiz", json!(1)), &channel, start)
            .unwrap()
            .id()
            .unwrap()
            .to_string();
        for sweep in 1..=5 {
            engine.retry_sweep(&channel, start + Duration::from_secs(sweep));
        }
        let entry = engine.get(&id).expect("still queued");
        assert_eq!(entry.attempts, 0);
        assert!(!entry.awaiting_ack());

        channel.open.set(true);
        assert_eq!(engine.retry_sweep(&channel, start + Duration::from_secs(6)), 1);
        assert_eq!(engine.get(&id).unwrap().attempts, 1);
    }

    #[test]
    fn second_enqueue_for_key_supersedes_first() {
        let channel = FakeChannel::default();
        let mut engine = engine();
        let now = Instant::now();

        let first = engine
            .enqueue(OutboundMessage::new("vote", json!("a")).with_logical_key("poll-1"), &channel, now)
            .unwrap();
        let second = engine
            .enqueue(OutboundMessage::new("vote", json!("b")).with_logical_key("poll-1"), &channel, now)
            .unwrap();

        assert_eq!(engine.len(), 1);
        assert!(engine.get(first.id().unwrap()).is_none());
        assert!(engine.get(second.id().unwrap()).is_some());
        assert!(matches!(
            engine.drain_events().as_slice(),
            [DeliveryEvent::Superseded { logical_key, .. }] if logical_key == "poll-1"
        ));
    }

    #[test]
    fn transmitted_answer_is_not_superseded() {
        let channel = FakeChannel::default();
        let mut engine = engine();
        let now = Instant::now();

        let draft = engine
            .enqueue(OutboundMessage::answer("q3", json!("A")), &channel, now)
            .unwrap();
        channel.open.set(true);
        let sent = engine
            .enqueue(OutboundMessage::answer("q3", json!("B")), &channel, now)
            .unwrap();
        assert!(engine.get(draft.id().unwrap()).is_none(), "unsent answer is replaceable");
        assert_eq!(channel.sent_count(), 1);

        let refused = engine
            .enqueue(OutboundMessage::answer("q3", json!("C")), &channel, now)
            .unwrap();
        assert_eq!(refused, EnqueueOutcome::AnswerInFlight(sent.id().unwrap().to_string()));
        assert_eq!(engine.len(), 1);
        assert_eq!(channel.sent_count(), 1);
        assert_eq!(channel.sent.borrow()[0].payload, json!("B"));

        engine.expire_ack_timeouts(now + Duration::from_secs(1));
        assert!(engine.is_complete("q3"));
        assert_eq!(
            engine
                .enqueue(OutboundMessage::answer("q3", json!("D")), &channel, now)
                .unwrap(),
            EnqueueOutcome::AlreadyComplete
        );
    }

    #[test]
    fn answer_is_never_resent_after_ack() {
        let channel = FakeChannel::open();
        let mut engine = engine();
        let now = Instant::now();

        let id = engine
            .enqueue(OutboundMessage::answer("q7", json!("B")), &channel, now)
            .unwrap()
            .id()
            .unwrap()
            .to_string();
        assert!(!engine.try_send(&id, &channel, now));
        assert!(matches!(engine.acknowledge(&id), AckOutcome::Acknowledged(_)));
        assert!(engine.is_complete("q7"));

        engine.retry_sweep(&channel, now + Duration::from_secs(10));
        let outcome = engine
            .enqueue(OutboundMessage::answer("q7", json!("C")), &channel, now)
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::AlreadyComplete);
        assert_eq!(channel.sent_count(), 1);
    }

    #[test]
    fn standard_messages_retry_until_exhausted() {
        let channel = FakeChannel::open();
        let mut engine = engine();
        let mut now = Instant::now();

        let id = engine
            .enqueue(
                OutboundMessage::new("quiz", json!(null)).with_max_attempts(3),
                &channel,
                now,
            )
            .unwrap()
            .id()
            .unwrap()
            .to_string();

        for _ in 0..5 {
            now += Duration::from_secs(3);
            engine.expire_ack_timeouts(now);
            engine.retry_sweep(&channel, now);
        }

        assert_eq!(channel.sent_count(), 3);
        assert!(engine.get(&id).is_none());
        let events = engine.drain_events();
        assert!(events.contains(&DeliveryEvent::Exhausted { id, attempts: 3 }));
    }

    #[test]
    fn pending_messages_are_skipped_by_sweep() {
        let channel = FakeChannel::open();
        let mut engine = engine();
        let now = Instant::now();

        engine
            .enqueue(OutboundMessage::new("quiz", json!(1)), &channel, now)
            .unwrap();
        assert_eq!(engine.retry_sweep(&channel, now + Duration::from_secs(1)), 0);
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(3)));
        assert_eq!(channel.sent_count(), 1);
    }

    #[test]
    fn unacknowledged_classes_leave_queue_after_send() {
        let channel = FakeChannel::open();
        let mut engine = engine();
        let now = Instant::now();

        engine
            .enqueue(OutboundMessage::new("cursor", json!([1, 2])).unreliable(), &channel, now)
            .unwrap();
        engine
            .enqueue(OutboundMessage::new(MessageKind::Ack, json!(null)), &channel, now)
            .unwrap();

        assert!(engine.is_empty());
        assert_eq!(channel.sent_count(), 2);
        assert!(channel.sent.borrow().iter().all(|envelope| envelope.unreliable));
    }

    #[test]
    fn late_ack_for_dropped_message_is_recorded() {
        let mut engine = engine();
        assert_eq!(engine.acknowledge("ghost"), AckOutcome::Unknown);
        assert_eq!(engine.acknowledge("ghost"), AckOutcome::AlreadyAcknowledged);
    }

    #[test]
    fn clear_drops_everything_queued() {
        let channel = FakeChannel::default();
        let mut engine = engine();
        let now = Instant::now();
        engine
            .enqueue(OutboundMessage::new("quiz", json!(1)), &channel, now)
            .unwrap();
        engine.clear();
        assert!(engine.is_empty());
        assert_eq!(engine.next_deadline(), None);
    }
}
