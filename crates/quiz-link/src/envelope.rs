//! Typed message envelope carried over the data channel.
//!
//! Frames are JSON text: `{kind, correlationId?, payload, senderParticipantId?, unreliable?}`.
//! The kind and delivery class of an outbound message are fixed when the
//! [`OutboundMessage`] is built and are never re-derived from the payload.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const KIND_HEARTBEAT: &str = "heartbeat";
const KIND_HEARTBEAT_RESPONSE: &str = "heartbeat_response";
const KIND_ACK: &str = "ack";
const KIND_ANSWER: &str = "answer";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Liveness heartbeat; never queued, never acknowledged.
    Heartbeat,
    /// Echo of a heartbeat; never re-echoed.
    HeartbeatResponse,
    /// Acknowledgment carrying the acknowledged correlation id.
    Ack,
    /// Scored quiz answer: single-shot with acknowledgment.
    Answer,
    Custom(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Heartbeat => KIND_HEARTBEAT,
            MessageKind::HeartbeatResponse => KIND_HEARTBEAT_RESPONSE,
            MessageKind::Ack => KIND_ACK,
            MessageKind::Answer => KIND_ANSWER,
            MessageKind::Custom(kind) => kind,
        }
    }

    /// Reserved kinds are link plumbing and never reach the application.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            MessageKind::Heartbeat | MessageKind::HeartbeatResponse | MessageKind::Ack
        )
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            KIND_HEARTBEAT => MessageKind::Heartbeat,
            KIND_HEARTBEAT_RESPONSE => MessageKind::HeartbeatResponse,
            KIND_ACK => MessageKind::Ack,
            KIND_ANSWER => MessageKind::Answer,
            _ => MessageKind::Custom(value),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        MessageKind::from(value.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reliability requirement of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Transmitted once and forgotten; acks are not themselves acknowledged.
    Ack,
    /// One attempt; acknowledged or assumed delivered after its timeout.
    Answer,
    /// Retried until acknowledged or `max_attempts` is reached.
    Standard,
    /// Transmitted once without acknowledgment tracking.
    Unreliable,
}

impl DeliveryClass {
    pub fn for_kind(kind: &MessageKind) -> Self {
        match kind {
            MessageKind::Ack => DeliveryClass::Ack,
            MessageKind::Heartbeat | MessageKind::HeartbeatResponse => DeliveryClass::Unreliable,
            MessageKind::Answer => DeliveryClass::Answer,
            MessageKind::Custom(_) => DeliveryClass::Standard,
        }
    }

    pub fn tracks_ack(self) -> bool {
        matches!(self, DeliveryClass::Answer | DeliveryClass::Standard)
    }

    pub fn ack_timeout(self, answer: Duration, standard: Duration) -> Option<Duration> {
        match self {
            DeliveryClass::Answer => Some(answer),
            DeliveryClass::Standard => Some(standard),
            DeliveryClass::Ack | DeliveryClass::Unreliable => None,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unreliable: bool,
}

impl Envelope {
    pub fn new(kind: impl Into<MessageKind>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            payload,
            sender_participant_id: None,
            unreliable: false,
        }
    }

    pub fn ack(correlation_id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Ack,
            correlation_id: Some(correlation_id.into()),
            payload: Value::Null,
            sender_participant_id: None,
            unreliable: true,
        }
    }

    pub fn heartbeat(seq: u64) -> Self {
        Self {
            kind: MessageKind::Heartbeat,
            correlation_id: None,
            payload: serde_json::json!({ "seq": seq }),
            sender_participant_id: None,
            unreliable: true,
        }
    }

    /// Echo for a received heartbeat. Returns `None` for anything that is not
    /// a heartbeat so responses are never re-echoed.
    pub fn heartbeat_response_to(heartbeat: &Envelope) -> Option<Self> {
        if heartbeat.kind != MessageKind::Heartbeat {
            return None;
        }
        Some(Self {
            kind: MessageKind::HeartbeatResponse,
            correlation_id: None,
            payload: heartbeat.payload.clone(),
            sender_participant_id: None,
            unreliable: true,
        })
    }

    pub fn heartbeat_seq(&self) -> Option<u64> {
        self.payload.get("seq").and_then(Value::as_u64)
    }

    /// Whether the receiver must answer this message with an acknowledgment.
    pub fn wants_ack(&self) -> bool {
        !self.kind.is_reserved() && !self.unreliable && self.correlation_id.is_some()
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A message handed to the link for delivery.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    kind: MessageKind,
    payload: Value,
    class: DeliveryClass,
    correlation_id: Option<String>,
    logical_key: Option<String>,
    max_attempts: Option<u32>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<MessageKind>, payload: Value) -> Self {
        let kind = kind.into();
        let class = DeliveryClass::for_kind(&kind);
        Self {
            kind,
            payload,
            class,
            correlation_id: None,
            logical_key: None,
            max_attempts: None,
        }
    }

    /// Quiz answer keyed by the quiz it answers.
    pub fn answer(quiz_id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Answer, payload).with_logical_key(quiz_id)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_logical_key(mut self, key: impl Into<String>) -> Self {
        self.logical_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Skip acknowledgment tracking for an application kind.
    pub fn unreliable(mut self) -> Self {
        if self.class != DeliveryClass::Ack {
            self.class = DeliveryClass::Unreliable;
        }
        self
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn class(&self) -> DeliveryClass {
        self.class
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn logical_key(&self) -> Option<&str> {
        self.logical_key.as_deref()
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub(crate) fn into_envelope(
        self,
        wire_id: String,
        sender_participant_id: Option<String>,
    ) -> Envelope {
        let unreliable = !self.class.tracks_ack();
        Envelope {
            kind: self.kind,
            correlation_id: Some(wire_id),
            payload: self.payload,
            sender_participant_id,
            unreliable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_through_strings() {
        let encoded = Envelope::new("quiz", json!({"q": 1})).encode().unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("\"kind\":\"quiz\""));
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageKind::Custom("quiz".into()));

        let ack = Envelope::decode(br#"{"kind":"ack","correlationId":"m1"}"#).unwrap();
        assert_eq!(ack.kind, MessageKind::Ack);
        assert_eq!(ack.correlation_id.as_deref(), Some("m1"));
        assert_eq!(ack.payload, Value::Null);
    }

    #[test]
    fn only_heartbeats_are_echoed() {
        let heartbeat = Envelope::heartbeat(7);
        let echo = Envelope::heartbeat_response_to(&heartbeat).expect("echo");
        assert_eq!(echo.kind, MessageKind::HeartbeatResponse);
        assert_eq!(echo.heartbeat_seq(), Some(7));
        assert!(Envelope::heartbeat_response_to(&echo).is_none());
    }

    #[test]
    fn ack_requirement_follows_kind_and_flag() {
        let mut message = Envelope::new("quiz", Value::Null);
        assert!(!message.wants_ack(), "no correlation id");
        message.correlation_id = Some("m1".into());
        assert!(message.wants_ack());
        message.unreliable = true;
        assert!(!message.wants_ack());
        assert!(!Envelope::ack("m1").wants_ack());
    }

    #[test]
    fn delivery_class_is_fixed_at_construction() {
        assert_eq!(
            OutboundMessage::answer("q1", Value::Null).class(),
            DeliveryClass::Answer
        );
        assert_eq!(
            OutboundMessage::new("quiz", Value::Null).class(),
            DeliveryClass::Standard
        );
        assert_eq!(
            OutboundMessage::new("quiz", Value::Null).unreliable().class(),
            DeliveryClass::Unreliable
        );
        assert_eq!(
            OutboundMessage::new("ack", Value::Null).unreliable().class(),
            DeliveryClass::Ack
        );
    }
}
