use super::acks::BoundedIdSet;
use crate::envelope::Envelope;

/// Outcome of observing one inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundVerdict {
    /// First sighting: hand to the application, then send `ack` if present.
    Deliver { ack: Option<String> },
    /// Retransmission of a message already delivered. `ack` is the
    /// acknowledgment to repeat, in case the first one was lost.
    Duplicate { ack: Option<String> },
}

impl InboundVerdict {
    pub fn ack(&self) -> Option<&str> {
        match self {
            InboundVerdict::Deliver { ack } | InboundVerdict::Duplicate { ack } => ack.as_deref(),
        }
    }
}

/// Tracks inbound correlation ids so each logical message reaches the
/// application at most once.
#[derive(Debug)]
pub struct InboundDeduplicator {
    seen: BoundedIdSet,
}

impl InboundDeduplicator {
    pub fn new(history: usize) -> Self {
        Self {
            seen: BoundedIdSet::new(history),
        }
    }

    pub fn observe(&mut self, envelope: &Envelope) -> InboundVerdict {
        let Some(id) = envelope.correlation_id.as_deref() else {
            return InboundVerdict::Deliver { ack: None };
        };
        let ack = envelope.wants_ack().then(|| id.to_string());
        if self.seen.insert(id) {
            InboundVerdict::Deliver { ack }
        } else {
            tracing::debug!(
                target = "quiz_link::delivery",
                correlation_id = id,
                kind = %envelope.kind,
                "duplicate inbound message suppressed"
            );
            InboundVerdict::Duplicate { ack }
        }
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quiz(id: &str) -> Envelope {
        let mut envelope = Envelope::new("quiz", json!({"question": "2+2"}));
        envelope.correlation_id = Some(id.to_string());
        envelope
    }

    #[test]
    fn same_id_delivers_once() {
        let mut dedup = InboundDeduplicator::new(16);
        let first = dedup.observe(&quiz("m1"));
        let second = dedup.observe(&quiz("m1"));

        assert_eq!(first, InboundVerdict::Deliver { ack: Some("m1".into()) });
        assert!(matches!(second, InboundVerdict::Duplicate { .. }));
        assert!(dedup.has_seen("m1"));
    }

    #[test]
    fn unreliable_messages_are_not_acknowledged() {
        let mut dedup = InboundDeduplicator::new(16);
        let mut envelope = quiz("m2");
        envelope.unreliable = true;
        assert_eq!(dedup.observe(&envelope), InboundVerdict::Deliver { ack: None });
    }

    #[test]
    fn uncorrelated_messages_always_deliver() {
        let mut dedup = InboundDeduplicator::new(16);
        let envelope = Envelope::new("chat", json!("hi"));
        assert_eq!(dedup.observe(&envelope), InboundVerdict::Deliver { ack: None });
        assert_eq!(dedup.observe(&envelope), InboundVerdict::Deliver { ack: None });
    }
}
