use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// Domain Event Trait
// ============================================================================

/// Identity and ordering information the delivery pipeline reads from an event.
///
/// Object safe, so sinks and sequence sources can take `&dyn DomainEvent`.
pub trait DomainEvent: Send + Sync + 'static {
    fn event_id(&self) -> Uuid;

    /// Stable type name used for handler routing
    fn event_type(&self) -> &str;

    /// Aggregate that scopes ordering guarantees
    fn aggregate_id(&self) -> &str;

    fn occurred_on(&self) -> DateTime<Utc>;

    /// Position of this event in its aggregate's stream, when the producer
    /// assigns one
    fn sequence_number(&self) -> Option<i64> {
        None
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Generic Event Envelope - wraps any payload with delivery metadata
///
/// Type Parameter:
/// - `P`: The payload carried to handlers
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventEnvelope<P> {
    // Event Identity
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub sequence_number: Option<i64>,

    // Event Type Information
    pub event_type: String,
    pub event_version: i32,

    pub payload: P,

    // Causation & Correlation
    pub causation_id: Option<Uuid>,
    pub correlation_id: Uuid,

    pub user_id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    pub metadata: HashMap<String, String>,
}

impl<P> EventEnvelope<P> {
    pub fn new(aggregate_id: impl Into<String>, event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            sequence_number: None,
            event_type: event_type.into(),
            event_version: 1,
            payload,
            causation_id: None,
            correlation_id: Uuid::new_v4(),
            user_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_sequence(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

impl<P> DomainEvent for EventEnvelope<P>
where
    P: Send + Sync + 'static,
{
    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn occurred_on(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn sequence_number(&self) -> Option<i64> {
        self.sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct OrderPlaced {
        order_id: String,
    }

    #[test]
    fn test_event_envelope_creation() {
        let correlation_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            "order-17",
            "OrderPlaced",
            OrderPlaced {
                order_id: "order-17".to_string(),
            },
        )
        .with_sequence(4)
        .with_correlation(correlation_id);

        assert_eq!(envelope.aggregate_id(), "order-17");
        assert_eq!(envelope.event_type(), "OrderPlaced");
        assert_eq!(envelope.sequence_number(), Some(4));
        assert_eq!(envelope.correlation_id, correlation_id);
        assert_eq!(envelope.event_version, 1);
    }

    #[test]
    fn test_trait_object_access() {
        let envelope = EventEnvelope::new("cart-1", "CartCheckedOut", ());
        let event: &dyn DomainEvent = &envelope;

        assert_eq!(event.event_id(), envelope.event_id);
        assert_eq!(event.occurred_on(), envelope.timestamp);
        assert_eq!(event.sequence_number(), None);
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = EventEnvelope::new("order-9", "OrderPlaced", serde_json::json!({"total": 42}))
            .with_metadata("source".to_string(), "checkout".to_string());

        let json = serde_json::to_string(&envelope).unwrap();
        let restored: EventEnvelope<serde_json::Value> = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.event_id, envelope.event_id);
        assert_eq!(restored.payload["total"], 42);
        assert_eq!(restored.metadata.get("source").map(String::as_str), Some("checkout"));
    }
}
