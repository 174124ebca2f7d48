use crate::events::DomainEvent;

/// Where an event's position in its aggregate stream comes from
pub trait SequenceSource: Send + Sync {
    fn sequence_of(&self, event: &dyn DomainEvent) -> Option<i64>;
}

/// Position assigned by the producer (`DomainEvent::sequence_number`)
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSequenceNumber;

impl SequenceSource for EventSequenceNumber {
    fn sequence_of(&self, event: &dyn DomainEvent) -> Option<i64> {
        event.sequence_number()
    }
}

/// Occurrence time in epoch seconds.
///
/// Only detects timestamp regressions; two events in the same second look
/// like duplicates and any pause between events looks like a gap. For
/// producers that cannot assign sequence numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct OccurredOnEpochSeconds;

impl SequenceSource for OccurredOnEpochSeconds {
    fn sequence_of(&self, event: &dyn DomainEvent) -> Option<i64> {
        Some(event.occurred_on().timestamp())
    }
}
