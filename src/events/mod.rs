// ============================================================================
// Events - what producers hand to the dispatcher
// ============================================================================
//
// The reliability core only needs event identity, type, aggregate and timing.
// Payload shape belongs to the producer.
//
// ============================================================================

mod event;

pub use event::{DomainEvent, EventEnvelope};
