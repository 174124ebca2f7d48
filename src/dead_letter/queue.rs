use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::sink::{log_dead_letter, DeadLetterSink};
use crate::error::{TerminalFailure, TerminalReason};
use crate::events::DomainEvent;

// ============================================================================
// In-Memory Dead Letter Queue
// ============================================================================
//
// Keeps terminal failures queryable for manual intervention:
// - list the most recent messages
// - failure counts by event type and handler
// - drain for replay through the dispatcher
//
// Bounded: once full, the oldest message is dropped.
//
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub handler_name: String,
    pub error_message: String,
    pub reason: TerminalReason,
    pub failure_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadLetterStats {
    pub total_messages: usize,
    pub dropped_messages: u64,
    pub by_event_type: HashMap<String, usize>,
    pub by_handler: HashMap<String, usize>,
}

pub struct DeadLetterQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<DeadLetter>,
    dropped: u64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, letter: DeadLetter) {
        let mut state = self.state();
        if state.messages.len() >= self.capacity {
            state.messages.pop_front();
            state.dropped += 1;
            tracing::warn!(capacity = self.capacity, "Dead letter queue full, dropping oldest message");
        }
        state.messages.push_back(letter);
    }

    /// Most recent messages first
    pub fn messages(&self, limit: usize) -> Vec<DeadLetter> {
        self.state().messages.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DeadLetterStats {
        let state = self.state();
        let mut stats = DeadLetterStats {
            total_messages: state.messages.len(),
            dropped_messages: state.dropped,
            ..Default::default()
        };

        for message in &state.messages {
            *stats.by_event_type.entry(message.event_type.clone()).or_default() += 1;
            *stats.by_handler.entry(message.handler_name.clone()).or_default() += 1;
        }

        stats
    }

    /// Remove and return every message, oldest first
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.state().messages.drain(..).collect()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn accept(&self, event: &dyn DomainEvent, failure: &TerminalFailure) {
        log_dead_letter(event, failure);

        self.push(DeadLetter {
            event_id: event.event_id(),
            aggregate_id: event.aggregate_id().to_string(),
            event_type: event.event_type().to_string(),
            handler_name: failure.handler_name.clone(),
            error_message: failure.cause.to_string(),
            reason: failure.reason,
            failure_count: failure.attempts,
            first_failed_at: failure.first_failed_at,
            last_failed_at: failure.last_failed_at,
        });

        tracing::info!(
            event_id = %event.event_id(),
            handler = %failure.handler_name,
            "Message stored in DLQ"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::events::EventEnvelope;

    fn failure_for(event: &dyn DomainEvent, handler: &str) -> TerminalFailure {
        TerminalFailure {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            handler_name: handler.to_string(),
            attempts: 3,
            reason: TerminalReason::Exhausted,
            first_failed_at: Utc::now(),
            last_failed_at: Utc::now(),
            cause: HandlerError::retryable("smtp timeout"),
        }
    }

    #[tokio::test]
    async fn test_accept_stores_message() {
        let queue = DeadLetterQueue::new(10);
        let event = EventEnvelope::new("order-1", "OrderPlaced", ());

        queue.accept(&event, &failure_for(&event, "send_receipt")).await;

        let messages = queue.messages(10);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_id, event.event_id);
        assert_eq!(messages[0].handler_name, "send_receipt");
        assert_eq!(messages[0].failure_count, 3);
        assert_eq!(messages[0].error_message, "smtp timeout");
    }

    #[tokio::test]
    async fn test_stats_group_by_type_and_handler() {
        let queue = DeadLetterQueue::new(10);
        let placed = EventEnvelope::new("order-1", "OrderPlaced", ());
        let cancelled = EventEnvelope::new("order-2", "OrderCancelled", ());

        queue.accept(&placed, &failure_for(&placed, "send_receipt")).await;
        queue.accept(&placed, &failure_for(&placed, "reserve_stock")).await;
        queue.accept(&cancelled, &failure_for(&cancelled, "send_receipt")).await;

        let stats = queue.stats();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.by_event_type["OrderPlaced"], 2);
        assert_eq!(stats.by_handler["send_receipt"], 2);
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let queue = DeadLetterQueue::new(2);
        let events: Vec<_> = (0..3)
            .map(|i| EventEnvelope::new(format!("order-{i}"), "OrderPlaced", ()))
            .collect();

        for event in &events {
            queue.accept(event, &failure_for(event, "send_receipt")).await;
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().dropped_messages, 1);

        let drained = queue.drain();
        assert_eq!(drained[0].aggregate_id, "order-1");
        assert_eq!(drained[1].aggregate_id, "order-2");
        assert!(queue.is_empty());
    }
}
