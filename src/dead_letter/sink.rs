use async_trait::async_trait;

use crate::error::TerminalFailure;
use crate::events::DomainEvent;

/// Receiver of terminally failed (event, handler) pairs.
///
/// Called once per failed chain, from the executor task that ran it.
/// Implementations must not panic and have no way to fail the pipeline.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn accept(&self, event: &dyn DomainEvent, failure: &TerminalFailure);
}

/// Default sink: one structured error log line per dead letter
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn accept(&self, event: &dyn DomainEvent, failure: &TerminalFailure) {
        log_dead_letter(event, failure);
    }
}

pub(crate) fn log_dead_letter(event: &dyn DomainEvent, failure: &TerminalFailure) {
    tracing::error!(
        event_id = %event.event_id(),
        event_type = %event.event_type(),
        aggregate_id = %event.aggregate_id(),
        handler = %failure.handler_name,
        attempts = failure.attempts,
        reason = %failure.reason,
        root_cause = %failure.cause.root_cause(),
        "💀 Routing event to dead letter sink"
    );
}
