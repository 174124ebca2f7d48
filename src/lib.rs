// ============================================================================
// Event-Delivery Reliability Core
// ============================================================================
//
// In-process library that delivers domain events to registered handlers with
// at-least-once semantics:
// - Retry with exponential backoff, driven by per-handler policies
// - Dead-letter routing once a retry chain gives up
// - Per-aggregate sequence checks (valid / duplicate / out-of-order)
// - Prometheus metrics for the whole pipeline
//
// Transport, persistence and business rules live outside this crate. They
// produce events and register handlers through `EventDispatcher`.
//
// ============================================================================

pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod sequence;

pub use config::DispatcherConfig;
pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterSink, DeadLetterStats, LoggingDeadLetterSink};
pub use dispatcher::{CleanupHandle, CleanupReport, EventDispatcher, EventHandler, PublishReceipt};
pub use error::{DispatchError, HandlerError, PolicyError, SequenceError, TerminalFailure, TerminalReason};
pub use events::{DomainEvent, EventEnvelope};
pub use metrics::Metrics;
pub use retry::{ContextKey, DeliveryHandle, DeliveryOutcome, RetryContext, RetryExecutor, RetryPolicy, RetryStatistics};
pub use sequence::{
    EventSequenceNumber, OccurredOnEpochSeconds, SequenceRecord, SequenceSource, SequenceStatistics,
    SequenceStatus, SequenceValidator,
};
