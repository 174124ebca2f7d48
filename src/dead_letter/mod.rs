// ============================================================================
// Dead Letter Handling
// ============================================================================
//
// Terminal failures leave the retry pipeline here. The core itself does no
// external I/O: sinks log and optionally keep failures in memory. Alerting or
// persistence plugs in by implementing `DeadLetterSink`.
//
// ============================================================================

mod queue;
mod sink;

pub use queue::{DeadLetter, DeadLetterQueue, DeadLetterStats};
pub use sink::{DeadLetterSink, LoggingDeadLetterSink};
