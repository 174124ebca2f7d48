// ============================================================================
// Per-Aggregate Sequence Checks
// ============================================================================
//
// Classifies each incoming event against the position expected for its
// aggregate. Nothing is buffered or reordered; callers decide what to do
// with duplicates and gaps.
//
// ============================================================================

mod record;
mod source;
mod validator;

pub use record::{SequenceRecord, SequenceStatus};
pub use source::{EventSequenceNumber, OccurredOnEpochSeconds, SequenceSource};
pub use validator::{SequenceStatistics, SequenceValidator};
