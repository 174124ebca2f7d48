use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Verdict of one sequence check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SequenceStatus {
    Valid,
    /// Position already seen (or older)
    Duplicate,
    /// Position beyond the next expected one; a gap exists
    OutOfOrder,
}

impl SequenceStatus {
    pub fn classify(expected: i64, actual: i64) -> Self {
        match actual.cmp(&expected) {
            std::cmp::Ordering::Equal => SequenceStatus::Valid,
            std::cmp::Ordering::Less => SequenceStatus::Duplicate,
            std::cmp::Ordering::Greater => SequenceStatus::OutOfOrder,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Valid => "valid",
            SequenceStatus::Duplicate => "duplicate",
            SequenceStatus::OutOfOrder => "out_of_order",
        }
    }
}

impl std::fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one validation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceRecord {
    pub aggregate_id: String,
    pub event_type: String,
    pub event_id: Uuid,
    pub expected_sequence: i64,
    pub actual_sequence: i64,
    pub timestamp: DateTime<Utc>,
}

impl SequenceRecord {
    pub fn status(&self) -> SequenceStatus {
        SequenceStatus::classify(self.expected_sequence, self.actual_sequence)
    }

    pub fn is_valid(&self) -> bool {
        self.status() == SequenceStatus::Valid
    }

    /// Missing positions between the expected and the received one
    pub fn gap(&self) -> i64 {
        self.actual_sequence.saturating_sub(self.expected_sequence).max(0)
    }
}
