use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::record::{SequenceRecord, SequenceStatus};
use super::source::{EventSequenceNumber, SequenceSource};
use crate::error::SequenceError;
use crate::events::DomainEvent;

// ============================================================================
// Sequence Validator
// ============================================================================
//
// One counter per aggregate holds the last in-order position seen.
//
//   expected = counter + 1
//   actual == expected  -> Valid      (counter := actual)
//   actual <  expected  -> Duplicate  (counter unchanged)
//   actual >  expected  -> OutOfOrder (counter unchanged, gap not healed)
//
// Counters only move backwards through `reset_sequence` /
// `force_update_sequence`. Records are kept for a bounded window so
// statistics can be computed from them.
//
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequenceStatistics {
    pub tracked_aggregates: usize,
    pub total_records: usize,
    /// Validations since start, including records already purged
    pub total_validations: u64,
    pub valid_count: usize,
    pub duplicate_count: usize,
    pub out_of_order_count: usize,
    pub valid_rate: f64,
    pub duplicate_rate: f64,
    pub out_of_order_rate: f64,
}

pub struct SequenceValidator {
    counters: DashMap<String, i64>,
    records: Mutex<VecDeque<SequenceRecord>>,
    source: Arc<dyn SequenceSource>,
    max_retained_records: usize,
    total_validations: AtomicU64,
}

impl Default for SequenceValidator {
    fn default() -> Self {
        Self::new(Arc::new(EventSequenceNumber), 10_000)
    }
}

impl SequenceValidator {
    pub fn new(source: Arc<dyn SequenceSource>, max_retained_records: usize) -> Self {
        Self {
            counters: DashMap::new(),
            records: Mutex::new(VecDeque::new()),
            source,
            max_retained_records: max_retained_records.max(1),
            total_validations: AtomicU64::new(0),
        }
    }

    fn records(&self) -> MutexGuard<'_, VecDeque<SequenceRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Classify `event` against its aggregate's counter
    pub fn validate(&self, event: &dyn DomainEvent) -> Result<SequenceRecord, SequenceError> {
        let actual = self
            .source
            .sequence_of(event)
            .ok_or_else(|| SequenceError::MissingSequence {
                event_id: event.event_id(),
                aggregate_id: event.aggregate_id().to_string(),
            })?;

        // Read-modify-write under the entry's shard lock
        let expected = {
            let mut counter = self.counters.entry(event.aggregate_id().to_string()).or_insert(0);
            let expected = counter.saturating_add(1);
            if actual == expected {
                *counter = actual;
            }
            expected
        };

        let record = SequenceRecord {
            aggregate_id: event.aggregate_id().to_string(),
            event_type: event.event_type().to_string(),
            event_id: event.event_id(),
            expected_sequence: expected,
            actual_sequence: actual,
            timestamp: Utc::now(),
        };

        match record.status() {
            SequenceStatus::Valid => {
                tracing::debug!(
                    aggregate_id = %record.aggregate_id,
                    sequence = actual,
                    "Event in sequence"
                );
            }
            SequenceStatus::Duplicate => {
                tracing::warn!(
                    aggregate_id = %record.aggregate_id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    expected = expected,
                    actual = actual,
                    "Duplicate event detected"
                );
            }
            SequenceStatus::OutOfOrder => {
                tracing::warn!(
                    aggregate_id = %record.aggregate_id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    expected = expected,
                    actual = actual,
                    gap = record.gap(),
                    "Out-of-order event detected"
                );
            }
        }

        self.total_validations.fetch_add(1, Ordering::Relaxed);
        self.retain(record.clone());

        Ok(record)
    }

    fn retain(&self, record: SequenceRecord) {
        let mut records = self.records();
        while records.len() >= self.max_retained_records {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Last in-order position for `aggregate_id`, 0 when untracked
    pub fn current_sequence(&self, aggregate_id: &str) -> i64 {
        self.counters.get(aggregate_id).map(|c| *c).unwrap_or(0)
    }

    /// Set the counter unconditionally (manual recovery after a gap)
    pub fn force_update_sequence(&self, aggregate_id: &str, sequence: i64) {
        let previous = self.counters.insert(aggregate_id.to_string(), sequence);
        tracing::info!(
            aggregate_id = %aggregate_id,
            previous = ?previous,
            sequence = sequence,
            "Sequence counter force-updated"
        );
    }

    /// Forget the aggregate; its next event is expected at position 1
    pub fn reset_sequence(&self, aggregate_id: &str) -> bool {
        let removed = self.counters.remove(aggregate_id).is_some();
        tracing::info!(aggregate_id = %aggregate_id, tracked = removed, "Sequence counter reset");
        removed
    }

    pub fn tracked_aggregates(&self) -> usize {
        self.counters.len()
    }

    /// Retained records for one aggregate, oldest first
    pub fn records_for(&self, aggregate_id: &str) -> Vec<SequenceRecord> {
        self.records()
            .iter()
            .filter(|r| r.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    /// Drop records older than `retention`
    pub fn cleanup_expired(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut records = self.records();
        let before = records.len();
        records.retain(|r| now.signed_duration_since(r.timestamp) <= retention);
        let removed = before - records.len();

        if removed > 0 {
            tracing::info!(removed = removed, "Removed expired sequence records");
        }
        removed
    }

    pub fn statistics(&self) -> SequenceStatistics {
        let records = self.records();
        let total = records.len();

        let mut stats = SequenceStatistics {
            tracked_aggregates: self.counters.len(),
            total_records: total,
            total_validations: self.total_validations.load(Ordering::Relaxed),
            ..Default::default()
        };

        for record in records.iter() {
            match record.status() {
                SequenceStatus::Valid => stats.valid_count += 1,
                SequenceStatus::Duplicate => stats.duplicate_count += 1,
                SequenceStatus::OutOfOrder => stats.out_of_order_count += 1,
            }
        }

        if total > 0 {
            let total = total as f64;
            stats.valid_rate = stats.valid_count as f64 / total;
            stats.duplicate_rate = stats.duplicate_count as f64 / total;
            stats.out_of_order_rate = stats.out_of_order_count as f64 / total;
        }

        stats
    }
}
