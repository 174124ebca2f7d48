use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::events::DomainEvent;

/// Identity of one retry chain: `event_type|aggregate_id|handler_name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new(event_type: &str, aggregate_id: &str, handler_name: &str) -> Self {
        Self(format!("{event_type}|{aggregate_id}|{handler_name}"))
    }

    pub fn for_event(event: &dyn DomainEvent, handler_name: &str) -> Self {
        Self::new(event.event_type(), event.aggregate_id(), handler_name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attempt state of one (event, handler) retry chain.
///
/// Created on the first failure and removed when the chain ends. Only the
/// executor task running the chain mutates it; everyone else gets clones.
#[derive(Debug, Clone, Serialize)]
pub struct RetryContext {
    pub key: ContextKey,
    pub event_id: Uuid,
    pub attempt_count: u32,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub first_failure_time: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl RetryContext {
    pub fn new(key: ContextKey, event_id: Uuid) -> Self {
        Self {
            key,
            event_id,
            attempt_count: 0,
            next_retry_time: None,
            last_attempt_time: None,
            first_failure_time: Utc::now(),
            last_error: None,
        }
    }

    /// Record a failed attempt and return the new attempt count
    pub fn record_failure(&mut self, error: &str, max_attempts: u32) -> u32 {
        let now = Utc::now();
        if self.attempt_count == 0 {
            self.first_failure_time = now;
        }
        self.attempt_count = (self.attempt_count + 1).min(max_attempts);
        self.last_attempt_time = Some(now);
        self.last_error = Some(error.to_string());
        self.next_retry_time = None;
        self.attempt_count
    }

    pub fn schedule_retry(&mut self, delay: Duration) -> DateTime<Utc> {
        let base = self.last_attempt_time.unwrap_or_else(Utc::now);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| base.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_retry_time = Some(at);
        at
    }

    pub fn is_retry_pending(&self) -> bool {
        self.next_retry_time.is_some()
    }

    /// Most recent activity on this chain
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_attempt_time.unwrap_or(self.first_failure_time)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_activity()) > retention
    }
}
