use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::context::{ContextKey, RetryContext};
use super::policy::RetryPolicy;
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::EventHandler;
use crate::error::{HandlerError, TerminalFailure, TerminalReason};
use crate::events::DomainEvent;
use crate::metrics::Metrics;

// ============================================================================
// Retry Executor
// ============================================================================
//
// Runs one handler against one event under a policy:
//
//   submit ──> spawn chain ──> invoke ──ok──> drop context ──> Delivered
//                               │
//                              err ──> context.attempt_count += 1
//                               │
//                 retryable && attempts < max ──> timed wait ──> invoke
//                               │
//                              else ──> DeadLetterSink ──> DeadLettered
//
// - `submit` never blocks: the chain runs on a tokio task
// - one chain per context key at a time (later submissions queue behind)
// - invocations share a bounded pool of permits; waits hold no permit
// - handler errors and panics stay inside the chain
//
// ============================================================================

/// How a retry chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    DeadLettered { attempts: u32, reason: TerminalReason },
    /// Context removed by an administrative call while the chain was running
    Cancelled { attempts: u32 },
    /// Chain task ended without reporting (aborted or runtime shut down)
    Aborted,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts }
            | DeliveryOutcome::DeadLettered { attempts, .. }
            | DeliveryOutcome::Cancelled { attempts } => *attempts,
            DeliveryOutcome::Aborted => 0,
        }
    }
}

/// Handle on a submitted retry chain
pub struct DeliveryHandle {
    pub event_id: Uuid,
    pub handler_name: String,
    pub key: ContextKey,
    task: JoinHandle<DeliveryOutcome>,
}

impl DeliveryHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the chain to end
    pub async fn wait(self) -> DeliveryOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    context_key = %self.key,
                    "Retry chain task did not complete"
                );
                DeliveryOutcome::Aborted
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStatistics {
    /// Chains that failed at least once and have not ended yet
    pub active_retries: usize,
    /// Retries scheduled since start
    pub total_retry_attempts: u64,
    pub total_delivered: u64,
    pub total_dead_lettered: u64,
    pub total_cancelled: u64,
}

#[derive(Clone)]
pub struct RetryExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    contexts: DashMap<ContextKey, RetryContext>,
    lanes: DashMap<ContextKey, Arc<Mutex<()>>>,
    permits: Semaphore,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Metrics>,
    total_retry_attempts: AtomicU64,
    total_delivered: AtomicU64,
    total_dead_lettered: AtomicU64,
    total_cancelled: AtomicU64,
}

impl RetryExecutor {
    pub fn new(
        max_concurrent_handlers: usize,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                contexts: DashMap::new(),
                lanes: DashMap::new(),
                permits: Semaphore::new(max_concurrent_handlers.max(1)),
                dead_letters,
                metrics,
                total_retry_attempts: AtomicU64::new(0),
                total_delivered: AtomicU64::new(0),
                total_dead_lettered: AtomicU64::new(0),
                total_cancelled: AtomicU64::new(0),
            }),
        }
    }

    /// Start delivering `event` to `handler`. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<E: DomainEvent>(
        &self,
        event: Arc<E>,
        handler: Arc<dyn EventHandler<E>>,
        policy: RetryPolicy,
    ) -> DeliveryHandle {
        let key = ContextKey::for_event(&*event, handler.handler_name());
        let event_id = event.event_id();
        let handler_name = handler.handler_name().to_string();

        tracing::debug!(
            event_id = %event_id,
            context_key = %key,
            max_attempts = policy.max_attempts,
            "Submitting event to handler"
        );

        let inner = self.inner.clone();
        let chain_key = key.clone();
        let task = tokio::spawn(async move { inner.run_chain(chain_key, event, handler, policy).await });

        DeliveryHandle {
            event_id,
            handler_name,
            key,
            task,
        }
    }

    pub fn stats(&self) -> RetryStatistics {
        RetryStatistics {
            active_retries: self.inner.contexts.len(),
            total_retry_attempts: self.inner.total_retry_attempts.load(Ordering::Relaxed),
            total_delivered: self.inner.total_delivered.load(Ordering::Relaxed),
            total_dead_lettered: self.inner.total_dead_lettered.load(Ordering::Relaxed),
            total_cancelled: self.inner.total_cancelled.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of one chain's attempt state
    pub fn context(&self, key: &ContextKey) -> Option<RetryContext> {
        self.inner.contexts.get(key).map(|ctx| ctx.clone())
    }

    pub fn active_contexts(&self) -> Vec<RetryContext> {
        self.inner.contexts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop a chain's context; the chain stops at its next failure or retry
    pub fn cancel(&self, key: &ContextKey) -> bool {
        let removed = self.inner.contexts.remove(key).is_some();
        if removed {
            tracing::warn!(context_key = %key, "Retry context cancelled");
            self.inner.metrics.set_active_retries(self.inner.contexts.len());
        }
        removed
    }

    /// Remove contexts with no activity within `retention`
    pub fn cleanup_expired(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.inner.contexts.retain(|_, ctx| {
            let expired = ctx.is_expired(now, retention);
            if expired {
                removed += 1;
            }
            !expired
        });

        if removed > 0 {
            tracing::info!(removed = removed, "Removed expired retry contexts");
            self.inner.metrics.set_active_retries(self.inner.contexts.len());
        }
        removed
    }
}

impl ExecutorInner {
    async fn run_chain<E: DomainEvent>(
        self: Arc<Self>,
        key: ContextKey,
        event: Arc<E>,
        handler: Arc<dyn EventHandler<E>>,
        policy: RetryPolicy,
    ) -> DeliveryOutcome {
        let lane = Arc::clone(
            &self
                .lanes
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );

        let outcome = {
            let _turn = lane.lock().await;
            self.drive(&key, &event, handler.as_ref(), &policy).await
        };

        drop(lane);
        self.lanes.remove_if(&key, |_, lane| Arc::strong_count(lane) == 1);

        outcome
    }

    async fn drive<E: DomainEvent>(
        &self,
        key: &ContextKey,
        event: &Arc<E>,
        handler: &dyn EventHandler<E>,
        policy: &RetryPolicy,
    ) -> DeliveryOutcome {
        let handler_name = handler.handler_name();
        let mut attempts: u32 = 0;

        loop {
            tracing::debug!(
                event_id = %event.event_id(),
                handler = %handler_name,
                attempt = attempts + 1,
                max_attempts = policy.max_attempts,
                "Invoking handler"
            );

            let error = match self.invoke(handler, event.clone()).await {
                Ok(()) => return self.delivered(key, handler_name, attempts + 1),
                Err(error) => error,
            };

            // The local count is authoritative. Only the first failure creates
            // the context; a context missing after that was cancelled.
            attempts += 1;
            if attempts == 1 {
                self.contexts
                    .entry(key.clone())
                    .or_insert_with(|| RetryContext::new(key.clone(), event.event_id()))
                    .record_failure(&error.to_string(), policy.max_attempts);
            } else {
                match self.contexts.get_mut(key) {
                    Some(mut ctx) => {
                        ctx.record_failure(&error.to_string(), policy.max_attempts);
                    }
                    None => return self.cancelled(key, attempts),
                }
            }
            self.metrics.set_active_retries(self.contexts.len());

            if !policy.is_retryable(&error, attempts) {
                return self.dead_letter(key, &**event, handler_name, attempts, policy, error).await;
            }

            let delay = policy.delay_for_attempt(attempts);
            let retry_at = match self.contexts.get_mut(key) {
                Some(mut ctx) => ctx.schedule_retry(delay),
                None => return self.cancelled(key, attempts),
            };

            self.total_retry_attempts.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_retry_attempt(handler_name, attempts);

            tracing::warn!(
                event_id = %event.event_id(),
                handler = %handler_name,
                attempt = attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                retry_at = %retry_at,
                "Handler failed, retrying after delay"
            );

            tokio::time::sleep(delay).await;

            if !self.contexts.contains_key(key) {
                return self.cancelled(key, attempts);
            }
        }
    }

    async fn invoke<E: DomainEvent>(
        &self,
        handler: &dyn EventHandler<E>,
        event: Arc<E>,
    ) -> Result<(), HandlerError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| HandlerError::retryable("handler pool closed"))?;

        let started = Instant::now();
        let result = match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        self.metrics.record_invocation(
            handler.handler_name(),
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );

        result
    }

    fn delivered(&self, key: &ContextKey, handler_name: &str, attempts: u32) -> DeliveryOutcome {
        self.contexts.remove(key);
        self.metrics.set_active_retries(self.contexts.len());
        self.total_delivered.fetch_add(1, Ordering::Relaxed);

        if attempts > 1 {
            self.metrics.record_retry_outcome(handler_name, true);
            tracing::info!(
                context_key = %key,
                attempt = attempts,
                "Handler succeeded after retry"
            );
        }

        DeliveryOutcome::Delivered { attempts }
    }

    async fn dead_letter(
        &self,
        key: &ContextKey,
        event: &dyn DomainEvent,
        handler_name: &str,
        attempts: u32,
        policy: &RetryPolicy,
        error: HandlerError,
    ) -> DeliveryOutcome {
        let reason = if policy.should_retry(&error) {
            TerminalReason::Exhausted
        } else {
            TerminalReason::NonRetryable
        };

        let now = Utc::now();
        let first_failed_at = self
            .contexts
            .get(key)
            .map(|ctx| ctx.first_failure_time)
            .unwrap_or(now);

        let failure = TerminalFailure {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            handler_name: handler_name.to_string(),
            attempts,
            reason,
            first_failed_at,
            last_failed_at: now,
            cause: error,
        };

        self.dead_letters.accept(event, &failure).await;

        self.contexts.remove(key);
        self.metrics.set_active_retries(self.contexts.len());
        self.metrics.record_retry_outcome(handler_name, false);
        self.metrics.record_dlq_message(event.event_type());
        self.total_dead_lettered.fetch_add(1, Ordering::Relaxed);

        DeliveryOutcome::DeadLettered { attempts, reason }
    }

    fn cancelled(&self, key: &ContextKey, attempts: u32) -> DeliveryOutcome {
        tracing::warn!(
            context_key = %key,
            attempts = attempts,
            "Retry context removed while a retry was pending, stopping chain"
        );
        self.total_cancelled.fetch_add(1, Ordering::Relaxed);
        DeliveryOutcome::Cancelled { attempts }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
