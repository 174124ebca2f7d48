mod handler;

pub use handler::EventHandler;

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use uuid::Uuid;

use self::handler::FnHandler;
use crate::config::DispatcherConfig;
use crate::dead_letter::{DeadLetterQueue, DeadLetterSink};
use crate::error::{DispatchError, HandlerError};
use crate::events::DomainEvent;
use crate::metrics::Metrics;
use crate::retry::{ContextKey, DeliveryHandle, DeliveryOutcome, RetryContext, RetryExecutor, RetryPolicy, RetryStatistics};
use crate::sequence::{EventSequenceNumber, SequenceRecord, SequenceSource, SequenceStatistics, SequenceValidator};

// ============================================================================
// Event Dispatcher
// ============================================================================
//
// Entry point for producers and administrators:
//
//   publish(event)
//     ├─ reject events without type or aggregate id
//     ├─ sequence check (optional) ──> SequenceRecord in the receipt
//     └─ for each handler registered for event_type:
//          RetryExecutor::submit(event, handler, handler's policy)
//
// publish returns once every chain is submitted. Handler failures never
// surface here; they end in a dead letter. A duplicate or out-of-order
// classification is reported to the caller, delivery still happens.
//
// ============================================================================

struct Registration<E> {
    handler: Arc<dyn EventHandler<E>>,
    policy: RetryPolicy,
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Result of a publish call
pub struct PublishReceipt {
    pub event_id: Uuid,
    /// Present when sequence validation is enabled
    pub sequence: Option<SequenceRecord>,
    pub deliveries: Vec<DeliveryHandle>,
}

impl PublishReceipt {
    /// Wait for every handler chain of this event to end
    pub async fn wait_all(self) -> Vec<DeliveryOutcome> {
        join_all(self.deliveries.into_iter().map(|handle| handle.wait())).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub retry_contexts: usize,
    pub sequence_records: usize,
}

/// Periodic cleanup task; aborted on `shutdown` or drop
pub struct CleanupHandle {
    task: JoinHandle<()>,
}

impl CleanupHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct EventDispatcher<E: DomainEvent> {
    registry: RwLock<HashMap<String, Vec<Registration<E>>>>,
    executor: RetryExecutor,
    validator: Arc<SequenceValidator>,
    metrics: Arc<Metrics>,
    dead_letters: Option<Arc<DeadLetterQueue>>,
    config: DispatcherConfig,
}

impl<E: DomainEvent> EventDispatcher<E> {
    /// Dispatcher whose dead letters are kept in an in-memory queue
    pub fn new(config: DispatcherConfig) -> anyhow::Result<Self> {
        let queue = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));
        Self::build(config, queue.clone(), Some(queue))
    }

    /// Dispatcher handing dead letters to `sink`
    pub fn with_dead_letter_sink(config: DispatcherConfig, sink: Arc<dyn DeadLetterSink>) -> anyhow::Result<Self> {
        Self::build(config, sink, None)
    }

    fn build(
        config: DispatcherConfig,
        sink: Arc<dyn DeadLetterSink>,
        dead_letters: Option<Arc<DeadLetterQueue>>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let executor = RetryExecutor::new(config.max_concurrent_handlers, sink, metrics.clone());
        let validator = Arc::new(SequenceValidator::new(
            Arc::new(EventSequenceNumber),
            config.max_retained_records,
        ));

        tracing::info!(
            max_concurrent_handlers = config.max_concurrent_handlers,
            validate_sequences = config.validate_sequences,
            "Event dispatcher created"
        );

        Ok(Self {
            registry: RwLock::new(HashMap::new()),
            executor,
            validator,
            metrics,
            dead_letters,
            config,
        })
    }

    /// Replace where sequence numbers are read from. Resets all counters.
    pub fn with_sequence_source(mut self, source: Arc<dyn SequenceSource>) -> Self {
        self.validator = Arc::new(SequenceValidator::new(source, self.config.max_retained_records));
        self
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an async closure under the default retry policy
    pub fn register_handler<F, Fut>(&self, event_type: &str, handler_name: &str, f: F) -> Result<(), DispatchError>
    where
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler::<E>::new(handler_name, f)), None)
    }

    pub fn register_handler_with_policy<F, Fut>(
        &self,
        event_type: &str,
        handler_name: &str,
        policy: RetryPolicy,
        f: F,
    ) -> Result<(), DispatchError>
    where
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler::<E>::new(handler_name, f)), Some(policy))
    }

    /// Register a handler object; `None` selects the default policy
    pub fn register(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler<E>>,
        policy: Option<RetryPolicy>,
    ) -> Result<(), DispatchError> {
        let policy = policy.unwrap_or_default();
        let handler_name = handler.handler_name().to_string();

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let handlers = registry.entry(event_type.to_string()).or_default();

        if handlers.iter().any(|r| r.handler.handler_name() == handler_name) {
            return Err(DispatchError::DuplicateHandler {
                event_type: event_type.to_string(),
                handler_name,
            });
        }

        tracing::info!(
            event_type = %event_type,
            handler = %handler_name,
            max_attempts = policy.max_attempts,
            "Registered event handler"
        );
        handlers.push(Registration { handler, policy });
        Ok(())
    }

    pub fn unregister_handler(&self, event_type: &str, handler_name: &str) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = registry.get_mut(event_type) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|r| r.handler.handler_name() != handler_name);
        let removed = handlers.len() < before;

        if handlers.is_empty() {
            registry.remove(event_type);
        }
        if removed {
            tracing::info!(event_type = %event_type, handler = %handler_name, "Unregistered event handler");
        }
        removed
    }

    pub fn handler_names(&self, event_type: &str) -> Result<Vec<String>, DispatchError> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .get(event_type)
            .map(|handlers| handlers.iter().map(|r| r.handler.handler_name().to_string()).collect())
            .ok_or_else(|| DispatchError::UnknownEventType(event_type.to_string()))
    }

    fn handlers_for(&self, event_type: &str) -> Vec<Registration<E>> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(event_type).cloned().unwrap_or_default()
    }

    // ========================================================================
    // Publication
    // ========================================================================

    /// Submit `event` to every handler registered for its type.
    ///
    /// Must be called from within a tokio runtime.
    pub fn publish(&self, event: impl Into<Arc<E>>) -> Result<PublishReceipt, DispatchError> {
        let event: Arc<E> = event.into();

        if event.event_type().is_empty() {
            return Err(DispatchError::InvalidEvent {
                reason: "event type is empty".to_string(),
            });
        }
        if event.aggregate_id().is_empty() {
            return Err(DispatchError::InvalidEvent {
                reason: "aggregate id is empty".to_string(),
            });
        }

        let sequence = if self.config.validate_sequences {
            let record = self.validator.validate(&*event)?;
            self.metrics.record_sequence_check(record.status().as_str());
            Some(record)
        } else {
            None
        };

        self.metrics.record_publish(event.event_type());

        let handlers = self.handlers_for(event.event_type());
        if handlers.is_empty() {
            tracing::debug!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                "No handlers registered for event type"
            );
        }

        let deliveries = handlers
            .into_iter()
            .map(|r| self.executor.submit(event.clone(), r.handler, r.policy))
            .collect::<Vec<_>>();

        tracing::debug!(
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            aggregate_id = %event.aggregate_id(),
            handlers = deliveries.len(),
            "Event published"
        );

        Ok(PublishReceipt {
            event_id: event.event_id(),
            sequence,
            deliveries,
        })
    }

    // ========================================================================
    // Management
    // ========================================================================

    pub fn retry_statistics(&self) -> RetryStatistics {
        self.executor.stats()
    }

    pub fn retry_context(&self, key: &ContextKey) -> Option<RetryContext> {
        self.executor.context(key)
    }

    pub fn active_retries(&self) -> Vec<RetryContext> {
        self.executor.active_contexts()
    }

    /// Stop a chain before its next attempt
    pub fn cancel_retry(&self, key: &ContextKey) -> bool {
        self.executor.cancel(key)
    }

    pub fn sequence_statistics(&self) -> SequenceStatistics {
        self.validator.statistics()
    }

    pub fn current_sequence(&self, aggregate_id: &str) -> i64 {
        self.validator.current_sequence(aggregate_id)
    }

    pub fn force_update_sequence(&self, aggregate_id: &str, sequence: i64) {
        self.validator.force_update_sequence(aggregate_id, sequence);
    }

    pub fn reset_sequence(&self, aggregate_id: &str) -> bool {
        self.validator.reset_sequence(aggregate_id)
    }

    pub fn sequence_records(&self, aggregate_id: &str) -> Vec<SequenceRecord> {
        self.validator.records_for(aggregate_id)
    }

    /// Purge retry contexts and sequence records idle past the retention
    pub fn cleanup_expired(&self) -> CleanupReport {
        cleanup(&self.executor, &self.validator, self.config.retention)
    }

    /// Run `cleanup_expired` every `cleanup_interval`
    pub fn start_cleanup_task(&self) -> CleanupHandle {
        let executor = self.executor.clone();
        let validator = self.validator.clone();
        let retention = self.config.retention;
        let interval = self.config.cleanup_interval;

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                cleanup(&executor, &validator, retention);
            }
        });

        tracing::info!(interval_secs = interval.as_secs(), "Started cleanup task");
        CleanupHandle { task }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// In-memory dead letters, when the dispatcher owns the queue
    pub fn dead_letters(&self) -> Option<&DeadLetterQueue> {
        self.dead_letters.as_deref()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

fn cleanup(executor: &RetryExecutor, validator: &SequenceValidator, retention: Duration) -> CleanupReport {
    let report = CleanupReport {
        retry_contexts: executor.cleanup_expired(retention),
        sequence_records: validator.cleanup_expired(retention),
    };
    tracing::debug!(
        retry_contexts = report.retry_contexts,
        sequence_records = report.sequence_records,
        "Cleanup pass finished"
    );
    report
}
