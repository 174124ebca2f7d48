use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use event_reliability::{
    ContextKey, DeliveryOutcome, DispatcherConfig, EventDispatcher, EventEnvelope, EventHandler,
    HandlerError, RetryPolicy, SequenceStatus, TerminalReason,
};

type OrderEvent = EventEnvelope<String>;

/// Fails `failures` times, then succeeds; records when each call happened
struct ScriptedHandler {
    name: &'static str,
    failures: u32,
    calls: AtomicU32,
    called_at: Mutex<Vec<Instant>>,
}

impl ScriptedHandler {
    fn new(name: &'static str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            failures,
            calls: AtomicU32::new(0),
            called_at: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler<OrderEvent> for ScriptedHandler {
    fn handler_name(&self) -> &str {
        self.name
    }

    async fn handle(&self, _event: Arc<OrderEvent>) -> Result<(), HandlerError> {
        self.called_at.lock().unwrap().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::retryable(format!("downstream unavailable (call {call})")));
        }
        Ok(())
    }
}

fn dispatcher() -> EventDispatcher<OrderEvent> {
    EventDispatcher::new(DispatcherConfig::default()).unwrap()
}

fn order_event(aggregate: &str, sequence: i64) -> OrderEvent {
    EventEnvelope::new(aggregate, "OrderCreated", "{}".to_string()).with_sequence(sequence)
}

#[test]
fn backoff_doubles_and_caps() {
    let policy = RetryPolicy::default();

    let delays: Vec<u64> = (1..=8).map(|n| policy.delay_for_attempt(n).as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn always_failing_handler_is_dead_lettered_after_max_attempts() {
    let dispatcher = dispatcher();
    let handler = ScriptedHandler::new("billing", u32::MAX);
    dispatcher.register("OrderCreated", handler.clone(), None).unwrap();

    let outcomes = dispatcher
        .publish(order_event("order-1", 1))
        .unwrap()
        .wait_all()
        .await;

    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::DeadLettered {
            attempts: 3,
            reason: TerminalReason::Exhausted
        }]
    );
    assert_eq!(handler.calls(), 3);

    let stats = dispatcher.retry_statistics();
    assert_eq!(stats.total_retry_attempts, 2);
    assert_eq!(stats.total_dead_lettered, 1);
    assert_eq!(stats.active_retries, 0);

    let dead_letters = dispatcher.dead_letters().unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters.messages(1)[0].failure_count, 3);
    assert_eq!(dispatcher.metrics().dlq_messages_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_wait_for_the_backoff_delay() {
    let dispatcher = dispatcher();
    let handler = ScriptedHandler::new("billing", u32::MAX);
    dispatcher.register("OrderCreated", handler.clone(), None).unwrap();

    dispatcher
        .publish(order_event("order-1", 1))
        .unwrap()
        .wait_all()
        .await;

    let called_at = handler.called_at.lock().unwrap().clone();
    assert_eq!(called_at.len(), 3);
    assert!(called_at[1] - called_at[0] >= Duration::from_secs(1));
    assert!(called_at[2] - called_at[1] >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn recovery_leaves_no_retry_context() {
    let dispatcher = dispatcher();
    let handler = ScriptedHandler::new("billing", 2);
    dispatcher.register("OrderCreated", handler.clone(), None).unwrap();

    let receipt = dispatcher.publish(order_event("order-1", 1)).unwrap();
    let key = receipt.deliveries[0].key.clone();
    let outcomes = receipt.wait_all().await;

    assert_eq!(outcomes, vec![DeliveryOutcome::Delivered { attempts: 3 }]);
    assert_eq!(handler.calls(), 3);
    assert_eq!(key, ContextKey::new("OrderCreated", "order-1", "billing"));
    assert!(dispatcher.retry_context(&key).is_none());
    assert_eq!(dispatcher.retry_statistics().active_retries, 0);
    assert_eq!(dispatcher.metrics().active_retries.get(), 0);
    assert!(dispatcher.dead_letters().unwrap().is_empty());
}

#[tokio::test]
async fn in_order_events_advance_the_counter() {
    let dispatcher = dispatcher();

    let first = dispatcher.publish(order_event("A", 1)).unwrap();
    assert_eq!(first.sequence.unwrap().status(), SequenceStatus::Valid);
    assert_eq!(dispatcher.current_sequence("A"), 1);

    let second = dispatcher.publish(order_event("A", 2)).unwrap();
    assert_eq!(second.sequence.unwrap().status(), SequenceStatus::Valid);
    assert_eq!(dispatcher.current_sequence("A"), 2);
}

#[tokio::test]
async fn duplicate_does_not_move_the_counter() {
    let dispatcher = dispatcher();
    dispatcher.publish(order_event("A", 1)).unwrap();
    dispatcher.publish(order_event("A", 2)).unwrap();

    let record = dispatcher.publish(order_event("A", 1)).unwrap().sequence.unwrap();
    assert_eq!(record.status(), SequenceStatus::Duplicate);
    assert_eq!(record.expected_sequence, 3);
    assert_eq!(dispatcher.current_sequence("A"), 2);
}

#[tokio::test]
async fn gap_is_reported_until_forced_past() {
    let dispatcher = dispatcher();
    dispatcher.publish(order_event("A", 1)).unwrap();
    dispatcher.publish(order_event("A", 2)).unwrap();

    let record = dispatcher.publish(order_event("A", 5)).unwrap().sequence.unwrap();
    assert_eq!(record.status(), SequenceStatus::OutOfOrder);
    assert_eq!(dispatcher.current_sequence("A"), 2);

    dispatcher.force_update_sequence("A", 5);
    let record = dispatcher.publish(order_event("A", 6)).unwrap().sequence.unwrap();
    assert_eq!(record.status(), SequenceStatus::Valid);
    assert_eq!(dispatcher.current_sequence("A"), 6);

    let stats = dispatcher.sequence_statistics();
    assert_eq!(stats.valid_count, 3);
    assert_eq!(stats.out_of_order_count, 1);
}

#[tokio::test]
async fn reset_expects_position_one() {
    let dispatcher = dispatcher();
    dispatcher.publish(order_event("A", 1)).unwrap();
    dispatcher.publish(order_event("A", 2)).unwrap();

    assert!(dispatcher.reset_sequence("A"));

    let record = dispatcher.publish(order_event("A", 7)).unwrap().sequence.unwrap();
    assert_eq!(record.expected_sequence, 1);
}

#[tokio::test(start_paused = true)]
async fn none_policy_dead_letters_on_first_failure() {
    let dispatcher = dispatcher();
    let handler = ScriptedHandler::new("billing", u32::MAX);
    dispatcher
        .register("OrderCreated", handler.clone(), Some(RetryPolicy::none()))
        .unwrap();

    let outcomes = dispatcher
        .publish(order_event("order-1", 1))
        .unwrap()
        .wait_all()
        .await;

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], DeliveryOutcome::DeadLettered { attempts: 1, .. }));
    assert_eq!(handler.calls(), 1);
    assert_eq!(dispatcher.retry_statistics().total_retry_attempts, 0);
    assert_eq!(dispatcher.dead_letters().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn chains_for_the_same_key_run_one_at_a_time() {
    let dispatcher = dispatcher();
    let handler = ScriptedHandler::new("billing", 1);
    dispatcher.register("OrderCreated", handler.clone(), None).unwrap();

    // Same aggregate and handler: the second chain waits for the first
    let first = dispatcher.publish(order_event("order-1", 1)).unwrap();
    let second = dispatcher.publish(order_event("order-1", 2)).unwrap();

    assert_eq!(first.wait_all().await, vec![DeliveryOutcome::Delivered { attempts: 2 }]);
    assert_eq!(second.wait_all().await, vec![DeliveryOutcome::Delivered { attempts: 1 }]);
    assert_eq!(handler.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn handlers_of_one_event_run_independently() {
    let dispatcher = dispatcher();
    let failing = ScriptedHandler::new("billing", u32::MAX);
    let healthy = ScriptedHandler::new("shipping", 0);
    dispatcher.register("OrderCreated", failing.clone(), None).unwrap();
    dispatcher.register("OrderCreated", healthy.clone(), None).unwrap();

    let started = Instant::now();
    let receipt = dispatcher.publish(order_event("order-1", 1)).unwrap();

    // publish only submits; no handler has run yet
    assert_eq!(failing.calls(), 0);
    assert_eq!(healthy.calls(), 0);
    assert_eq!(receipt.deliveries.len(), 2);

    let mut deliveries = receipt.deliveries;
    let billing_at = deliveries
        .iter()
        .position(|d| d.handler_name == "billing")
        .unwrap();
    let billing = deliveries.remove(billing_at);
    let shipping = deliveries.remove(0);

    // Delivered while billing is still waiting out its first 1s backoff
    assert_eq!(shipping.wait().await, DeliveryOutcome::Delivered { attempts: 1 });
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!billing.is_finished());
    assert_eq!(failing.calls(), 1);

    assert!(matches!(
        billing.wait().await,
        DeliveryOutcome::DeadLettered { attempts: 3, .. }
    ));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(healthy.calls(), 1);
}
