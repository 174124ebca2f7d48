use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_reliability::metrics::start_metrics_server;
use event_reliability::{
    DispatcherConfig, EventDispatcher, EventEnvelope, HandlerError, RetryPolicy,
};

type OrderEvent = EventEnvelope<serde_json::Value>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,event_reliability=debug")),
        )
        .init();

    tracing::info!("🚀 Starting event reliability demo");

    // === 1. Configuration ===
    let config = DispatcherConfig::from_env()?;
    let metrics_port: u16 = std::env::var("EVENT_RELIABILITY_METRICS_PORT")
        .ok()
        .map(|raw| raw.parse::<u16>())
        .transpose()?
        .unwrap_or(9090);
    tracing::info!(?config, "Loaded dispatcher configuration");

    let dispatcher: EventDispatcher<OrderEvent> = EventDispatcher::new(config)?;
    let _cleanup = dispatcher.start_cleanup_task();

    // === 2. Metrics server on its own thread ===
    let registry = Arc::new(dispatcher.metrics().registry().clone());
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(start_metrics_server(registry, metrics_port)) {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    // === 3. Handlers ===
    dispatcher.register_handler("OrderCreated", "inventory", |event: Arc<OrderEvent>| async move {
        tracing::info!(order_id = %event.aggregate_id, "📦 Reserving stock");
        Ok(())
    })?;

    // Payment gateway that times out twice before accepting
    let payment_calls = Arc::new(AtomicU32::new(0));
    dispatcher.register_handler_with_policy("OrderCreated", "payment", RetryPolicy::fast(), {
        let payment_calls = payment_calls.clone();
        move |event: Arc<OrderEvent>| {
            let payment_calls = payment_calls.clone();
            async move {
                let call = payment_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= 2 {
                    return Err(HandlerError::retryable(format!("payment gateway timeout (call {call})")));
                }
                tracing::info!(order_id = %event.aggregate_id, "💳 Payment captured");
                Ok(())
            }
        }
    })?;

    dispatcher.register_handler("OrderCancelled", "refund", |event: Arc<OrderEvent>| async move {
        Err(HandlerError::non_retryable(format!(
            "no payment on record for {}",
            event.aggregate_id
        )))
    })?;

    // === 4. Publish ===
    let order_id = "order-1001";
    let event = |event_type: &str, sequence: i64| {
        EventEnvelope::new(order_id, event_type, json!({ "order_id": order_id })).with_sequence(sequence)
    };

    let mut receipts = Vec::new();
    receipts.push(dispatcher.publish(event("OrderCreated", 1))?);
    receipts.push(dispatcher.publish(event("OrderCancelled", 2))?);

    // Redelivered by the transport
    receipts.push(dispatcher.publish(event("OrderCancelled", 2))?);

    // Positions 3 and 4 never arrive
    receipts.push(dispatcher.publish(event("OrderCreated", 5))?);

    for receipt in &receipts {
        if let Some(record) = &receipt.sequence {
            tracing::info!(
                event_id = %receipt.event_id,
                status = %record.status(),
                expected = record.expected_sequence,
                actual = record.actual_sequence,
                "Sequence check"
            );
        }
    }

    for receipt in receipts {
        for outcome in receipt.wait_all().await {
            tracing::info!(?outcome, "Delivery finished");
        }
    }

    // Operator decides the gap is acceptable
    dispatcher.force_update_sequence(order_id, 5);
    dispatcher.publish(event("OrderCreated", 6))?.wait_all().await;

    // === 5. Report ===
    let report = json!({
        "retry": dispatcher.retry_statistics(),
        "sequence": dispatcher.sequence_statistics(),
        "dead_letters": dispatcher.dead_letters().map(|queue| queue.stats()),
        "current_sequence": dispatcher.current_sequence(order_id),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!("🎉 Demo complete!");
    Ok(())
}
