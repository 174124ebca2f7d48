// ============================================================================
// Retry Pipeline
// ============================================================================
//
// - policy:   how often and how long to retry (immutable, shared)
// - context:  attempt state of one (event, handler) chain
// - executor: runs chains on the tokio runtime, routes give-ups to the DLQ
//
// ============================================================================

mod context;
mod executor;
mod policy;

pub use context::{ContextKey, RetryContext};
pub use executor::{DeliveryHandle, DeliveryOutcome, RetryExecutor, RetryStatistics};
pub use policy::RetryPolicy;
