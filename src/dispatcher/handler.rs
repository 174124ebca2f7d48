use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;

/// Consumer of one or more event types.
///
/// Delivery is at-least-once: the same event can reach `handle` again after
/// a failure, so handlers should tolerate repeats.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    /// Name used in retry keys, logs and dead letters
    fn handler_name(&self) -> &str;

    async fn handle(&self, event: Arc<E>) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an `EventHandler`
pub(crate) struct FnHandler<E> {
    name: String,
    handler: Box<dyn Fn(Arc<E>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>,
}

impl<E: Send + Sync + 'static> FnHandler<E> {
    pub(crate) fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(move |event| f(event).boxed()),
        }
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> EventHandler<E> for FnHandler<E> {
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<E>) -> Result<(), HandlerError> {
        (self.handler)(event).await
    }
}
