//! The task handler seam.
//!
//! Application code implements [`TaskHandler`] (or passes an async closure)
//! and returns a [`TaskResult`]. Expected failures are reported as
//! `TaskResult::error`; a panic inside the handler is caught by the worker
//! and treated the same way.

use crate::model::TaskResult;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> TaskResult;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value) -> TaskResult {
        (self)(payload).await
    }
}

/// Shared, type-erased handler.
pub type SharedHandler = Arc<dyn TaskHandler>;

/// Box an async closure as a [`SharedHandler`].
///
/// ```
/// use expensio::jobs::handler::handler_fn;
/// use expensio::model::TaskResult;
///
/// let handler = handler_fn(|payload| async move {
///     TaskResult::success(format!("got {payload}"))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Arc::new(f)
}
