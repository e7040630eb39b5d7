use std::future::Future;

use async_trait::async_trait;

use super::Worker;
use crate::error::WorkerError;

/// Adapts an async closure into a [`Worker`].
///
/// ```ignore
/// let worker = FnWorker::new(|req: SynthesisRequest| async move {
///     Ok(candidate_for(req))
/// });
/// ```
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<I, O, F, Fut> Worker<I, O> for FnWorker<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, WorkerError>> + Send,
{
    async fn invoke(&self, item: I) -> Result<O, WorkerError> {
        (self.f)(item).await
    }
}
