//! Build pipeline
//!
//! Every unit of work is an [`AsyncStep`]: a spawned task whose result is memoized and can
//! be awaited by any number of later steps. A step only ever receives handles to steps that
//! already exist, so the graph is acyclic by construction. [`StepsRunner`] wires the steps
//! for one build target and awaits the last one.

pub mod build;
pub mod context;
pub mod local;
pub mod pull;
pub mod push;
pub mod runner;

pub use context::BuildContext;
pub use runner::{BuildResult, StepsRunner};

use crate::error::{BuilderError, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, try_join_all};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// A memoized, cancellable unit of build work
///
/// The work is spawned on construction; it is expected to await the steps it depends on
/// before doing anything else. Cloning yields another handle on the same result.
pub struct AsyncStep<T: Clone + Send + Sync + 'static> {
    name: &'static str,
    result: Shared<BoxFuture<'static, Result<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncStep<T> {
    pub fn new<F>(name: &'static str, cancellation: &CancellationToken, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let cancellation = cancellation.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(BuilderError::Cancelled),
                result = work => result,
            }
        });
        Self {
            name,
            result: async move { handle.await? }.boxed().shared(),
        }
    }

    /// A step that is already complete
    pub fn ready(name: &'static str, value: T) -> Self {
        Self {
            name,
            result: futures::future::ready(Ok(value)).boxed().shared(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the result; every caller observes the same value or error
    pub async fn get(&self) -> Result<T> {
        self.result.clone().await
    }

    /// Result if the step has already finished
    pub fn peek(&self) -> Option<Result<T>> {
        self.result.peek().cloned()
    }

    /// Step that runs `work` with this step's result once it is available
    pub fn then<U, F, Fut>(&self, name: &'static str, cancellation: &CancellationToken, work: F) -> AsyncStep<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let dependency = self.clone();
        AsyncStep::new(name, cancellation, async move { work(dependency.get().await?).await })
    }

    /// Step resolving to the results of `steps` in order; the first failure wins
    pub fn all(name: &'static str, cancellation: &CancellationToken, steps: Vec<AsyncStep<T>>) -> AsyncStep<Vec<T>> {
        AsyncStep::new(name, cancellation, async move {
            try_join_all(steps.iter().map(AsyncStep::get)).await
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for AsyncStep<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            result: self.result.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for AsyncStep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStep")
            .field("name", &self.name)
            .field("done", &self.result.peek().is_some())
            .finish()
    }
}
