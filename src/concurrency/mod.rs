//! Worker pool for running distinct tasks in parallel
//!
//! What this module provides
//! - `WorkerPool<S>` bounding how many tasks a service processes at once
//!
//! Exports
//! - Models
//!   - `ConcurrencyLimit(usize)`
//! - Constructors
//!   - `WorkerPool::from_config(svc, &OrchestratorConfig)` sized by `worker_pool_size`
//! - Services
//!   - `WorkerPool<S>: Service<Vec<Task>, Response = Vec<Result<S::Response, BoxError>>>`
//!
//! Implementation strategy
//! - One semaphore per pool, shared by every batch and every `spawn`, so the
//!   limit holds across concurrent callers
//! - Each task runs on its own Tokio task; a failing task never fails its
//!   siblings, and batch results come back in submission order
//!
//! Testing strategy
//! - Fake services with injected latency; atomic counters assert the bound

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower::{BoxError, Service, ServiceExt};
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::task::Task;

/// Maximum number of tasks in flight.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimit(pub usize);

#[derive(Clone)]
pub struct WorkerPool<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> WorkerPool<S> {
    pub fn new(inner: S, limit: ConcurrencyLimit) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit.0.max(1))),
        }
    }

    /// A pool bounded by `config.worker_pool_size`.
    pub fn from_config(inner: S, config: &OrchestratorConfig) -> Self {
        Self::new(inner, ConcurrencyLimit(config.worker_pool_size))
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<S> WorkerPool<S>
where
    S: Service<Task, Error = BoxError> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    /// Runs one task once a worker slot is free.
    pub fn spawn(&self, task: Task) -> JoinHandle<Result<S::Response, BoxError>> {
        let permits = self.permits.clone();
        let svc = self.inner.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            svc.oneshot(task).await
        })
    }

    /// Runs a batch, returning one result per task in submission order.
    pub async fn run_all(&self, tasks: Vec<Task>) -> Vec<Result<S::Response, BoxError>> {
        let handles: Vec<_> = tasks.into_iter().map(|t| self.spawn(t)).collect();
        let mut results = Vec::with_capacity(handles.len());
        for h in handles {
            results.push(match h.await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "worker task did not finish");
                    Err(Box::new(e) as BoxError)
                }
            });
        }
        results
    }
}

impl<S> Service<Vec<Task>> for WorkerPool<S>
where
    S: Service<Task, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Vec<Result<S::Response, BoxError>>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, tasks: Vec<Task>) -> Self::Future {
        let pool = self.clone();
        Box::pin(async move { Ok(pool.run_all(tasks).await) })
    }
}
