//! Observability: handler spans, completed-chain feed, subscriber setup
//!
//! What this module provides
//! - Structured tracing around handler invocations
//! - A feed of completed chains for external analytics; nothing is aggregated
//!   in-process
//!
//! Exports
//! - Models
//!   - `CompletedChain { task_id, status, path, transitions, strategy, steps, error, finished_at }`
//! - Layers
//!   - `TracingLayer<S>` creating a `handler` span with fields: handler, task_id, attempt
//! - Services
//!   - `ChainSink: Service<CompletedChain, Response=()>`, boxed as `ChainSinkSvc`
//!   - `JsonLinesChainSink` appending one JSON object per line to a file
//! - Utils
//!   - `init_tracing(json)` for binaries
//!
//! Testing strategy
//! - Capture sink input with a `service_fn`; read back the JSON-lines file

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Layer, Service};
use tracing::{info_span, Instrument};

use crate::chain::ChainEntry;
use crate::coordinator::Strategy;
use crate::error::ErrorKind;
use crate::handoff::HandlerRequest;
use crate::registry::HandlerId;
use crate::sessions::{SessionState, SessionStatus};
use crate::task::TaskId;

/// Summary of a finished task, emitted once per terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedChain {
    pub task_id: TaskId,
    pub status: SessionStatus,
    /// Visited handlers, origin first.
    pub path: Vec<HandlerId>,
    pub transitions: Vec<ChainEntry>,
    pub strategy: Strategy,
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub finished_at: DateTime<Utc>,
}

impl From<&SessionState> for CompletedChain {
    fn from(state: &SessionState) -> Self {
        Self {
            task_id: state.task_id.clone(),
            status: state.status,
            path: state.chain.path(),
            transitions: state.chain.entries().to_vec(),
            strategy: state.strategy,
            steps: state.steps,
            error: state.last_error.as_ref().map(|e| e.kind),
            finished_at: state.updated_at,
        }
    }
}

pub trait ChainSink: Service<CompletedChain, Response = (), Error = BoxError> {}
impl<T> ChainSink for T where T: Service<CompletedChain, Response = (), Error = BoxError> {}

/// Boxed chain sink.
pub type ChainSinkSvc = BoxCloneSyncService<CompletedChain, (), BoxError>;

/// Sink that drops everything.
pub fn noop_sink() -> ChainSinkSvc {
    BoxCloneSyncService::new(tower::service_fn(|_c: CompletedChain| async {
        Ok::<_, BoxError>(())
    }))
}

/// Appends each completed chain as one JSON line.
#[derive(Debug, Clone)]
pub struct JsonLinesChainSink {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonLinesChainSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Service<CompletedChain> for JsonLinesChainSink {
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, chain: CompletedChain) -> Self::Future {
        let path = self.path.clone();
        let lock = self.write_lock.clone();
        Box::pin(async move {
            let mut line = serde_json::to_vec(&chain)?;
            line.push(b'\n');
            let _guard = lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// Layer that adds a span around each handler invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<HandlerRequest> for Tracing<S>
where
    S: Service<HandlerRequest, Response = String, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = String;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: HandlerRequest) -> Self::Future {
        let span = info_span!(
            "handler",
            handler = %req.handler,
            task_id = %req.task.id(),
            attempt = req.attempt
        );
        let fut = self.inner.call(req).instrument(span.clone());
        Box::pin(async move {
            let out = fut.await;
            span.in_scope(|| match &out {
                Ok(raw) => tracing::debug!(bytes = raw.len(), "handler returned"),
                Err(e) => tracing::debug!(error = %e, "handler errored"),
            });
            out
        })
    }
}

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). Returns quietly if one is already installed.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
