//! Orchestrator: the per-task run loop
//!
//! What this module provides
//! - `Orchestrator` driving a task from intake to a terminal status
//! - `RunReport` returned for every terminal status, never a bare partial result
//!
//! State machine
//! - `Running → Running` on an accepted transfer or a recovered guard violation
//! - `Running → Completed` on a terminal result
//! - `Running → Aborted` on a second guard violation, or cancellation
//! - `Running → Failed` on a handler error or timeout that survives its retry,
//!   or on output the codec cannot decode
//!
//! Exports
//! - Services
//!   - `Orchestrator: Service<Task, Response = RunReport, Error = BoxError>`
//! - Operations
//!   - `start(task)`: classify, route and persist the initial session
//!   - `step(state, cancel)`: one invoke → decode → record transition, then persist
//!   - `run(state, cancel)`: step until terminal, then emit to the chain sink
//!   - `resume(task_id, cancel)`: continue a persisted session; finalized sessions are
//!     returned as-is without invoking any handler
//!   - `submit(task)`: `start` + `run`
//!
//! Implementation strategy
//! - Per-task state lives in a `SessionState` passed explicitly through the
//!   loop and saved after every step; there is no shared mutable routing state
//! - Each invocation goes through `TracingLayer` and `TimeoutLayer`; retries
//!   are driven here so each one lands in the audit trail
//! - Transfer validation order: target exists, chain append (depth, then
//!   cycle), target permitted by the source descriptor
//! - A guard violation keeps the task on the handler that asked for the
//!   transfer and leaves a `handoff.rejected` note in its context; a second
//!   violation before any accepted transfer aborts
//! - `BoundedParallel` tasks start with one concurrent round over the
//!   participants; see `fan_out` for how mixed outcomes resolve
//!
//! Testing strategy
//! - Scripted handlers built with `handler_fn` / `static_reply`; scenario and
//!   property tests live under `tests/`

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::chain::ChainRecord;
use crate::codec::{self, Fragment, REJECTED_KEY};
use crate::config::OrchestratorConfig;
use crate::context::{Context, Priority};
use crate::coordinator::{Coordinator, Strategy};
use crate::error::{ErrorReport, HandoffError, Result};
use crate::handoff::{HandlerRequest, HandoffDecision, TaskResult, TransferRequest};
use crate::observability::{noop_sink, ChainSinkSvc, CompletedChain, TracingLayer};
use crate::registry::{CapabilityRegistry, HandlerId};
use crate::resilience::{RetryPolicy, TimeoutLayer, TransientFailures};
use crate::sessions::{
    AuditEvent, AuditKind, InMemorySessionStore, SessionState, SessionStatus, SessionStore,
};
use crate::task::{Task, TaskId};

/// Final outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: TaskId,
    pub status: SessionStatus,
    pub result: Option<TaskResult>,
    pub chain: ChainRecord,
    pub audit: Vec<AuditEvent>,
    pub last_error: Option<ErrorReport>,
    pub context: Context,
    pub strategy: Strategy,
    pub steps: u32,
}

impl From<&SessionState> for RunReport {
    fn from(state: &SessionState) -> Self {
        Self {
            task_id: state.task_id.clone(),
            status: state.status,
            result: state.result.clone(),
            chain: state.chain.clone(),
            audit: state.audit.clone(),
            last_error: state.last_error.clone(),
            context: state.context.clone(),
            strategy: state.strategy,
            steps: state.steps,
        }
    }
}

/// Drives tasks through their handlers. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<CapabilityRegistry>,
    coordinator: Coordinator,
    store: Arc<dyn SessionStore>,
    sink: ChainSinkSvc,
    config: OrchestratorConfig,
    retry: RetryPolicy,
}

/// Outcome of one handler invocation, retries included.
struct Invocation {
    outcome: Result<String>,
    attempts: u32,
    retries: Vec<HandoffError>,
}

/// What one fan-out participant produced.
enum Contribution {
    Done(TaskResult),
    Transfer(TransferRequest),
    Failed(HandoffError),
}

impl Orchestrator {
    pub fn builder(registry: impl Into<Arc<CapabilityRegistry>>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(registry.into())
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.inner.store.clone()
    }

    /// Classifies and routes a new task, then persists its initial session.
    pub async fn start(&self, task: Task) -> Result<SessionState> {
        let cfg = &self.inner.config;
        let context = Context::for_task(&task, cfg.context_budget_bytes)?;
        if self.inner.store.load(task.id()).await?.is_some() {
            return Err(HandoffError::Session(format!(
                "task {} already has a session",
                task.id()
            )));
        }
        let decision = self.inner.coordinator.route(&task, &self.inner.registry)?;
        let chain = ChainRecord::new(decision.initial_handler.clone(), cfg.max_depth);
        let state = SessionState::new(
            task,
            context,
            chain,
            decision.strategy,
            decision.participants,
        );
        self.inner.store.save(&state).await?;
        info!(
            task_id = %state.task_id,
            handler = %state.current_handler,
            strategy = ?state.strategy,
            "task accepted"
        );
        Ok(state)
    }

    /// Performs one transition and persists the result.
    ///
    /// Handler and guard failures are recorded in `state`, not returned;
    /// the error path is reserved for the session store.
    pub async fn step(&self, state: &mut SessionState, cancel: &CancellationToken) -> Result<()> {
        if state.is_finalized() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            self.cancel_task(state);
        } else if state.strategy == Strategy::BoundedParallel
            && !state.fan_out_done
            && state.participants.len() > 1
        {
            self.fan_out(state, cancel).await;
        } else {
            self.sequential_step(state, cancel).await;
        }
        state.updated_at = Utc::now();
        self.inner.store.save(state).await
    }

    /// Steps until the task reaches a terminal status.
    pub async fn run(&self, mut state: SessionState, cancel: CancellationToken) -> Result<RunReport> {
        let span = info_span!("task", task_id = %state.task_id);
        async move {
            // Every iteration either appends to the chain, arms the fallback
            // or finalizes, so this is never reached by a sound loop.
            let limit = 2 * (state.chain.max_depth() as u32 + 1) + 2;
            let mut iterations = 0u32;
            while !state.is_finalized() {
                if iterations >= limit {
                    let err = HandoffError::MaxDepthExceeded {
                        max_depth: state.chain.max_depth(),
                    };
                    error!(iterations, "step limit reached");
                    let handler = state.current_handler.clone();
                    state.record_error(AuditKind::Aborted, &handler, &err);
                    state.finalize(SessionStatus::Aborted, None, Some(&err));
                    self.inner.store.save(&state).await?;
                    break;
                }
                iterations += 1;
                let step_span = info_span!("step", handler = %state.current_handler, step = iterations);
                self.step(&mut state, &cancel).instrument(step_span).await?;
            }
            self.emit(&state).await;
            Ok(RunReport::from(&state))
        }
        .instrument(span)
        .await
    }

    /// `start` followed by `run` with a fresh cancellation token.
    pub async fn submit(&self, task: Task) -> Result<RunReport> {
        let state = self.start(task).await?;
        self.run(state, CancellationToken::new()).await
    }

    /// Continues a persisted session until it is terminal.
    pub async fn resume(&self, task_id: &TaskId, cancel: CancellationToken) -> Result<RunReport> {
        let state = self
            .inner
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| HandoffError::Session(format!("no session for task {}", task_id)))?;
        if state.is_finalized() {
            debug!(task_id = %task_id, status = %state.status, "session already finalized");
            return Ok(RunReport::from(&state));
        }
        info!(task_id = %task_id, handler = %state.current_handler, steps = state.steps, "resuming task");
        self.run(state, cancel).await
    }

    async fn sequential_step(&self, state: &mut SessionState, cancel: &CancellationToken) {
        let handler = state.current_handler.clone();
        let inv = self
            .invoke(&state.task, &state.context, &handler, cancel)
            .await;
        Self::account(state, &handler, &inv);
        let raw = match inv.outcome {
            Ok(raw) => raw,
            Err(err) => return self.fail(state, &handler, err),
        };
        match codec::decode(&raw) {
            Ok(decision) => self.apply_decision(state, &handler, decision),
            Err(e) => {
                let err = HandoffError::MalformedHandoff {
                    handler: handler.clone(),
                    message: e.to_string(),
                };
                self.fail(state, &handler, err)
            }
        }
    }

    /// Runs the fan-out round of a `BoundedParallel` task.
    ///
    /// All participants see the same context and run concurrently. Then:
    /// - the first transfer (rank order) to a handler outside the fan-out set
    ///   escalates: the chain is re-rooted at that participant and the
    ///   transfer goes through the normal checks
    /// - otherwise, if any participant completed, the task completes with one
    ///   `{source, output}` (or `{source, error}`) entry per participant;
    ///   transfers inside the set are ignored
    /// - with no completions, an inside transfer is followed as above, and
    ///   if there is none the task fails with the first participant error
    async fn fan_out(&self, state: &mut SessionState, cancel: &CancellationToken) {
        state.fan_out_done = true;
        let budget = self.inner.config.context_budget_bytes;
        let participants = state.participants.clone();
        let lead = state.current_handler.clone();
        let names: Vec<&str> = participants.iter().map(HandlerId::as_str).collect();
        state.record(AuditKind::FanOut, &lead, names.join(", "));
        info!(participants = ?names, "fanning out");

        let runs: Vec<_> = participants
            .iter()
            .map(|p| {
                let this = self.clone();
                let task = state.task.clone();
                let context = state.context.clone();
                let cancel = cancel.clone();
                let p = p.clone();
                async move { this.invoke(&task, &context, &p, &cancel).await }
            })
            .collect();
        let invocations = futures::future::join_all(runs).await;

        if cancel.is_cancelled() {
            return self.cancel_task(state);
        }

        let inside: BTreeSet<&HandlerId> = participants.iter().collect();
        let mut contributions = Vec::with_capacity(participants.len());
        for (p, inv) in participants.iter().zip(invocations) {
            Self::account(state, p, &inv);
            let decoded = inv.outcome.and_then(|raw| {
                codec::decode(&raw).map_err(|e| HandoffError::MalformedHandoff {
                    handler: p.clone(),
                    message: e.to_string(),
                })
            });
            let c = match decoded {
                Ok(HandoffDecision::Complete(r)) => {
                    let d = HandoffDecision::Complete(r.clone());
                    state.context =
                        codec::build_context(&state.context, &Fragment::new(p, &d), None, budget);
                    Contribution::Done(r)
                }
                Ok(HandoffDecision::Transfer(t)) => Contribution::Transfer(t),
                Err(e) => {
                    warn!(handler = %p, error = %e, "fan-out participant failed");
                    state.record_error(AuditKind::Failed, p, &e);
                    Contribution::Failed(e)
                }
            };
            contributions.push((p, c));
        }

        let any_done = contributions
            .iter()
            .any(|(_, c)| matches!(c, Contribution::Done(_)));
        let leaving = contributions.iter().find_map(|(p, c)| match c {
            Contribution::Transfer(t) if !inside.contains(&t.target) => Some((*p, t)),
            _ => None,
        });
        let escalation = leaving.or_else(|| {
            if any_done {
                return None;
            }
            contributions.iter().find_map(|(p, c)| match c {
                Contribution::Transfer(t) => Some((*p, t)),
                _ => None,
            })
        });
        if let Some((source, req)) = escalation {
            let source = source.clone();
            let req = req.clone();
            info!(handler = %source, target = %req.target, "fan-out escalated to a transfer");
            state.chain.reroot(source.clone());
            state.current_handler = source.clone();
            let decision = HandoffDecision::Transfer(req.clone());
            return self.apply_transfer(state, &source, &req, &decision);
        }

        if !any_done {
            let err = contributions
                .into_iter()
                .find_map(|(_, c)| match c {
                    Contribution::Failed(e) => Some(e),
                    _ => None,
                })
                .unwrap_or_else(|| HandoffError::HandlerInvocation {
                    handler: lead.clone(),
                    message: "no fan-out participant produced a result".into(),
                });
            return self.fail(state, &lead, err);
        }

        let mut outputs = Vec::with_capacity(contributions.len());
        let mut lines = Vec::with_capacity(contributions.len());
        for (p, c) in contributions {
            match c {
                Contribution::Done(r) => {
                    let line = r.summary.clone().unwrap_or_else(|| render(&r.output));
                    lines.push(format!("[{}] {}", p, line));
                    outputs.push(json!({ "source": p, "output": r.output }));
                }
                Contribution::Failed(e) => {
                    lines.push(format!("[{}] failed: {}", p, e));
                    outputs.push(json!({ "source": p, "error": ErrorReport::from(&e) }));
                }
                Contribution::Transfer(t) => {
                    debug!(handler = %p, target = %t.target, "ignoring transfer inside fan-out set");
                }
            }
        }
        let result = TaskResult {
            output: Value::Array(outputs),
            summary: Some(lines.join("\n")),
        };
        state.record(AuditKind::Completed, &lead, "fan-out aggregated");
        state.last_error = None;
        state.finalize(SessionStatus::Completed, Some(result), None);
        info!("task completed by fan-out");
    }

    fn apply_decision(&self, state: &mut SessionState, handler: &HandlerId, decision: HandoffDecision) {
        match &decision {
            HandoffDecision::Complete(result) => {
                state.context = codec::build_context(
                    &state.context,
                    &Fragment::new(handler, &decision),
                    None,
                    self.inner.config.context_budget_bytes,
                );
                state.record(
                    AuditKind::Completed,
                    handler,
                    result.summary.clone().unwrap_or_default(),
                );
                state.last_error = None;
                state.finalize(SessionStatus::Completed, Some(result.clone()), None);
                info!(handler = %handler, chain_len = state.chain.len(), "task completed");
            }
            HandoffDecision::Transfer(req) => self.apply_transfer(state, handler, req, &decision),
        }
    }

    fn apply_transfer(
        &self,
        state: &mut SessionState,
        from: &HandlerId,
        req: &TransferRequest,
        decision: &HandoffDecision,
    ) {
        match self.check_transfer(&state.chain, from, req) {
            Ok(chain) => {
                state.chain = chain;
                state.context = codec::build_context(
                    &state.context,
                    &Fragment::new(from, decision),
                    Some(&req.reason),
                    self.inner.config.context_budget_bytes,
                );
                state.current_handler = req.target.clone();
                state.fallback_pending = false;
                state.record(
                    AuditKind::Transferred,
                    from,
                    format!("{} -> {}: {}", from, req.target, req.reason),
                );
                info!(from = %from, to = %req.target, reason = %req.reason, "transfer accepted");
            }
            Err(err) if err.is_guard_violation() => self.recover(state, from, &req.target, err),
            Err(err) => self.fail(state, from, err),
        }
    }

    fn check_transfer(
        &self,
        chain: &ChainRecord,
        from: &HandlerId,
        req: &TransferRequest,
    ) -> Result<ChainRecord> {
        let registry = &self.inner.registry;
        registry.resolve(&req.target)?;
        let next = chain.append(from, &req.target, req.reason.clone())?;
        if !registry.resolve(from)?.can_transfer_to(&req.target) {
            return Err(HandoffError::TransferNotPermitted {
                from: from.clone(),
                to: req.target.clone(),
            });
        }
        Ok(next)
    }

    fn recover(&self, state: &mut SessionState, from: &HandlerId, target: &HandlerId, err: HandoffError) {
        if state.fallback_pending {
            error!(handler = %from, target = %target, error = %err, "fallback also violated a guard, aborting");
            state.record_error(AuditKind::Aborted, from, &err);
            state.finalize(SessionStatus::Aborted, None, Some(&err));
            return;
        }
        warn!(handler = %from, target = %target, error = %err, "transfer rejected, falling back to source");
        state.fallback_pending = true;
        state.context.insert(
            REJECTED_KEY,
            json!({ "target": target, "kind": err.kind(), "message": err.to_string() }),
            Priority::High,
        );
        state
            .context
            .enforce_budget(self.inner.config.context_budget_bytes);
        state.last_error = Some(ErrorReport::from(&err));
        state.record_error(AuditKind::Recovered, from, &err);
        state.current_handler = from.clone();
    }

    fn fail(&self, state: &mut SessionState, handler: &HandlerId, err: HandoffError) {
        if matches!(err, HandoffError::Cancelled) {
            return self.cancel_task(state);
        }
        error!(handler = %handler, error = %err, chain_len = state.chain.len(), "task failed");
        state.record_error(AuditKind::Failed, handler, &err);
        state.finalize(SessionStatus::Failed, None, Some(&err));
    }

    fn cancel_task(&self, state: &mut SessionState) {
        let handler = state.current_handler.clone();
        info!(handler = %handler, "task cancelled");
        state.record_error(AuditKind::Cancelled, &handler, &HandoffError::Cancelled);
        state.finalize(SessionStatus::Aborted, None, Some(&HandoffError::Cancelled));
    }

    fn account(state: &mut SessionState, handler: &HandlerId, inv: &Invocation) {
        for err in &inv.retries {
            state.steps += 1;
            state.record_error(AuditKind::Retried, handler, err);
        }
        state.steps += inv.attempts - inv.retries.len() as u32;
    }

    /// Invokes `handler` under the step timeout, retrying per policy.
    async fn invoke(
        &self,
        task: &Task,
        context: &Context,
        handler: &HandlerId,
        cancel: &CancellationToken,
    ) -> Invocation {
        let mut inv = Invocation {
            outcome: Err(HandoffError::Cancelled),
            attempts: 0,
            retries: Vec::new(),
        };
        let svc = match self.inner.registry.handler(handler) {
            Ok(svc) => ServiceBuilder::new()
                .layer(TracingLayer::new())
                .layer(TimeoutLayer::new(self.inner.config.step_timeout()))
                .service(svc),
            Err(err) => {
                inv.outcome = Err(err);
                return inv;
            }
        };
        loop {
            let req = HandlerRequest {
                task: task.clone(),
                handler: handler.clone(),
                context: context.clone(),
                attempt: inv.attempts,
                cancel: cancel.clone(),
            };
            inv.attempts += 1;
            let call: Pin<Box<dyn Future<Output = std::result::Result<String, BoxError>> + Send>> =
                Box::pin(svc.clone().oneshot(req));
            let err = match call.await {
                Ok(raw) => {
                    inv.outcome = Ok(raw);
                    return inv;
                }
                Err(e) => HandoffError::from_boxed(e, handler),
            };
            if cancel.is_cancelled() {
                inv.outcome = Err(HandoffError::Cancelled);
                return inv;
            }
            let delay = self.inner.retry.next_delay(
                inv.attempts - 1,
                &err,
                &TransientFailures,
            );
            match delay {
                Some(delay) => {
                    warn!(handler = %handler, attempt = inv.attempts, error = %err, "handler failed, retrying");
                    inv.retries.push(err);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            inv.outcome = Err(HandoffError::Cancelled);
                            return inv;
                        }
                    }
                }
                None => {
                    inv.outcome = Err(err);
                    return inv;
                }
            }
        }
    }

    async fn emit(&self, state: &SessionState) {
        let record = CompletedChain::from(state);
        if let Err(e) = self.inner.sink.clone().oneshot(record).await {
            warn!(error = %e, "chain sink rejected record");
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.inner.registry)
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Service<Task> for Orchestrator {
    type Response = RunReport;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, task: Task) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.submit(task).await.map_err(|e| Box::new(e) as BoxError) })
    }
}

pub struct OrchestratorBuilder {
    registry: Arc<CapabilityRegistry>,
    config: OrchestratorConfig,
    store: Option<Arc<dyn SessionStore>>,
    sink: Option<ChainSinkSvc>,
    coordinator: Option<Coordinator>,
}

impl OrchestratorBuilder {
    fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            config: OrchestratorConfig::default(),
            store: None,
            sink: None,
            coordinator: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: ChainSinkSvc) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Overrides the coordinator built from `config.coordinator`.
    pub fn coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let coordinator = self
            .coordinator
            .unwrap_or_else(|| Coordinator::new(self.config.coordinator.clone()));
        let inner = Inner {
            registry: self.registry,
            coordinator,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
            sink: self.sink.unwrap_or_else(noop_sink),
            retry: RetryPolicy::from(&self.config.retry),
            config: self.config,
        };
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::handlers::{handler_fn, static_reply};
    use crate::registry::HandlerDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn single(id: &str, reply: &str) -> Orchestrator {
        let registry = CapabilityRegistry::builder()
            .register(HandlerDescriptor::new(id).keywords(["work"]), static_reply(reply))
            .build()
            .unwrap();
        Orchestrator::builder(registry)
            .config(ConfigBuilder::new().backoff(Duration::from_millis(1)).build())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn completes_with_terminal_result() {
        let orch = single("solo", r#"{"result": "done", "summary": "all good"}"#);
        let report = orch.submit(Task::new("some work")).await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.result.unwrap().output, json!("done"));
        assert!(report.chain.is_empty());
        assert_eq!(report.context.get("output.solo"), Some(&json!("done")));
        assert_eq!(report.steps, 1);
    }

    #[tokio::test]
    async fn malformed_output_fails_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = CapabilityRegistry::builder()
            .register(
                HandlerDescriptor::new("chatty"),
                handler_fn(move |_req: HandlerRequest| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>("I think billing should take this.".to_string())
                    }
                }),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::builder(registry).build().unwrap();
        let report = orch.submit(Task::new("x")).await.unwrap();
        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(
            report.last_error.map(|e| e.kind),
            Some(crate::error::ErrorKind::MalformedHandoff)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_is_retried_once_with_same_context() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        let registry = CapabilityRegistry::builder()
            .register(
                HandlerDescriptor::new("flaky"),
                handler_fn(move |req: HandlerRequest| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push((req.attempt, req.context.clone()));
                        if req.attempt == 0 {
                            Err::<String, BoxError>("transient".into())
                        } else {
                            Ok(r#"{"result": "recovered"}"#.to_string())
                        }
                    }
                }),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::builder(registry)
            .config(ConfigBuilder::new().backoff(Duration::from_millis(1)).build())
            .build()
            .unwrap();
        let report = orch.submit(Task::new("x")).await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, seen[1].1);
        assert!(report.audit.iter().any(|e| e.kind == AuditKind::Retried));
        assert_eq!(report.steps, 2);
    }

    #[tokio::test]
    async fn cancelled_before_first_step_aborts() {
        let orch = single("solo", r#"{"result": 1}"#);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = orch.start(Task::new("work")).await.unwrap();
        let report = orch.run(state, cancel).await.unwrap();
        assert_eq!(report.status, SessionStatus::Aborted);
        assert_eq!(
            report.last_error.map(|e| e.kind),
            Some(crate::error::ErrorKind::Cancelled)
        );
        assert_eq!(report.steps, 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_at_intake() {
        let registry = CapabilityRegistry::builder()
            .register(HandlerDescriptor::new("solo"), static_reply(r#"{"result": 1}"#))
            .build()
            .unwrap();
        let orch = Orchestrator::builder(registry)
            .config(ConfigBuilder::new().context_budget(32).build())
            .build()
            .unwrap();
        let task = Task::new("x".repeat(100));
        let id = task.id().clone();
        let err = orch.submit(task).await.unwrap_err();
        assert!(matches!(err, HandoffError::PayloadTooLarge { .. }));
        assert!(orch.store().load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orchestrator_is_a_tower_service() {
        let orch = single("solo", r#"{"result": "svc"}"#);
        let report = orch.oneshot(Task::new("work")).await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let orch = single("solo", r#"{"result": 1}"#);
        orch.submit(Task::with_id("dup", "work")).await.unwrap();
        let err = orch.submit(Task::with_id("dup", "work")).await.unwrap_err();
        assert!(matches!(err, HandoffError::Session(_)));
    }
}
