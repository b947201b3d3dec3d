//! Session state and persistence
//!
//! What this module provides
//! - `SessionState`: everything needed to resume a task after a crash
//! - `SessionStore`: async load/save/list behind a trait, constructor-injected
//!   into the orchestrator
//!
//! Exports
//! - Models
//!   - `SessionStatus`, `SessionState`, `AuditEvent`, `AuditKind`
//! - Stores
//!   - `InMemorySessionStore` (tests, ephemeral runs)
//!   - `FileSessionStore` (one JSON record per task, atomic replace)
//!   - `SqliteSessionStore` lives in `crate::sqlite_session`
//!
//! Implementation strategy
//! - A record is saved after every transition; the orchestrator never keeps
//!   state that is not also in the store
//! - Writes for one task are serialized; records are replaced whole
//! - Finalized records (completed, failed, aborted) are never overwritten,
//!   so a stray save after finalization is a `Session` error
//!
//! Testing strategy
//! - Round-trip through each store, finalized-record protection, and file
//!   store behavior across instances sharing a directory

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{ChainEntry, ChainRecord, DEFAULT_MAX_DEPTH};
use crate::context::Context;
use crate::coordinator::Strategy;
use crate::error::{ErrorKind, ErrorReport, HandoffError, Result};
use crate::handoff::TaskResult;
use crate::registry::HandlerId;
use crate::task::{Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened at one point of a task's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A handler returned a terminal result.
    Completed,
    /// A transfer was accepted and appended to the chain.
    Transferred,
    /// An invocation failed and is being retried.
    Retried,
    /// A guard rejected a transfer; the task stayed with its handler.
    Recovered,
    /// Several handlers were run concurrently.
    FanOut,
    Aborted,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Step counter at the time of the event.
    pub step: u32,
    pub handler: HandlerId,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub at: DateTime<Utc>,
}

/// Persisted state of one task.
///
/// Stored as a flat record: `chain` is the array of `{from, to, reason,
/// timestamp}` entries, the context is stored as `context_snapshot`, and the
/// chain origin is recovered from the first entry (or the current handler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SessionRecord", try_from = "SessionRecord")]
pub struct SessionState {
    pub task_id: TaskId,
    pub task: Task,
    pub chain: ChainRecord,
    pub current_handler: HandlerId,
    pub status: SessionStatus,
    pub context: Context,
    pub audit: Vec<AuditEvent>,
    pub last_error: Option<ErrorReport>,
    pub result: Option<TaskResult>,
    pub strategy: Strategy,
    /// Fan-out participants, best first. Empty unless the strategy fans out.
    pub participants: Vec<HandlerId>,
    pub fan_out_done: bool,
    /// Set after a guard violation; a second one aborts the task.
    pub fallback_pending: bool,
    /// Handler invocations performed so far, retries included.
    pub steps: u32,
    pub updated_at: DateTime<Utc>,
}

/// On-disk shape of a [`SessionState`].
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    task_id: TaskId,
    task: Task,
    chain: Vec<ChainEntry>,
    #[serde(default = "default_max_depth")]
    max_depth: usize,
    current_handler: HandlerId,
    status: SessionStatus,
    context_snapshot: Context,
    #[serde(default)]
    audit: Vec<AuditEvent>,
    #[serde(default)]
    last_error: Option<ErrorReport>,
    #[serde(default)]
    result: Option<TaskResult>,
    strategy: Strategy,
    #[serde(default)]
    participants: Vec<HandlerId>,
    #[serde(default)]
    fan_out_done: bool,
    #[serde(default)]
    fallback_pending: bool,
    #[serde(default)]
    steps: u32,
    updated_at: DateTime<Utc>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl From<SessionState> for SessionRecord {
    fn from(s: SessionState) -> Self {
        Self {
            task_id: s.task_id,
            task: s.task,
            max_depth: s.chain.max_depth(),
            chain: s.chain.entries().to_vec(),
            current_handler: s.current_handler,
            status: s.status,
            context_snapshot: s.context,
            audit: s.audit,
            last_error: s.last_error,
            result: s.result,
            strategy: s.strategy,
            participants: s.participants,
            fan_out_done: s.fan_out_done,
            fallback_pending: s.fallback_pending,
            steps: s.steps,
            updated_at: s.updated_at,
        }
    }
}

impl TryFrom<SessionRecord> for SessionState {
    type Error = HandoffError;

    fn try_from(r: SessionRecord) -> Result<Self> {
        let origin = r
            .chain
            .first()
            .map(|e| e.from.clone())
            .unwrap_or_else(|| r.current_handler.clone());
        let chain = ChainRecord::from_entries(origin, r.chain, r.max_depth)?;
        if chain.active() != &r.current_handler {
            return Err(HandoffError::Session(format!(
                "session {}: current handler {} does not match chain end {}",
                r.task_id,
                r.current_handler,
                chain.active()
            )));
        }
        Ok(Self {
            task_id: r.task_id,
            task: r.task,
            chain,
            current_handler: r.current_handler,
            status: r.status,
            context: r.context_snapshot,
            audit: r.audit,
            last_error: r.last_error,
            result: r.result,
            strategy: r.strategy,
            participants: r.participants,
            fan_out_done: r.fan_out_done,
            fallback_pending: r.fallback_pending,
            steps: r.steps,
            updated_at: r.updated_at,
        })
    }
}

impl SessionState {
    pub fn new(
        task: Task,
        context: Context,
        chain: ChainRecord,
        strategy: Strategy,
        participants: Vec<HandlerId>,
    ) -> Self {
        Self {
            task_id: task.id().clone(),
            current_handler: chain.active().clone(),
            task,
            chain,
            status: SessionStatus::Running,
            context,
            audit: Vec::new(),
            last_error: None,
            result: None,
            strategy,
            participants,
            fan_out_done: false,
            fallback_pending: false,
            steps: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn record(&mut self, kind: AuditKind, handler: &HandlerId, detail: impl Into<String>) {
        self.push_event(kind, handler, detail.into(), None);
    }

    pub fn record_error(&mut self, kind: AuditKind, handler: &HandlerId, err: &HandoffError) {
        self.push_event(kind, handler, err.to_string(), Some(err.kind()));
    }

    fn push_event(
        &mut self,
        kind: AuditKind,
        handler: &HandlerId,
        detail: String,
        error: Option<ErrorKind>,
    ) {
        self.audit.push(AuditEvent {
            step: self.steps,
            handler: handler.clone(),
            kind,
            detail,
            error,
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Moves the state to a terminal status.
    pub fn finalize(
        &mut self,
        status: SessionStatus,
        result: Option<TaskResult>,
        error: Option<&HandoffError>,
    ) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.result = result;
        if let Some(err) = error {
            self.last_error = Some(ErrorReport::from(err));
        }
        self.updated_at = Utc::now();
    }
}

/// Durable storage for session records.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, task_id: &TaskId) -> Result<Option<SessionState>>;

    /// Replaces the record for `state.task_id`. Fails if the stored record
    /// is already finalized.
    async fn save(&self, state: &SessionState) -> Result<()>;

    /// Task ids with a stored record, sorted.
    async fn list(&self) -> Result<Vec<TaskId>>;
}

fn finalized_error(task_id: &TaskId, status: SessionStatus) -> HandoffError {
    HandoffError::Session(format!(
        "session {} is finalized ({}) and cannot be overwritten",
        task_id, status
    ))
}

/// A simple in-memory session store.
#[derive(Debug, Default, Clone)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<TaskId, SessionState>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, task_id: &TaskId) -> Result<Option<SessionState>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| HandoffError::Session("session store lock poisoned".into()))?;
        Ok(guard.get(task_id).cloned())
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| HandoffError::Session("session store lock poisoned".into()))?;
        if let Some(existing) = guard.get(&state.task_id) {
            if existing.is_finalized() {
                return Err(finalized_error(&state.task_id, existing.status));
            }
        }
        guard.insert(state.task_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskId>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| HandoffError::Session("session store lock poisoned".into()))?;
        let mut ids: Vec<_> = guard.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON file per task under a directory.
///
/// Each save writes a temporary file in the same directory, fsyncs it and
/// renames it over the record, so a crash leaves either the old or the new
/// record on disk.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    locks: Arc<Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FileSessionStore {
    /// Opens (and creates if needed) the store directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &TaskId) -> Result<PathBuf> {
        let id = task_id.as_str();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(HandoffError::Session(format!("invalid task id: {:?}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn lock_for(&self, task_id: &TaskId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| HandoffError::Session("session lock table poisoned".into()))?;
        Ok(locks.entry(task_id.clone()).or_default().clone())
    }

    fn release_lock(&self, task_id: &TaskId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(task_id);
        }
    }
}

fn read_record(path: &Path) -> Result<Option<SessionState>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| HandoffError::Session(format!("{} has no parent", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| HandoffError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, task_id: &TaskId) -> Result<Option<SessionState>> {
        let path = self.path_for(task_id)?;
        tokio::task::spawn_blocking(move || read_record(&path))
            .await
            .map_err(|e| HandoffError::Session(format!("load task panicked: {}", e)))?
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let path = self.path_for(&state.task_id)?;
        let lock = self.lock_for(&state.task_id)?;
        let _guard = lock.lock().await;
        let data = serde_json::to_vec_pretty(state)?;
        let task_id = state.task_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(existing) = read_record(&path)? {
                if existing.is_finalized() {
                    return Err(finalized_error(&task_id, existing.status));
                }
            }
            atomic_write(&path, &data)?;
            debug!(task_id = %task_id, path = %path.display(), "session saved");
            Ok(())
        })
        .await
        .map_err(|e| HandoffError::Session(format!("save task panicked: {}", e)))??;
        // no further writes are accepted for a finalized record
        if state.is_finalized() {
            self.release_lock(&state.task_id);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskId>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut ids = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(TaskId::from(stem));
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
        .map_err(|e| HandoffError::Session(format!("list task panicked: {}", e)))?
    }
}
