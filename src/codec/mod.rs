//! Handoff codec: raw handler output ↔ decisions, and context merging
//!
//! What this module provides
//! - `decode(raw)` turning a handler's raw text into a `HandoffDecision`
//! - `build_context(previous, fragment, reason, budget)` producing the context
//!   handed to the next handler
//!
//! Decoding rules
//! - The whole output is tried as a JSON object first; failing that, the first
//!   fenced block labelled `handoff` or `json` is used
//! - `{"result": ...}` is terminal; `{"transfer": {...}}` is a transfer
//! - `reason` and `context_delta` are optional; `target` is required
//! - `context_delta` keys starting with `handoff.` are reserved
//! - Anything else is a `CodecError`; nothing is inferred from free text
//!
//! Composition
//! - Pure functions, no Tower dependency; the orchestrator calls them at the
//!   edge of each step

use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::{Context, Priority};
use crate::handoff::{HandoffDecision, TaskResult, TransferRequest};
use crate::registry::HandlerId;

/// Context key holding the latest transfer reason.
pub const REASON_KEY: &str = "handoff.reason";
/// Context key holding the handler that made the latest transfer.
pub const FROM_KEY: &str = "handoff.from";
/// Context key describing a transfer that was rejected by a guard.
pub const REJECTED_KEY: &str = "handoff.rejected";
/// Prefix of the keys above; handlers cannot set these through a delta.
pub const RESERVED_PREFIX: &str = "handoff.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("handler output is empty")]
    Empty,
    #[error("no JSON object or fenced handoff block found")]
    NoStructuredBlock,
    #[error("invalid JSON in handoff block: {0}")]
    InvalidJson(String),
    #[error("handoff block is not a JSON object")]
    NotAnObject,
    #[error("output declares both a result and a transfer")]
    Ambiguous,
    #[error("output declares neither a result nor a transfer")]
    UnknownShape,
    #[error("transfer is missing a target")]
    MissingTarget,
    #[error("transfer field `{0}` has the wrong type")]
    InvalidField(&'static str),
    #[error("context_delta key `{0}` is reserved")]
    ReservedKey(String),
}

/// Decode a handler's raw output.
pub fn decode(raw: &str) -> Result<HandoffDecision, CodecError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CodecError::Empty);
    }
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => v,
        Err(_) => {
            let block = fenced_block(trimmed).ok_or(CodecError::NoStructuredBlock)?;
            serde_json::from_str::<Value>(&block)
                .map_err(|e| CodecError::InvalidJson(e.to_string()))?
        }
    };
    classify(value)
}

fn classify(value: Value) -> Result<HandoffDecision, CodecError> {
    let Value::Object(mut obj) = value else {
        return Err(CodecError::NotAnObject);
    };
    match (obj.remove("result"), obj.remove("transfer")) {
        (Some(_), Some(_)) => Err(CodecError::Ambiguous),
        (None, None) => Err(CodecError::UnknownShape),
        (Some(output), None) => {
            let summary = match obj.remove("summary") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s),
                Some(_) => return Err(CodecError::InvalidField("summary")),
            };
            Ok(HandoffDecision::Complete(TaskResult { output, summary }))
        }
        (None, Some(transfer)) => parse_transfer(transfer).map(HandoffDecision::Transfer),
    }
}

fn parse_transfer(value: Value) -> Result<TransferRequest, CodecError> {
    let Value::Object(mut obj) = value else {
        return Err(CodecError::InvalidField("transfer"));
    };
    let target = match obj.remove("target") {
        Some(Value::String(s)) if !s.trim().is_empty() => HandlerId::from(s.trim()),
        Some(Value::String(_)) | None | Some(Value::Null) => return Err(CodecError::MissingTarget),
        Some(_) => return Err(CodecError::InvalidField("target")),
    };
    let reason = match obj.remove("reason") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(_) => return Err(CodecError::InvalidField("reason")),
    };
    let context_delta = match obj.remove("context_delta") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m,
        Some(_) => return Err(CodecError::InvalidField("context_delta")),
    };
    if let Some(key) = context_delta.keys().find(|k| k.starts_with(RESERVED_PREFIX)) {
        return Err(CodecError::ReservedKey(key.clone()));
    }
    Ok(TransferRequest {
        target,
        reason,
        context_delta,
    })
}

/// First fenced block labelled `handoff` or `json`.
fn fenced_block(text: &str) -> Option<String> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(label) = line.trim().strip_prefix("```") else {
            continue;
        };
        if !matches!(label.trim(), "handoff" | "json") {
            continue;
        }
        let mut body = String::new();
        for inner in lines.by_ref() {
            if inner.trim() == "```" {
                return Some(body);
            }
            body.push_str(inner);
            body.push('\n');
        }
        return None;
    }
    None
}

/// What a handler contributed in one step.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub handler: &'a HandlerId,
    pub decision: &'a HandoffDecision,
}

impl<'a> Fragment<'a> {
    pub fn new(handler: &'a HandlerId, decision: &'a HandoffDecision) -> Self {
        Self { handler, decision }
    }
}

/// Context key under which a handler's output is stored.
pub fn output_key(handler: &HandlerId) -> String {
    format!("output.{}", handler)
}

/// Merge a handler's output into `previous` and enforce `budget`.
///
/// Terminal output lands under `output.<handler>`. A transfer contributes its
/// `context_delta` entries and a marker under `output.<handler>`. The reason is
/// kept under [`REASON_KEY`] as a low-priority entry.
pub fn build_context(
    previous: &Context,
    fragment: &Fragment<'_>,
    transfer_reason: Option<&str>,
    budget: usize,
) -> Context {
    let mut next = previous.clone();
    match fragment.decision {
        HandoffDecision::Complete(result) => {
            next.insert(
                output_key(fragment.handler),
                result.output.clone(),
                Priority::Normal,
            );
        }
        HandoffDecision::Transfer(req) => {
            for (k, v) in &req.context_delta {
                next.insert(k.clone(), v.clone(), Priority::Normal);
            }
            next.insert(
                output_key(fragment.handler),
                serde_json::json!({ "transferred_to": req.target }),
                Priority::Low,
            );
            next.insert(
                FROM_KEY,
                Value::String(fragment.handler.to_string()),
                Priority::High,
            );
        }
    }
    if let Some(reason) = transfer_reason.filter(|r| !r.is_empty()) {
        next.insert(REASON_KEY, Value::String(reason.to_string()), Priority::Low);
    }
    next.enforce_budget(budget);
    next
}
