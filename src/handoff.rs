//! # Handoff Types
//!
//! A handler is handed a [`HandlerRequest`] and answers with raw text. That
//! text is decoded by the [`codec`](crate::codec) into a [`HandoffDecision`]:
//! either the task is complete, or the handler asks for another handler to
//! take over.
//!
//! ### Transfer declaration
//!
//! ```json
//! {"transfer": {"target": "billing", "reason": "needs domain billing",
//!               "context_delta": {"order_id": "A-1009"}}}
//! ```
//!
//! ### Terminal result
//!
//! ```json
//! {"result": {"refund": "issued"}, "summary": "Refund issued for A-1009"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::registry::HandlerId;
use crate::task::Task;

/// Input passed to a handler for one invocation.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub task: Task,
    /// The handler being invoked.
    pub handler: HandlerId,
    pub context: Context,
    /// Zero on the first try, incremented on each retry.
    pub attempt: u32,
    /// Cancellation signal; honoring it is up to the handler.
    pub cancel: CancellationToken,
}

impl HandlerRequest {
    /// Serializable view used by out-of-process handlers.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "task_id": self.task.id(),
            "handler": self.handler,
            "attempt": self.attempt,
            "payload": self.task.payload(),
            "context": self.context.to_json(),
        })
    }
}

/// A handler's request that another handler take over the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub target: HandlerId,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub context_delta: Map<String, Value>,
}

impl TransferRequest {
    pub fn new(target: impl Into<HandlerId>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
            context_delta: Map::new(),
        }
    }

    pub fn with_delta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_delta.insert(key.into(), value);
        self
    }
}

/// Terminal output of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl TaskResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            summary: None,
        }
    }
}

/// Decoded handler output.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffDecision {
    /// The task is complete.
    Complete(TaskResult),
    /// Another handler should take over.
    Transfer(TransferRequest),
}
