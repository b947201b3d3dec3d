//! Task intake types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Immutable task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A unit of work submitted to the orchestrator.
///
/// Fields are read-only once constructed; the payload travels into the
/// context as its pinned entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            id: TaskId::new(),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// Creates a task with a caller-chosen identifier.
    pub fn with_id(id: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            id: TaskId(id.into()),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Text used for classification: the payload itself when it is a string,
    /// otherwise every string leaf joined by spaces.
    pub fn text(&self) -> String {
        fn collect(v: &Value, out: &mut Vec<String>) {
            match v {
                Value::String(s) => out.push(s.clone()),
                Value::Array(items) => items.iter().for_each(|i| collect(i, out)),
                Value::Object(map) => map.values().for_each(|i| collect(i, out)),
                _ => {}
            }
        }
        let mut parts = Vec::new();
        collect(&self.payload, &mut parts);
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new("hello");
        let b = Task::new("hello");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_task_text_flattens_payload() {
        let task = Task::with_id(
            "t-1",
            serde_json::json!({"request": "refund order", "tags": ["billing", 3]}),
        );
        let text = task.text();
        assert!(text.contains("refund order"));
        assert!(text.contains("billing"));
        assert_eq!(task.id().as_str(), "t-1");
    }

    #[test]
    fn test_task_serialization() {
        let task = Task::with_id("t-2", "plain request");
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }
}
