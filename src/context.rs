//! # Handoff Context
//!
//! The context is the key/value state that travels with a task from one
//! handler to the next. Every handler's output fragment is merged into it, as
//! is the `context_delta` of each transfer request.
//!
//! Context is size-bounded: its serialized JSON form must fit a byte budget.
//! When a merge pushes it over, entries are evicted lowest priority first and,
//! within a priority, oldest first. The original task payload is stored as a
//! [`Priority::Pinned`] entry under [`TASK_KEY`] and is never evicted, so a
//! handler can always be resumed from the context alone.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{HandoffError, Result};
use crate::task::Task;

/// Key under which the original task payload is pinned.
pub const TASK_KEY: &str = "task";

/// Eviction priority of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    /// Never evicted.
    Pinned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
    pub priority: Priority,
    /// Insertion order; refreshed when a key is overwritten.
    pub seq: u64,
}

/// Insertion-ordered key/value state with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    entries: Vec<ContextEntry>,
    next_seq: u64,
    /// Number of entries evicted over the lifetime of this context.
    evicted: u64,
}

impl Context {
    /// Creates the initial context for a task, failing if the pinned payload
    /// alone already exceeds `budget`.
    pub fn for_task(task: &Task, budget: usize) -> Result<Self> {
        let mut ctx = Self::default();
        ctx.insert(TASK_KEY, task.payload().clone(), Priority::Pinned);
        let size = ctx.serialized_size();
        if size > budget {
            return Err(HandoffError::PayloadTooLarge { size, budget });
        }
        Ok(ctx)
    }

    /// Inserts or overwrites `key`. Overwriting moves the entry to the newest
    /// position. Pinned entries cannot be overwritten; returns `false` then.
    pub fn insert(&mut self, key: impl Into<String>, value: Value, priority: Priority) -> bool {
        let key = key.into();
        let seq = self.next_seq;
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            if self.entries[pos].priority == Priority::Pinned {
                debug!(key = %key, "refusing to overwrite pinned context entry");
                return false;
            }
            self.entries.remove(pos);
        }
        self.next_seq += 1;
        self.entries.push(ContextEntry {
            key,
            value,
            priority,
            seq,
        });
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.key == key && e.priority != Priority::Pinned)?;
        Some(self.entries.remove(pos).value)
    }

    /// The original task payload.
    pub fn task_payload(&self) -> Option<&Value> {
        self.get(TASK_KEY)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Plain JSON object view handed to handlers.
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.entries.len());
        for e in &self.entries {
            map.insert(e.key.clone(), e.value.clone());
        }
        Value::Object(map)
    }

    /// Size in bytes of the serialized entries. Bookkeeping fields are not
    /// counted, so a context holding only its pinned payload never grows.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(&self.entries)
            .map(|v| v.len())
            .unwrap_or(usize::MAX)
    }

    /// Evicts entries until the serialized size fits `budget`.
    ///
    /// Returns the evicted keys in eviction order. Pinned entries are never
    /// evicted.
    pub fn enforce_budget(&mut self, budget: usize) -> Vec<String> {
        let mut dropped = Vec::new();
        while self.serialized_size() > budget {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.priority != Priority::Pinned)
                .min_by_key(|(_, e)| (e.priority, e.seq))
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    let entry = self.entries.remove(i);
                    self.evicted += 1;
                    dropped.push(entry.key);
                }
                None => break,
            }
        }
        if !dropped.is_empty() {
            debug!(evicted = ?dropped, budget, "context over budget");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx() -> Context {
        Context::for_task(&Task::with_id("t", "summarise the quarterly report"), 4096).unwrap()
    }

    #[test]
    fn test_task_payload_is_pinned() {
        let mut c = ctx();
        assert!(!c.insert(TASK_KEY, json!("overwritten"), Priority::High));
        assert_eq!(c.task_payload(), Some(&json!("summarise the quarterly report")));
        assert!(c.remove(TASK_KEY).is_none());
    }

    #[test]
    fn test_overwrite_keeps_keys_unique_and_refreshes_order() {
        let mut c = ctx();
        c.insert("a", json!(1), Priority::Normal);
        c.insert("b", json!(2), Priority::Normal);
        c.insert("a", json!(3), Priority::Normal);
        assert_eq!(c.len(), 3);
        assert_eq!(c.keys().collect::<Vec<_>>(), vec![TASK_KEY, "b", "a"]);
        assert_eq!(c.get("a"), Some(&json!(3)));
    }

    #[test]
    fn test_eviction_prefers_low_priority_then_oldest() {
        let mut c = ctx();
        c.insert("old_normal", json!("x".repeat(100)), Priority::Normal);
        c.insert("low", json!("y".repeat(100)), Priority::Low);
        c.insert("new_normal", json!("z".repeat(100)), Priority::Normal);
        let budget = c.serialized_size() - 50;
        let dropped = c.enforce_budget(budget);
        assert_eq!(dropped, vec!["low".to_string()]);

        let budget = c.serialized_size() - 50;
        let dropped = c.enforce_budget(budget);
        assert_eq!(dropped, vec!["old_normal".to_string()]);
        assert!(c.contains_key("new_normal"));
        assert_eq!(c.evicted(), 2);
    }

    #[test]
    fn test_payload_larger_than_budget_is_rejected() {
        let task = Task::with_id("t", "x".repeat(200));
        let err = Context::for_task(&task, 64).unwrap_err();
        assert!(matches!(err, HandoffError::PayloadTooLarge { budget: 64, .. }));
    }

    #[test]
    fn test_to_json_view() {
        let mut c = ctx();
        c.insert("output.triage", json!({"intent": "billing"}), Priority::Normal);
        let v = c.to_json();
        assert_eq!(v["output.triage"]["intent"], "billing");
        assert_eq!(v[TASK_KEY], "summarise the quarterly report");
    }

    proptest! {
        #[test]
        fn budget_holds_and_payload_survives(
            values in proptest::collection::vec(("[a-z]{1,8}", ".{0,120}", 0u8..3), 0..30),
            budget in 256usize..2048,
        ) {
            let task = Task::with_id("t", "keep me");
            let mut c = Context::for_task(&task, budget).unwrap();
            for (k, v, p) in values {
                let priority = match p { 0 => Priority::Low, 1 => Priority::Normal, _ => Priority::High };
                c.insert(k, Value::String(v), priority);
                c.enforce_budget(budget);
                prop_assert!(c.serialized_size() <= budget);
                prop_assert_eq!(c.task_payload(), Some(&json!("keep me")));
            }
        }
    }
}
