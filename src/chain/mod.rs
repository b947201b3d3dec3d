//! Chain tracker: the append-only record of handler transitions for one task
//!
//! What this module provides
//! - `ChainRecord` with an origin handler and `{from, to, reason, timestamp}` entries
//! - `append` returning a new record, never mutating the old one
//!
//! Guards, in the order they are checked
//! 1. `InvalidTransition`: `from` must be the active handler (origin, or the
//!    `to` of the last entry)
//! 2. `MaxDepthExceeded`: the record already holds `max_depth` entries
//! 3. `CycleDetected`: `to` is `from` itself, or acted as `from` earlier
//!
//! The depth guard runs first so a full chain always reports its depth,
//! whatever the requested target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HandoffError, Result};
use crate::registry::HandlerId;

/// Default chain length limit.
pub const DEFAULT_MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub from: HandlerId,
    pub to: HandlerId,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    origin: HandlerId,
    entries: Vec<ChainEntry>,
    max_depth: usize,
}

impl ChainRecord {
    pub fn new(origin: HandlerId, max_depth: usize) -> Self {
        Self {
            origin,
            entries: Vec::new(),
            max_depth,
        }
    }

    pub fn origin(&self) -> &HandlerId {
        &self.origin
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handler currently holding the task.
    pub fn active(&self) -> &HandlerId {
        self.entries.last().map(|e| &e.to).unwrap_or(&self.origin)
    }

    /// Visited handlers, origin first.
    pub fn path(&self) -> Vec<HandlerId> {
        std::iter::once(self.origin.clone())
            .chain(self.entries.iter().map(|e| e.to.clone()))
            .collect()
    }

    /// True when `to` would close a loop.
    pub fn would_cycle(&self, from: &HandlerId, to: &HandlerId) -> bool {
        to == from || self.entries.iter().any(|e| &e.from == to)
    }

    /// Returns a copy of this record with one more transition.
    pub fn append(
        &self,
        from: &HandlerId,
        to: &HandlerId,
        reason: impl Into<String>,
    ) -> Result<ChainRecord> {
        if from != self.active() {
            return Err(HandoffError::InvalidTransition {
                expected: self.active().clone(),
                found: from.clone(),
            });
        }
        if self.entries.len() >= self.max_depth {
            return Err(HandoffError::MaxDepthExceeded {
                max_depth: self.max_depth,
            });
        }
        if self.would_cycle(from, to) {
            return Err(HandoffError::CycleDetected {
                from: from.clone(),
                to: to.clone(),
            });
        }
        let mut next = self.clone();
        next.entries.push(ChainEntry {
            from: from.clone(),
            to: to.clone(),
            reason: reason.into(),
            timestamp: Utc::now(),
        });
        Ok(next)
    }

    /// Rebuilds a record from stored entries, checking that they still form
    /// a valid chain: contiguous, within `max_depth`, and free of cycles.
    pub fn from_entries(
        origin: HandlerId,
        entries: Vec<ChainEntry>,
        max_depth: usize,
    ) -> Result<ChainRecord> {
        let mut record = ChainRecord::new(origin, max_depth);
        for entry in entries {
            // validate with the same guards as `append`, keeping the stored entry
            record.append(&entry.from, &entry.to, String::new())?;
            record.entries.push(entry);
        }
        Ok(record)
    }

    /// Re-roots an empty record at a different origin.
    pub(crate) fn reroot(&mut self, origin: HandlerId) {
        debug_assert!(self.entries.is_empty());
        self.origin = origin;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn h(s: &str) -> HandlerId {
        HandlerId::from(s)
    }

    #[test]
    fn append_records_transition_and_keeps_original() {
        let chain = ChainRecord::new(h("x"), 5);
        let next = chain.append(&h("x"), &h("y"), "needs domain y").unwrap();
        assert!(chain.is_empty());
        assert_eq!(next.len(), 1);
        assert_eq!(next.entries()[0].from, h("x"));
        assert_eq!(next.entries()[0].to, h("y"));
        assert_eq!(next.entries()[0].reason, "needs domain y");
        assert_eq!(next.active(), &h("y"));
        assert_eq!(next.path(), vec![h("x"), h("y")]);
    }

    #[test]
    fn self_transfer_is_a_cycle() {
        let chain = ChainRecord::new(h("x"), 5);
        let err = chain.append(&h("x"), &h("x"), "again").unwrap_err();
        assert!(matches!(err, HandoffError::CycleDetected { .. }));
    }

    #[test]
    fn returning_to_an_earlier_source_is_a_cycle() {
        let chain = ChainRecord::new(h("a"), 5)
            .append(&h("a"), &h("b"), "")
            .unwrap();
        let err = chain.append(&h("b"), &h("a"), "").unwrap_err();
        assert!(matches!(err, HandoffError::CycleDetected { ref to, .. } if to == &h("a")));
        let chain = chain.append(&h("b"), &h("c"), "").unwrap();
        assert!(chain.append(&h("c"), &h("d"), "").is_ok());
    }

    #[test]
    fn depth_limit_is_enforced_before_cycles() {
        let ids: Vec<_> = (1..=6).map(|i| h(&format!("h{}", i))).collect();
        let mut chain = ChainRecord::new(ids[0].clone(), 5);
        for w in ids.windows(2) {
            chain = chain.append(&w[0], &w[1], "next").unwrap();
        }
        assert_eq!(chain.len(), 5);
        let err = chain.append(&ids[5], &ids[0], "wrap").unwrap_err();
        assert!(matches!(err, HandoffError::MaxDepthExceeded { max_depth: 5 }));
    }

    #[test]
    fn append_from_inactive_handler_is_rejected() {
        let chain = ChainRecord::new(h("a"), 5);
        let err = chain.append(&h("b"), &h("c"), "").unwrap_err();
        assert!(matches!(err, HandoffError::InvalidTransition { .. }));
    }

    #[test]
    fn from_entries_rebuilds_and_validates() {
        let chain = ChainRecord::new(h("a"), 5)
            .append(&h("a"), &h("b"), "first")
            .unwrap()
            .append(&h("b"), &h("c"), "second")
            .unwrap();
        let rebuilt = ChainRecord::from_entries(h("a"), chain.entries().to_vec(), 5).unwrap();
        assert_eq!(rebuilt, chain);

        let err = ChainRecord::from_entries(h("x"), chain.entries().to_vec(), 5).unwrap_err();
        assert!(matches!(err, HandoffError::InvalidTransition { .. }));
        let err = ChainRecord::from_entries(h("a"), chain.entries().to_vec(), 1).unwrap_err();
        assert!(matches!(err, HandoffError::MaxDepthExceeded { max_depth: 1 }));
    }

    proptest! {
        // Below the depth limit, CycleDetected fires exactly when the target
        // already acted as a source (including the current source).
        #[test]
        fn cycle_iff_target_was_a_source(targets in proptest::collection::vec(0u8..6, 1..12)) {
            let mut chain = ChainRecord::new(h("n0"), 64);
            let mut sources: Vec<HandlerId> = Vec::new();
            for t in targets {
                let from = chain.active().clone();
                let to = h(&format!("n{}", t));
                let was_source = to == from || sources.contains(&to);
                match chain.append(&from, &to, "") {
                    Ok(next) => {
                        prop_assert!(!was_source);
                        sources.push(from);
                        chain = next;
                    }
                    Err(HandoffError::CycleDetected { .. }) => prop_assert!(was_source),
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }
            }
        }
    }
}
