//! Coordinator: picks the first handler and the execution strategy
//!
//! What this module provides
//! - `Coordinator::route(task, registry) -> RoutingDecision`
//! - `Classifier` trait with `KeywordClassifier` as the default
//!
//! Routing rules
//! - A classifier labels the task with an intent and a complexity (1..=10)
//! - Complexity below `low_threshold` runs `Single`; up to `high_threshold`
//!   runs `Sequential`; above that runs `BoundedParallel` over the
//!   `max_fan_out` best-scoring handlers
//! - Handlers are scored from their capabilities: keyword hits, an intent
//!   match worth two hits, scaled by `weight`; handlers whose complexity range
//!   excludes the task are not eligible
//! - Ties break by handler id so routing is deterministic
//!
//! Testing strategy
//! - Small registries with disjoint keywords; explicit complexity hints in
//!   the task payload drive the strategy thresholds

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::error::{HandoffError, Result};
use crate::registry::{CapabilityRegistry, HandlerDescriptor, HandlerId};
use crate::task::Task;

pub const MIN_COMPLEXITY: u8 = 1;
pub const MAX_COMPLEXITY: u8 = 10;

/// How a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One handler is expected to finish the task; it may still transfer.
    Single,
    /// A chain of handlers, transfers expected.
    Sequential,
    /// Several handlers run concurrently and their outputs are concatenated.
    BoundedParallel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    /// Clamped to `1..=10`.
    pub complexity: u8,
}

impl Classification {
    pub fn new(intent: impl Into<String>, complexity: u8) -> Self {
        Self {
            intent: intent.into(),
            complexity: complexity.clamp(MIN_COMPLEXITY, MAX_COMPLEXITY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub initial_handler: HandlerId,
    pub strategy: Strategy,
    pub classification: Classification,
    /// Fan-out participants, best first; empty unless `BoundedParallel`.
    pub participants: Vec<HandlerId>,
}

/// Labels a task with an intent and a complexity.
pub trait Classifier: Send + Sync + 'static {
    fn classify(&self, task: &Task, registry: &CapabilityRegistry) -> Classification;
}

impl<F> Classifier for F
where
    F: Fn(&Task, &CapabilityRegistry) -> Classification + Send + Sync + 'static,
{
    fn classify(&self, task: &Task, registry: &CapabilityRegistry) -> Classification {
        self(task, registry)
    }
}

/// Heuristic classifier.
///
/// An object payload may carry explicit `"intent"` / `"complexity"` hints,
/// which win. Otherwise the intent is the best-matching handler's first
/// intent (or `general`), and complexity grows with the number of handlers
/// the text matches and with its length.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl Classifier for KeywordClassifier {
    fn classify(&self, task: &Task, registry: &CapabilityRegistry) -> Classification {
        let payload = task.payload();
        let hinted_intent = payload.get("intent").and_then(|v| v.as_str());
        let hinted_complexity = payload
            .get("complexity")
            .and_then(|v| v.as_u64())
            .map(|c| c.min(MAX_COMPLEXITY as u64) as u8);

        let text = task.text().to_lowercase();
        let mut matched: Vec<(&HandlerDescriptor, usize)> = registry
            .list()
            .into_iter()
            .map(|d| (d, keyword_hits(d, &text)))
            .filter(|(_, hits)| *hits > 0)
            .collect();
        matched.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));

        let intent = hinted_intent
            .map(str::to_string)
            .or_else(|| {
                matched
                    .first()
                    .and_then(|(d, _)| d.capabilities.intents.first().cloned())
            })
            .unwrap_or_else(|| "general".to_string());

        let complexity = hinted_complexity.unwrap_or_else(|| {
            let words = text.split_whitespace().count();
            let spread = matched.len().saturating_sub(1) * 3;
            (1 + spread + words / 40).min(MAX_COMPLEXITY as usize) as u8
        });

        Classification::new(intent, complexity)
    }
}

fn keyword_hits(descriptor: &HandlerDescriptor, text: &str) -> usize {
    descriptor
        .capabilities
        .keywords
        .iter()
        .filter(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
        .count()
}

/// Score of a handler for a classified task; `None` when ineligible.
pub fn score(descriptor: &HandlerDescriptor, text: &str, class: &Classification) -> Option<f32> {
    let caps = &descriptor.capabilities;
    if class.complexity < caps.min_complexity || class.complexity > caps.max_complexity {
        return None;
    }
    let intent_match = caps
        .intents
        .iter()
        .any(|i| i.eq_ignore_ascii_case(&class.intent));
    let raw = keyword_hits(descriptor, text) + if intent_match { 2 } else { 0 };
    Some(raw as f32 * caps.weight)
}

pub struct Coordinator {
    config: CoordinatorConfig,
    classifier: Arc<dyn Classifier>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(KeywordClassifier),
        }
    }

    pub fn with_classifier(mut self, classifier: impl Classifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn strategy_for(&self, complexity: u8) -> Strategy {
        if complexity < self.config.low_threshold {
            Strategy::Single
        } else if complexity <= self.config.high_threshold {
            Strategy::Sequential
        } else {
            Strategy::BoundedParallel
        }
    }

    /// Eligible handlers with a positive score, best first.
    pub fn rank(
        &self,
        task: &Task,
        registry: &CapabilityRegistry,
        class: &Classification,
    ) -> Vec<HandlerId> {
        let text = task.text().to_lowercase();
        let mut scored: Vec<(f32, &HandlerId)> = registry
            .list()
            .into_iter()
            .filter_map(|d| score(d, &text, class).map(|s| (s, &d.id)))
            .filter(|(s, _)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn route(&self, task: &Task, registry: &CapabilityRegistry) -> Result<RoutingDecision> {
        if registry.is_empty() {
            return Err(HandoffError::configuration("registry has no handlers"));
        }
        let classification = self.classifier.classify(task, registry);
        let ranked = self.rank(task, registry, &classification);
        debug!(task_id = %task.id(), ?classification, ?ranked, "ranked handlers");

        let initial_handler = match ranked.first() {
            Some(best) => best.clone(),
            None => self.fallback_handler(registry, &classification)?,
        };

        let mut strategy = self.strategy_for(classification.complexity);
        let mut participants = Vec::new();
        if strategy == Strategy::BoundedParallel {
            participants = ranked
                .into_iter()
                .take(self.config.max_fan_out)
                .collect();
            if participants.len() < 2 {
                debug!(task_id = %task.id(), "too few participants to fan out");
                strategy = Strategy::Sequential;
                participants.clear();
            }
        }

        info!(
            task_id = %task.id(),
            handler = %initial_handler,
            ?strategy,
            intent = %classification.intent,
            complexity = classification.complexity,
            "task routed"
        );
        Ok(RoutingDecision {
            initial_handler,
            strategy,
            classification,
            participants,
        })
    }

    fn fallback_handler(
        &self,
        registry: &CapabilityRegistry,
        class: &Classification,
    ) -> Result<HandlerId> {
        if let Some(default) = &self.config.default_handler {
            registry.resolve(default)?;
            return Ok(default.clone());
        }
        let all = registry.list();
        let eligible = all.iter().find(|d| {
            class.complexity >= d.capabilities.min_complexity
                && class.complexity <= d.capabilities.max_complexity
        });
        eligible
            .or_else(|| all.first())
            .map(|d| d.id.clone())
            .ok_or_else(|| HandoffError::configuration("registry has no handlers"))
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
