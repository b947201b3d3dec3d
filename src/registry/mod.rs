//! Capability registry: who can handle what, and who may hand off to whom
//!
//! What this module provides
//! - `HandlerDescriptor` values loaded once at startup (TOML or in code)
//! - `CapabilityRegistry::resolve` / `list` lookups, immutable after build
//! - One bound `HandlerSvc` per descriptor, resolved at registration
//!
//! Validation happens eagerly in `RegistryBuilder::build`: empty or duplicate
//! ids, transfer targets that name no registered handler, and descriptors with
//! no bound handler are all `ConfigurationError`s. A registry that builds is
//! closed: every transfer target resolves.
//!
//! Descriptor file format
//! ```toml
//! [[handlers]]
//! id = "triage"
//! domains = ["support"]
//! transfer_targets = ["billing"]
//! reply = '{"transfer": {"target": "billing", "reason": "needs domain billing"}}'
//!
//! [handlers.capabilities]
//! keywords = ["help", "question"]
//! intents = ["support"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HandoffError, Result};
use crate::handlers::{process_handler, static_reply, HandlerSvc};

/// Handler identifier newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub String);

impl HandlerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Metadata the coordinator scores handlers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Words or phrases in a task that suggest this handler.
    pub keywords: Vec<String>,
    /// Intent labels this handler serves.
    pub intents: Vec<String>,
    pub min_complexity: u8,
    pub max_complexity: u8,
    /// Score multiplier.
    pub weight: f32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            intents: Vec::new(),
            min_complexity: 1,
            max_complexity: 10,
            weight: 1.0,
        }
    }
}

/// Static description of a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub id: HandlerId,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub transfer_targets: BTreeSet<HandlerId>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl HandlerDescriptor {
    pub fn new(id: impl Into<HandlerId>) -> Self {
        Self {
            id: id.into(),
            domains: Vec::new(),
            transfer_targets: BTreeSet::new(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn transfers_to(mut self, target: impl Into<HandlerId>) -> Self {
        self.transfer_targets.insert(target.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .keywords
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.capabilities.intents.push(intent.into());
        self
    }

    pub fn complexity(mut self, min: u8, max: u8) -> Self {
        self.capabilities.min_complexity = min;
        self.capabilities.max_complexity = max;
        self
    }

    pub fn weight(mut self, weight: f32) -> Self {
        self.capabilities.weight = weight;
        self
    }

    pub fn can_transfer_to(&self, target: &HandlerId) -> bool {
        self.transfer_targets.contains(target)
    }
}

/// One `[[handlers]]` entry of a descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorEntry {
    #[serde(flatten)]
    pub descriptor: HandlerDescriptor,
    /// Fixed raw output returned on every invocation.
    #[serde(default)]
    pub reply: Option<String>,
    /// External program; receives the request as JSON on stdin.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Parsed descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorFile {
    #[serde(default)]
    pub handlers: Vec<DescriptorEntry>,
}

impl DescriptorFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| HandoffError::configuration(format!("invalid descriptor file: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HandoffError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.handlers.iter().map(|e| e.descriptor.clone()).collect()
    }
}

struct Registered {
    descriptor: HandlerDescriptor,
    service: HandlerSvc,
}

/// Immutable, validated set of handlers.
pub struct CapabilityRegistry {
    handlers: BTreeMap<HandlerId, Registered>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Looks up a descriptor.
    pub fn resolve(&self, id: &HandlerId) -> Result<&HandlerDescriptor> {
        self.handlers
            .get(id)
            .map(|r| &r.descriptor)
            .ok_or_else(|| HandoffError::UnknownHandler(id.clone()))
    }

    /// All descriptors, ordered by id.
    pub fn list(&self) -> Vec<&HandlerDescriptor> {
        self.handlers.values().map(|r| &r.descriptor).collect()
    }

    /// The callable bound to `id`.
    pub fn handler(&self, id: &HandlerId) -> Result<HandlerSvc> {
        self.handlers
            .get(id)
            .map(|r| r.service.clone())
            .ok_or_else(|| HandoffError::UnknownHandler(id.clone()))
    }

    pub fn contains(&self, id: &HandlerId) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Checks descriptors alone: ids non-empty and unique, transfer targets
    /// closed over the set.
    pub fn validate_descriptors(descriptors: &[HandlerDescriptor]) -> Result<()> {
        let mut ids = BTreeSet::new();
        for d in descriptors {
            if d.id.as_str().trim().is_empty() {
                return Err(HandoffError::configuration("handler id must not be empty"));
            }
            if !ids.insert(&d.id) {
                return Err(HandoffError::configuration(format!(
                    "duplicate handler id: {}",
                    d.id
                )));
            }
            let c = &d.capabilities;
            if c.min_complexity > c.max_complexity {
                return Err(HandoffError::configuration(format!(
                    "handler {}: min_complexity {} exceeds max_complexity {}",
                    d.id, c.min_complexity, c.max_complexity
                )));
            }
        }
        for d in descriptors {
            if let Some(missing) = d.transfer_targets.iter().find(|t| !ids.contains(t)) {
                return Err(HandoffError::configuration(format!(
                    "handler {} lists unknown transfer target {}",
                    d.id, missing
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects descriptors and handler bindings, then validates them as a whole.
#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<HandlerDescriptor>,
    bindings: BTreeMap<HandlerId, HandlerSvc>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a descriptor file, binding `reply`/`command` entries.
    pub fn from_file(file: DescriptorFile) -> Result<Self> {
        let mut builder = Self::new();
        for entry in file.handlers {
            let id = entry.descriptor.id.clone();
            match (entry.reply, entry.command) {
                (Some(_), Some(_)) => {
                    return Err(HandoffError::configuration(format!(
                        "handler {} sets both reply and command",
                        id
                    )))
                }
                (Some(reply), None) => {
                    builder.bindings.insert(id.clone(), static_reply(reply));
                }
                (None, Some(command)) => {
                    let (program, args) = command.split_first().ok_or_else(|| {
                        HandoffError::configuration(format!("handler {} has an empty command", id))
                    })?;
                    builder
                        .bindings
                        .insert(id.clone(), process_handler(program, args.to_vec()));
                }
                (None, None) => {}
            }
            builder.descriptors.push(entry.descriptor);
        }
        Ok(builder)
    }

    /// Adds a descriptor together with its handler.
    pub fn register(mut self, descriptor: HandlerDescriptor, service: HandlerSvc) -> Self {
        self.bindings.insert(descriptor.id.clone(), service);
        self.descriptors.push(descriptor);
        self
    }

    /// Adds a descriptor whose handler is bound separately.
    pub fn descriptor(mut self, descriptor: HandlerDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Binds (or rebinds) the handler for `id`.
    pub fn bind(mut self, id: impl Into<HandlerId>, service: HandlerSvc) -> Self {
        self.bindings.insert(id.into(), service);
        self
    }

    pub fn build(mut self) -> Result<CapabilityRegistry> {
        CapabilityRegistry::validate_descriptors(&self.descriptors)?;
        if let Some(stray) = self
            .bindings
            .keys()
            .find(|id| !self.descriptors.iter().any(|d| &d.id == *id))
        {
            return Err(HandoffError::configuration(format!(
                "handler {} is bound but has no descriptor",
                stray
            )));
        }
        let mut handlers = BTreeMap::new();
        for descriptor in self.descriptors {
            let service = self.bindings.remove(&descriptor.id).ok_or_else(|| {
                HandoffError::configuration(format!("handler {} has no binding", descriptor.id))
            })?;
            debug!(handler = %descriptor.id, targets = ?descriptor.transfer_targets, "registered handler");
            handlers.insert(
                descriptor.id.clone(),
                Registered {
                    descriptor,
                    service,
                },
            );
        }
        info!(count = handlers.len(), "capability registry loaded");
        Ok(CapabilityRegistry { handlers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::static_reply;

    fn reply() -> HandlerSvc {
        static_reply(r#"{"result": "ok"}"#)
    }

    #[test]
    fn test_resolve_and_list() {
        let registry = CapabilityRegistry::builder()
            .register(
                HandlerDescriptor::new("triage")
                    .domain("support")
                    .transfers_to("billing"),
                reply(),
            )
            .register(HandlerDescriptor::new("billing").domain("finance"), reply())
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        let triage = registry.resolve(&HandlerId::from("triage")).unwrap();
        assert!(triage.can_transfer_to(&HandlerId::from("billing")));
        let ids: Vec<_> = registry.list().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["billing", "triage"]);

        let err = registry.resolve(&HandlerId::from("legal")).unwrap_err();
        assert!(matches!(err, HandoffError::UnknownHandler(ref id) if id.as_str() == "legal"));
    }

    #[test]
    fn test_dangling_transfer_target_fails_at_build() {
        let err = CapabilityRegistry::builder()
            .register(HandlerDescriptor::new("triage").transfers_to("ghost"), reply())
            .build()
            .unwrap_err();
        assert!(matches!(err, HandoffError::Configuration { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_and_unbound_handlers_fail() {
        let dup = CapabilityRegistry::builder()
            .register(HandlerDescriptor::new("a"), reply())
            .register(HandlerDescriptor::new("a"), reply())
            .build();
        assert!(dup.is_err());

        let unbound = CapabilityRegistry::builder()
            .descriptor(HandlerDescriptor::new("a"))
            .build();
        assert!(unbound.unwrap_err().to_string().contains("no binding"));

        let stray = CapabilityRegistry::builder()
            .register(HandlerDescriptor::new("a"), reply())
            .bind("b", reply())
            .build();
        assert!(stray.unwrap_err().to_string().contains("no descriptor"));
    }

    #[test]
    fn test_descriptor_file_parsing() {
        let file = DescriptorFile::from_toml_str(
            r#"
            [[handlers]]
            id = "triage"
            domains = ["support"]
            transfer_targets = ["billing"]
            reply = '{"transfer": {"target": "billing"}}'

            [handlers.capabilities]
            keywords = ["help"]
            intents = ["support"]

            [[handlers]]
            id = "billing"
            domains = ["finance"]
            reply = '{"result": "refunded"}'
            "#,
        )
        .unwrap();
        assert_eq!(file.handlers.len(), 2);
        let triage = &file.handlers[0].descriptor;
        assert_eq!(triage.capabilities.keywords, vec!["help".to_string()]);
        assert_eq!(triage.capabilities.max_complexity, 10);

        let registry = RegistryBuilder::from_file(file).unwrap().build().unwrap();
        assert!(registry.contains(&HandlerId::from("billing")));
    }

    #[test]
    fn test_malformed_descriptor_file_is_configuration_error() {
        let err = DescriptorFile::from_toml_str("[[handlers]]\ndomains = 3").unwrap_err();
        assert!(matches!(err, HandoffError::Configuration { .. }));

        let both = DescriptorFile::from_toml_str(
            r#"
            [[handlers]]
            id = "x"
            reply = "{}"
            command = ["cat"]
            "#,
        )
        .unwrap();
        assert!(RegistryBuilder::from_file(both).is_err());
    }

    #[test]
    fn test_inverted_complexity_range_rejected() {
        let err = CapabilityRegistry::validate_descriptors(&[
            HandlerDescriptor::new("x").complexity(8, 2)
        ])
        .unwrap_err();
        assert!(err.to_string().contains("min_complexity"));
    }
}
