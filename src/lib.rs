//! # Tower Handoff
//!
//! A Tower-based orchestration core that routes tasks to specialized handlers,
//! lets a handler hand an in-flight task to another handler, and guarantees
//! every task ends in a terminal status with a complete audit trail.
//!
//! ## Core Concepts
//!
//! - **Handler**: a Tower service taking a [`HandlerRequest`] and returning raw
//!   text that decodes to either a terminal result or a transfer request
//! - **Registry**: the immutable set of handler descriptors and their bound
//!   services, validated as a whole at load time
//! - **Chain**: the append-only record of transfers for one task, bounded in
//!   depth and free of cycles
//! - **Coordinator**: picks the first handler and the execution strategy
//! - **Orchestrator**: the run loop; every step is persisted to a
//!   [`SessionStore`] so tasks can be resumed
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower_handoff::{
//!     static_reply, CapabilityRegistry, HandlerDescriptor, Orchestrator, Task,
//! };
//!
//! # async fn example() -> tower_handoff::Result<()> {
//! let registry = CapabilityRegistry::builder()
//!     .register(
//!         HandlerDescriptor::new("triage")
//!             .keywords(["refund"])
//!             .transfers_to("billing"),
//!         static_reply(r#"{"transfer": {"target": "billing", "reason": "needs domain billing"}}"#),
//!     )
//!     .register(
//!         HandlerDescriptor::new("billing"),
//!         static_reply(r#"{"result": "refund issued"}"#),
//!     )
//!     .build()?;
//!
//! let orchestrator = Orchestrator::builder(registry).build()?;
//! let report = orchestrator.submit(Task::new("refund order A-1009")).await?;
//! println!("{} via {:?}", report.status, report.chain.path());
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod handoff;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod sessions;
pub mod sqlite_session;
pub mod task;

// Public re-exports for convenience
pub use chain::{ChainEntry, ChainRecord};
pub use config::{ConfigBuilder, OrchestratorConfig};
pub use context::{Context, Priority};
pub use coordinator::{Classification, Classifier, Coordinator, RoutingDecision, Strategy};
pub use error::{ErrorKind, ErrorReport, HandoffError, Result};
pub use handlers::{handler_fn, process_handler, static_reply, HandlerSvc};
pub use handoff::{HandlerRequest, HandoffDecision, TaskResult, TransferRequest};
pub use observability::{ChainSinkSvc, CompletedChain, JsonLinesChainSink};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunReport};
pub use registry::{CapabilityRegistry, DescriptorFile, HandlerDescriptor, HandlerId};
pub use sessions::{
    FileSessionStore, InMemorySessionStore, SessionState, SessionStatus, SessionStore,
};
pub use sqlite_session::SqliteSessionStore;
pub use task::{Task, TaskId};

// Re-export Tower traits that users need
pub use tokio_util::sync::CancellationToken;
pub use tower::{Layer, Service, ServiceExt};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_imports() {
        let _ = std::mem::size_of::<HandoffError>();
        let _ = std::mem::size_of::<RunReport>();
    }
}
