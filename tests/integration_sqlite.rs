//! # Integration Tests for SQLite Session Storage
//!
//! Sessions written by one store instance must be readable by the next one
//! opened on the same database file, and finalized sessions must stay final.

use std::sync::Arc;

use serde_json::json;
use tempfile::NamedTempFile;
use tower_handoff::{
    static_reply, CapabilityRegistry, ChainRecord, Context, HandlerDescriptor, HandlerId,
    Orchestrator, SessionState, SessionStatus, SessionStore, SqliteSessionStore, Strategy, Task,
    TaskId,
};

fn state(id: &str) -> SessionState {
    let task = Task::with_id(id, "persist me");
    let context = Context::for_task(&task, 4096).unwrap();
    let chain = ChainRecord::new(HandlerId::from("intake"), 5);
    SessionState::new(task, context, chain, Strategy::Single, Vec::new())
}

#[tokio::test]
async fn test_sqlite_persistence() {
    // A named temp file keeps the database around across store instances
    // and removes it when the test ends.
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path();

    {
        let store = SqliteSessionStore::new(db_path).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());

        let mut s = state("task-a");
        s.chain = s
            .chain
            .append(&HandlerId::from("intake"), &HandlerId::from("review"), "needs review")
            .unwrap();
        s.current_handler = HandlerId::from("review");
        store.save(&s).await.unwrap();
        store.save(&state("task-b")).await.unwrap();
    }

    {
        let store = SqliteSessionStore::new(db_path).await.unwrap();
        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![TaskId::from("task-a"), TaskId::from("task-b")]);

        let loaded = store.load(&TaskId::from("task-a")).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.current_handler, HandlerId::from("review"));
        assert_eq!(loaded.chain.len(), 1);
        assert_eq!(loaded.chain.entries()[0].reason, "needs review");
        assert_eq!(loaded.context.task_payload(), Some(&json!("persist me")));

        assert!(store.load(&TaskId::from("nope")).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_finalized_sessions_are_not_overwritten() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteSessionStore::new(temp_file.path()).await.unwrap();

    let mut s = state("task-f");
    store.save(&s).await.unwrap();
    s.finalize(SessionStatus::Failed, None, None);
    store.save(&s).await.unwrap();

    let mut again = s.clone();
    again.status = SessionStatus::Running;
    assert!(store.save(&again).await.is_err());

    let loaded = store.load(&TaskId::from("task-f")).await.unwrap().unwrap();
    assert_eq!(loaded.status, SessionStatus::Failed);
}

#[tokio::test]
async fn test_orchestrator_on_sqlite_store() {
    let temp_file = NamedTempFile::new().unwrap();
    let store: Arc<dyn SessionStore> =
        Arc::new(SqliteSessionStore::new(temp_file.path()).await.unwrap());
    let registry = CapabilityRegistry::builder()
        .register(
            HandlerDescriptor::new("intake")
                .keywords(["order"])
                .transfers_to("shipping"),
            static_reply(r#"{"transfer": {"target": "shipping", "reason": "ship it"}}"#),
        )
        .register(
            HandlerDescriptor::new("shipping"),
            static_reply(r#"{"result": "shipped"}"#),
        )
        .build()
        .unwrap();
    let orchestrator = Orchestrator::builder(registry)
        .store(store.clone())
        .build()
        .unwrap();

    let report = orchestrator
        .submit(Task::with_id("order-9", "new order"))
        .await
        .unwrap();
    assert_eq!(report.status, SessionStatus::Completed);

    let reopened = SqliteSessionStore::new(temp_file.path()).await.unwrap();
    let stored = reopened.load(&TaskId::from("order-9")).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(stored.chain, report.chain);
    assert_eq!(stored.result.unwrap().output, json!("shipped"));
}

#[tokio::test]
async fn test_in_memory_store() {
    let store = SqliteSessionStore::new_in_memory().await.unwrap();
    store.save(&state("mem-1")).await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec![TaskId::from("mem-1")]);
}
