//! Change Stream Tests
//!
//! Tests for change delivery:
//! - Events are published only after commit
//! - Rolled back work publishes nothing
//! - Collection filters and the all-collections subscription
//! - Handler tasks stop when cancelled

use std::sync::{Arc, Mutex};
use std::time::Duration;

use docudb::cdc::ALL_COLLECTIONS;
use docudb::{
    Action, CollectionSchema, Context, Database, DbConfig, Document, MemoryKv, OverflowPolicy,
    TxOptions,
};
use serde_json::{json, Value};

// =============================================================================
// Helper Functions
// =============================================================================

fn doc(value: Value) -> Document {
    Document::from_value(value).unwrap()
}

fn setup() -> (Database, Context) {
    let db = Database::in_memory().unwrap();
    let ctx = Context::new();
    db.configure_collection(&ctx, CollectionSchema::new("user"))
        .unwrap();
    db.configure_collection(&ctx, CollectionSchema::new("task"))
        .unwrap();
    (db, ctx)
}

// =============================================================================
// Commit Visibility
// =============================================================================

#[tokio::test]
async fn test_events_published_after_commit() {
    let (db, ctx) = setup();
    let mut sub = db.subscribe("user");

    let mut tx = db.begin(&ctx, TxOptions::default()).unwrap();
    tx.create("user", doc(json!({"_id": "u1", "name": "a"})))
        .unwrap();
    assert_eq!(tx.cdc().len(), 1);
    assert!(sub.try_recv().is_none());

    tx.commit().unwrap();
    let event = sub.recv().await.unwrap();
    assert_eq!(event.collection, "user");
    assert_eq!(event.action, Action::Create);
    assert_eq!(event.document_id, "u1");
    assert_eq!(event.document.get("name"), Some(&json!("a")));
}

#[tokio::test]
async fn test_rollback_publishes_nothing() {
    let (db, ctx) = setup();
    let mut sub = db.subscribe(ALL_COLLECTIONS);

    let mut tx = db.begin(&ctx, TxOptions::default()).unwrap();
    tx.create("user", doc(json!({"_id": "u1"}))).unwrap();
    tx.rollback().unwrap();

    {
        let mut dropped = db.begin(&ctx, TxOptions::default()).unwrap();
        dropped.create("user", doc(json!({"_id": "u2"}))).unwrap();
    }

    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_update_and_delete_events_in_order() {
    let (db, ctx) = setup();
    let mut sub = db.subscribe("user");

    db.create(&ctx, "user", doc(json!({"_id": "u1", "age": 1})))
        .unwrap();
    db.update(&ctx, "user", "u1", doc(json!({"age": 2})))
        .unwrap();
    db.delete(&ctx, "user", "u1").unwrap();

    let actions: Vec<Action> = [
        sub.recv().await.unwrap(),
        sub.recv().await.unwrap(),
        sub.recv().await.unwrap(),
    ]
    .iter()
    .map(|e| e.action)
    .collect();
    assert_eq!(actions, vec![Action::Create, Action::Update, Action::Delete]);
}

// =============================================================================
// Filtering
// =============================================================================

#[tokio::test]
async fn test_collection_filter() {
    let (db, ctx) = setup();
    let mut users = db.subscribe("user");
    let mut all = db.subscribe(ALL_COLLECTIONS);

    db.create(&ctx, "task", doc(json!({"_id": "t1"}))).unwrap();
    db.create(&ctx, "user", doc(json!({"_id": "u1"}))).unwrap();

    assert_eq!(users.recv().await.unwrap().document_id, "u1");
    assert!(users.try_recv().is_none());

    assert_eq!(all.recv().await.unwrap().collection, "task");
    assert_eq!(all.recv().await.unwrap().collection, "user");
}

#[tokio::test]
async fn test_closed_database_ends_subscriptions() {
    let (db, _) = setup();
    let mut sub = db.subscribe("user");
    db.close().unwrap();
    assert!(sub.recv().await.is_none());
}

// =============================================================================
// Overflow
// =============================================================================

#[tokio::test]
async fn test_reject_newest_keeps_first_events() {
    let config = DbConfig::default()
        .with_change_stream_capacity(2)
        .with_overflow_policy(OverflowPolicy::RejectNewest);
    let db = Database::open(Arc::new(MemoryKv::new()), config).unwrap();
    let ctx = Context::new();
    db.configure_collection(&ctx, CollectionSchema::new("user"))
        .unwrap();
    let mut sub = db.subscribe("user");

    for id in ["u1", "u2", "u3", "u4"] {
        db.create(&ctx, "user", doc(json!({"_id": id}))).unwrap();
    }

    assert_eq!(sub.try_recv().unwrap().document_id, "u1");
    assert_eq!(sub.try_recv().unwrap().document_id, "u2");
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_drop_oldest_keeps_latest_events() {
    let config = DbConfig::default()
        .with_change_stream_capacity(2)
        .with_overflow_policy(OverflowPolicy::DropOldest);
    let db = Database::open(Arc::new(MemoryKv::new()), config).unwrap();
    let ctx = Context::new();
    db.configure_collection(&ctx, CollectionSchema::new("user"))
        .unwrap();
    let mut sub = db.subscribe("user");

    for id in ["u1", "u2", "u3", "u4"] {
        db.create(&ctx, "user", doc(json!({"_id": id}))).unwrap();
    }

    assert_eq!(sub.recv().await.unwrap().document_id, "u3");
    assert_eq!(sub.recv().await.unwrap().document_id, "u4");
}

// =============================================================================
// Handler Tasks
// =============================================================================

#[tokio::test]
async fn test_on_change_handler_receives_events() {
    let (db, ctx) = setup();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let task = db
        .on_change("user", move |collection, cdc| {
            sink.lock()
                .unwrap()
                .push(format!("{}/{}", collection, cdc.document_id));
        })
        .unwrap();

    db.create(&ctx, "user", doc(json!({"_id": "u1"}))).unwrap();
    db.create(&ctx, "user", doc(json!({"_id": "u2"}))).unwrap();

    for _ in 0..100 {
        if seen.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec!["user/u1", "user/u2"]);

    task.cancel().await;
    db.create(&ctx, "user", doc(json!({"_id": "u3"}))).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_on_change_requires_runtime() {
    let (db, _) = setup();
    assert!(db.on_change("user", |_, _| {}).is_err());
}
