//! Tests for transaction lifecycles

use std::sync::Arc;

use sqlweave_rdbc::prelude::*;

fn stub_source() -> (Arc<StubDataSource>, Arc<StubScript>) {
    let ds = Arc::new(StubDataSource::new());
    let script = ds.script().clone();
    (ds, script)
}

#[tokio::test]
async fn managed_transaction_opens_lazily() {
    let (ds, script) = stub_source();
    let mut tx = ManagedTransaction::new(ds, None, false);

    assert_eq!(script.connections_opened(), 0);
    tx.connection().await.unwrap();
    assert_eq!(script.connections_opened(), 1);

    // Second call reuses the same connection.
    tx.connection().await.unwrap();
    assert_eq!(script.connections_opened(), 1);
}

#[tokio::test]
async fn managed_transaction_applies_autocommit_preference() {
    let (ds, script) = stub_source();
    let mut tx = ManagedTransaction::new(ds, None, false);
    tx.connection().await.unwrap();

    assert!(script.events().contains(&ConnectionEvent::AutoCommit(false)));

    tx.commit().await.unwrap();
    assert!(script.events().contains(&ConnectionEvent::Committed));

    tx.rollback().await.unwrap();
    assert!(script.events().contains(&ConnectionEvent::RolledBack));
}

#[tokio::test]
async fn managed_commit_is_noop_under_autocommit() {
    let (ds, script) = stub_source();
    let mut tx = ManagedTransaction::new(ds, None, true);
    tx.connection().await.unwrap();

    tx.commit().await.unwrap();
    tx.rollback().await.unwrap();

    let events = script.events();
    assert!(!events.contains(&ConnectionEvent::Committed));
    assert!(!events.contains(&ConnectionEvent::RolledBack));
}

#[tokio::test]
async fn managed_close_resets_autocommit_and_releases() {
    let (ds, script) = stub_source();
    let mut tx = ManagedTransaction::new(ds, None, false);
    tx.connection().await.unwrap();
    tx.close().await.unwrap();

    let events = script.events();
    // Autocommit is restored before close so drivers do not issue an
    // implicit commit of a half-finished transaction.
    assert!(events.contains(&ConnectionEvent::AutoCommit(true)));
    assert!(events.contains(&ConnectionEvent::Closed));
}

#[tokio::test]
async fn managed_transaction_applies_isolation() {
    let (ds, script) = stub_source();
    let mut tx = ManagedTransaction::new(ds, Some(IsolationLevel::Serializable), true);
    tx.connection().await.unwrap();

    assert!(script
        .events()
        .contains(&ConnectionEvent::Isolation("SERIALIZABLE".to_string())));
}

#[tokio::test]
async fn external_transaction_never_touches_lifecycle() {
    let (ds, script) = stub_source();
    let conn = ds.connection().await.unwrap();
    let mut tx = ExternalTransaction::new(conn);

    tx.commit().await.unwrap();
    tx.rollback().await.unwrap();
    tx.close().await.unwrap();

    let events = script.events();
    assert!(!events.contains(&ConnectionEvent::Committed));
    assert!(!events.contains(&ConnectionEvent::RolledBack));
    assert!(!events.contains(&ConnectionEvent::Closed));
}
