//! Session table against an in-memory SQLite database

use chrono::{Duration, TimeZone, Utc};
use revtun_store::entities::session;
use revtun_store::{connect, migrate, SessionStore};
use sea_orm::ConnectionTrait;

async fn setup_store() -> SessionStore {
    SessionStore::open("sqlite::memory:")
        .await
        .expect("Failed to open in-memory store")
}

fn row(agent_id: &str) -> session::Model {
    let connected = Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap();
    session::Model {
        agent_id: agent_id.to_string(),
        session_id: "s-1".to_string(),
        auth_id: "auth-1".to_string(),
        name: Some("build box".to_string()),
        version: Some("0.7.0".to_string()),
        address: Some("192.0.2.10:51000".to_string()),
        tunnels: "[]".to_string(),
        allowed_user_groups: r#"["admins"]"#.to_string(),
        connected_at: connected,
        disconnected_at: None,
        updated_at: connected,
    }
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");
    assert!(matches!(
        db.get_database_backend(),
        sea_orm::DatabaseBackend::Sqlite
    ));
    assert!(migrate(&db).await.is_ok());
    // running them again is a no-op
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_save_and_list() {
    let store = setup_store().await;
    store.save(row("agent-b")).await.unwrap();
    store.save(row("agent-a")).await.unwrap();

    let rows = store.list_all().await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["agent-a", "agent-b"]);
    assert_eq!(rows[0], row("agent-a"));
}

#[tokio::test]
async fn test_save_replaces_existing_row() {
    let store = setup_store().await;
    store.save(row("agent-a")).await.unwrap();

    let mut updated = row("agent-a");
    updated.disconnected_at = Some(updated.connected_at + Duration::minutes(5));
    updated.tunnels = r#"[{"id":"1"}]"#.to_string();
    store.save(updated.clone()).await.unwrap();

    let rows = store.list_all().await.unwrap();
    assert_eq!(rows, vec![updated]);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let store = setup_store().await;
    store.save(row("agent-a")).await.unwrap();

    store.delete("agent-a").await.unwrap();
    store.delete("agent-a").await.unwrap();
    assert!(store.list_all().await.unwrap().is_empty());
}
