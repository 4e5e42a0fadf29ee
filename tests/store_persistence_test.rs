// Integration tests for the on-disk auth store

use authstore::config::StorageConfig;
use authstore::vault::{RecordKey, RecordStore};
use authstore::{
    AuthRequestData, AuthStore, CallContext, ClientAuthStore, ClientSessionData, MasterKey,
    StoreError,
};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;

fn storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        path: dir.path().join("sessions.db").to_str().unwrap().to_string(),
        lock_timeout_ms: 5000,
    }
}

fn session(account_did: &str, session_id: &str) -> ClientSessionData {
    ClientSessionData {
        account_did: account_did.to_string(),
        session_id: session_id.to_string(),
        host_url: "https://pds.example.com".to_string(),
        auth_server_url: "https://auth.example.com".to_string(),
        auth_server_token_endpoint: "https://auth.example.com/oauth/token".to_string(),
        scopes: vec!["atproto".to_string()],
        access_token: "access-token".to_string(),
        refresh_token: "refresh-token".to_string(),
        dpop_auth_server_nonce: String::new(),
        dpop_host_nonce: String::new(),
        dpop_private_key_multibase: "z42key".to_string(),
    }
}

fn auth_request(state: &str) -> AuthRequestData {
    AuthRequestData {
        state: state.to_string(),
        auth_server_url: "https://auth.example.com".to_string(),
        account_did: None,
        scopes: vec!["atproto".to_string()],
        request_uri: "urn:ietf:params:oauth:request_uri:1".to_string(),
        auth_server_token_endpoint: "https://auth.example.com/oauth/token".to_string(),
        pkce_verifier: "abc".to_string(),
        dpop_auth_server_nonce: String::new(),
        dpop_private_key_multibase: "z42key".to_string(),
    }
}

/// Records survive closing and reopening the database with the same secret.
#[tokio::test]
async fn test_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = storage_config(&dir);
    let ctx = CallContext::background();

    {
        let key = MasterKey::derive("hunter2").unwrap();
        let store = AuthStore::open(&config, &key).unwrap();
        store
            .save_session(&ctx, &session("did:plc:alice", "s1"))
            .await
            .unwrap();
        store.save_auth_request(&ctx, &auth_request("xyz")).await.unwrap();
    }

    let key = MasterKey::derive("hunter2").unwrap();
    let store = AuthStore::open(&config, &key).unwrap();

    let restored = store.get_session(&ctx, "did:plc:alice", "s1").await.unwrap();
    assert_eq!(restored, session("did:plc:alice", "s1"));
    assert_eq!(
        store.take_auth_request(&ctx, "xyz").await.unwrap().pkce_verifier,
        "abc"
    );
}

/// Changing the secret makes old records fail authentication, not decode garbage.
#[tokio::test]
async fn test_changed_secret_fails_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let config = storage_config(&dir);
    let ctx = CallContext::background();

    {
        let key = MasterKey::derive("old-secret").unwrap();
        let store = AuthStore::open(&config, &key).unwrap();
        store
            .save_session(&ctx, &session("did:plc:alice", "s1"))
            .await
            .unwrap();
    }

    let key = MasterKey::derive("new-secret").unwrap();
    let store = AuthStore::open(&config, &key).unwrap();

    let result = store.get_session(&ctx, "did:plc:alice", "s1").await;
    match result {
        Err(e @ StoreError::Authentication) => assert!(e.requires_sign_in()),
        other => panic!("expected authentication error, got {:?}", other),
    }
}

/// Two handles on one file (two connections) can write concurrently.
#[tokio::test]
async fn test_two_handles_share_one_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = storage_config(&dir);
    let key = MasterKey::derive("hunter2").unwrap();

    let first = AuthStore::open(&config, &key).unwrap();
    let second = AuthStore::open(&config, &key).unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = if i % 2 == 0 { first.clone() } else { second.clone() };
        handles.push(tokio::spawn(async move {
            let request = auth_request(&format!("state-{}", i));
            store
                .save_auth_request(&CallContext::background(), &request)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let ctx = CallContext::background();
    for i in 0..10 {
        let state = format!("state-{}", i);
        assert_eq!(first.get_auth_request(&ctx, &state).await.unwrap().state, state);
    }
}

/// The generic record store accepts arbitrary structured payloads.
#[tokio::test]
async fn test_generic_payload_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let key = MasterKey::derive("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap();
    assert_eq!(key.as_bytes(), &[0u8; 32]);
    let path = dir.path().join("records.db");
    let store = RecordStore::open(path.to_str().unwrap(), &key, Duration::from_secs(5)).unwrap();
    let ctx = CallContext::background();

    let alice = RecordKey::session("did:plc:alice", "s1");
    store.upsert(&ctx, &alice, &json!({"foo": 1})).await.unwrap();

    let got: Value = store.get(&ctx, &alice).await.unwrap();
    assert_eq!(got, json!({"foo": 1}));

    let bob: Result<Value, _> = store
        .get(&ctx, &RecordKey::session("did:plc:bob", "s1"))
        .await;
    assert!(matches!(bob, Err(StoreError::NotFound(_))));

    let xyz = RecordKey::auth_request("xyz");
    store.upsert(&ctx, &xyz, &json!({"verifier": "abc"})).await.unwrap();
    let got: Value = store.get(&ctx, &xyz).await.unwrap();
    assert_eq!(got, json!({"verifier": "abc"}));

    store.delete(&ctx, &xyz).await.unwrap();
    let gone: Result<Value, _> = store.get(&ctx, &xyz).await;
    assert!(matches!(gone, Err(StoreError::NotFound(_))));
}

/// Opening twice never drops existing tables or rows.
#[tokio::test]
async fn test_reopen_keeps_schema_and_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = storage_config(&dir);
    let key = MasterKey::from_bytes([5u8; 32]);
    let ctx = CallContext::background();

    for i in 0..3 {
        let store = AuthStore::open(&config, &key).unwrap();
        store
            .save_session(&ctx, &session("did:plc:alice", &format!("s{}", i)))
            .await
            .unwrap();
    }

    let store = AuthStore::open(&config, &key).unwrap();
    let sessions = store.list_sessions(&ctx, "did:plc:alice").await.unwrap();
    assert_eq!(sessions.len(), 3);
}

/// A write blocked by another connection's write lock waits out the lock
/// timeout, then fails with a retryable persistence error.
#[tokio::test]
async fn test_foreign_write_lock_times_out_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        lock_timeout_ms: 300,
        ..storage_config(&dir)
    };
    let key = MasterKey::from_bytes([1u8; 32]);
    let store = AuthStore::open(&config, &key).unwrap();
    let ctx = CallContext::background();

    let holder = rusqlite::Connection::open(&config.path).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    let started = std::time::Instant::now();
    let result = store.save_auth_request(&ctx, &auth_request("xyz")).await;
    let elapsed = started.elapsed();

    match result {
        Err(err @ StoreError::Persistence(_)) => assert!(err.is_retryable()),
        other => panic!("expected persistence error, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(300), "gave up after {:?}", elapsed);

    holder.execute_batch("ROLLBACK").unwrap();
    store.save_auth_request(&ctx, &auth_request("xyz")).await.unwrap();
}

/// Reads keep working while another connection holds the write lock.
#[tokio::test]
async fn test_reads_proceed_during_foreign_write_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        lock_timeout_ms: 300,
        ..storage_config(&dir)
    };
    let key = MasterKey::from_bytes([1u8; 32]);
    let store = AuthStore::open(&config, &key).unwrap();
    let ctx = CallContext::background();
    store
        .save_session(&ctx, &session("did:plc:alice", "s1"))
        .await
        .unwrap();

    let holder = rusqlite::Connection::open(&config.path).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();
    holder
        .execute("DELETE FROM sessions WHERE session_id = 's1'", [])
        .unwrap();

    let started = std::time::Instant::now();
    let restored = store.get_session(&ctx, "did:plc:alice", "s1").await.unwrap();
    assert_eq!(restored, session("did:plc:alice", "s1"));
    assert!(started.elapsed() < Duration::from_millis(300));

    holder.execute_batch("COMMIT").unwrap();
    assert!(matches!(
        store.get_session(&ctx, "did:plc:alice", "s1").await,
        Err(StoreError::NotFound(_))
    ));
}
