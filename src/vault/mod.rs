//! Encrypted storage for OAuth sessions and authorization requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       AuthStore (ClientAuthStore)        │
//! │  - typed session / auth-request ops      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       RecordStore                        │
//! │  - upsert / get / delete / take          │
//! │  - bounded-wait write lock, reader pool  │
//! └─────────────────────────────────────────┘
//!          ↓ (seal)             ↑ (open)
//! ┌─────────────────────────────────────────┐
//! │       EnvelopeCipher                     │
//! │  - AES-256-GCM, random nonce per write   │
//! │  - keyed once by MasterKey::derive       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite (sessions, auth_requests)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use authstore::config::StorageConfig;
//! use authstore::oauth::ClientAuthStore;
//! use authstore::vault::{AuthStore, CallContext, MasterKey};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let key = MasterKey::derive(&std::env::var("SESSION_DB_KEY")?)?;
//! let store = AuthStore::open(&StorageConfig::default(), &key)?;
//!
//! let ctx = CallContext::background();
//! match store.get_session(&ctx, "did:plc:alice", "s1").await {
//!     Ok(session) => println!("resumed session on {}", session.host_url),
//!     Err(e) if e.requires_sign_in() => println!("please sign in again"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::oauth::{AuthRequestData, ClientAuthStore, ClientSessionData};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

mod context;
mod encryption;
mod key;
mod storage;


pub use context::CallContext;
pub use encryption::{EnvelopeCipher, NONCE_SIZE, TAG_SIZE};
pub use key::{MasterKey, KEY_SIZE};
pub use storage::{init_schema, RecordKey, RecordKind, RecordStore, SessionSummary};

/// Session and auth-request store handed to the OAuth client.
///
/// Cheap to clone; every clone shares the same connections and cipher.
#[derive(Clone)]
pub struct AuthStore {
    records: RecordStore,
}

impl AuthStore {
    /// Opens the store described by `config`, creating the schema if needed.
    pub fn open(config: &StorageConfig, key: &MasterKey) -> Result<Self, StoreError> {
        let records = RecordStore::open(&config.path, key, config.lock_timeout())?;
        debug!(
            path = %config.path,
            lock_timeout_ms = config.lock_timeout_ms,
            "Auth store opened"
        );
        Ok(Self { records })
    }

    pub fn open_in_memory(key: &MasterKey, lock_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            records: RecordStore::open_in_memory(key, lock_timeout)?,
        })
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Deletes auth requests not written for at least `max_age`.
    ///
    /// Abandoned logins never reach their callback; this keeps their state
    /// from piling up.
    pub async fn purge_auth_requests(
        &self,
        ctx: &CallContext,
        max_age: Duration,
    ) -> Result<usize, StoreError> {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(max_age);
        self.records.purge_auth_requests(ctx, cutoff).await
    }

    /// Sessions held for one account, most recent first.
    pub async fn list_sessions(
        &self,
        ctx: &CallContext,
        account_did: &str,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.records.list_sessions(ctx, account_did).await
    }

    /// Signs an account out everywhere. Returns how many sessions were removed.
    pub async fn revoke_sessions(
        &self,
        ctx: &CallContext,
        account_did: &str,
    ) -> Result<usize, StoreError> {
        self.records.delete_sessions(ctx, account_did).await
    }
}

#[async_trait]
impl ClientAuthStore for AuthStore {
    async fn save_session(
        &self,
        ctx: &CallContext,
        session: &ClientSessionData,
    ) -> Result<(), StoreError> {
        let key = RecordKey::session(&session.account_did, &session.session_id);
        self.records.upsert(ctx, &key, session).await
    }

    async fn get_session(
        &self,
        ctx: &CallContext,
        account_did: &str,
        session_id: &str,
    ) -> Result<ClientSessionData, StoreError> {
        self.records
            .get(ctx, &RecordKey::session(account_did, session_id))
            .await
    }

    async fn delete_session(
        &self,
        ctx: &CallContext,
        account_did: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.records
            .delete(ctx, &RecordKey::session(account_did, session_id))
            .await
            .map(|_| ())
    }

    async fn save_auth_request(
        &self,
        ctx: &CallContext,
        request: &AuthRequestData,
    ) -> Result<(), StoreError> {
        self.records
            .upsert(ctx, &RecordKey::auth_request(&request.state), request)
            .await
    }

    async fn get_auth_request(
        &self,
        ctx: &CallContext,
        state: &str,
    ) -> Result<AuthRequestData, StoreError> {
        self.records.get(ctx, &RecordKey::auth_request(state)).await
    }

    async fn delete_auth_request(&self, ctx: &CallContext, state: &str) -> Result<(), StoreError> {
        self.records
            .delete(ctx, &RecordKey::auth_request(state))
            .await
            .map(|_| ())
    }

    async fn take_auth_request(
        &self,
        ctx: &CallContext,
        state: &str,
    ) -> Result<AuthRequestData, StoreError> {
        self.records.take(ctx, &RecordKey::auth_request(state)).await
    }
}
