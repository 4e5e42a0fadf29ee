//! Encrypted record storage using SQLite.
//!
//! Holds OAuth sessions and in-flight authorization requests. Payloads are
//! serialized, sealed with the envelope cipher and stored as opaque blobs; no
//! plaintext payload ever reaches the database.

use super::context::CallContext;
use super::encryption::EnvelopeCipher;
use super::key::MasterKey;
use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, InterruptHandle, OpenFlags, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Version of the plaintext document sealed into each row.
const PAYLOAD_VERSION: u16 = 1;

/// Read connections kept open between reads.
const MAX_IDLE_READERS: usize = 4;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        data       BLOB NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id);

    CREATE TABLE IF NOT EXISTS auth_requests (
        state      TEXT PRIMARY KEY,
        data       BLOB NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_auth_requests_updated ON auth_requests(updated_at);
"#;

/// The two record kinds kept by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Session,
    AuthRequest,
}

impl RecordKind {
    pub fn label(self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::AuthRequest => "auth request",
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            RecordKind::Session => {
                "SELECT data FROM sessions WHERE session_id = ?1 AND account_id = ?2"
            }
            RecordKind::AuthRequest => "SELECT data FROM auth_requests WHERE state = ?1",
        }
    }

    fn delete_sql(self) -> &'static str {
        match self {
            RecordKind::Session => "DELETE FROM sessions WHERE session_id = ?1 AND account_id = ?2",
            RecordKind::AuthRequest => "DELETE FROM auth_requests WHERE state = ?1",
        }
    }

    fn take_sql(self) -> &'static str {
        match self {
            RecordKind::Session => {
                "DELETE FROM sessions WHERE session_id = ?1 AND account_id = ?2 RETURNING data"
            }
            RecordKind::AuthRequest => "DELETE FROM auth_requests WHERE state = ?1 RETURNING data",
        }
    }
}

/// Address of one record.
///
/// Sessions can only be addressed together with their owning account, so an
/// unfiltered session lookup cannot be expressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKey {
    Session {
        account_id: String,
        session_id: String,
    },
    AuthRequest {
        state: String,
    },
}

impl RecordKey {
    pub fn session(account_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        RecordKey::Session {
            account_id: account_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn auth_request(state: impl Into<String>) -> Self {
        RecordKey::AuthRequest {
            state: state.into(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            RecordKey::Session { .. } => RecordKind::Session,
            RecordKey::AuthRequest { .. } => RecordKind::AuthRequest,
        }
    }

    /// Bind parameters for the kind's select/delete statements.
    fn lookup_params(&self) -> Vec<&str> {
        match self {
            RecordKey::Session {
                account_id,
                session_id,
            } => vec![session_id.as_str(), account_id.as_str()],
            RecordKey::AuthRequest { state } => vec![state.as_str()],
        }
    }

    /// Associated data binding a ciphertext to the row it was written for.
    fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::new();
        match self {
            RecordKey::Session {
                account_id,
                session_id,
            } => {
                aad.extend_from_slice(b"sessions\0");
                aad.extend_from_slice(session_id.as_bytes());
                aad.push(0);
                aad.extend_from_slice(account_id.as_bytes());
            }
            RecordKey::AuthRequest { state } => {
                aad.extend_from_slice(b"auth_requests\0");
                aad.extend_from_slice(state.as_bytes());
            }
        }
        aad
    }
}

/// Session id and last write time, listed without decrypting the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub updated_at: i64,
}

#[derive(Serialize)]
struct SealedDocument<'a, T> {
    v: u16,
    data: &'a T,
}

#[derive(Deserialize)]
struct OpenedDocument<T> {
    v: u16,
    data: T,
}

fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(&SealedDocument {
        v: PAYLOAD_VERSION,
        data: payload,
    })?)
}

fn decode_payload<T: DeserializeOwned>(plaintext: &[u8]) -> Result<T, StoreError> {
    let document: OpenedDocument<T> = serde_json::from_slice(plaintext)?;
    if document.v != PAYLOAD_VERSION {
        return Err(StoreError::Serialization(format!(
            "unsupported payload version {}",
            document.v
        )));
    }
    Ok(document.data)
}

fn persistence(err: rusqlite::Error) -> StoreError {
    StoreError::Persistence(err.to_string())
}

/// Encrypted record storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE sessions (
///     session_id TEXT PRIMARY KEY,
///     account_id TEXT NOT NULL,
///     data       BLOB NOT NULL,     -- nonce || ciphertext
///     updated_at INTEGER NOT NULL   -- unix seconds
/// );
/// CREATE TABLE auth_requests (
///     state      TEXT PRIMARY KEY,
///     data       BLOB NOT NULL,
///     updated_at INTEGER NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// - Writes share one connection behind an async mutex; waiting for it is
///   bounded by the lock timeout, after which the write fails with `Persistence`
/// - File databases run in WAL mode and reads use their own pooled read-only
///   connections, so they never wait for the write mutex
/// - In-memory and temporary databases cannot be shared between connections;
///   their reads go through the write connection
/// - The same timeout is SQLite's busy timeout for other processes' locks
/// - Statements run on the blocking pool and can be interrupted on cancellation
/// - Every write is a single statement, so a row is either old or new
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
    readers: Option<Arc<ReaderPool>>,
    cipher: EnvelopeCipher,
    lock_timeout: Duration,
}

/// Read-only connections on the store's file, opened on demand.
struct ReaderPool {
    path: String,
    busy_timeout: Duration,
    idle: std::sync::Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn checkout_idle(&self) -> Option<Connection> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_READERS {
                idle.push(conn);
            }
        }
    }
}

impl RecordStore {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    ///
    /// An empty `path` gives SQLite's private temporary database.
    pub fn open(path: &str, key: &MasterKey, lock_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(persistence)?;
        conn.busy_timeout(lock_timeout).map_err(persistence)?;

        let mut readers = None;
        if !path.is_empty() && path != ":memory:" {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(persistence)?;
            if mode.eq_ignore_ascii_case("wal") {
                readers = Some(Arc::new(ReaderPool {
                    path: path.to_string(),
                    busy_timeout: lock_timeout,
                    idle: std::sync::Mutex::new(Vec::new()),
                }));
            } else {
                warn!(
                    path,
                    journal_mode = %mode,
                    "WAL not available, reads share the write connection"
                );
            }
        }

        Self::with_connection(conn, readers, key, lock_timeout)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory(key: &MasterKey, lock_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(persistence)?;
        conn.busy_timeout(lock_timeout).map_err(persistence)?;
        Self::with_connection(conn, None, key, lock_timeout)
    }

    fn with_connection(
        conn: Connection,
        readers: Option<Arc<ReaderPool>>,
        key: &MasterKey,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            readers,
            cipher: EnvelopeCipher::new(key),
            lock_timeout,
        })
    }

    /// Writes `payload` under `key`, replacing any existing row entirely.
    pub async fn upsert<T: Serialize>(
        &self,
        ctx: &CallContext,
        key: &RecordKey,
        payload: &T,
    ) -> Result<(), StoreError> {
        let plaintext = encode_payload(payload)?;
        let blob = self.cipher.seal(&plaintext, &key.associated_data())?;
        let now = Utc::now().timestamp();
        let key = key.clone();

        self.with_conn(ctx, move |conn| match &key {
            RecordKey::Session {
                account_id,
                session_id,
            } => conn.prepare_cached(
                r#"
                INSERT INTO sessions (session_id, account_id, data, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(session_id) DO UPDATE SET
                    account_id = excluded.account_id,
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
            )?
            .execute(params![session_id, account_id, blob, now])
            .map(|_| ()),
            RecordKey::AuthRequest { state } => conn.prepare_cached(
                r#"
                INSERT INTO auth_requests (state, data, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(state) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
            )?
            .execute(params![state, blob, now])
            .map(|_| ()),
        })
        .await
    }

    /// Reads and decrypts the record under `key`.
    ///
    /// # Returns
    /// * `Err(NotFound)` - No row for the key (or the session belongs to another account)
    /// * `Err(Authentication)` - Ciphertext does not verify
    /// * `Err(Serialization)` - Plaintext is not a `T`
    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        key: &RecordKey,
    ) -> Result<T, StoreError> {
        let lookup = key.clone();
        let blob = self
            .with_reader(ctx, move |conn| {
                conn.prepare_cached(lookup.kind().select_sql())?
                    .query_row(params_from_iter(lookup.lookup_params()), |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()
            })
            .await?;

        self.open_blob(key, blob)
    }

    /// Deletes the record under `key`. Missing rows are not an error.
    ///
    /// Returns whether a row was removed.
    pub async fn delete(&self, ctx: &CallContext, key: &RecordKey) -> Result<bool, StoreError> {
        let key = key.clone();
        let removed = self
            .with_conn(ctx, move |conn| {
                conn.prepare_cached(key.kind().delete_sql())?
                    .execute(params_from_iter(key.lookup_params()))
            })
            .await?;
        Ok(removed > 0)
    }

    /// Atomically removes the record under `key` and returns its payload.
    ///
    /// The row is gone once this returns, even if it then fails to decrypt.
    pub async fn take<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        key: &RecordKey,
    ) -> Result<T, StoreError> {
        let lookup = key.clone();
        let blob = self
            .with_conn(ctx, move |conn| {
                conn.prepare_cached(lookup.kind().take_sql())?
                    .query_row(params_from_iter(lookup.lookup_params()), |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()
            })
            .await?;

        self.open_blob(key, blob)
    }

    /// Deletes auth requests last written at or before `cutoff` (unix seconds).
    pub async fn purge_auth_requests(
        &self,
        ctx: &CallContext,
        cutoff: i64,
    ) -> Result<usize, StoreError> {
        self.with_conn(ctx, move |conn| {
            conn.prepare_cached("DELETE FROM auth_requests WHERE updated_at <= ?1")?
                .execute(params![cutoff])
        })
        .await
    }

    /// Lists the sessions of one account, most recently written first.
    pub async fn list_sessions(
        &self,
        ctx: &CallContext,
        account_id: &str,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let account_id = account_id.to_string();
        self.with_reader(ctx, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT session_id, updated_at FROM sessions WHERE account_id = ?1 \
                 ORDER BY updated_at DESC, session_id",
            )?;
            let sessions = stmt
                .query_map(params![account_id], |row| {
                    Ok(SessionSummary {
                        session_id: row.get(0)?,
                        updated_at: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
        .await
    }

    /// Deletes every session of one account. Returns the number removed.
    pub async fn delete_sessions(
        &self,
        ctx: &CallContext,
        account_id: &str,
    ) -> Result<usize, StoreError> {
        let account_id = account_id.to_string();
        self.with_conn(ctx, move |conn| {
            conn.prepare_cached("DELETE FROM sessions WHERE account_id = ?1")?
                .execute(params![account_id])
        })
        .await
    }

    fn open_blob<T: DeserializeOwned>(
        &self,
        key: &RecordKey,
        blob: Option<Vec<u8>>,
    ) -> Result<T, StoreError> {
        let blob = blob.ok_or(StoreError::NotFound(key.kind().label()))?;
        let plaintext = self.cipher.open(&blob, &key.associated_data())?;
        decode_payload(&plaintext)
    }

    /// Runs `op` against the write connection on the blocking pool.
    ///
    /// Waiting for the connection is bounded by the lock timeout. If the
    /// context fires while `op` runs, the statement is interrupted and the
    /// context's error is returned.
    async fn with_conn<R, F>(&self, ctx: &CallContext, op: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        ctx.check()?;

        let guard = tokio::select! {
            biased;
            acquired = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.conn).lock_owned()) => {
                acquired.map_err(|_| {
                    StoreError::Persistence(format!(
                        "store is busy: lock not acquired within {:?}",
                        self.lock_timeout
                    ))
                })?
            }
            err = ctx.done() => return Err(err),
        };

        let interrupt = guard.get_interrupt_handle();
        let task = tokio::task::spawn_blocking(move || op(&*guard));
        run_interruptible(ctx, task, interrupt).await
    }

    /// Runs a read-only `op` on a pooled read connection.
    ///
    /// Falls back to the write connection when the database has no reader pool.
    async fn with_reader<R, F>(&self, ctx: &CallContext, op: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = match &self.readers {
            Some(pool) => Arc::clone(pool),
            None => return self.with_conn(ctx, op).await,
        };
        ctx.check()?;

        let conn = match pool.checkout_idle() {
            Some(conn) => conn,
            None => {
                let connecting = Arc::clone(&pool);
                tokio::select! {
                    biased;
                    joined = tokio::task::spawn_blocking(move || connecting.connect()) => joined
                        .map_err(|e| StoreError::Persistence(format!("store task failed: {}", e)))?
                        .map_err(persistence)?,
                    err = ctx.done() => return Err(err),
                }
            }
        };

        let interrupt = conn.get_interrupt_handle();
        let task = tokio::task::spawn_blocking(move || {
            let result = op(&conn);
            pool.checkin(conn);
            result
        });
        run_interruptible(ctx, task, interrupt).await
    }

    #[cfg(test)]
    pub(crate) async fn raw_connection(&self) -> tokio::sync::OwnedMutexGuard<Connection> {
        Arc::clone(&self.conn).lock_owned().await
    }
}

/// Waits for a statement task, interrupting it if the context fires first.
async fn run_interruptible<R>(
    ctx: &CallContext,
    task: JoinHandle<rusqlite::Result<R>>,
    interrupt: InterruptHandle,
) -> Result<R, StoreError> {
    tokio::select! {
        biased;
        joined = task => joined
            .map_err(|e| StoreError::Persistence(format!("store task failed: {}", e)))?
            .map_err(persistence),
        err = ctx.done() => {
            interrupt.interrupt();
            Err(err)
        }
    }
}

/// Creates both tables and their indexes if absent. Safe on every startup.
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA).map_err(persistence)
}
