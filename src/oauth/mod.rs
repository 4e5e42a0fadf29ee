//! Payloads the OAuth client keeps in the store, and the store contract it
//! depends on.
//!
//! The OAuth flow itself (redirects, code exchange, token refresh) lives
//! elsewhere; it hands fully formed payloads to a [`ClientAuthStore`] and reads
//! them back on callback or on every authenticated request.

use crate::error::StoreError;
use crate::vault::CallContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated session state for one signed-in account.
///
/// # Security
/// - Encrypted at rest by the store
/// - `Debug` output redacts tokens and key material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSessionData {
    /// Account the session acts for (a DID such as `did:plc:...`)
    pub account_did: String,

    /// Opaque session identifier, unique across accounts
    pub session_id: String,

    /// Resource server (PDS) the account lives on
    pub host_url: String,

    pub auth_server_url: String,
    pub auth_server_token_endpoint: String,
    pub scopes: Vec<String>,

    pub access_token: String,
    pub refresh_token: String,

    /// Latest DPoP nonces handed out by the auth server and the host
    pub dpop_auth_server_nonce: String,
    pub dpop_host_nonce: String,

    /// DPoP signing key, multibase-encoded
    pub dpop_private_key_multibase: String,
}

impl fmt::Debug for ClientSessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSessionData")
            .field("account_did", &self.account_did)
            .field("session_id", &self.session_id)
            .field("host_url", &self.host_url)
            .field("auth_server_url", &self.auth_server_url)
            .field("scopes", &self.scopes)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("dpop_private_key_multibase", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Ephemeral state of one authorization flow, kept between the redirect to
/// the provider and its callback.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequestData {
    /// OAuth `state` parameter; the record's key
    pub state: String,

    pub auth_server_url: String,

    /// Known up front when login started from a handle or DID
    #[serde(default)]
    pub account_did: Option<String>,

    pub scopes: Vec<String>,

    /// PAR `request_uri` returned by the auth server
    pub request_uri: String,

    pub auth_server_token_endpoint: String,
    pub pkce_verifier: String,
    pub dpop_auth_server_nonce: String,
    pub dpop_private_key_multibase: String,
}

impl fmt::Debug for AuthRequestData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequestData")
            .field("state", &self.state)
            .field("auth_server_url", &self.auth_server_url)
            .field("account_did", &self.account_did)
            .field("scopes", &self.scopes)
            .field("request_uri", &self.request_uri)
            .field("pkce_verifier", &"<redacted>")
            .field("dpop_private_key_multibase", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Store contract consumed by the OAuth client.
///
/// Implementations return only [`StoreError`]; engine-specific errors never
/// cross this boundary.
///
/// # Lifecycle
/// 1. Login starts: `save_auth_request`
/// 2. Provider redirects back: `take_auth_request` (or `get_auth_request` then
///    `delete_auth_request`)
/// 3. Code exchanged: `save_session`
/// 4. Every authenticated request: `get_session`
/// 5. Logout or revocation: `delete_session`
#[async_trait]
pub trait ClientAuthStore: Send + Sync {
    /// Creates or fully replaces the session keyed by `session.session_id`.
    async fn save_session(
        &self,
        ctx: &CallContext,
        session: &ClientSessionData,
    ) -> Result<(), StoreError>;

    /// Returns the session only if it belongs to `account_did`.
    async fn get_session(
        &self,
        ctx: &CallContext,
        account_did: &str,
        session_id: &str,
    ) -> Result<ClientSessionData, StoreError>;

    /// Removes the session if it belongs to `account_did`. Idempotent.
    async fn delete_session(
        &self,
        ctx: &CallContext,
        account_did: &str,
        session_id: &str,
    ) -> Result<(), StoreError>;

    /// Creates or fully replaces the auth request keyed by `request.state`.
    async fn save_auth_request(
        &self,
        ctx: &CallContext,
        request: &AuthRequestData,
    ) -> Result<(), StoreError>;

    async fn get_auth_request(
        &self,
        ctx: &CallContext,
        state: &str,
    ) -> Result<AuthRequestData, StoreError>;

    /// Idempotent.
    async fn delete_auth_request(&self, ctx: &CallContext, state: &str) -> Result<(), StoreError>;

    /// Reads and removes the auth request in one atomic step, so a flow's
    /// state can be consumed at most once.
    async fn take_auth_request(
        &self,
        ctx: &CallContext,
        state: &str,
    ) -> Result<AuthRequestData, StoreError>;
}
