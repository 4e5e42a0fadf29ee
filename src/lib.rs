// Error taxonomy shared by every store operation
pub mod error;

// TOML + environment configuration
pub mod config;

// Session and auth-request payloads, and the store contract
pub mod oauth;

// Key derivation, envelope encryption and SQLite record storage
pub mod vault;

// Background purge of abandoned auth requests
pub mod cleanup;

pub use error::StoreError;
pub use oauth::{AuthRequestData, ClientAuthStore, ClientSessionData};
pub use vault::{AuthStore, CallContext, MasterKey};
