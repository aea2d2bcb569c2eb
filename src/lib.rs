// Shared error type and expiry classification
pub mod classify;
pub mod error;

// Configuration (TOML file plus environment overrides)
pub mod config;

// Encrypted credential persistence
pub mod credentials;

// Token issuer client
pub mod issuer;
pub mod validation;

// Refresh lifecycle
pub mod on_demand;
pub mod refresh;
pub mod scheduler;

// Consent and scope checks
pub mod oauth;
pub mod permissions;

// Facade used by consumers
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{load_config, AdTokenConfig};
pub use credentials::{Credential, CredentialMetadata, CredentialStore, Expiry, Principal, PrincipalType};
pub use error::TokenError;
pub use permissions::PermissionCheckResult;
pub use refresh::RefreshOutcome;
pub use service::{CallError, TokenService};
