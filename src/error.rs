//! Error taxonomy for the token lifecycle.
//!
//! Hot paths (validation, permission checks, sweeps, on-demand retries) fold
//! these into typed results; they only surface as `Err` at component seams.

use thiserror::Error;

/// Unified error type for issuer calls and credential handling.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No application credentials configured. Fatal until corrected.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// The issuer could not be reached or answered with a transient error.
    #[error("issuer unreachable: {0}")]
    TransportFailure(String),

    /// The issuer explicitly rejected the token (invalid, expired, revoked).
    #[error("issuer rejected token: {message}")]
    IssuerRejected {
        code: Option<i64>,
        subcode: Option<i64>,
        message: String,
    },

    /// A stored secret could not be decrypted.
    #[error("stored secret unreadable: {0}")]
    DecryptionFailure(String),

    /// A refresh decision used all of its exchange attempts.
    #[error("refresh failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    /// No credential is stored for the principal.
    #[error("no credential stored for {0}")]
    CredentialNotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TokenError {
    /// Builds an `IssuerRejected` without issuer codes.
    pub fn rejected(message: impl Into<String>) -> Self {
        TokenError::IssuerRejected {
            code: None,
            subcode: None,
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TokenError::TransportFailure(_))
    }
}
