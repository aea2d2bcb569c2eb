//! Expiry-like error classification.
//!
//! One fixed table, shared by the permission checker and the on-demand
//! refresh hook.

use crate::error::TokenError;

/// Issuer error codes that mean the token itself is expired or invalid.
pub const EXPIRY_ERROR_CODES: &[i64] = &[102, 190, 2500];

/// Issuer error subcodes for expired, logged-out or revoked sessions.
pub const EXPIRY_ERROR_SUBCODES: &[i64] = &[458, 460, 463, 467];

/// Lowercase message fragments that indicate an expiry-like failure.
pub const EXPIRY_KEYWORDS: &[&str] = &[
    "expired",
    "invalid token",
    "access token",
    "oauth",
    "permission",
];

/// Returns true if an issuer code, subcode or message looks like an expired
/// or invalidated token.
pub fn is_expiry_like(code: Option<i64>, subcode: Option<i64>, message: &str) -> bool {
    if code.is_some_and(|c| EXPIRY_ERROR_CODES.contains(&c)) {
        return true;
    }
    if subcode.is_some_and(|s| EXPIRY_ERROR_SUBCODES.contains(&s)) {
        return true;
    }
    let message = message.to_lowercase();
    EXPIRY_KEYWORDS.iter().any(|keyword| message.contains(keyword))
}

/// Errors that can tell whether they were caused by a stale token.
///
/// Implement this for the error type of any downstream call wrapped by
/// [`OnDemandRefreshHook`](crate::on_demand::OnDemandRefreshHook).
pub trait ExpirySignal {
    fn is_expiry_like(&self) -> bool;
}

impl ExpirySignal for TokenError {
    fn is_expiry_like(&self) -> bool {
        match self {
            TokenError::IssuerRejected {
                code,
                subcode,
                message,
            } => is_expiry_like(*code, *subcode, message),
            _ => false,
        }
    }
}

/// Error returned by a downstream ads API call, carrying the issuer's codes.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("downstream call failed: {message}")]
pub struct DownstreamError {
    pub code: Option<i64>,
    pub subcode: Option<i64>,
    pub message: String,
}

impl DownstreamError {
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            subcode: None,
            message: message.into(),
        }
    }
}

impl ExpirySignal for DownstreamError {
    fn is_expiry_like(&self) -> bool {
        is_expiry_like(self.code, self.subcode, &self.message)
    }
}
