//! Token validation against the issuer.
//!
//! `validate` never fails: transport and issuer errors become an invalid
//! result carrying the issuer's diagnostics.

use crate::classify;
use crate::credentials::Expiry;
use crate::error::TokenError;
use crate::issuer::{Issuer, TokenIntrospection};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// What a secret is worth right now.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Identity owning the token, used to key storage
    pub principal_id: Option<String>,
    pub scopes: BTreeSet<String>,
    pub expires_at: Expiry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_subcode: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_message: Option<String>,
}

impl ValidationResult {
    /// An invalid result with only a diagnostic message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            issuer_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Whether the issuer's reported cause looks like an expired or
    /// revoked token.
    pub fn is_expiry_like(&self) -> bool {
        !self.is_valid
            && classify::is_expiry_like(
                self.issuer_code,
                self.issuer_subcode,
                self.issuer_message.as_deref().unwrap_or_default(),
            )
    }

    /// Human-readable reason for an invalid result.
    pub fn reason(&self) -> String {
        self.issuer_message
            .clone()
            .unwrap_or_else(|| "token is not valid".to_string())
    }
}

impl From<TokenIntrospection> for ValidationResult {
    fn from(info: TokenIntrospection) -> Self {
        Self {
            is_valid: info.is_valid,
            principal_id: info.principal_id,
            scopes: info.scopes,
            expires_at: info.expires_at,
            issuer_code: info.error_code,
            issuer_subcode: info.error_subcode,
            issuer_message: info.error_message,
        }
    }
}

impl From<TokenError> for ValidationResult {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::IssuerRejected {
                code,
                subcode,
                message,
            } => Self {
                issuer_code: code,
                issuer_subcode: subcode,
                issuer_message: Some(message),
                ..Default::default()
            },
            other => Self::invalid(other.to_string()),
        }
    }
}

/// Asks the issuer whether a secret is live and what it grants.
#[derive(Clone)]
pub struct ValidationClient {
    issuer: Arc<dyn Issuer>,
}

impl ValidationClient {
    pub fn new(issuer: Arc<dyn Issuer>) -> Self {
        Self { issuer }
    }

    pub async fn validate(&self, secret: &str) -> ValidationResult {
        if secret.trim().is_empty() {
            return ValidationResult::invalid("empty token");
        }

        match self.issuer.introspect(secret).await {
            Ok(info) => {
                let result = ValidationResult::from(info);
                debug!(
                    valid = result.is_valid,
                    principal_id = ?result.principal_id,
                    expires_at = %result.expires_at,
                    "Token validated"
                );
                result
            }
            Err(e) => {
                debug!(error = %e, "Token validation failed");
                ValidationResult::from(e)
            }
        }
    }
}
