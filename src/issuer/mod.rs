//! The token issuer contract.
//!
//! A single issuer is supported: it can introspect a token, exchange a
//! token for a long-lived one, redeem an authorization code, and list the
//! page tokens reachable through a user token.

use crate::credentials::Expiry;
use crate::error::TokenError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

mod graph;

pub use graph::GraphIssuer;

/// What the issuer reports about a token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenIntrospection {
    pub is_valid: bool,
    /// Identity owning the token (page id for page tokens, user id otherwise)
    pub principal_id: Option<String>,
    pub app_id: Option<String>,
    pub scopes: BTreeSet<String>,
    pub expires_at: Expiry,
    pub error_code: Option<i64>,
    pub error_subcode: Option<i64>,
    pub error_message: Option<String>,
}

/// A secret returned by an exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ExchangedToken {
    pub secret: String,
    /// Lifetime in seconds, if the issuer reported one
    pub expires_in: Option<i64>,
}

impl ExchangedToken {
    /// Expiry implied by `expires_in`, counted from `now`.
    pub fn expiry(&self, now: DateTime<Utc>) -> Expiry {
        match self.expires_in {
            Some(0) => Expiry::Never,
            Some(secs) => Expiry::At(now + Duration::seconds(secs)),
            None => Expiry::Unknown,
        }
    }
}

impl std::fmt::Debug for ExchangedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangedToken")
            .field("secret", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// A page reachable through a user token.
#[derive(Clone, PartialEq, Eq)]
pub struct PageAccount {
    pub id: String,
    pub name: Option<String>,
    pub access_token: String,
    pub category: Option<String>,
}

impl std::fmt::Debug for PageAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAccount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("access_token", &"<redacted>")
            .field("category", &self.category)
            .finish()
    }
}

/// Token issuer operations.
///
/// Errors are typed: `TransportFailure` for unreachable or transient
/// failures, `IssuerRejected` for explicit refusals, `ConfigurationMissing`
/// when the application credentials are absent.
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Asks the issuer what a token grants.
    async fn introspect(&self, secret: &str) -> Result<TokenIntrospection, TokenError>;

    /// Exchanges a token for a fresh long-lived one.
    async fn exchange(&self, secret: &str) -> Result<ExchangedToken, TokenError>;

    /// Redeems an authorization code.
    async fn exchange_code(&self, code: &str) -> Result<ExchangedToken, TokenError>;

    /// Lists the pages (and their tokens) reachable through a user token.
    async fn page_accounts(&self, user_secret: &str) -> Result<Vec<PageAccount>, TokenError>;
}
