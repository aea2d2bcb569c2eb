//! Credential model and encrypted persistence.
//!
//! One authoritative [`Credential`] is kept per [`Principal`]. Secrets are
//! sealed by a [`TokenEncryptor`] before they reach disk and the store file
//! is rewritten atomically, with a backup of the last good state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - load / save / list                    │
//! │  - self-heal on corrupted content        │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenEncryptor                     │
//! │  - AES-256-GCM, base64 fallback          │
//! │  - scheme tag on every blob              │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       JSON store file (+ .bak)           │
//! │  - versioned record schema               │
//! │  - temp file + fsync + rename            │
//! └─────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

mod encryption;
mod storage;

pub use encryption::{validate_key, EncryptedBlob, Scheme, TokenEncryptor};
pub use storage::{CredentialStore, ReencryptReport};

/// Kind of identity a credential acts on behalf of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    User,
    Page,
    Business,
    App,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Page => "page",
            PrincipalType::Business => "business",
            PrincipalType::App => "app",
        }
    }
}

impl fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PrincipalType::User),
            "page" => Ok(PrincipalType::Page),
            "business" => Ok(PrincipalType::Business),
            "app" => Ok(PrincipalType::App),
            other => Err(format!("unknown principal type '{}'", other)),
        }
    }
}

/// A (type, id) pair identifying exactly one stored credential.
///
/// Rendered and parsed as `"<type>:<id>"`, e.g. `page:1234`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    pub principal_type: PrincipalType,
    pub principal_id: String,
}

impl Principal {
    pub fn new(principal_type: PrincipalType, principal_id: impl Into<String>) -> Self {
        Self {
            principal_type,
            principal_id: principal_id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(PrincipalType::User, id)
    }

    pub fn page(id: impl Into<String>) -> Self {
        Self::new(PrincipalType::Page, id)
    }

    pub fn business(id: impl Into<String>) -> Self {
        Self::new(PrincipalType::Business, id)
    }

    pub fn app(id: impl Into<String>) -> Self {
        Self::new(PrincipalType::App, id)
    }

    /// Store key, `"<type>:<id>"`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.principal_type, self.principal_id)
    }
}

impl FromStr for Principal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("principal '{}' is not of the form <type>:<id>", s))?;
        if id.is_empty() {
            return Err(format!("principal '{}' has an empty id", s));
        }
        Ok(Principal::new(kind.parse()?, id))
    }
}

/// Token expiry. `Unknown` is distinct from `Never`: the issuer simply
/// has not told us yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Expiry {
    Never,
    #[default]
    Unknown,
    At(DateTime<Utc>),
}

impl Expiry {
    /// Maps an issuer unix timestamp: `0` means the token never expires,
    /// absent means the issuer did not say.
    pub fn from_unix(ts: Option<i64>) -> Self {
        match ts {
            None => Expiry::Unknown,
            Some(0) => Expiry::Never,
            Some(secs) => match Utc.timestamp_opt(secs, 0).single() {
                Some(at) => Expiry::At(at),
                None => Expiry::Unknown,
            },
        }
    }

    /// True if the expiry falls within `margin` of `now` (or has passed).
    pub fn within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::At(at) => *at <= now + margin,
            Expiry::Never | Expiry::Unknown => false,
        }
    }

    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Expiry::At(at) if *at <= now)
    }

    /// True if replacing `old` with `self` would move a known expiry
    /// backwards (or forget it).
    pub fn regresses_from(&self, old: &Expiry) -> bool {
        match (old, self) {
            (Expiry::Never | Expiry::Unknown, _) => false,
            (_, Expiry::Never) => false,
            (Expiry::At(old_at), Expiry::At(new_at)) => new_at < old_at,
            (Expiry::At(_), Expiry::Unknown) => true,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::At(at) => Some(*at),
            _ => None,
        }
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Never => f.write_str("never"),
            Expiry::Unknown => f.write_str("unknown"),
            Expiry::At(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}

/// Everything saved alongside a secret.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialMetadata {
    pub scopes: BTreeSet<String>,
    pub owner_id: Option<String>,
    pub expires_at: Expiry,
}

impl CredentialMetadata {
    pub fn with_expiry(expires_at: Expiry) -> Self {
        Self {
            expires_at,
            ..Default::default()
        }
    }
}

/// A decrypted credential.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub principal: Principal,
    pub secret: String,
    pub scopes: BTreeSet<String>,
    /// Identity the credential was obtained through (the user behind a page token)
    pub owner_id: Option<String>,
    pub expires_at: Expiry,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn metadata(&self) -> CredentialMetadata {
        CredentialMetadata {
            scopes: self.scopes.clone(),
            owner_id: self.owner_id.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("owner_id", &self.owner_id)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}
