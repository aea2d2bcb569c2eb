//! Scripted issuer and store helpers for unit tests.

use crate::config::StorageConfig;
use crate::credentials::{CredentialStore, Expiry};
use crate::error::TokenError;
use crate::issuer::{ExchangedToken, Issuer, PageAccount, TokenIntrospection};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// One scripted answer to `exchange`.
#[derive(Clone, Debug)]
pub enum ExchangeStep {
    Token { secret: String, expires_in: Option<i64> },
    Transport,
    Rejected { code: i64 },
    Panic,
}

impl ExchangeStep {
    pub fn token(secret: &str, expires_in: Option<i64>) -> Self {
        ExchangeStep::Token {
            secret: secret.to_string(),
            expires_in,
        }
    }
}

/// In-memory issuer.
///
/// Unknown secrets introspect as invalid with code 190. An empty exchange
/// script answers with transport failures.
#[derive(Default)]
pub struct MockIssuer {
    introspections: Mutex<HashMap<String, Result<TokenIntrospection, String>>>,
    exchanges: Mutex<VecDeque<ExchangeStep>>,
    codes: Mutex<HashMap<String, ExchangedToken>>,
    pages: Mutex<HashMap<String, Vec<PageAccount>>>,
    exchanged_from: Mutex<Vec<String>>,
    introspect_calls: AtomicUsize,
    exchange_calls: AtomicUsize,
}

impl MockIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_valid(&self, secret: &str, principal_id: &str, scopes: &[&str], expires_at: Expiry) {
        self.set_introspection(
            secret,
            TokenIntrospection {
                is_valid: true,
                principal_id: Some(principal_id.to_string()),
                app_id: Some("app123".to_string()),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                expires_at,
                ..Default::default()
            },
        );
    }

    pub fn set_introspection(&self, secret: &str, info: TokenIntrospection) {
        self.introspections
            .lock()
            .unwrap()
            .insert(secret.to_string(), Ok(info));
    }

    /// Introspecting `secret` fails with a transport error.
    pub fn fail_introspection(&self, secret: &str, message: &str) {
        self.introspections
            .lock()
            .unwrap()
            .insert(secret.to_string(), Err(message.to_string()));
    }

    pub fn push_exchange(&self, step: ExchangeStep) {
        self.exchanges.lock().unwrap().push_back(step);
    }

    pub fn set_code(&self, code: &str, secret: &str, expires_in: Option<i64>) {
        self.codes.lock().unwrap().insert(
            code.to_string(),
            ExchangedToken {
                secret: secret.to_string(),
                expires_in,
            },
        );
    }

    pub fn set_pages(&self, user_secret: &str, pages: Vec<PageAccount>) {
        self.pages
            .lock()
            .unwrap()
            .insert(user_secret.to_string(), pages);
    }

    pub fn introspect_calls(&self) -> usize {
        self.introspect_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.introspect_calls() + self.exchange_calls()
    }

    /// Secrets passed to `exchange`, in call order.
    pub fn exchanged_from(&self) -> Vec<String> {
        self.exchanged_from.lock().unwrap().clone()
    }
}

#[async_trait]
impl Issuer for MockIssuer {
    async fn introspect(&self, secret: &str) -> Result<TokenIntrospection, TokenError> {
        self.introspect_calls.fetch_add(1, Ordering::SeqCst);
        match self.introspections.lock().unwrap().get(secret) {
            Some(Ok(info)) => Ok(info.clone()),
            Some(Err(message)) => Err(TokenError::TransportFailure(message.clone())),
            None => Ok(TokenIntrospection {
                is_valid: false,
                error_code: Some(190),
                error_message: Some("Invalid OAuth access token.".to_string()),
                ..Default::default()
            }),
        }
    }

    async fn exchange(&self, secret: &str) -> Result<ExchangedToken, TokenError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.exchanged_from.lock().unwrap().push(secret.to_string());
        let step = self.exchanges.lock().unwrap().pop_front();

        match step {
            Some(ExchangeStep::Token { secret, expires_in }) => {
                Ok(ExchangedToken { secret, expires_in })
            }
            Some(ExchangeStep::Rejected { code }) => Err(TokenError::IssuerRejected {
                code: Some(code),
                subcode: None,
                message: "Error validating access token".to_string(),
            }),
            Some(ExchangeStep::Panic) => panic!("scripted issuer panic"),
            Some(ExchangeStep::Transport) | None => Err(TokenError::TransportFailure(
                "connection refused".to_string(),
            )),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedToken, TokenError> {
        self.codes
            .lock()
            .unwrap()
            .get(code)
            .cloned()
            .ok_or_else(|| TokenError::rejected("Invalid verification code format."))
    }

    async fn page_accounts(&self, user_secret: &str) -> Result<Vec<PageAccount>, TokenError> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(user_secret)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        path: dir.path().join("credentials.json"),
        encryption_key: Some(BASE64.encode([5u8; 32])),
        ..Default::default()
    }
}

/// A fresh encrypted store in `dir`.
pub fn temp_store(dir: &TempDir) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::open(&storage_config(dir)).unwrap())
}
