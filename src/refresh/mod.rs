//! Token refresh engine.
//!
//! Exchanges a stale secret for a fresh one, validates the result and
//! persists it. A replacement that fails validation, or whose expiry is
//! earlier than the one it replaces, is discarded and the old secret stays.

use crate::config::RefreshConfig;
use crate::credentials::{Credential, CredentialMetadata, CredentialStore, Expiry};
use crate::error::TokenError;
use crate::issuer::Issuer;
use crate::validation::ValidationClient;
use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};

/// Result of one refresh decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(Credential),
    NotNeeded,
    Failed { reason: String, attempt_count: u32 },
}

impl RefreshOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed(_))
    }
}

/// Retry and margin settings.
#[derive(Clone, Debug)]
pub struct RefreshPolicy {
    /// Exchange attempts per scheduled decision
    pub max_attempts: u32,
    /// Base delay, multiplied by the attempt number, plus jitter
    pub retry_backoff: StdDuration,
    /// Margin used by `refresh_on_demand`
    pub on_demand_margin: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&RefreshConfig::default())
    }
}

impl RefreshPolicy {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: StdDuration::from_millis(config.retry_backoff_ms),
            on_demand_margin: Duration::hours(config.on_demand_margin_hours),
        }
    }
}

/// Why a single exchange attempt did not produce a usable secret.
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

impl From<TokenError> for AttemptError {
    fn from(err: TokenError) -> Self {
        if err.is_retryable() {
            AttemptError::Retryable(err.to_string())
        } else {
            AttemptError::Fatal(err.to_string())
        }
    }
}

/// Exchanges stale secrets for fresh ones.
pub struct RefreshEngine {
    issuer: Arc<dyn Issuer>,
    validator: ValidationClient,
    store: Arc<CredentialStore>,
    policy: RefreshPolicy,
}

impl RefreshEngine {
    pub fn new(issuer: Arc<dyn Issuer>, store: Arc<CredentialStore>, policy: RefreshPolicy) -> Self {
        Self {
            validator: ValidationClient::new(issuer.clone()),
            issuer,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Refreshes `credential` if it expires within `margin`, retrying the
    /// exchange up to `max_attempts` times.
    ///
    /// Makes no issuer call when the expiry is `Never` or further away than
    /// `margin`.
    pub async fn refresh_if_needed(&self, credential: &Credential, margin: Duration) -> RefreshOutcome {
        self.refresh_with_attempts(credential, margin, self.policy.max_attempts)
            .await
    }

    /// Reactive refresh: short margin, one exchange attempt.
    pub async fn refresh_on_demand(&self, credential: &Credential) -> RefreshOutcome {
        self.refresh_with_attempts(credential, self.policy.on_demand_margin, 1)
            .await
    }

    async fn refresh_with_attempts(
        &self,
        credential: &Credential,
        margin: Duration,
        max_attempts: u32,
    ) -> RefreshOutcome {
        let principal = &credential.principal;
        let now = Utc::now();
        let mut current = credential.clone();

        match credential.expires_at {
            Expiry::Never => {
                debug!(principal = %principal, "Token never expires, no refresh needed");
                return RefreshOutcome::NotNeeded;
            }
            Expiry::At(_) if !credential.expires_at.within(margin, now) => {
                debug!(
                    principal = %principal,
                    expires_at = %credential.expires_at,
                    "Token outside refresh margin"
                );
                return RefreshOutcome::NotNeeded;
            }
            Expiry::At(_) => {}
            Expiry::Unknown => {
                let validation = self.validator.validate(&credential.secret).await;
                if !validation.is_valid {
                    warn!(
                        principal = %principal,
                        reason = %validation.reason(),
                        "Token with unknown expiry is no longer valid"
                    );
                    return RefreshOutcome::Failed {
                        reason: validation.reason(),
                        attempt_count: 0,
                    };
                }

                if validation.expires_at != Expiry::Unknown {
                    current.expires_at = validation.expires_at;
                    if !validation.scopes.is_empty() {
                        current.scopes = validation.scopes.clone();
                    }
                    match self
                        .store
                        .save_async(principal, &current.secret, current.metadata())
                        .await
                    {
                        Ok(saved) => current = saved,
                        Err(e) => warn!(principal = %principal, error = %e, "Failed to record learned expiry"),
                    }
                }

                if !current.expires_at.within(margin, now) {
                    debug!(
                        principal = %principal,
                        expires_at = %current.expires_at,
                        "Learned expiry outside refresh margin"
                    );
                    return RefreshOutcome::NotNeeded;
                }
            }
        }

        let max_attempts = max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.exchange_once(&current).await {
                Ok(refreshed) => {
                    info!(
                        principal = %principal,
                        attempt = attempt,
                        expires_at = %refreshed.expires_at,
                        "Token refreshed"
                    );
                    return RefreshOutcome::Refreshed(refreshed);
                }
                Err(AttemptError::Fatal(reason)) => {
                    warn!(
                        principal = %principal,
                        attempt = attempt,
                        error = %reason,
                        "Token refresh rejected"
                    );
                    return RefreshOutcome::Failed {
                        reason,
                        attempt_count: attempt,
                    };
                }
                Err(AttemptError::Retryable(reason)) => {
                    warn!(
                        principal = %principal,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %reason,
                        "Token refresh failed, will retry"
                    );
                    last_error = reason;

                    if attempt < max_attempts {
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        let exhausted = TokenError::ExhaustedRetries {
            attempts: max_attempts,
            last_error,
        };
        error!(principal = %principal, error = %exhausted, "Token refresh gave up");
        RefreshOutcome::Failed {
            reason: exhausted.to_string(),
            attempt_count: max_attempts,
        }
    }

    /// One exchange, validation and save.
    async fn exchange_once(&self, current: &Credential) -> Result<Credential, AttemptError> {
        let exchanged = self.issuer.exchange(&current.secret).await?;

        let validation = self.validator.validate(&exchanged.secret).await;
        if !validation.is_valid {
            return Err(AttemptError::Retryable(format!(
                "new token failed validation: {}",
                validation.reason()
            )));
        }

        let expires_at = match validation.expires_at {
            Expiry::Unknown => exchanged.expiry(Utc::now()),
            known => known,
        };
        if expires_at.regresses_from(&current.expires_at) {
            return Err(AttemptError::Retryable(format!(
                "new token expires {} before current {}",
                expires_at, current.expires_at
            )));
        }

        let scopes = if validation.scopes.is_empty() {
            current.scopes.clone()
        } else {
            validation.scopes
        };
        let metadata = CredentialMetadata {
            scopes,
            owner_id: current.owner_id.clone(),
            expires_at,
        };

        self.store
            .save_async(&current.principal, &exchanged.secret, metadata)
            .await
            .map_err(|e| AttemptError::Fatal(format!("{:#}", e)))
    }

    /// Linear backoff plus up to 25% jitter.
    async fn backoff(&self, attempt: u32) {
        let base = self.policy.retry_backoff * attempt;
        if base.is_zero() {
            return;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 4));
        let delay = base + StdDuration::from_millis(jitter_ms);
        debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::time::sleep(delay).await;
    }
}
