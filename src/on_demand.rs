//! Reactive refresh around a single downstream call.

use crate::classify::ExpirySignal;
use crate::credentials::{CredentialStore, Principal};
use crate::refresh::{RefreshEngine, RefreshOutcome};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Why a hooked call failed.
#[derive(Debug, PartialEq, Eq)]
pub enum HookError<E> {
    /// The call failed for a reason a new secret would not fix
    Downstream(E),
    /// The call failed with an expiry-like error and no working secret
    /// could be obtained: the refresh failed, the credential vanished, or
    /// the refreshed secret was rejected too.
    Reauthorize(E),
}

impl<E> HookError<E> {
    pub fn into_inner(self) -> E {
        match self {
            HookError::Downstream(err) | HookError::Reauthorize(err) => err,
        }
    }
}

/// Retries a downstream call once, with a fresh secret, when it fails with
/// an expiry-like error.
#[derive(Clone)]
pub struct OnDemandRefreshHook {
    store: Arc<CredentialStore>,
    engine: Arc<RefreshEngine>,
}

/// Result of looking for a secret to retry with.
enum Fresh {
    Secret(String),
    /// Stored expiry is outside the on-demand margin
    NotStale,
    Unavailable,
}

impl OnDemandRefreshHook {
    pub fn new(store: Arc<CredentialStore>, engine: Arc<RefreshEngine>) -> Self {
        Self { store, engine }
    }

    /// Runs `call` with `secret`. If it fails with an expiry-like error and a
    /// fresh secret can be obtained, runs it exactly once more with the
    /// fresh secret.
    ///
    /// The downstream error is never altered, only classified: an
    /// expiry-like failure that a new secret could not fix comes back as
    /// [`HookError::Reauthorize`].
    pub async fn call<T, E, F, Fut>(
        &self,
        principal: &Principal,
        secret: String,
        mut call: F,
    ) -> Result<T, HookError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ExpirySignal + Display,
    {
        let err = match call(secret.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_expiry_like() {
            return Err(HookError::Downstream(err));
        }

        warn!(principal = %principal, error = %err, "Downstream call hit an expired token");
        match self.fresh_secret(principal, &secret).await {
            Fresh::Secret(fresh) => {
                info!(principal = %principal, "Retrying downstream call with refreshed token");
                match call(fresh).await {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_expiry_like() => {
                        warn!(principal = %principal, error = %err, "Refreshed token rejected as well");
                        Err(HookError::Reauthorize(err))
                    }
                    Err(err) => Err(HookError::Downstream(err)),
                }
            }
            Fresh::NotStale => Err(HookError::Downstream(err)),
            Fresh::Unavailable => Err(HookError::Reauthorize(err)),
        }
    }

    /// A secret other than `stale`: the stored one if another path already
    /// replaced it, otherwise the result of an on-demand refresh.
    async fn fresh_secret(&self, principal: &Principal, stale: &str) -> Fresh {
        let Some(credential) = self.store.load(principal) else {
            warn!(principal = %principal, "Credential disappeared before refresh");
            return Fresh::Unavailable;
        };
        if credential.secret != stale {
            return Fresh::Secret(credential.secret);
        }

        match self.engine.refresh_on_demand(&credential).await {
            RefreshOutcome::Refreshed(refreshed) => Fresh::Secret(refreshed.secret),
            RefreshOutcome::NotNeeded => {
                warn!(principal = %principal, "Stored expiry is outside the on-demand margin, not retrying");
                Fresh::NotStale
            }
            RefreshOutcome::Failed { reason, .. } => {
                warn!(principal = %principal, reason = %reason, "On-demand refresh failed");
                Fresh::Unavailable
            }
        }
    }
}
