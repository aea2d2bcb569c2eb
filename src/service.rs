//! Consumer-facing facade over the token lifecycle components.

use crate::classify::ExpirySignal;
use crate::config::AdTokenConfig;
use crate::credentials::{
    Credential, CredentialMetadata, CredentialStore, Expiry, Principal, ReencryptReport,
};
use crate::error::TokenError;
use crate::issuer::{GraphIssuer, Issuer};
use crate::oauth::{
    AuthorizationUrlBuilder, GraphAuthorizer, Reauthorization, Reauthorizer, StateEntry,
    StateManager,
};
use crate::on_demand::{HookError, OnDemandRefreshHook};
use crate::permissions::{PermissionCheckResult, PermissionChecker};
use crate::refresh::{RefreshEngine, RefreshOutcome, RefreshPolicy};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::validation::ValidationClient;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Failure of a call wrapped by [`TokenService::on_demand_retry`].
#[derive(Debug)]
pub enum CallError<E> {
    /// No usable credential could be obtained; the user must go through
    /// consent
    Unauthorized {
        principal: Principal,
        reauthorization: Reauthorization,
    },
    /// The downstream call failed, after at most one refresh and retry
    Downstream(E),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Unauthorized { principal, .. } => {
                write!(f, "no usable credential for {}", principal)
            }
            CallError::Downstream(err) => err.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Downstream(err) => Some(err),
            CallError::Unauthorized { .. } => None,
        }
    }
}

/// Everything the rest of the application needs to hold live tokens.
pub struct TokenService {
    config: AdTokenConfig,
    issuer: Arc<dyn Issuer>,
    store: Arc<CredentialStore>,
    validator: ValidationClient,
    engine: Arc<RefreshEngine>,
    checker: PermissionChecker,
    reauthorizer: Reauthorizer,
    hook: OnDemandRefreshHook,
    scheduler: Arc<Scheduler>,
}

impl TokenService {
    /// Wires the Graph issuer and consent dialog from configuration.
    pub fn from_config(config: AdTokenConfig) -> Result<Self, TokenError> {
        let issuer = Arc::new(GraphIssuer::new(&config.issuer)?);
        let authorizer = Arc::new(GraphAuthorizer::new(&config.issuer));
        Self::with_parts(config, issuer, authorizer)
    }

    /// Wires the service around an explicit issuer and URL builder.
    pub fn with_parts(
        config: AdTokenConfig,
        issuer: Arc<dyn Issuer>,
        authorizer: Arc<dyn AuthorizationUrlBuilder>,
    ) -> Result<Self, TokenError> {
        let store = Arc::new(CredentialStore::open(&config.storage)?);
        let validator = ValidationClient::new(issuer.clone());
        let engine = Arc::new(RefreshEngine::new(
            issuer.clone(),
            store.clone(),
            RefreshPolicy::from_config(&config.refresh),
        ));
        let reauthorizer = Reauthorizer::new(
            authorizer,
            StateManager::new(config.refresh.state_expiry_secs),
            config.issuer.default_scopes.clone(),
        );
        let checker = PermissionChecker::new(validator.clone(), reauthorizer.clone());
        let hook = OnDemandRefreshHook::new(store.clone(), engine.clone());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            engine.clone(),
            SchedulerSettings::from_config(&config.refresh),
        ));

        info!(
            store = %store.path().display(),
            credentials = store.len(),
            encrypted = store.encryptor().has_key(),
            "Token service ready"
        );

        Ok(Self {
            config,
            issuer,
            store,
            validator,
            engine,
            checker,
            reauthorizer,
            hook,
            scheduler,
        })
    }

    /// Stored secret for a principal, as is.
    pub fn get_credential(&self, principal: &Principal) -> Option<String> {
        self.store.load(principal).map(|credential| credential.secret)
    }

    pub fn credential(&self, principal: &Principal) -> Option<Credential> {
        self.store.load(principal)
    }

    /// Stored secret, refreshed first if it expires within the on-demand
    /// margin.
    ///
    /// When the refresh fails the old secret is still returned as long as it
    /// has not expired.
    pub async fn ensure_fresh(&self, principal: &Principal) -> Option<String> {
        let credential = self.store.load(principal)?;

        match self.engine.refresh_on_demand(&credential).await {
            RefreshOutcome::Refreshed(refreshed) => Some(refreshed.secret),
            RefreshOutcome::NotNeeded => Some(credential.secret),
            RefreshOutcome::Failed {
                reason,
                attempt_count,
            } => {
                // Zero attempts: the issuer already declared the secret invalid
                let unusable = credential.expires_at.is_past(Utc::now())
                    || (credential.expires_at == Expiry::Unknown && attempt_count == 0);
                if unusable {
                    warn!(principal = %principal, reason = %reason, "No usable credential");
                    None
                } else {
                    warn!(principal = %principal, reason = %reason, "Refresh failed, serving current token");
                    Some(credential.secret)
                }
            }
        }
    }

    pub async fn check_permissions(
        &self,
        secret: &str,
        required: &BTreeSet<String>,
    ) -> PermissionCheckResult {
        self.checker.check(secret, required).await
    }

    /// Runs `call` with the principal's stored secret, refreshing and
    /// retrying once on an expiry-like failure.
    pub async fn on_demand_retry<T, E, F, Fut>(
        &self,
        principal: &Principal,
        call: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ExpirySignal + fmt::Display,
    {
        let secret = match self.get_credential(principal) {
            Some(secret) => secret,
            None => {
                return Err(CallError::Unauthorized {
                    principal: principal.clone(),
                    reauthorization: self.reauthorization_for(principal),
                })
            }
        };

        match self.hook.call(principal, secret, call).await {
            Ok(value) => Ok(value),
            Err(HookError::Downstream(err)) => Err(CallError::Downstream(err)),
            Err(HookError::Reauthorize(err)) => {
                warn!(principal = %principal, error = %err, "Credential cannot be renewed, reauthorization required");
                Err(CallError::Unauthorized {
                    principal: principal.clone(),
                    reauthorization: self.reauthorization_for(principal),
                })
            }
        }
    }

    /// Consent for whatever the principal held before, plus the defaults.
    fn reauthorization_for(&self, principal: &Principal) -> Reauthorization {
        let held = self
            .store
            .load(principal)
            .map(|credential| credential.scopes)
            .unwrap_or_default();
        self.reauthorizer.request_with_defaults(held)
    }

    /// Consent URL for `scopes` (the defaults when empty).
    pub fn reauthorization(&self, scopes: Vec<String>) -> Reauthorization {
        self.reauthorizer.request(scopes)
    }

    /// Validates and consumes an OAuth state token.
    pub fn consume_state(&self, state: &str) -> Option<StateEntry> {
        self.reauthorizer.states().redeem(state)
    }

    /// Manual save, replacing any stored credential.
    pub fn save_credential(
        &self,
        principal: &Principal,
        secret: &str,
        metadata: CredentialMetadata,
    ) -> Result<Credential, TokenError> {
        Ok(self.store.save(principal, secret, metadata)?)
    }

    /// Redeems an authorization code, upgrades the result to a long-lived
    /// token when possible, and stores it for the user it belongs to.
    pub async fn complete_authorization(&self, code: &str) -> Result<Credential, TokenError> {
        let short_lived = self.issuer.exchange_code(code).await?;

        let token = match self.issuer.exchange(&short_lived.secret).await {
            Ok(long_lived) => long_lived,
            Err(e) => {
                warn!(error = %e, "Could not upgrade to a long-lived token, keeping short-lived");
                short_lived
            }
        };

        let validation = self.validator.validate(&token.secret).await;
        if !validation.is_valid {
            return Err(TokenError::IssuerRejected {
                code: validation.issuer_code,
                subcode: validation.issuer_subcode,
                message: validation.reason(),
            });
        }
        let user_id = validation
            .principal_id
            .clone()
            .ok_or_else(|| TokenError::rejected("issuer did not report the token owner"))?;

        let expires_at = match validation.expires_at {
            Expiry::Unknown => token.expiry(Utc::now()),
            known => known,
        };
        let principal = Principal::user(user_id);
        let credential = self
            .store
            .save_async(
                &principal,
                &token.secret,
                CredentialMetadata {
                    scopes: validation.scopes,
                    owner_id: None,
                    expires_at,
                },
            )
            .await?;

        info!(principal = %principal, expires_at = %credential.expires_at, "Authorization completed");
        Ok(credential)
    }

    /// Stores one page credential per page reachable through the user's
    /// token, owned by that user.
    pub async fn sync_page_credentials(&self, user: &Principal) -> Result<Vec<Principal>, TokenError> {
        let credential = self
            .store
            .load(user)
            .ok_or_else(|| TokenError::CredentialNotFound(user.to_string()))?;

        let pages = self.issuer.page_accounts(&credential.secret).await?;
        let mut synced = Vec::with_capacity(pages.len());

        for page in pages {
            let principal = Principal::page(&page.id);
            let validation = self.validator.validate(&page.access_token).await;
            if !validation.is_valid {
                warn!(principal = %principal, reason = %validation.reason(), "Skipping invalid page token");
                continue;
            }

            self.store
                .save_async(
                    &principal,
                    &page.access_token,
                    CredentialMetadata {
                        scopes: validation.scopes,
                        owner_id: Some(user.principal_id.clone()),
                        expires_at: validation.expires_at,
                    },
                )
                .await?;
            synced.push(principal);
        }

        info!(user = %user, pages = synced.len(), "Page credentials synced");
        Ok(synced)
    }

    pub fn reencrypt_all(&self, force: bool) -> Result<ReencryptReport, TokenError> {
        Ok(self.store.reencrypt_all(force)?)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<RefreshEngine> {
        &self.engine
    }

    pub fn reauthorizer(&self) -> &Reauthorizer {
        &self.reauthorizer
    }

    pub fn config(&self) -> &AdTokenConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DownstreamError;
    use crate::issuer::PageAccount;
    use crate::test_support::{storage_config, ExchangeStep, MockIssuer};
    use chrono::Duration;
    use tempfile::TempDir;

    struct PlainUrls;

    impl AuthorizationUrlBuilder for PlainUrls {
        fn build_authorization_url(&self, scopes: &[String], state: &str) -> String {
            format!("https://consent.test/?scope={}&state={}", scopes.join(","), state)
        }
    }

    fn service(dir: &TempDir) -> (Arc<MockIssuer>, TokenService) {
        let mut config = AdTokenConfig::default();
        config.storage = storage_config(dir);
        config.refresh.retry_backoff_ms = 0;
        let issuer = Arc::new(MockIssuer::new());
        let service = TokenService::with_parts(config, issuer.clone(), Arc::new(PlainUrls)).unwrap();
        (issuer, service)
    }

    #[tokio::test]
    async fn test_get_credential() {
        let dir = TempDir::new().unwrap();
        let (_, service) = service(&dir);
        let principal = Principal::business("9");

        assert!(service.get_credential(&principal).is_none());
        service
            .save_credential(&principal, "EAAbiz", CredentialMetadata::default())
            .unwrap();
        assert_eq!(service.get_credential(&principal).as_deref(), Some("EAAbiz"));
    }

    #[tokio::test]
    async fn test_ensure_fresh_refreshes_near_expiry() {
        let dir = TempDir::new().unwrap();
        let (issuer, service) = service(&dir);
        let principal = Principal::user("42");
        service
            .save_credential(
                &principal,
                "EAAold",
                CredentialMetadata::with_expiry(Expiry::At(Utc::now() + Duration::hours(1))),
            )
            .unwrap();
        issuer.push_exchange(ExchangeStep::token("EAAnew", Some(5_184_000)));
        issuer.set_valid("EAAnew", "42", &["ads_read"], Expiry::At(Utc::now() + Duration::days(60)));

        assert_eq!(service.ensure_fresh(&principal).await.as_deref(), Some("EAAnew"));
    }

    #[tokio::test]
    async fn test_ensure_fresh_serves_stale_token_until_it_expires() {
        let dir = TempDir::new().unwrap();
        let (issuer, service) = service(&dir);
        let live = Principal::user("1");
        let dead = Principal::user("2");
        service
            .save_credential(
                &live,
                "EAAlive",
                CredentialMetadata::with_expiry(Expiry::At(Utc::now() + Duration::hours(1))),
            )
            .unwrap();
        service
            .save_credential(
                &dead,
                "EAAdead",
                CredentialMetadata::with_expiry(Expiry::At(Utc::now() - Duration::hours(1))),
            )
            .unwrap();

        assert_eq!(service.ensure_fresh(&live).await.as_deref(), Some("EAAlive"));
        assert!(service.ensure_fresh(&dead).await.is_none());
        // One attempt per read
        assert_eq!(issuer.exchange_calls(), 2);
    }

    #[tokio::test]
    async fn test_on_demand_retry_without_credential() {
        let dir = TempDir::new().unwrap();
        let (_, service) = service(&dir);
        let principal = Principal::page("100");

        let result: Result<(), CallError<DownstreamError>> = service
            .on_demand_retry(&principal, |_| async { Ok(()) })
            .await;

        match result {
            Err(CallError::Unauthorized {
                principal: missing,
                reauthorization,
            }) => {
                assert_eq!(missing, principal);
                assert_eq!(reauthorization.scopes.len(), 4);
                assert!(service.consume_state(&reauthorization.state).is_some());
            }
            other => panic!("expected Unauthorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_on_demand_retry_downstream_error() {
        let dir = TempDir::new().unwrap();
        let (_, service) = service(&dir);
        let principal = Principal::page("100");
        service
            .save_credential(&principal, "EAApage", CredentialMetadata::with_expiry(Expiry::Never))
            .unwrap();

        let result: Result<(), CallError<DownstreamError>> = service
            .on_demand_retry(&principal, |_| async {
                Err(DownstreamError::new(Some(100), "Unsupported get request"))
            })
            .await;

        assert!(matches!(result, Err(CallError::Downstream(e)) if e.code == Some(100)));
    }

    #[tokio::test]
    async fn test_on_demand_retry_rejected_refresh_asks_for_consent() {
        let dir = TempDir::new().unwrap();
        let (issuer, service) = service(&dir);
        let principal = Principal::user("42");
        let mut metadata =
            CredentialMetadata::with_expiry(Expiry::At(Utc::now() + Duration::hours(1)));
        metadata.scopes.insert("read_insights".to_string());
        service
            .save_credential(&principal, "EAAold", metadata)
            .unwrap();
        issuer.push_exchange(ExchangeStep::Rejected { code: 190 });

        let result: Result<(), CallError<DownstreamError>> = service
            .on_demand_retry(&principal, |_| async {
                Err(DownstreamError::new(Some(190), "Session has expired"))
            })
            .await;

        match result {
            Err(CallError::Unauthorized {
                principal: denied,
                reauthorization,
            }) => {
                assert_eq!(denied, principal);
                assert!(reauthorization.scopes.contains(&"read_insights".to_string()));
                assert!(reauthorization.scopes.contains(&"ads_read".to_string()));
                assert!(service.consume_state(&reauthorization.state).is_some());
            }
            other => panic!("expected Unauthorized, got {:?}", other),
        }
        assert_eq!(issuer.exchange_calls(), 1);
    }

    #[tokio::test]
    async fn test_on_demand_retry_refreshed_token_still_rejected() {
        let dir = TempDir::new().unwrap();
        let (issuer, service) = service(&dir);
        let principal = Principal::user("42");
        service
            .save_credential(
                &principal,
                "EAAold",
                CredentialMetadata::with_expiry(Expiry::At(Utc::now() + Duration::hours(1))),
            )
            .unwrap();
        issuer.push_exchange(ExchangeStep::token("EAAnew", Some(5_184_000)));
        issuer.set_valid("EAAnew", "42", &["ads_read"], Expiry::At(Utc::now() + Duration::days(60)));

        let result: Result<(), CallError<DownstreamError>> = service
            .on_demand_retry(&principal, |_| async {
                Err(DownstreamError::new(Some(190), "Session has expired"))
            })
            .await;

        assert!(matches!(result, Err(CallError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_complete_authorization() {
        let dir = TempDir::new().unwrap();
        let (issuer, service) = service(&dir);
        let expiry = Expiry::At(Utc::now() + Duration::days(60));
        issuer.set_code("code-1", "EAAshort", Some(3600));
        issuer.push_exchange(ExchangeStep::token("EAAlong", Some(5_184_000)));
        issuer.set_valid("EAAlong", "42", &["ads_read", "pages_show_list"], expiry);

        let credential = service.complete_authorization("code-1").await.unwrap();

        assert_eq!(credential.principal, Principal::user("42"));
        assert_eq!(credential.expires_at, expiry);
        assert_eq!(issuer.exchanged_from(), vec!["EAAshort".to_string()]);
        assert_eq!(service.get_credential(&Principal::user("42")).as_deref(), Some("EAAlong"));
    }

    #[tokio::test]
    async fn test_complete_authorization_rejects_bad_code() {
        let dir = TempDir::new().unwrap();
        let (_, service) = service(&dir);

        assert!(matches!(
            service.complete_authorization("nope").await,
            Err(TokenError::IssuerRejected { .. })
        ));
        assert!(service.store().list_principals().is_empty());
    }

    #[tokio::test]
    async fn test_sync_page_credentials() {
        let dir = TempDir::new().unwrap();
        let (issuer, service) = service(&dir);
        let user = Principal::user("42");
        service
            .save_credential(&user, "EAAuser", CredentialMetadata::default())
            .unwrap();
        issuer.set_pages(
            "EAAuser",
            vec![
                PageAccount {
                    id: "100".to_string(),
                    name: Some("Bakery".to_string()),
                    access_token: "EAAp1".to_string(),
                    category: None,
                },
                PageAccount {
                    id: "200".to_string(),
                    name: None,
                    access_token: "EAAunknown".to_string(),
                    category: None,
                },
            ],
        );
        issuer.set_valid("EAAp1", "100", &["pages_read_engagement"], Expiry::Never);

        let synced = service.sync_page_credentials(&user).await.unwrap();

        assert_eq!(synced, vec![Principal::page("100")]);
        let page = service.credential(&Principal::page("100")).unwrap();
        assert_eq!(page.owner_id.as_deref(), Some("42"));
        assert_eq!(page.expires_at, Expiry::Never);
        assert_eq!(service.store().owned_by("42"), vec![Principal::page("100")]);
    }

    #[tokio::test]
    async fn test_sync_pages_requires_user_credential() {
        let dir = TempDir::new().unwrap();
        let (_, service) = service(&dir);

        assert!(matches!(
            service.sync_page_credentials(&Principal::user("404")).await,
            Err(TokenError::CredentialNotFound(_))
        ));
    }
}
