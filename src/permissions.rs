//! Permission checks: does a secret cover a required scope set?

use crate::oauth::{Reauthorization, Reauthorizer};
use crate::validation::ValidationClient;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Outcome of a permission check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PermissionCheckResult {
    Granted,
    Expired {
        reauthorization: Reauthorization,
    },
    Invalid {
        reason: String,
    },
    MissingScopes {
        missing: Vec<String>,
        reauthorization: Reauthorization,
    },
}

impl PermissionCheckResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionCheckResult::Granted)
    }

    /// The consent request attached to the result, if any.
    pub fn reauthorization(&self) -> Option<&Reauthorization> {
        match self {
            PermissionCheckResult::Expired { reauthorization }
            | PermissionCheckResult::MissingScopes {
                reauthorization, ..
            } => Some(reauthorization),
            _ => None,
        }
    }
}

/// Decides whether secrets cover required scopes.
#[derive(Clone)]
pub struct PermissionChecker {
    validator: ValidationClient,
    reauthorizer: Reauthorizer,
}

impl PermissionChecker {
    pub fn new(validator: ValidationClient, reauthorizer: Reauthorizer) -> Self {
        Self {
            validator,
            reauthorizer,
        }
    }

    /// Validates `secret` and compares its scopes with `required`.
    ///
    /// Scope names compare by exact, case-sensitive equality. Blank names
    /// are not scopes and are ignored.
    pub async fn check(&self, secret: &str, required: &BTreeSet<String>) -> PermissionCheckResult {
        let required: BTreeSet<String> = required
            .iter()
            .filter(|scope| !scope.trim().is_empty())
            .cloned()
            .collect();
        let validation = self.validator.validate(secret).await;

        if !validation.is_valid {
            if validation.is_expiry_like() {
                debug!(reason = %validation.reason(), "Token expired");
                return PermissionCheckResult::Expired {
                    reauthorization: self.reauthorizer.request_with_defaults(required.iter().cloned()),
                };
            }
            return PermissionCheckResult::Invalid {
                reason: validation.reason(),
            };
        }

        let missing: Vec<String> = required.difference(&validation.scopes).cloned().collect();
        if missing.is_empty() {
            return PermissionCheckResult::Granted;
        }

        debug!(missing = ?missing, "Token lacks required scopes");
        PermissionCheckResult::MissingScopes {
            reauthorization: self.reauthorizer.request(missing.iter().cloned()),
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Expiry;
    use crate::oauth::{AuthorizationUrlBuilder, StateManager};
    use crate::test_support::MockIssuer;
    use std::sync::Arc;

    struct PlainUrls;

    impl AuthorizationUrlBuilder for PlainUrls {
        fn build_authorization_url(&self, scopes: &[String], state: &str) -> String {
            format!("https://consent.test/?scope={}&state={}", scopes.join(","), state)
        }
    }

    fn checker(issuer: Arc<MockIssuer>) -> PermissionChecker {
        let reauthorizer = Reauthorizer::new(
            Arc::new(PlainUrls),
            StateManager::new(600),
            vec!["public_profile".to_string()],
        );
        PermissionChecker::new(ValidationClient::new(issuer), reauthorizer)
    }

    fn set(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_superset_is_granted() {
        let issuer = Arc::new(MockIssuer::new());
        issuer.set_valid("EAAtoken", "42", &["a", "b", "c"], Expiry::Never);

        let result = checker(issuer).check("EAAtoken", &set(&["a", "b"])).await;
        assert_eq!(result, PermissionCheckResult::Granted);
    }

    #[tokio::test]
    async fn test_missing_scopes_reauthorize_exactly_the_missing_set() {
        let issuer = Arc::new(MockIssuer::new());
        issuer.set_valid("EAAtoken", "42", &["a"], Expiry::Never);

        let result = checker(issuer).check("EAAtoken", &set(&["a", "b"])).await;

        match result {
            PermissionCheckResult::MissingScopes {
                missing,
                reauthorization,
            } => {
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(reauthorization.scopes, vec!["b".to_string()]);
                assert!(reauthorization.url.contains("scope=b&"));
            }
            other => panic!("expected MissingScopes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blank_required_scopes_are_ignored() {
        let issuer = Arc::new(MockIssuer::new());
        issuer.set_valid("EAAtoken", "42", &["a"], Expiry::Never);
        let checker = checker(issuer);

        let result = checker.check("EAAtoken", &set(&["a", "", " "])).await;
        assert_eq!(result, PermissionCheckResult::Granted);

        match checker.check("EAAtoken", &set(&["", "b"])).await {
            PermissionCheckResult::MissingScopes {
                missing,
                reauthorization,
            } => {
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(reauthorization.scopes, missing);
            }
            other => panic!("expected MissingScopes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scope_comparison_is_case_sensitive() {
        let issuer = Arc::new(MockIssuer::new());
        issuer.set_valid("EAAtoken", "42", &["ADS_READ"], Expiry::Never);

        let result = checker(issuer).check("EAAtoken", &set(&["ads_read"])).await;
        assert!(matches!(result, PermissionCheckResult::MissingScopes { .. }));
    }

    #[tokio::test]
    async fn test_expired_token() {
        // Unknown secrets introspect as code 190
        let issuer = Arc::new(MockIssuer::new());

        let result = checker(issuer).check("EAAstale", &set(&["ads_read"])).await;

        match result {
            PermissionCheckResult::Expired { reauthorization } => {
                assert_eq!(reauthorization.scopes, vec!["ads_read", "public_profile"]);
            }
            other => panic!("expected Expired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_token_not_expiry_like() {
        let issuer = Arc::new(MockIssuer::new());
        issuer.fail_introspection("EAAtoken", "connection reset");

        let result = checker(issuer).check("EAAtoken", &set(&["ads_read"])).await;
        assert!(matches!(result, PermissionCheckResult::Invalid { .. }));
        assert!(result.reauthorization().is_none());
    }
}
