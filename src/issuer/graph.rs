//! Graph API implementation of the issuer contract.

use super::{ExchangedToken, Issuer, PageAccount, TokenIntrospection};
use crate::config::IssuerConfig;
use crate::credentials::Expiry;
use crate::error::TokenError;
use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on followed `paging.next` links when listing pages
const MAX_PAGES: usize = 10;

/// Graph API error envelope
#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: GraphError,
}

#[derive(Deserialize, Debug)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
    #[serde(default)]
    is_transient: bool,
}

/// `debug_token` response
#[derive(Deserialize, Debug)]
struct DebugTokenResponse {
    data: DebugTokenData,
}

#[derive(Deserialize, Debug, Default)]
struct DebugTokenData {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    profile_id: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    data_access_expires_at: Option<i64>,
    #[serde(default)]
    error: Option<DebugTokenError>,
}

#[derive(Deserialize, Debug)]
struct DebugTokenError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    subcode: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// `oauth/access_token` response
#[derive(Deserialize, Debug)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// `me/accounts` response page
#[derive(Deserialize, Debug)]
struct AccountsResponse {
    #[serde(default)]
    data: Vec<AccountEntry>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Deserialize, Debug)]
struct AccountEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

/// Issuer backed by the Graph API over HTTPS.
pub struct GraphIssuer {
    client: reqwest::Client,
    graph_url: String,
    api_version: String,
    app_id: Option<String>,
    app_secret: Option<String>,
    redirect_uri: Option<String>,
}

impl GraphIssuer {
    /// Builds the HTTP client. Missing application credentials are only
    /// reported when a call needs them.
    pub fn new(config: &IssuerConfig) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("adtoken/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            graph_url: config.graph_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            app_id: config.app_id.clone().filter(|s| !s.is_empty()),
            app_secret: config.app_secret.clone().filter(|s| !s.is_empty()),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    fn app_credentials(&self) -> Result<(&str, &str), TokenError> {
        match (&self.app_id, &self.app_secret) {
            (Some(id), Some(secret)) => Ok((id.as_str(), secret.as_str())),
            _ => Err(TokenError::ConfigurationMissing(
                "issuer app_id and app_secret are required".to_string(),
            )),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.graph_url, self.api_version, path)
    }

    /// Sends a GET and decodes the JSON body, mapping Graph errors onto the
    /// error taxonomy.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TokenError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error("request failed", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("failed to read body", e))?;

        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
            let err = envelope.error;
            debug!(
                status = %status,
                code = ?err.code,
                subcode = ?err.error_subcode,
                "Issuer returned an error"
            );
            if err.is_transient || status.is_server_error() {
                return Err(TokenError::TransportFailure(err.message));
            }
            return Err(TokenError::IssuerRejected {
                code: err.code,
                subcode: err.error_subcode,
                message: err.message,
            });
        }

        if status.is_server_error() {
            return Err(TokenError::TransportFailure(format!(
                "issuer returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(TokenError::rejected(format!("issuer returned {}", status)));
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!(error = %e, "Unexpected issuer response");
            TokenError::TransportFailure(format!("unexpected response: {}", e))
        })
    }

    async fn access_token(&self, query: &[(&str, &str)]) -> Result<ExchangedToken, TokenError> {
        let response: AccessTokenResponse = self
            .get_json(&self.endpoint("oauth/access_token"), query)
            .await?;

        if response.access_token.is_empty() {
            return Err(TokenError::rejected("issuer returned an empty token"));
        }

        Ok(ExchangedToken {
            secret: response.access_token,
            expires_in: response.expires_in,
        })
    }
}

impl DebugTokenData {
    fn into_introspection(self) -> TokenIntrospection {
        // `expires_at: 0` means a non-expiring token
        let expires_at = match self.expires_at {
            Some(ts) => Expiry::from_unix(Some(ts)),
            None => Expiry::from_unix(self.data_access_expires_at),
        };
        let (error_code, error_subcode, error_message) = match self.error {
            Some(err) => (err.code, err.subcode, err.message),
            None => (None, None, None),
        };

        TokenIntrospection {
            is_valid: self.is_valid,
            principal_id: self.profile_id.or(self.user_id),
            app_id: self.app_id,
            scopes: self.scopes.into_iter().collect(),
            expires_at,
            error_code,
            error_subcode,
            error_message,
        }
    }
}

#[async_trait]
impl Issuer for GraphIssuer {
    async fn introspect(&self, secret: &str) -> Result<TokenIntrospection, TokenError> {
        let (app_id, app_secret) = self.app_credentials()?;
        let app_token = format!("{}|{}", app_id, app_secret);

        let response: DebugTokenResponse = self
            .get_json(
                &self.endpoint("debug_token"),
                &[("input_token", secret), ("access_token", app_token.as_str())],
            )
            .await?;

        Ok(response.data.into_introspection())
    }

    async fn exchange(&self, secret: &str) -> Result<ExchangedToken, TokenError> {
        let (app_id, app_secret) = self.app_credentials()?;
        debug!("Exchanging token for a long-lived token");

        self.access_token(&[
            ("grant_type", "fb_exchange_token"),
            ("client_id", app_id),
            ("client_secret", app_secret),
            ("fb_exchange_token", secret),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedToken, TokenError> {
        let (app_id, app_secret) = self.app_credentials()?;
        let redirect_uri = self.redirect_uri.as_deref().ok_or_else(|| {
            TokenError::ConfigurationMissing("issuer redirect_uri is required".to_string())
        })?;
        debug!("Exchanging authorization code");

        self.access_token(&[
            ("client_id", app_id),
            ("client_secret", app_secret),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ])
        .await
    }

    async fn page_accounts(&self, user_secret: &str) -> Result<Vec<PageAccount>, TokenError> {
        let mut pages = Vec::new();
        let mut response: AccountsResponse = self
            .get_json(
                &self.endpoint("me/accounts"),
                &[
                    ("fields", "id,name,access_token,category"),
                    ("access_token", user_secret),
                ],
            )
            .await?;

        for _ in 0..MAX_PAGES {
            for entry in response.data {
                match entry.access_token {
                    Some(token) if !token.is_empty() => pages.push(PageAccount {
                        id: entry.id,
                        name: entry.name,
                        access_token: token,
                        category: entry.category,
                    }),
                    _ => debug!(page_id = %entry.id, "Page listed without a token, skipping"),
                }
            }

            // `next` already carries the full query string
            match response.paging.and_then(|p| p.next) {
                Some(next) => response = self.get_json(&next, &[]).await?,
                None => return Ok(pages),
            }
        }

        warn!(max_pages = MAX_PAGES, "Stopped following page listing");
        Ok(pages)
    }
}

/// Request URLs carry secrets in their query string, so they never reach
/// the error text.
fn transport_error(context: &str, e: reqwest::Error) -> TokenError {
    let kind = if e.is_timeout() {
        " (timed out)"
    } else if e.is_connect() {
        " (connection failed)"
    } else {
        ""
    };
    TokenError::TransportFailure(format!("{}{}: {}", context, kind, e.without_url()))
}
