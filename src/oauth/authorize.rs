//! Consent dialog URLs.

use crate::config::IssuerConfig;

/// Builds the URL a user visits to (re)grant scopes.
pub trait AuthorizationUrlBuilder: Send + Sync {
    fn build_authorization_url(&self, scopes: &[String], state: &str) -> String;
}

/// Graph consent dialog: `{dialog}/{version}/dialog/oauth`.
#[derive(Clone, Debug)]
pub struct GraphAuthorizer {
    dialog_url: String,
    api_version: String,
    client_id: String,
    redirect_uri: String,
}

impl GraphAuthorizer {
    pub fn new(config: &IssuerConfig) -> Self {
        Self {
            dialog_url: config.dialog_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            client_id: config.app_id.clone().unwrap_or_default(),
            redirect_uri: config.redirect_uri.clone().unwrap_or_default(),
        }
    }
}

impl AuthorizationUrlBuilder for GraphAuthorizer {
    fn build_authorization_url(&self, scopes: &[String], state: &str) -> String {
        format!(
            "{}/{}/dialog/oauth?client_id={}&redirect_uri={}&state={}&scope={}&response_type=code",
            self.dialog_url,
            self.api_version,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state),
            urlencoding::encode(&scopes.join(","))
        )
    }
}
