//! Reauthorization: consent URLs bound to single-use state tokens.

use serde::Serialize;
use std::sync::Arc;

mod authorize;
mod state;

pub use authorize::{AuthorizationUrlBuilder, GraphAuthorizer};
pub use state::{run_state_purge, StateEntry, StateManager};

/// What a caller needs to send a user back through consent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reauthorization {
    pub url: String,
    pub state: String,
    /// Exactly the scopes the URL asks for
    pub scopes: Vec<String>,
}

/// Issues reauthorization URLs.
#[derive(Clone)]
pub struct Reauthorizer {
    builder: Arc<dyn AuthorizationUrlBuilder>,
    states: StateManager,
    default_scopes: Vec<String>,
}

impl Reauthorizer {
    pub fn new(
        builder: Arc<dyn AuthorizationUrlBuilder>,
        states: StateManager,
        default_scopes: Vec<String>,
    ) -> Self {
        Self {
            builder,
            states,
            default_scopes,
        }
    }

    /// Requests consent for `scopes` (sorted, deduplicated). An empty
    /// request asks for the default scopes.
    pub fn request<I, S>(&self, scopes: I) -> Reauthorization
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut scopes: Vec<String> = scopes
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            scopes = self.default_scopes.clone();
        }
        scopes.sort();
        scopes.dedup();

        let state = self.states.issue(&scopes);
        let url = self.builder.build_authorization_url(&scopes, &state);
        Reauthorization { url, state, scopes }
    }

    /// Request for the default scopes plus `extra`.
    pub fn request_with_defaults<I, S>(&self, extra: I) -> Reauthorization
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scopes: Vec<String> = self
            .default_scopes
            .iter()
            .cloned()
            .chain(extra.into_iter().map(Into::into))
            .collect();
        self.request(scopes)
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    pub fn default_scopes(&self) -> &[String] {
        &self.default_scopes
    }
}
