use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete adtoken configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdTokenConfig {
    #[serde(default)]
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Issuer (ads platform) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    /// Application ID. Required for every issuer call.
    #[serde(default)]
    pub app_id: Option<String>,
    /// Application secret. Required for every issuer call.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Base URL of the Graph API (token exchange and introspection)
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    /// Base URL of the consent dialog
    #[serde(default = "default_dialog_url")]
    pub dialog_url: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Scopes requested when a reauthorization asks for nothing specific
    #[serde(default = "default_scopes")]
    pub default_scopes: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    "v19.0".to_string()
}

fn default_graph_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_dialog_url() -> String {
    "https://www.facebook.com".to_string()
}

fn default_scopes() -> Vec<String> {
    ["public_profile", "pages_show_list", "pages_read_engagement", "ads_read"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            api_version: default_api_version(),
            graph_url: default_graph_url(),
            dialog_url: default_dialog_url(),
            redirect_uri: None,
            default_scopes: default_scopes(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// JSON store file. The backup lives next to it as `<path>.bak`.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Base64-encoded 32-byte key. Without it secrets are only encoded.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Use base64 encoding when strong encryption is unavailable
    #[serde(default = "default_allow_fallback_encoding")]
    pub allow_fallback_encoding: bool,
    /// Static secret used when a stored secret cannot be decrypted
    #[serde(default)]
    pub fallback_secret: Option<String>,
    /// Principal seeded with the fallback secret, as `<type>:<id>`
    #[serde(default = "default_fallback_principal")]
    pub fallback_principal: String,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/credentials.json")
}

fn default_allow_fallback_encoding() -> bool {
    true
}

fn default_fallback_principal() -> String {
    "app:default".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            encryption_key: None,
            allow_fallback_encoding: default_allow_fallback_encoding(),
            fallback_secret: None,
            fallback_principal: default_fallback_principal(),
        }
    }
}

/// Refresh engine and scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Run the background sweep
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Pause between sweeps (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Credentials expiring within this horizon are refreshed by a sweep (hours)
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: i64,
    /// Margin used by the on-demand and read paths (hours)
    #[serde(default = "default_on_demand_margin_hours")]
    pub on_demand_margin_hours: i64,
    /// Exchange attempts per scheduled refresh decision
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff between exchange attempts (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Pause after a failed sweep cycle before restarting (seconds)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// How long an OAuth state token stays valid (seconds)
    #[serde(default = "default_state_expiry")]
    pub state_expiry_secs: i64,
}

fn default_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    6 * 60 * 60
}

fn default_horizon_hours() -> i64 {
    24
}

fn default_on_demand_margin_hours() -> i64 {
    6
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_cooldown() -> u64 {
    60
}

fn default_state_expiry() -> i64 {
    600
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_secs: default_sweep_interval(),
            horizon_hours: default_horizon_hours(),
            on_demand_margin_hours: default_on_demand_margin_hours(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cooldown_secs: default_cooldown(),
            state_expiry_secs: default_state_expiry(),
        }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3002
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl AdTokenConfig {
    /// Applies `ADTOKEN_*` environment variables on top of the loaded values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ADTOKEN_APP_ID") {
            self.issuer.app_id = Some(v);
        }
        if let Some(v) = lookup("ADTOKEN_APP_SECRET") {
            self.issuer.app_secret = Some(v);
        }
        if let Some(v) = lookup("ADTOKEN_REDIRECT_URI") {
            self.issuer.redirect_uri = Some(v);
        }
        if let Some(v) = lookup("ADTOKEN_API_VERSION") {
            self.issuer.api_version = v;
        }
        if let Some(v) = lookup("ADTOKEN_ENCRYPTION_KEY") {
            self.storage.encryption_key = Some(v);
        }
        if let Some(v) = lookup("ADTOKEN_ACCESS_TOKEN") {
            self.storage.fallback_secret = Some(v);
        }
        if let Some(v) = lookup("ADTOKEN_STORE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ADTOKEN_API_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.api.port = port;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AdTokenConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AdTokenConfig =
        toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AdTokenConfig::default();
        assert_eq!(config.issuer.api_version, "v19.0");
        assert_eq!(config.issuer.default_scopes.len(), 4);
        assert!(config.issuer.app_id.is_none());
        assert_eq!(config.storage.fallback_principal, "app:default");
        assert!(config.storage.allow_fallback_encoding);
        assert_eq!(config.refresh.horizon_hours, 24);
        assert_eq!(config.refresh.max_attempts, 3);
        assert_eq!(config.api.port, 3002);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [issuer]
            app_id = "1234"
            app_secret = "s3cret"
            api_version = "v22.0"
            default_scopes = ["ads_read"]

            [storage]
            path = "/tmp/tokens.json"
            allow_fallback_encoding = false

            [refresh]
            sweep_interval_secs = 600
            horizon_hours = 48
            max_attempts = 5

            [api]
            port = 8080
        "#;

        let config: AdTokenConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.issuer.app_id.as_deref(), Some("1234"));
        assert_eq!(config.issuer.api_version, "v22.0");
        assert_eq!(config.issuer.default_scopes, vec!["ads_read".to_string()]);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/tokens.json"));
        assert!(!config.storage.allow_fallback_encoding);
        assert_eq!(config.refresh.sweep_interval_secs, 600);
        assert_eq!(config.refresh.horizon_hours, 48);
        assert_eq!(config.refresh.max_attempts, 5);
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections and fields use defaults
        let toml = r#"
            [refresh]
            cooldown_secs = 5
        "#;

        let config: AdTokenConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.refresh.cooldown_secs, 5);
        assert_eq!(config.refresh.horizon_hours, 24);
        assert_eq!(config.issuer.graph_url, "https://graph.facebook.com");
        assert_eq!(config.storage.path, PathBuf::from("data/credentials.json"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ADTOKEN_APP_ID", "999"),
            ("ADTOKEN_ACCESS_TOKEN", "EAAfallback"),
            ("ADTOKEN_STORE_PATH", "/var/lib/adtoken/store.json"),
            ("ADTOKEN_API_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();

        let mut config = AdTokenConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.issuer.app_id.as_deref(), Some("999"));
        assert_eq!(config.storage.fallback_secret.as_deref(), Some("EAAfallback"));
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/adtoken/store.json")
        );
        // Unparsable values keep the default
        assert_eq!(config.api.port, 3002);
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/adtoken.toml").is_err());
    }
}
