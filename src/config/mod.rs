// Configuration management
use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_POPUP_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_POPUP_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_PENDING_TTL_SECONDS: i64 = 600;
const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 300;
const MAX_PENDING_TTL_SECONDS: i64 = 86_400;
const MAX_CLOCK_SKEW_SECONDS: i64 = 3_600;

/// On-disk configuration file shape
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub popup: PopupSection,
    #[serde(default)]
    pub redirect: RedirectSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientSection {
    pub client_id: Option<String>,
    pub authority: Option<String>,
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub authorize_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
}

/// Where tokens and accounts live between runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheLocation {
    Memory,
    #[default]
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub location: CacheLocation,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_seconds: i64,
}

fn default_clock_skew() -> i64 {
    DEFAULT_CLOCK_SKEW_SECONDS
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            location: CacheLocation::default(),
            clock_skew_seconds: default_clock_skew(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopupSection {
    #[serde(default = "default_popup_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_popup_timeout() -> u64 {
    DEFAULT_POPUP_TIMEOUT_SECONDS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POPUP_POLL_INTERVAL_MS
}

impl Default for PopupSection {
    fn default() -> Self {
        Self {
            timeout_seconds: default_popup_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectSection {
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_seconds: i64,
}

fn default_pending_ttl() -> i64 {
    DEFAULT_PENDING_TTL_SECONDS
}

impl Default for RedirectSection {
    fn default() -> Self {
        Self {
            pending_ttl_seconds: default_pending_ttl(),
        }
    }
}

impl Config {
    /// Get the config directory path
    ///
    /// Priority:
    /// 1. XDG_CONFIG_HOME/authflow (if env var is set)
    /// 2. ~/.config/authflow (if ~/.config exists)
    /// 3. ~/.authflow (fallback on Unix)
    /// 4. Platform default on Windows
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config).join("authflow"));
        }

        #[cfg(unix)]
        {
            if let Some(home_dir) = dirs::home_dir() {
                let xdg_config = home_dir.join(".config");
                if xdg_config.exists() {
                    return Ok(xdg_config.join("authflow"));
                }
                return Ok(home_dir.join(".authflow"));
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(config_dir) = dirs::config_dir() {
                return Ok(config_dir.join("authflow"));
            }
        }

        Err(AuthError::Configuration(
            "Could not determine config directory".to_string(),
        ))
    }

    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default file, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_file_path()?)?;
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from an explicit path, defaults when the file is missing
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        tracing::debug!("Loading config from: {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| {
            AuthError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&contents)
            .map_err(|e| AuthError::Configuration(format!("Failed to parse config file: {}", e)))
    }

    fn apply_env(&mut self) {
        if let Ok(client_id) = std::env::var("AUTHFLOW_CLIENT_ID") {
            tracing::debug!("Using AUTHFLOW_CLIENT_ID from environment");
            self.client.client_id = Some(client_id);
        }
        if let Ok(authority) = std::env::var("AUTHFLOW_AUTHORITY") {
            tracing::debug!("Using AUTHFLOW_AUTHORITY from environment: {}", authority);
            self.client.authority = Some(authority);
        }
        if let Ok(redirect_uri) = std::env::var("AUTHFLOW_REDIRECT_URI") {
            tracing::debug!("Using AUTHFLOW_REDIRECT_URI from environment: {}", redirect_uri);
            self.client.redirect_uri = Some(redirect_uri);
        }
        if let Ok(scopes) = std::env::var("AUTHFLOW_SCOPES") {
            self.client.scopes = scopes.split_whitespace().map(str::to_string).collect();
        }
    }

    /// Command-line values win over file and environment
    pub fn with_overrides(
        mut self,
        client_id: Option<String>,
        authority: Option<String>,
        redirect_uri: Option<String>,
    ) -> Self {
        if client_id.is_some() {
            self.client.client_id = client_id;
        }
        if authority.is_some() {
            self.client.authority = authority;
        }
        if redirect_uri.is_some() {
            self.client.redirect_uri = redirect_uri;
        }
        self
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    AuthError::Configuration(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| AuthError::Configuration(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, toml_string)
            .map_err(|e| AuthError::Configuration(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Write a commented sample config, refusing to overwrite an existing file
    pub fn create_sample(path: &std::path::Path) -> Result<()> {
        if path.exists() {
            return Err(AuthError::Configuration(format!(
                "Config file already exists at: {}",
                path.display()
            )));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                AuthError::Configuration(format!("Failed to create config directory: {}", e))
            })?;
        }

        let sample_config = r#"# authflow configuration
# Values can be overridden with AUTHFLOW_CLIENT_ID, AUTHFLOW_AUTHORITY,
# AUTHFLOW_REDIRECT_URI and AUTHFLOW_SCOPES.

[client]
# Application (client) id registered with the identity provider (required)
client_id = ""

# Issuer URL; /authorize, /token and /logout are derived from it (required)
# Example: authority = "https://login.microsoftonline.com/common/oauth2/v2.0"
authority = ""

# Where the provider sends the browser back (required)
redirect_uri = "http://localhost:4200"

# Scopes requested in addition to openid, profile and offline_access
scopes = []

[cache]
# "storage" keeps tokens and accounts between runs, "memory" forgets them
location = "storage"
clock_skew_seconds = 300

[popup]
timeout_seconds = 60
poll_interval_ms = 50

[redirect]
# Pending redirect logins older than this are discarded
pending_ttl_seconds = 600
"#;

        fs::write(path, sample_config).map_err(|e| {
            AuthError::Configuration(format!("Failed to write sample config: {}", e))
        })?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.client.client_id.is_some()
            && self.client.authority.is_some()
            && self.client.redirect_uri.is_some()
    }

    /// Validate into the immutable runtime configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let client_id = self.client.client_id.as_deref().ok_or_else(|| {
            AuthError::Configuration(
                "client_id not configured. Set it in the config file, AUTHFLOW_CLIENT_ID or --client-id".to_string(),
            )
        })?;
        let authority = self.client.authority.as_deref().ok_or_else(|| {
            AuthError::Configuration(
                "authority not configured. Set it in the config file, AUTHFLOW_AUTHORITY or --authority".to_string(),
            )
        })?;
        let redirect_uri = self.client.redirect_uri.as_deref().ok_or_else(|| {
            AuthError::Configuration(
                "redirect_uri not configured. Set it in the config file, AUTHFLOW_REDIRECT_URI or --redirect-uri".to_string(),
            )
        })?;

        let mut config = ClientConfig::new(client_id, authority, redirect_uri)?;
        config.scopes = self.client.scopes.clone();
        config.cache_location = self.cache.location;
        config.clock_skew_seconds = self.cache.clock_skew_seconds;
        config.popup_timeout = Duration::from_secs(self.popup.timeout_seconds);
        config.popup_poll_interval = Duration::from_millis(self.popup.poll_interval_ms);
        config.pending_request_ttl_seconds = self.redirect.pending_ttl_seconds;
        config.authorize_endpoint = parse_optional(&self.client.authorize_endpoint, "authorize_endpoint")?;
        config.token_endpoint = parse_optional(&self.client.token_endpoint, "token_endpoint")?;
        config.end_session_endpoint =
            parse_optional(&self.client.end_session_endpoint, "end_session_endpoint")?;
        config.post_logout_redirect_uri =
            parse_optional(&self.client.post_logout_redirect_uri, "post_logout_redirect_uri")?;

        config.validate()?;
        Ok(config)
    }
}

fn parse_optional(value: &Option<String>, field: &str) -> Result<Option<Url>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_url(raw, field).map(Some),
    }
}

fn parse_url(raw: &str, field: &str) -> Result<Url> {
    Url::parse(raw.trim())
        .map_err(|e| AuthError::Configuration(format!("{} is not a valid URL ({}): {}", field, raw, e)))
}

/// Validated, immutable client configuration shared by every component
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub client_id: String,
    pub authority: Url,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    pub cache_location: CacheLocation,
    pub clock_skew_seconds: i64,
    pub popup_timeout: Duration,
    pub popup_poll_interval: Duration,
    pub pending_request_ttl_seconds: i64,
    pub authorize_endpoint: Option<Url>,
    pub token_endpoint: Option<Url>,
    pub end_session_endpoint: Option<Url>,
    pub post_logout_redirect_uri: Option<Url>,
}

impl ClientConfig {
    pub fn new(client_id: &str, authority: &str, redirect_uri: &str) -> Result<Self> {
        let config = Self {
            client_id: client_id.trim().to_string(),
            authority: parse_url(authority, "authority")?,
            redirect_uri: parse_url(redirect_uri, "redirect_uri")?,
            scopes: Vec::new(),
            cache_location: CacheLocation::default(),
            clock_skew_seconds: DEFAULT_CLOCK_SKEW_SECONDS,
            popup_timeout: Duration::from_secs(DEFAULT_POPUP_TIMEOUT_SECONDS),
            popup_poll_interval: Duration::from_millis(DEFAULT_POPUP_POLL_INTERVAL_MS),
            pending_request_ttl_seconds: DEFAULT_PENDING_TTL_SECONDS,
            authorize_endpoint: None,
            token_endpoint: None,
            end_session_endpoint: None,
            post_logout_redirect_uri: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_id.chars().any(char::is_whitespace) {
            return Err(AuthError::Configuration(
                "client_id must be a non-empty value without whitespace".to_string(),
            ));
        }

        match self.authority.scheme() {
            "https" => {}
            "http" if is_loopback(&self.authority) => {}
            other => {
                return Err(AuthError::Configuration(format!(
                    "authority must use https (got {})",
                    other
                )))
            }
        }
        if self.authority.host_str().map_or(true, str::is_empty) {
            return Err(AuthError::Configuration(
                "authority must include a host".to_string(),
            ));
        }
        if self.authority.query().is_some() || self.authority.fragment().is_some() {
            return Err(AuthError::Configuration(
                "authority must not carry a query or fragment".to_string(),
            ));
        }

        if self.redirect_uri.cannot_be_a_base() || self.redirect_uri.fragment().is_some() {
            return Err(AuthError::Configuration(format!(
                "redirect_uri must be an absolute URL without fragment (got {})",
                self.redirect_uri
            )));
        }

        if self.popup_timeout.is_zero() || self.popup_poll_interval.is_zero() {
            return Err(AuthError::Configuration(
                "popup timeout and poll interval must be positive".to_string(),
            ));
        }
        if !(1..=MAX_PENDING_TTL_SECONDS).contains(&self.pending_request_ttl_seconds) {
            return Err(AuthError::Configuration(format!(
                "pending_ttl_seconds must be between 1 and {}",
                MAX_PENDING_TTL_SECONDS
            )));
        }
        if !(0..=MAX_CLOCK_SKEW_SECONDS).contains(&self.clock_skew_seconds) {
            return Err(AuthError::Configuration(format!(
                "clock_skew_seconds must be between 0 and {}",
                MAX_CLOCK_SKEW_SECONDS
            )));
        }

        Ok(())
    }

    /// Authority without trailing slash, used as the cache partition
    pub fn authority_key(&self) -> String {
        self.authority.as_str().trim_end_matches('/').to_string()
    }

    /// Host of the authority, recorded on accounts
    pub fn environment(&self) -> String {
        self.authority.host_str().unwrap_or_default().to_string()
    }

    pub fn authorize_endpoint(&self) -> Result<Url> {
        self.endpoint(&self.authorize_endpoint, "authorize")
    }

    pub fn token_endpoint(&self) -> Result<Url> {
        self.endpoint(&self.token_endpoint, "token")
    }

    /// Where the provider returns after signing out
    pub fn post_logout_landing(&self) -> &Url {
        self.post_logout_redirect_uri
            .as_ref()
            .unwrap_or(&self.redirect_uri)
    }

    pub fn end_session_endpoint(&self) -> Result<Url> {
        self.endpoint(&self.end_session_endpoint, "logout")
    }

    fn endpoint(&self, explicit: &Option<Url>, path: &str) -> Result<Url> {
        match explicit {
            Some(url) => Ok(url.clone()),
            None => parse_url(&format!("{}/{}", self.authority_key(), path), path),
        }
    }

    /// Namespaced storage key, so several clients can share one storage
    pub fn storage_key(&self, name: &str) -> String {
        format!("authflow.{}.{}", self.client_id, name)
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("[::1]"))
}
