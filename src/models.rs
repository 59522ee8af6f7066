use crate::error::{AuthError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Scopes every login requests in addition to the caller's scopes
pub const OIDC_DEFAULT_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Interaction currently in flight for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    #[default]
    None,
    Login,
    Logout,
    AcquireToken,
    HandleRedirect,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InteractionStatus::None => "none",
            InteractionStatus::Login => "login",
            InteractionStatus::Logout => "logout",
            InteractionStatus::AcquireToken => "acquireToken",
            InteractionStatus::HandleRedirect => "handleRedirect",
        }
    }

    pub fn is_none(&self) -> bool {
        *self == InteractionStatus::None
    }
}

impl fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an interaction reaches the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Redirect,
    Popup,
    Silent,
}

/// Case-insensitive set of OAuth scopes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Parse a space-delimited scope string as returned by token endpoints
    pub fn parse(scopes: &str) -> Self {
        scopes.split_whitespace().collect()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(&scope.to_ascii_lowercase())
    }

    /// True when every scope of `required` is present in `self`
    pub fn contains_all(&self, required: &ScopeSet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn intersects(&self, other: &ScopeSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    /// Drop `openid`, `profile` and `offline_access`, which never appear on access tokens
    pub fn without_oidc_defaults(&self) -> ScopeSet {
        self.0
            .iter()
            .filter(|s| !OIDC_DEFAULT_SCOPES.contains(&s.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_scope_string(&self) -> String {
        self.iter().collect::<Vec<_>>().join(" ")
    }
}

impl<S: AsRef<str>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        ScopeSet(
            iter.into_iter()
                .map(|s| s.as_ref().trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

/// A signed-in identity known to this client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    /// Stable identifier: `oid.tid` when the provider issues both, otherwise `sub`
    pub home_account_id: String,
    /// Authority host the account was issued by
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Claims from the most recent id token
    #[serde(default)]
    pub id_token_claims: BTreeMap<String, serde_json::Value>,
}

impl Account {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.username),
            None => self.username.clone(),
        }
    }
}

/// Cached access token for one account, authority and scope set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenCacheEntry {
    pub home_account_id: String,
    pub authority: String,
    pub scopes: ScopeSet,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl TokenCacheEntry {
    /// Stable key over (account, authority, scopes)
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.home_account_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.authority.as_bytes());
        hasher.update(b"|");
        hasher.update(self.scopes.to_scope_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Expired once `expires_at - skew` has passed
    pub fn is_expired(&self, skew_seconds: i64) -> bool {
        match Duration::try_seconds(skew_seconds)
            .and_then(|skew| self.expires_at.checked_sub_signed(skew))
        {
            Some(threshold) => Utc::now() >= threshold,
            None => true,
        }
    }

    pub fn expires_in_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    pub fn expires_in_minutes(&self) -> i64 {
        self.expires_in_seconds() / 60
    }
}

/// Raw JSON body returned by a token endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Providers that omit `expires_in` get a one hour lifetime. Lifetimes
    /// outside what a timestamp can hold are rejected.
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        let lifetime = self.expires_in.unwrap_or(3600);
        Duration::try_seconds(lifetime)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::TokenExchange(format!("expires_in out of range: {}", lifetime))
            })
    }

    /// Granted scopes, falling back to the requested ones when the response omits them
    pub fn granted_scopes(&self, requested: &ScopeSet) -> ScopeSet {
        match self.scope.as_deref() {
            Some(scope) if !scope.trim().is_empty() => ScopeSet::parse(scope),
            _ => requested.clone(),
        }
    }
}

/// Record persisted between issuing an authorization request and receiving its response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAuthorizationRequest {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub interaction: InteractionStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorizationRequest {
    pub fn is_expired(&self, ttl_seconds: i64) -> bool {
        match Duration::try_seconds(ttl_seconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
        {
            Some(deadline) => Utc::now() >= deadline,
            None => false,
        }
    }
}

/// Caller-facing options for an interactive login
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub scopes: Vec<String>,
    pub prompt: Option<String>,
    pub login_hint: Option<String>,
    pub domain_hint: Option<String>,
    pub extra_query_parameters: Vec<(String, String)>,
}

impl LoginRequest {
    pub fn with_scopes<S: Into<String>>(scopes: impl IntoIterator<Item = S>) -> Self {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Optional hints flattened into query parameters, followed by caller extras
    pub fn query_parameters(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(prompt) = &self.prompt {
            params.push(("prompt".to_string(), prompt.clone()));
        }
        if let Some(hint) = &self.login_hint {
            params.push(("login_hint".to_string(), hint.clone()));
        }
        if let Some(hint) = &self.domain_hint {
            params.push(("domain_hint".to_string(), hint.clone()));
        }
        params.extend(self.extra_query_parameters.iter().cloned());
        params
    }
}

/// Outcome of a successful login or token acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationResult {
    pub account: Account,
    pub access_token: String,
    pub id_token: Option<String>,
    pub scopes: ScopeSet,
    pub expires_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl AuthenticationResult {
    pub fn from_cache_entry(account: Account, entry: &TokenCacheEntry) -> Self {
        Self {
            account,
            access_token: entry.access_token.clone(),
            id_token: entry.id_token.clone(),
            scopes: entry.scopes.clone(),
            expires_at: entry.expires_at,
            from_cache: true,
        }
    }

    /// Format expiration time as human-readable string
    pub fn expiration_display(&self) -> String {
        crate::expiry::format_time_remaining(&self.expires_at)
    }
}
