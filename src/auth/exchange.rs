use crate::config::ClientConfig;
use crate::error::{AuthError, Result};
use crate::models::TokenResponse;
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// Authorization code plus the PKCE verifier that proves the request came from us
#[derive(Debug, Clone, PartialEq)]
pub struct CodeExchangeRequest {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Back-channel calls to the provider's token endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange_code(&self, request: &CodeExchangeRequest) -> Result<TokenResponse>;

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenResponse>;
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Form-encoded token endpoint client
pub struct HttpTokenExchange {
    http: reqwest::Client,
    token_endpoint: Url,
    client_id: String,
}

impl HttpTokenExchange {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            token_endpoint: config.token_endpoint()?,
            client_id: config.client_id.clone(),
        })
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let grant = params
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| *v)
            .unwrap_or("unknown");
        tracing::debug!("POST {} (grant_type={})", self.token_endpoint, grant);

        let response = self
            .http
            .post(self.token_endpoint.clone())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(oauth_error) = serde_json::from_str::<OAuthErrorBody>(&body) {
                return Err(AuthError::Provider {
                    error: oauth_error.error,
                    description: oauth_error.error_description,
                });
            }
            return Err(AuthError::TokenExchange(format!("HTTP {}: {}", status, body)));
        }

        let tokens: TokenResponse = response.json().await?;
        tracing::debug!("Token endpoint returned token (expires_in={:?})", tokens.expires_in);
        Ok(tokens)
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange_code(&self, request: &CodeExchangeRequest) -> Result<TokenResponse> {
        let scope = request.scopes.join(" ");
        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("code", request.code.as_str()),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("code_verifier", request.code_verifier.as_str()),
            ("scope", scope.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenResponse> {
        let scope = scopes.join(" ");
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ])
        .await
    }
}
