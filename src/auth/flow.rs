// Shared plumbing for the redirect and popup controllers
use super::exchange::{CodeExchangeRequest, TokenExchange};
use super::id_token::IdTokenClaims;
use super::pkce::PkceChallenge;
use super::request::{AuthorizationRequestBuilder, AuthorizationResponse, AuthorizationUrl};
use super::token_cache::TokenCache;
use crate::accounts::AccountStateManager;
use crate::config::ClientConfig;
use crate::error::{AuthError, Result};
use crate::events::EventBroadcaster;
use crate::models::{
    Account, AuthenticationResult, InteractionStatus, LoginRequest, PendingAuthorizationRequest,
    ScopeSet, TokenCacheEntry, TokenResponse,
};
use crate::session::SessionState;
use chrono::Utc;
use std::sync::Arc;

/// Long-lived objects every controller works against
#[derive(Clone)]
pub struct FlowContext {
    pub config: Arc<ClientConfig>,
    pub session: Arc<SessionState>,
    pub accounts: Arc<AccountStateManager>,
    pub cache: Arc<TokenCache>,
    pub events: Arc<EventBroadcaster>,
    pub exchange: Arc<dyn TokenExchange>,
}

impl FlowContext {
    /// Request scopes, or the configured defaults when the request names none
    pub fn effective_scopes(&self, request: &LoginRequest) -> Vec<String> {
        if request.scopes.is_empty() {
            self.config.scopes.clone()
        } else {
            request.scopes.clone()
        }
    }

    /// Build an authorization URL and the record needed to redeem its response
    pub fn prepare(
        &self,
        request: &LoginRequest,
        interaction: InteractionStatus,
    ) -> Result<(AuthorizationUrl, PendingAuthorizationRequest)> {
        let pkce = PkceChallenge::generate();
        let authorization = AuthorizationRequestBuilder::build(
            &self.config,
            &pkce,
            &self.effective_scopes(request),
            &request.query_parameters(),
        )?;

        let pending = PendingAuthorizationRequest {
            state: authorization.state.clone(),
            nonce: authorization.nonce.clone(),
            code_verifier: pkce.verifier,
            scopes: authorization.scopes.clone(),
            redirect_uri: self.config.redirect_uri.to_string(),
            interaction,
            created_at: Utc::now(),
        };
        Ok((authorization, pending))
    }

    /// Redeem a matched authorization response: exchange the code, validate the
    /// id token, record the account and token, and make the account active
    pub async fn complete(
        &self,
        pending: &PendingAuthorizationRequest,
        response: AuthorizationResponse,
    ) -> Result<AuthenticationResult> {
        let code = response.into_code()?;
        let tokens = self
            .exchange
            .exchange_code(&CodeExchangeRequest {
                code,
                code_verifier: pending.code_verifier.clone(),
                redirect_uri: pending.redirect_uri.clone(),
                scopes: pending.scopes.clone(),
            })
            .await?;

        let id_token = tokens.id_token.as_deref().ok_or_else(|| {
            AuthError::InvalidIdToken("token response carries no id_token".to_string())
        })?;
        let claims = IdTokenClaims::decode(id_token)?;
        claims.validate(
            &pending.nonce,
            &self.config.client_id,
            self.config.clock_skew_seconds,
        )?;

        let requested: ScopeSet = pending.scopes.iter().collect();
        let entry = self.token_entry(&claims.home_account_id(), &tokens, &requested, None)?;
        let (account, _) = self
            .accounts
            .upsert_from_claims(&claims, &self.config.environment())?;
        self.cache.store(entry.clone())?;
        let account = self.accounts.set_active_account(&account.home_account_id)?;

        Ok(result_from(account, &entry))
    }

    /// Cache entry for a token response. `previous_refresh_token` is kept
    /// when the response does not rotate it.
    pub fn token_entry(
        &self,
        account_id: &str,
        tokens: &TokenResponse,
        requested: &ScopeSet,
        previous_refresh_token: Option<String>,
    ) -> Result<TokenCacheEntry> {
        Ok(TokenCacheEntry {
            home_account_id: account_id.to_string(),
            authority: self.config.authority_key(),
            scopes: tokens.granted_scopes(requested),
            access_token: tokens.access_token.clone(),
            id_token: tokens.id_token.clone(),
            expires_at: tokens.expires_at()?,
            refresh_token: tokens.refresh_token.clone().or(previous_refresh_token),
        })
    }
}

pub fn result_from(account: Account, entry: &TokenCacheEntry) -> AuthenticationResult {
    AuthenticationResult {
        from_cache: false,
        ..AuthenticationResult::from_cache_entry(account, entry)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::auth::exchange::MockTokenExchange;
    use crate::auth::id_token::encode_unsigned;
    use serde_json::json;
    use std::sync::Mutex;
    use url::Url;

    pub const CLIENT_ID: &str = "client-123";

    pub fn client_config() -> ClientConfig {
        ClientConfig::new(
            CLIENT_ID,
            "https://login.example.com/tenant",
            "http://localhost:4200/auth",
        )
        .unwrap()
    }

    pub fn query_param(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn tokens(sub: &str, nonce: &str) -> TokenResponse {
        TokenResponse {
            access_token: format!("at-{}", sub),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            refresh_token: Some(format!("rt-{}", sub)),
            id_token: Some(encode_unsigned(&json!({
                "sub": sub,
                "aud": CLIENT_ID,
                "nonce": nonce,
                "preferred_username": format!("{}@example.com", sub),
                "exp": Utc::now().timestamp() + 3600
            }))),
            scope: Some("api.read".to_string()),
        }
    }

    /// Answers every code with tokens for `sub` carrying whatever nonce the
    /// test last wrote into `nonce`
    pub fn exchange_echoing(sub: &str, nonce: Arc<Mutex<String>>) -> MockTokenExchange {
        let sub = sub.to_string();
        let mut exchange = MockTokenExchange::new();
        exchange
            .expect_exchange_code()
            .returning(move |_| Ok(tokens(&sub, &nonce.lock().unwrap())));
        exchange
    }

    pub fn context(config: ClientConfig, exchange: impl TokenExchange + 'static) -> FlowContext {
        let events = Arc::new(EventBroadcaster::new());
        FlowContext {
            config: Arc::new(config),
            session: Arc::new(SessionState::new(Arc::clone(&events))),
            accounts: Arc::new(AccountStateManager::new(Arc::clone(&events))),
            cache: Arc::new(TokenCache::in_memory(300)),
            events,
            exchange: Arc::new(exchange),
        }
    }
}
