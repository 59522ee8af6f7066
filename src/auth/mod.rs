// Authorization code + PKCE client
pub mod exchange;
mod flow;
pub mod id_token;
mod loopback;
pub mod pkce;
mod popup;
mod redirect;
pub mod request;
mod token_cache;

pub use exchange::{CodeExchangeRequest, HttpTokenExchange, TokenExchange};
pub use flow::FlowContext;
pub use id_token::IdTokenClaims;
pub use loopback::LoopbackPopupHost;
pub use pkce::PkceChallenge;
pub use popup::{PopupCancelHandle, PopupFlowController, PopupHost, PopupWindow};
pub use redirect::{BrowserNavigator, Navigator, RedirectFlowController, RedirectOutcome};
pub use request::{AuthorizationRequestBuilder, AuthorizationResponse, AuthorizationUrl};
pub use token_cache::TokenCache;

use crate::accounts::AccountStateManager;
use crate::config::{CacheLocation, ClientConfig};
use crate::error::{AuthError, Result};
use crate::events::{EventBroadcaster, EventPayload, EventType, SubscriptionId};
use crate::models::{
    Account, AuthenticationResult, InteractionStatus, InteractionType, LoginRequest,
    PendingAuthorizationRequest, ScopeSet, TokenCacheEntry,
};
use crate::session::SessionState;
use crate::storage::Storage;
use std::sync::Arc;
use url::Url;

/// Provider error codes that mean a refresh token can no longer be used silently
const INTERACTION_REQUIRED_ERRORS: [&str; 4] = [
    "invalid_grant",
    "interaction_required",
    "login_required",
    "consent_required",
];

/// High-level authentication interface
pub struct AuthClient {
    ctx: FlowContext,
    redirect: RedirectFlowController,
    popup: PopupFlowController,
    navigator: Arc<dyn Navigator>,
    settle_subscription: SubscriptionId,
}

impl AuthClient {
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn Storage>,
        exchange: Arc<dyn TokenExchange>,
        navigator: Arc<dyn Navigator>,
        popup_host: Arc<dyn PopupHost>,
    ) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBroadcaster::new());
        let session = Arc::new(SessionState::new(Arc::clone(&events)));
        let (accounts, cache) = match config.cache_location {
            CacheLocation::Storage => (
                AccountStateManager::with_storage(
                    Arc::clone(&events),
                    Arc::clone(&storage),
                    config.storage_key("accounts"),
                )?,
                TokenCache::with_storage(
                    config.clock_skew_seconds,
                    Arc::clone(&storage),
                    config.storage_key("tokens"),
                )?,
            ),
            CacheLocation::Memory => (
                AccountStateManager::new(Arc::clone(&events)),
                TokenCache::in_memory(config.clock_skew_seconds),
            ),
        };
        let accounts = Arc::new(accounts);

        // Interactions returning to idle are settle points for the active account
        let weak_accounts = Arc::downgrade(&accounts);
        let settle_subscription = events.subscribe(move |event| {
            if let EventPayload::Status(InteractionStatus::None) = event.payload {
                if let Some(accounts) = weak_accounts.upgrade() {
                    accounts.settle();
                }
            }
        });
        accounts.settle();

        let ctx = FlowContext {
            config: Arc::new(config),
            session,
            accounts,
            cache: Arc::new(cache),
            events,
            exchange,
        };

        Ok(Self {
            redirect: RedirectFlowController::new(ctx.clone(), storage, Arc::clone(&navigator)),
            popup: PopupFlowController::new(ctx.clone(), popup_host),
            ctx,
            navigator,
            settle_subscription,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.ctx.events
    }

    pub fn interaction_status(&self) -> InteractionStatus {
        self.ctx.session.status()
    }

    /// Start a redirect login; returns the URL the user agent was sent to
    pub fn login_redirect(&self, request: &LoginRequest) -> Result<Url> {
        self.redirect.start_login(request)
    }

    pub async fn handle_redirect_return(&self, current_url: &Url) -> Result<RedirectOutcome> {
        self.redirect.handle_return(current_url).await
    }

    pub fn pending_request(&self) -> Result<Option<PendingAuthorizationRequest>> {
        self.redirect.pending_request()
    }

    pub async fn login_popup(&self, request: &LoginRequest) -> Result<AuthenticationResult> {
        self.reclaim_abandoned_redirect();
        self.popup.start_login(request).await
    }

    pub async fn acquire_token_popup(&self, request: &LoginRequest) -> Result<AuthenticationResult> {
        self.reclaim_abandoned_redirect();
        self.popup.acquire_token(request).await
    }

    /// A redirect login the user walked away from must not block other interactions
    fn reclaim_abandoned_redirect(&self) {
        if let Err(e) = self.redirect.release_abandoned() {
            tracing::warn!("Could not inspect pending redirect request: {}", e);
        }
    }

    pub fn popup_cancel_handle(&self) -> PopupCancelHandle {
        self.popup.cancel_handle()
    }

    /// Return a cached token covering `scopes`, refreshing it when possible.
    /// Never opens a window; fails with `InteractionRequired` instead.
    pub async fn acquire_token_silent(
        &self,
        scopes: &[String],
        account_id: Option<&str>,
    ) -> Result<AuthenticationResult> {
        let account = self.resolve_account(account_id)?;
        self.ctx
            .events
            .emit_simple(EventType::AcquireTokenStart, Some(InteractionType::Silent));

        let result = self.silent(account, scopes).await;
        match &result {
            Ok(auth) => self.ctx.events.emit_result(
                EventType::AcquireTokenSuccess,
                InteractionType::Silent,
                auth.clone(),
            ),
            Err(e) => {
                tracing::debug!("Silent acquisition failed: {}", e);
                self.ctx.events.emit_error(
                    EventType::AcquireTokenFailure,
                    InteractionType::Silent,
                    e,
                )
            }
        }
        result
    }

    async fn silent(&self, account: Account, scopes: &[String]) -> Result<AuthenticationResult> {
        let requested = if scopes.is_empty() {
            self.ctx.config.scopes.clone()
        } else {
            scopes.to_vec()
        };
        let required: ScopeSet = requested.iter().collect();
        let authority = self.ctx.config.authority_key();

        if let Some(entry) = self
            .ctx
            .cache
            .lookup(&account.home_account_id, &authority, &required)
        {
            return Ok(AuthenticationResult::from_cache_entry(account, &entry));
        }

        let refresh_token = self
            .ctx
            .cache
            .refresh_token_for(&account.home_account_id, &authority)
            .ok_or_else(|| {
                AuthError::InteractionRequired(format!(
                    "no refresh token cached for {}",
                    account.username
                ))
            })?;

        tracing::info!("Refreshing access token for {}", account.username);
        let tokens = self
            .ctx
            .exchange
            .refresh(&refresh_token, &request::merge_scopes(&requested))
            .await
            .map_err(|e| match e {
                AuthError::Provider { error, description }
                    if INTERACTION_REQUIRED_ERRORS.contains(&error.as_str()) =>
                {
                    AuthError::InteractionRequired(description.unwrap_or(error))
                }
                other => other,
            })?;

        let entry = self.ctx.token_entry(
            &account.home_account_id,
            &tokens,
            &required,
            Some(refresh_token),
        )?;
        let account = match tokens.id_token.as_deref() {
            Some(id_token) => {
                let claims = IdTokenClaims::decode(id_token)?;
                if claims.home_account_id() != account.home_account_id {
                    return Err(AuthError::InvalidIdToken(
                        "refreshed id token names a different account".to_string(),
                    ));
                }
                self.ctx
                    .accounts
                    .upsert_from_claims(&claims, &self.ctx.config.environment())?
                    .0
            }
            None => account,
        };

        self.ctx.cache.store(entry.clone())?;
        Ok(flow::result_from(account, &entry))
    }

    /// Forget an account locally and build the provider's end-session URL.
    /// Defaults to the active account.
    pub fn logout(&self, account_id: Option<&str>) -> Result<Url> {
        self.reclaim_abandoned_redirect();
        let guard = self.ctx.session.begin(InteractionStatus::Logout)?;
        self.ctx
            .events
            .emit_simple(EventType::LogoutStart, Some(InteractionType::Redirect));

        let result = self.sign_out(account_id);
        match &result {
            Ok(_) => self
                .ctx
                .events
                .emit_simple(EventType::LogoutSuccess, Some(InteractionType::Redirect)),
            Err(e) => {
                tracing::error!("Logout failed: {}", e);
                self.ctx
                    .events
                    .emit_error(EventType::LogoutFailure, InteractionType::Redirect, e)
            }
        }
        drop(guard);
        result
    }

    fn sign_out(&self, account_id: Option<&str>) -> Result<Url> {
        let url = self.forget_signed_in(account_id)?;
        self.navigator.navigate(&url)?;
        Ok(url)
    }

    /// Sign out through a popup showing the provider's end-session page.
    /// The account is forgotten locally before the popup opens. Closing the
    /// popup counts as done. `main_window_redirect_uri`, when given, is
    /// navigated to afterwards.
    pub async fn logout_popup(
        &self,
        account_id: Option<&str>,
        main_window_redirect_uri: Option<&Url>,
    ) -> Result<Url> {
        self.reclaim_abandoned_redirect();
        let guard = self.ctx.session.begin(InteractionStatus::Logout)?;
        self.ctx
            .events
            .emit_simple(EventType::LogoutStart, Some(InteractionType::Popup));

        let result = self.sign_out_popup(account_id, main_window_redirect_uri).await;
        match &result {
            Ok(_) => self
                .ctx
                .events
                .emit_simple(EventType::LogoutSuccess, Some(InteractionType::Popup)),
            Err(e) => {
                tracing::error!("Popup logout failed: {}", e);
                self.ctx
                    .events
                    .emit_error(EventType::LogoutFailure, InteractionType::Popup, e)
            }
        }
        drop(guard);
        result
    }

    async fn sign_out_popup(
        &self,
        account_id: Option<&str>,
        main_window_redirect_uri: Option<&Url>,
    ) -> Result<Url> {
        let url = self.forget_signed_in(account_id)?;
        self.popup
            .end_session(&url, self.ctx.config.post_logout_landing())
            .await?;
        if let Some(target) = main_window_redirect_uri {
            self.navigator.navigate(target)?;
        }
        Ok(url)
    }

    /// Drop the account and its tokens, returning the end-session URL
    fn forget_signed_in(&self, account_id: Option<&str>) -> Result<Url> {
        let account = self.resolve_account(account_id)?;
        let id_token_hint = self.ctx.cache.id_token_for(&account.home_account_id);

        let removed = self.ctx.cache.remove_account(&account.home_account_id)?;
        tracing::debug!("Dropped {} cached token(s)", removed);
        self.ctx.accounts.remove_account(&account.home_account_id)?;

        let url = request::build_logout_url(&self.ctx.config, id_token_hint.as_deref())?;
        tracing::info!("Signed out {}", account.username);
        Ok(url)
    }

    fn resolve_account(&self, account_id: Option<&str>) -> Result<Account> {
        match account_id {
            Some(id) => self
                .ctx
                .accounts
                .account(id)
                .ok_or_else(|| AuthError::UnknownAccount(id.to_string())),
            None => self
                .ctx
                .accounts
                .active_account()
                .ok_or(AuthError::NoActiveAccount),
        }
    }

    pub fn all_accounts(&self) -> Vec<Account> {
        self.ctx.accounts.all_accounts()
    }

    pub fn active_account(&self) -> Option<Account> {
        self.ctx.accounts.active_account()
    }

    pub fn set_active_account(&self, account_id: &str) -> Result<Account> {
        self.ctx.accounts.set_active_account(account_id)
    }

    /// Forget an account and its tokens without contacting the provider
    pub fn remove_account(&self, account_id: &str) -> Result<Account> {
        self.ctx.cache.remove_account(account_id)?;
        self.ctx.accounts.remove_account(account_id)
    }

    pub fn cached_tokens(&self) -> Vec<TokenCacheEntry> {
        self.ctx.cache.entries()
    }
}

impl Drop for AuthClient {
    fn drop(&mut self) {
        self.ctx.events.unsubscribe(self.settle_subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::flow::test_support::*;
    use super::*;
    use crate::auth::exchange::MockTokenExchange;
    use crate::auth::popup::MockPopupHost;
    use crate::auth::redirect::MockNavigator;
    use crate::events::test_support::record;
    use crate::models::TokenResponse;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;

    fn navigator() -> Arc<dyn Navigator> {
        let mut navigator = MockNavigator::new();
        navigator.expect_navigate().returning(|_| Ok(()));
        Arc::new(navigator)
    }

    fn client_with(exchange: MockTokenExchange, storage: Arc<dyn Storage>) -> AuthClient {
        AuthClient::new(
            client_config(),
            storage,
            Arc::new(exchange),
            navigator(),
            Arc::new(MockPopupHost::new()),
        )
        .unwrap()
    }

    /// Log `sub` in through the redirect flow
    async fn redirect_login(client: &AuthClient, nonce: &Mutex<String>, scopes: &[&str]) -> AuthenticationResult {
        let url = client
            .login_redirect(&LoginRequest::with_scopes(scopes.iter().copied()))
            .unwrap();
        *nonce.lock().unwrap() = query_param(&url, "nonce").unwrap();
        let state = query_param(&url, "state").unwrap();
        let back = Url::parse(&format!("http://localhost:4200/auth?code=c&state={}", state)).unwrap();
        match client.handle_redirect_return(&back).await.unwrap() {
            RedirectOutcome::Completed(result) => result,
            RedirectOutcome::NoOp => panic!("login did not complete"),
        }
    }

    #[tokio::test]
    async fn test_redirect_login_end_to_end() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let client = client_with(
            exchange_echoing("u1", Arc::clone(&nonce)),
            Arc::new(MemoryStorage::new()),
        );
        let seen = record(client.events());

        let result = redirect_login(&client, &nonce, &["api.read"]).await;
        assert_eq!(result.account.username, "u1@example.com");
        assert!(seen.lock().unwrap().contains(&EventType::LoginSuccess));
        assert_eq!(client.cached_tokens().len(), 1);
        assert_eq!(client.all_accounts().len(), 1);
        assert_eq!(client.active_account().unwrap().home_account_id, "u1");
        assert_eq!(client.interaction_status(), InteractionStatus::None);
    }

    #[tokio::test]
    async fn test_silent_acquisition_hits_cache() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let mut exchange = exchange_echoing("u1", Arc::clone(&nonce));
        exchange.expect_refresh().never();
        let client = client_with(exchange, Arc::new(MemoryStorage::new()));
        redirect_login(&client, &nonce, &["api.read"]).await;

        let result = client
            .acquire_token_silent(&["API.Read".to_string()], None)
            .await
            .unwrap();
        assert!(result.from_cache);
        assert_eq!(result.access_token, "at-u1");
    }

    #[tokio::test]
    async fn test_silent_acquisition_refreshes_on_miss() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let mut exchange = exchange_echoing("u1", Arc::clone(&nonce));
        exchange
            .expect_refresh()
            .withf(|rt, _| rt.to_string() == "rt-u1")
            .times(1)
            .returning(|_, _| {
                Ok(TokenResponse {
                    access_token: "at-mail".to_string(),
                    token_type: "Bearer".to_string(),
                    expires_in: Some(3600),
                    refresh_token: None,
                    id_token: None,
                    scope: Some("mail.read".to_string()),
                })
            });
        let client = client_with(exchange, Arc::new(MemoryStorage::new()));
        redirect_login(&client, &nonce, &["api.read"]).await;

        let result = client
            .acquire_token_silent(&["mail.read".to_string()], None)
            .await
            .unwrap();
        assert!(!result.from_cache);
        assert_eq!(result.access_token, "at-mail");
        assert_eq!(client.cached_tokens().len(), 2);
        let authority = client.config().authority_key();
        assert_eq!(
            client.ctx.cache.refresh_token_for("u1", &authority).as_deref(),
            Some("rt-u1")
        );
    }

    #[tokio::test]
    async fn test_silent_acquisition_without_account_or_refresh_token() {
        let client = client_with(MockTokenExchange::new(), Arc::new(MemoryStorage::new()));
        assert!(matches!(
            client.acquire_token_silent(&[], None).await,
            Err(AuthError::NoActiveAccount)
        ));
        assert!(matches!(
            client.acquire_token_silent(&[], Some("ghost")).await,
            Err(AuthError::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_refresh_requires_interaction() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let mut exchange = exchange_echoing("u1", Arc::clone(&nonce));
        exchange.expect_refresh().returning(|_, _| {
            Err(AuthError::Provider {
                error: "invalid_grant".to_string(),
                description: Some("refresh token revoked".to_string()),
            })
        });
        let client = client_with(exchange, Arc::new(MemoryStorage::new()));
        redirect_login(&client, &nonce, &["api.read"]).await;
        let seen = record(client.events());

        let err = client
            .acquire_token_silent(&["mail.read".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InteractionRequired(_)));
        assert!(err.is_recoverable());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventType::AcquireTokenStart, EventType::AcquireTokenFailure]
        );
    }

    #[tokio::test]
    async fn test_logout_clears_account_and_tokens() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let client = client_with(
            exchange_echoing("u1", Arc::clone(&nonce)),
            Arc::new(MemoryStorage::new()),
        );
        redirect_login(&client, &nonce, &["api.read"]).await;
        let seen = record(client.events());

        let url = client.logout(None).unwrap();
        assert_eq!(url.path(), "/tenant/logout");
        assert!(query_param(&url, "id_token_hint").is_some());
        assert!(client.all_accounts().is_empty());
        assert!(client.cached_tokens().is_empty());
        assert!(client.active_account().is_none());

        let seen = seen.lock().unwrap();
        let start = seen.iter().position(|e| *e == EventType::LogoutStart).unwrap();
        let removed = seen.iter().position(|e| *e == EventType::AccountRemoved).unwrap();
        let success = seen.iter().position(|e| *e == EventType::LogoutSuccess).unwrap();
        assert!(start < removed && removed < success);
    }

    #[tokio::test]
    async fn test_logout_leaves_remaining_account_unselected() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let client = client_with(
            exchange_echoing("u1", Arc::clone(&nonce)),
            Arc::new(MemoryStorage::new()),
        );
        redirect_login(&client, &nonce, &["api.read"]).await;
        client
            .ctx
            .accounts
            .upsert_account(&tokens("u2", "n"), "login.example.com")
            .unwrap();

        client.logout(None).unwrap();
        assert_eq!(client.interaction_status(), InteractionStatus::None);
        assert_eq!(client.all_accounts().len(), 1);
        assert!(client.active_account().is_none());

        client.set_active_account("u2").unwrap();
        assert_eq!(client.active_account().unwrap().home_account_id, "u2");
    }

    /// Lands on `location` the first time it is polled
    struct LandingWindow {
        location: Option<Url>,
        closed: bool,
    }

    impl PopupWindow for LandingWindow {
        fn location(&mut self) -> Option<Url> {
            self.location.take()
        }

        fn is_closed(&mut self) -> bool {
            self.closed
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[tokio::test]
    async fn test_popup_logout_signs_out_and_returns_main_window() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let opened: Arc<Mutex<Vec<Url>>> = Arc::new(Mutex::new(Vec::new()));
        let navigated: Arc<Mutex<Vec<Url>>> = Arc::new(Mutex::new(Vec::new()));

        let mut host = MockPopupHost::new();
        let sink = Arc::clone(&opened);
        host.expect_open().times(1).returning(move |url| {
            sink.lock().unwrap().push(url.clone());
            let window: Box<dyn PopupWindow> = Box::new(LandingWindow {
                location: Url::parse("http://localhost:4200/auth").ok(),
                closed: false,
            });
            Ok(window)
        });
        let mut navigator = MockNavigator::new();
        let sink = Arc::clone(&navigated);
        navigator.expect_navigate().returning(move |url| {
            sink.lock().unwrap().push(url.clone());
            Ok(())
        });

        let client = AuthClient::new(
            client_config(),
            Arc::new(MemoryStorage::new()),
            Arc::new(exchange_echoing("u1", Arc::clone(&nonce))),
            Arc::new(navigator),
            Arc::new(host),
        )
        .unwrap();
        redirect_login(&client, &nonce, &["api.read"]).await;
        let seen = record(client.events());

        let home = Url::parse("http://localhost:4200/").unwrap();
        let url = client.logout_popup(None, Some(&home)).await.unwrap();

        assert_eq!(url.path(), "/tenant/logout");
        assert_eq!(opened.lock().unwrap().as_slice(), &[url.clone()]);
        assert_eq!(navigated.lock().unwrap().last(), Some(&home));
        assert!(client.all_accounts().is_empty());
        assert!(client.cached_tokens().is_empty());
        assert_eq!(client.interaction_status(), InteractionStatus::None);

        let seen = seen.lock().unwrap();
        let start = seen.iter().position(|e| *e == EventType::LogoutStart).unwrap();
        let success = seen.iter().position(|e| *e == EventType::LogoutSuccess).unwrap();
        assert!(start < success);
        assert!(!seen.contains(&EventType::LogoutFailure));
    }

    #[tokio::test]
    async fn test_popup_logout_without_account_fails_before_opening() {
        let mut host = MockPopupHost::new();
        host.expect_open().never();
        let client = AuthClient::new(
            client_config(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MockTokenExchange::new()),
            navigator(),
            Arc::new(host),
        )
        .unwrap();
        let seen = record(client.events());

        assert!(matches!(
            client.logout_popup(None, None).await,
            Err(AuthError::NoActiveAccount)
        ));
        assert!(seen.lock().unwrap().contains(&EventType::LogoutFailure));
        assert_eq!(client.interaction_status(), InteractionStatus::None);
    }

    #[tokio::test]
    async fn test_settle_promotes_single_persisted_account() {
        let nonce = Arc::new(Mutex::new(String::new()));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let client = client_with(exchange_echoing("u1", Arc::clone(&nonce)), Arc::clone(&storage));
            redirect_login(&client, &nonce, &["api.read"]).await;
            client.ctx.accounts.clear_active_account().unwrap();
        }

        let client = client_with(MockTokenExchange::new(), storage);
        assert_eq!(client.active_account().unwrap().home_account_id, "u1");
        let result = client
            .acquire_token_silent(&["api.read".to_string()], None)
            .await
            .unwrap();
        assert!(result.from_cache);
    }

    #[tokio::test]
    async fn test_expired_redirect_login_does_not_block_logout() {
        let storage = Arc::new(MemoryStorage::new());
        let client = client_with(MockTokenExchange::new(), Arc::clone(&storage) as Arc<dyn Storage>);
        client.login_redirect(&LoginRequest::default()).unwrap();

        let mut pending = client.pending_request().unwrap().unwrap();
        pending.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        let key = client.config().storage_key("request.pending");
        crate::storage::write_json(storage.as_ref(), &key, &pending).unwrap();

        assert!(matches!(client.logout(None), Err(AuthError::NoActiveAccount)));
        assert_eq!(client.interaction_status(), InteractionStatus::None);
        assert!(client.pending_request().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interactions_are_exclusive_across_flows() {
        let client = client_with(MockTokenExchange::new(), Arc::new(MemoryStorage::new()));
        client.login_redirect(&LoginRequest::default()).unwrap();

        assert!(matches!(
            client.logout(None),
            Err(AuthError::ConcurrentInteraction { .. })
        ));
        assert!(matches!(
            client.acquire_token_popup(&LoginRequest::default()).await,
            Err(AuthError::ConcurrentInteraction {
                in_progress: InteractionStatus::Login
            })
        ));
    }
}
