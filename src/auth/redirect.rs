// Full-page redirect login
use super::flow::FlowContext;
use super::request::parse_authorization_response;
use crate::error::{AuthError, Result};
use crate::events::EventType;
use crate::models::{
    AuthenticationResult, InteractionStatus, InteractionType, LoginRequest,
    PendingAuthorizationRequest,
};
use crate::storage::{self, Storage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// Sends the user agent to a URL
#[cfg_attr(test, mockall::automock)]
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url) -> Result<()>;
}

/// Opens URLs in the system browser, or only prints them in headless mode
pub struct BrowserNavigator {
    open_browser: bool,
}

impl BrowserNavigator {
    pub fn new(open_browser: bool) -> Self {
        Self { open_browser }
    }
}

impl Navigator for BrowserNavigator {
    fn navigate(&self, url: &Url) -> Result<()> {
        if !self.open_browser {
            eprintln!("Open this URL in a browser to continue:");
            eprintln!("  {}\n", url);
            return Ok(());
        }

        eprintln!("Opening browser to: {}", url);
        eprintln!("\nIf browser doesn't open automatically, visit:");
        eprintln!("  {}\n", url);
        webbrowser::open(url.as_str()).map_err(|e| AuthError::BrowserLaunchFailed(e.to_string()))
    }
}

#[derive(Debug)]
pub enum RedirectOutcome {
    /// The URL was not a response to a request issued here
    NoOp,
    Completed(AuthenticationResult),
}

pub struct RedirectFlowController {
    ctx: FlowContext,
    storage: Arc<dyn Storage>,
    navigator: Arc<dyn Navigator>,
    pending_key: String,
    /// Set while this controller holds the `Login` slot across navigation
    awaiting_return: AtomicBool,
}

impl RedirectFlowController {
    pub fn new(ctx: FlowContext, storage: Arc<dyn Storage>, navigator: Arc<dyn Navigator>) -> Self {
        let pending_key = ctx.config.storage_key("request.pending");
        Self {
            ctx,
            storage,
            navigator,
            pending_key,
            awaiting_return: AtomicBool::new(false),
        }
    }

    /// Persist a pending request and navigate to the provider.
    /// The interaction status stays `Login` until the return is handled.
    pub fn start_login(&self, request: &LoginRequest) -> Result<Url> {
        self.release_abandoned()?;
        let guard = self.ctx.session.begin(InteractionStatus::Login)?;
        self.ctx
            .events
            .emit_simple(EventType::LoginStart, Some(InteractionType::Redirect));

        match self.navigate_to_provider(request) {
            Ok(url) => {
                guard.keep();
                self.awaiting_return.store(true, Ordering::SeqCst);
                Ok(url)
            }
            Err(e) => {
                tracing::error!("Redirect login could not start: {}", e);
                if let Err(cleanup) = self.storage.remove(&self.pending_key) {
                    tracing::warn!("Failed to discard pending request: {}", cleanup);
                }
                self.ctx
                    .events
                    .emit_error(EventType::LoginFailure, InteractionType::Redirect, &e);
                Err(e)
            }
        }
    }

    fn navigate_to_provider(&self, request: &LoginRequest) -> Result<Url> {
        let (authorization, pending) = self.ctx.prepare(request, InteractionStatus::Login)?;
        storage::write_json(self.storage.as_ref(), &self.pending_key, &pending)?;
        tracing::info!("Redirecting to {} for login", self.ctx.config.environment());
        self.navigator.navigate(&authorization.url)?;
        Ok(authorization.url)
    }

    /// The request awaiting a response, if one was issued and not yet consumed
    pub fn pending_request(&self) -> Result<Option<PendingAuthorizationRequest>> {
        storage::read_json(self.storage.as_ref(), &self.pending_key)
    }

    /// Free the `Login` slot held for a redirect whose pending request is gone,
    /// unreadable or past its TTL. Returns whether the slot was released.
    pub fn release_abandoned(&self) -> Result<bool> {
        if !self.awaiting_return.load(Ordering::SeqCst)
            || self.ctx.session.status() != InteractionStatus::Login
        {
            return Ok(false);
        }

        let abandoned = match self.pending_request() {
            Ok(Some(pending)) => pending.is_expired(self.ctx.config.pending_request_ttl_seconds),
            Ok(None) | Err(AuthError::Json(_)) => true,
            Err(e) => return Err(e),
        };
        if !abandoned {
            return Ok(false);
        }

        tracing::warn!("Releasing redirect login that never returned");
        self.storage.remove(&self.pending_key)?;
        self.release_slot();
        Ok(true)
    }

    fn release_slot(&self) {
        if self.awaiting_return.swap(false, Ordering::SeqCst)
            && self.ctx.session.status() == InteractionStatus::Login
        {
            self.ctx.session.finish();
        }
    }

    /// Process the URL the user agent returned to. Anything that is not a
    /// response to the pending request leaves state untouched.
    pub async fn handle_return(&self, current_url: &Url) -> Result<RedirectOutcome> {
        self.release_abandoned()?;
        let Some(response) = parse_authorization_response(current_url) else {
            tracing::debug!("No authorization response in {}", current_url.path());
            return Ok(RedirectOutcome::NoOp);
        };

        let pending = match self.pending_request() {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                tracing::debug!("Authorization response arrived with no pending request");
                return Ok(RedirectOutcome::NoOp);
            }
            Err(AuthError::Json(e)) => {
                tracing::warn!("Discarding unreadable pending request: {}", e);
                self.storage.remove(&self.pending_key)?;
                self.release_slot();
                return Ok(RedirectOutcome::NoOp);
            }
            Err(e) => return Err(e),
        };

        if pending.is_expired(self.ctx.config.pending_request_ttl_seconds) {
            tracing::warn!("Pending request from {} has expired", pending.created_at);
            self.storage.remove(&self.pending_key)?;
            self.release_slot();
            return Ok(RedirectOutcome::NoOp);
        }
        if response.state.as_deref() != Some(pending.state.as_str()) {
            tracing::warn!("Ignoring authorization response with unknown state");
            return Ok(RedirectOutcome::NoOp);
        }

        let guard = self.ctx.session.begin_redirect_return()?;
        self.awaiting_return.store(false, Ordering::SeqCst);
        // consumed before redeeming so a replayed URL cannot reuse it
        let result = match self.storage.remove(&self.pending_key) {
            Ok(()) => self.ctx.complete(&pending, response).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(auth) => {
                tracing::info!("Logged in as {}", auth.account.username);
                self.ctx.events.emit_result(
                    EventType::LoginSuccess,
                    InteractionType::Redirect,
                    auth.clone(),
                );
            }
            Err(e) => {
                tracing::error!("Redirect login failed: {}", e);
                self.ctx
                    .events
                    .emit_error(EventType::LoginFailure, InteractionType::Redirect, e);
            }
        }
        drop(guard);

        result.map(RedirectOutcome::Completed)
    }
}
