// Popup login and token acquisition
use super::flow::FlowContext;
use super::request::{is_redirect_landing, parse_authorization_response};
use crate::error::{AuthError, Result};
use crate::events::EventType;
use crate::models::{AuthenticationResult, InteractionStatus, InteractionType, LoginRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use url::Url;

/// A secondary window showing the provider's sign-in page
pub trait PopupWindow: Send {
    /// Current location, or `None` while it is not readable (still on the provider)
    fn location(&mut self) -> Option<Url>;
    fn is_closed(&mut self) -> bool;
    fn close(&mut self);
}

/// Opens popup windows
#[cfg_attr(test, mockall::automock)]
pub trait PopupHost: Send + Sync {
    fn open(&self, url: &Url) -> Result<Box<dyn PopupWindow>>;
}

/// Aborts the popup interaction currently being monitored
#[derive(Debug, Clone, Default)]
pub struct PopupCancelHandle(Arc<AtomicBool>);

impl PopupCancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum PopupExit {
    Landed(Url),
    Closed,
}

pub struct PopupFlowController {
    ctx: FlowContext,
    host: Arc<dyn PopupHost>,
    cancel: PopupCancelHandle,
}

impl PopupFlowController {
    pub fn new(ctx: FlowContext, host: Arc<dyn PopupHost>) -> Self {
        Self {
            ctx,
            host,
            cancel: PopupCancelHandle::default(),
        }
    }

    /// Handle that cancels whichever popup interaction is running when it fires.
    /// A cancel issued while no popup is open is cleared by the next interaction.
    pub fn cancel_handle(&self) -> PopupCancelHandle {
        self.cancel.clone()
    }

    pub async fn start_login(&self, request: &LoginRequest) -> Result<AuthenticationResult> {
        self.run(request, InteractionStatus::Login).await
    }

    pub async fn acquire_token(&self, request: &LoginRequest) -> Result<AuthenticationResult> {
        self.run(request, InteractionStatus::AcquireToken).await
    }

    async fn run(
        &self,
        request: &LoginRequest,
        status: InteractionStatus,
    ) -> Result<AuthenticationResult> {
        let guard = self.ctx.session.begin(status)?;
        let (start, success, failure) = match status {
            InteractionStatus::Login => (
                EventType::LoginStart,
                EventType::LoginSuccess,
                EventType::LoginFailure,
            ),
            _ => (
                EventType::AcquireTokenStart,
                EventType::AcquireTokenSuccess,
                EventType::AcquireTokenFailure,
            ),
        };
        self.ctx.events.emit_simple(start, Some(InteractionType::Popup));
        self.cancel.reset();

        let result = self.interact(request, status).await;
        match &result {
            Ok(auth) => {
                tracing::info!("Popup {} completed for {}", status, auth.account.username);
                self.ctx
                    .events
                    .emit_result(success, InteractionType::Popup, auth.clone());
            }
            Err(e) => {
                tracing::error!("Popup {} failed: {}", status, e);
                self.ctx.events.emit_error(failure, InteractionType::Popup, e);
            }
        }
        drop(guard);
        result
    }

    async fn interact(
        &self,
        request: &LoginRequest,
        status: InteractionStatus,
    ) -> Result<AuthenticationResult> {
        let (authorization, pending) = self.ctx.prepare(request, status)?;
        let mut window = self.host.open(&authorization.url)?;
        let exit = self.watch(window.as_mut(), &self.ctx.config.redirect_uri).await;
        window.close();

        let landing = match exit? {
            PopupExit::Landed(location) => location,
            PopupExit::Closed => {
                tracing::debug!("Popup closed before completing");
                return Err(AuthError::UserCancelled);
            }
        };
        let response = parse_authorization_response(&landing).ok_or_else(|| AuthError::Provider {
            error: "invalid_response".to_string(),
            description: Some("Popup returned without code or error".to_string()),
        })?;
        if response.state.as_deref() != Some(pending.state.as_str()) {
            return Err(AuthError::StateMismatch);
        }
        self.ctx.complete(&pending, response).await
    }

    /// Show the provider's end-session page. Done once the window lands on
    /// `landing` or the user closes it. The caller holds the `Logout` slot.
    pub async fn end_session(&self, url: &Url, landing: &Url) -> Result<()> {
        self.cancel.reset();
        let mut window = self.host.open(url)?;
        let exit = self.watch(window.as_mut(), landing).await;
        window.close();

        match exit? {
            PopupExit::Landed(_) => tracing::debug!("End-session popup reached {}", landing),
            PopupExit::Closed => tracing::debug!("End-session popup closed"),
        }
        Ok(())
    }

    /// Poll the window until it lands on `target` or closes. Cancellation and
    /// the timeout are errors.
    async fn watch(&self, window: &mut dyn PopupWindow, target: &Url) -> Result<PopupExit> {
        let timeout = self.ctx.config.popup_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!("Popup cancelled by caller");
                return Err(AuthError::UserCancelled);
            }
            if window.is_closed() {
                return Ok(PopupExit::Closed);
            }
            if let Some(location) = window.location() {
                if is_redirect_landing(&location, target) {
                    return Ok(PopupExit::Landed(location));
                }
            }
            if Instant::now() >= deadline {
                return Err(AuthError::InteractionTimeout(timeout.as_secs()));
            }
            sleep(self.ctx.config.popup_poll_interval).await;
        }
    }
}
