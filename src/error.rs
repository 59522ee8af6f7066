use crate::models::InteractionStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("State mismatch - the response does not belong to a pending request")]
    StateMismatch,

    #[error("Nonce mismatch - id token was not issued for this request")]
    NonceMismatch,

    #[error("Invalid id token: {0}")]
    InvalidIdToken(String),

    #[error("User cancelled the interaction")]
    UserCancelled,

    #[error("Interaction timed out after {0} seconds")]
    InteractionTimeout(u64),

    #[error("Another interaction is already in progress: {in_progress}")]
    ConcurrentInteraction { in_progress: InteractionStatus },

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("No active account - sign in or select an account first")]
    NoActiveAccount,

    #[error("Interaction required: {0}")]
    InteractionRequired(String),

    #[error("Identity provider returned {error}: {}", .description.as_deref().unwrap_or("no description"))]
    Provider {
        error: String,
        description: Option<String>,
    },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl AuthError {
    /// Errors that end a single interaction but leave the client usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AuthError::StateMismatch
                | AuthError::NonceMismatch
                | AuthError::InvalidIdToken(_)
                | AuthError::UserCancelled
                | AuthError::InteractionTimeout(_)
                | AuthError::InteractionRequired(_)
                | AuthError::Provider { .. }
                | AuthError::TokenExchange(_)
                | AuthError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
