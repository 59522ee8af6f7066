//! authflow - OAuth 2.0 / OpenID Connect authorization code + PKCE client
//!
//! Redirect and popup sign-in, silent token acquisition from a scope-aware
//! cache, multi-account bookkeeping and lifecycle events.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod expiry;
pub mod models;
pub mod session;
pub mod storage;

pub use auth::AuthClient;
pub use config::{ClientConfig, Config};
pub use error::{AuthError, Result};
pub use events::{AuthEvent, EventBroadcaster, EventType};
pub use models::{Account, AuthenticationResult, InteractionStatus, LoginRequest};
