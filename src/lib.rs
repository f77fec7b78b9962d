//! authflow - client-side session management with silent re-authentication.
//!
//! The crate holds short-lived access credentials and a longer-lived refresh
//! credential, attaches them to outgoing HTTP requests, and transparently
//! recovers from credential expiry: the first 401 triggers a single refresh
//! exchange and the failed request is replayed once with the new credentials.
//! Concurrent failures share one exchange; a failed exchange ends the
//! session.
//!
//! Typical wiring:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use authflow::{Config, SessionService};
//!
//! let session = SessionService::new(Config::from_env())?;
//! session.init().await;
//! if session.is_authenticated() {
//!     let reports: serde_json::Value = session.client().get_json("/reports").await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, AuthHttpClient, RefreshCoordinator, RefreshedTokens};
pub use auth::{SessionEvent, SessionService, SessionState, TokenPair, TokenStore};
pub use config::{Config, TransportMode};
