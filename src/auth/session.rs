//! Session facade: login, logout, startup probe and the shared client.
//!
//! Exactly one `SessionService` exists per application instance. It owns the
//! session record and hands out the shared [`AuthHttpClient`]; everything
//! else in the application consumes `is_authenticated`/`current_user` and the
//! client, and reacts to [`SessionEvent::SignedOut`] by navigating to the
//! sign-in entry point.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthHttpClient};
use crate::config::{Config, TransportMode};

use super::TokenStore;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session-lifecycle notifications for external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session ended (explicit logout or failed refresh); the UI should
    /// navigate to the sign-in entry point.
    SignedOut,
}

/// The mutable session record. `is_authenticated == true` implies an access
/// token was present in the store at the moment it was set.
#[derive(Debug, Default)]
pub struct SessionState {
    pub is_authenticated: bool,
    /// Opaque profile payload from the identity endpoint; the session layer
    /// stores and exposes it without interpreting its fields.
    pub user: Option<Value>,
}

pub struct SessionService {
    config: Config,
    tokens: Arc<TokenStore>,
    state: Arc<RwLock<SessionState>>,
    client: AuthHttpClient,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionService {
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let tokens = Arc::new(TokenStore::new(&config));
        let state = Arc::new(RwLock::new(SessionState::default()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = AuthHttpClient::new(
            config.clone(),
            Arc::clone(&tokens),
            Arc::clone(&state),
            events.clone(),
        )?;
        Ok(Self {
            config,
            tokens,
            state,
            client,
            events,
        })
    }

    /// Startup probe: determine whether a usable credential exists and, if
    /// so, populate the session from the identity endpoint. Never raises;
    /// an unusable credential simply leaves the session signed out.
    pub async fn init(&self) {
        let has_credential = match self.config.transport {
            TransportMode::HeaderAndStorage => match self.tokens.load_persisted() {
                Ok(found) => found,
                Err(e) => {
                    warn!(err = %e, "failed to load persisted refresh token");
                    false
                }
            },
            // On a fresh start there is normally no in-memory token; the
            // HttpOnly cookie is not client-readable, so nothing to probe.
            TransportMode::Cookie => self.tokens.access().is_some(),
        };

        if !has_credential {
            debug!("no usable credential, skipping identity probe");
            self.set_state(false, None);
            return;
        }

        match self.fetch_profile().await {
            Ok(profile) => {
                info!("startup probe restored session");
                self.set_state(true, Some(profile));
            }
            Err(e) => {
                debug!(err = %e, "startup probe failed, starting signed out");
                self.set_state(false, None);
            }
        }
    }

    /// Install freshly issued credentials and populate the session.
    ///
    /// A failed profile fetch is logged but does not fail the login: the
    /// session stays authenticated with `user` unset.
    pub async fn login(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<(), ApiError> {
        let refresh_token = refresh_token.into();
        self.tokens.set(access_token.into(), refresh_token.clone());
        self.set_state(true, None);

        if self.config.transport == TransportMode::Cookie {
            if let Err(e) = self.client.push_refresh_cookie(&refresh_token).await {
                warn!(err = %e, "failed to set refresh cookie after login");
            }
        }

        match self.fetch_profile().await {
            Ok(profile) => self.set_state(true, Some(profile)),
            Err(e) => warn!(err = %e, "profile fetch after login failed"),
        }
        Ok(())
    }

    /// End the session. Best-effort server notification; the local session
    /// is cleared unconditionally and `SignedOut` is broadcast.
    pub async fn logout(&self) {
        self.client.sign_out(true).await;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_authenticated
    }

    pub fn current_user(&self) -> Option<Value> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user
            .clone()
    }

    /// The shared HTTP client for the rest of the application.
    pub fn client(&self) -> &AuthHttpClient {
        &self.client
    }

    /// Subscribe to session-lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn fetch_profile(&self) -> Result<Value, ApiError> {
        self.client
            .get_json::<Value>("/auth/me")
            .await
            .map_err(|e| match e {
                ApiError::RefreshFailed(_) => e,
                other => ApiError::ProfileFetchFailed(other.to_string()),
            })
    }

    fn set_state(&self, is_authenticated: bool, user: Option<Value>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.is_authenticated = is_authenticated;
        state.user = user;
    }
}
