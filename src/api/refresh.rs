//! Single-flight coordinator for the refresh exchange.
//!
//! Many requests can fail with 401 before any of them finishes refreshing.
//! The server rotates the refresh token on every exchange, so issuing the
//! exchange once per failing request races the rotations against each other
//! and can invalidate the credential entirely. The coordinator guarantees at
//! most one exchange in flight: the first 401 installs a pending handle and
//! spawns the exchange, concurrent 401s attach to that handle, and the handle
//! is cleared once the exchange settles.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::auth::TokenStore;
use crate::config::{Config, TransportMode};

use super::ApiError;

/// Header carrying the refresh token under header transport
pub(crate) const REFRESH_TOKEN_HEADER: &str = "X-Refresh-Token";

/// Timeout for the refresh and cookie-set calls, matching the client
const REFRESH_TIMEOUT_SECS: u64 = 5;

/// New credential pair returned by the refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Outcome shared with every request attached to one exchange. The error is
/// carried as a string so the outcome stays cloneable across waiters.
type RefreshOutcome = Result<RefreshedTokens, String>;

type PendingHandle = watch::Receiver<Option<RefreshOutcome>>;

pub struct RefreshCoordinator {
    http: reqwest::Client,
    config: Config,
    tokens: Arc<TokenStore>,
    /// Handle to the in-flight exchange, if any. Never held across the
    /// exchange itself - only while installing or clearing the slot.
    pending: Mutex<Option<PendingHandle>>,
}

impl RefreshCoordinator {
    pub fn new(http: reqwest::Client, config: Config, tokens: Arc<TokenStore>) -> Arc<Self> {
        Arc::new(Self {
            http,
            config,
            tokens,
            pending: Mutex::new(None),
        })
    }

    /// Obtain fresh credentials, joining an exchange already in flight if
    /// there is one. On success the new pair is already installed in the
    /// token store.
    pub async fn refresh(self: &Arc<Self>) -> Result<RefreshedTokens, ApiError> {
        let mut rx = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref() {
                Some(rx) => {
                    debug!("refresh already in flight, attaching to pending exchange");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *pending = Some(rx.clone());

                    // The exchange runs detached so a caller dropped mid-await
                    // (or a logout) still lets it settle.
                    let coordinator = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = coordinator.execute_exchange().await;
                        *coordinator.pending.lock().await = None;
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(ApiError::RefreshFailed);
            }
            rx.changed()
                .await
                .map_err(|_| ApiError::RefreshFailed("refresh task dropped".to_string()))?;
        }
    }

    /// Perform the exchange and install the resulting credentials.
    async fn execute_exchange(&self) -> RefreshOutcome {
        // Snapshot the store generation: a logout while the exchange is in
        // flight must not be undone by installing the new pair afterwards.
        let generation = self.tokens.generation();

        let mut request = self
            .http
            .post(self.config.endpoint("/auth/refresh"))
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS));
        if self.config.transport == TransportMode::HeaderAndStorage {
            if let Some(refresh) = self.tokens.refresh_token() {
                request = request.header(REFRESH_TOKEN_HEADER, refresh);
            }
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body).to_string());
        }
        let refreshed: RefreshedTokens = response.json().await.map_err(|e| e.to_string())?;

        if !self.tokens.set_if_generation(
            generation,
            refreshed.access_token.clone(),
            refreshed.refresh_token.clone(),
        ) {
            warn!("session cleared during refresh, discarding new credentials");
            return Err("session cleared during refresh".to_string());
        }

        // The response body, not the cookie, is the authoritative source of
        // the rotated refresh token; under cookie transport the server must
        // be asked to re-set the HttpOnly cookie from it.
        if self.config.transport == TransportMode::Cookie {
            push_refresh_cookie(&self.http, &self.config, &refreshed.refresh_token)
                .await
                .map_err(|e| e.to_string())?;
        }

        info!("access token refreshed");
        Ok(refreshed)
    }
}

/// Ask the server to (re)set the HttpOnly refresh cookie. Cookie transport
/// only.
pub(crate) async fn push_refresh_cookie(
    http: &reqwest::Client,
    config: &Config,
    refresh_token: &str,
) -> Result<(), ApiError> {
    let response = http
        .post(config.endpoint("/auth/set-refresh-cookie"))
        .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
        .form(&[("refresh_token", refresh_token)])
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::from_status(status, &body));
    }
    Ok(())
}
