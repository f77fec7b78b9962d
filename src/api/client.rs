//! Shared HTTP client with the outbound/inbound interceptor stages.
//!
//! Every authenticated request in the application flows through one
//! long-lived `AuthHttpClient`. The outbound stage attaches the current
//! credentials read from the shared [`TokenStore`] (never from captured
//! copies, so a token installed by a refresh is immediately visible). The
//! inbound stage detects an expired access token, performs a single refresh
//! exchange through the [`RefreshCoordinator`], and replays the original
//! request exactly once.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{header, Client, Method, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::auth::{SessionEvent, SessionState, TokenStore};
use crate::config::{Config, TransportMode};

use super::refresh::{push_refresh_cookie, RefreshCoordinator, REFRESH_TOKEN_HEADER};
use super::ApiError;

/// HTTP request timeout in seconds.
/// Short enough to fail fast in an interactive client, long enough for a
/// slow identity endpoint.
const REQUEST_TIMEOUT_SECS: u64 = 5;

/// The two endpoints that must succeed after the access token has already
/// expired; only they ever carry the refresh token as a header.
fn is_credential_endpoint(path: &str) -> bool {
    path.ends_with("/auth/refresh") || path.ends_with("/auth/logout")
}

/// Shared HTTP client. Clone is cheap - reqwest::Client uses Arc internally
/// for connection pooling, and all session state is behind shared handles.
#[derive(Clone)]
pub struct AuthHttpClient {
    http: Client,
    config: Config,
    tokens: Arc<TokenStore>,
    refresh: Arc<RefreshCoordinator>,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthHttpClient {
    pub fn new(
        config: Config,
        tokens: Arc<TokenStore>,
        state: Arc<RwLock<SessionState>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Self, ApiError> {
        // The cookie store carries the server-set HttpOnly refresh cookie
        // across requests, including the refresh exchange itself.
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .cookie_store(true)
            .build()?;
        let refresh = RefreshCoordinator::new(http.clone(), config.clone(), Arc::clone(&tokens));
        Ok(Self {
            http,
            config,
            tokens,
            refresh,
            state,
            events,
        })
    }

    /// Start a request against an API path. Send it with [`Self::send`] to
    /// get the interceptor pipeline.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.config.endpoint(path))
    }

    /// Send a request through the interceptor pipeline.
    ///
    /// Responses are returned as-is except for the first 401, which triggers
    /// one refresh-and-replay attempt. A 401 on the replayed request passes
    /// through unchanged. A failed refresh signs the session out and is
    /// surfaced as [`ApiError::RefreshFailed`].
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let mut request = builder.build()?;
        // Clone before the first send; the clone is the replay attempt.
        let replay = request.try_clone();
        self.attach_outbound_headers(&mut request)?;

        let response = self.http.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            // Streaming bodies cannot be replayed; pass the 401 through.
            debug!("401 on non-replayable request, passing through");
            return Ok(response);
        };

        debug!(url = %replay.url(), "401 received, attempting token refresh");
        match self.refresh.refresh().await {
            Ok(_) => {
                self.attach_outbound_headers(&mut replay)?;
                Ok(self.http.execute(replay).await?)
            }
            Err(e) => {
                warn!(err = %e, "token refresh failed, signing out");
                self.sign_out(true).await;
                Err(e)
            }
        }
    }

    /// Outbound interceptor stage: header mutation only, no side effects.
    fn attach_outbound_headers(&self, request: &mut Request) -> Result<(), ApiError> {
        if let Some(access) = self.tokens.access() {
            request.headers_mut().insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {access}"))?,
            );
        }
        if self.config.transport == TransportMode::HeaderAndStorage
            && is_credential_endpoint(request.url().path())
        {
            if let Some(refresh) = self.tokens.refresh_token() {
                request
                    .headers_mut()
                    .insert(REFRESH_TOKEN_HEADER, header::HeaderValue::from_str(&refresh)?);
            }
        }
        Ok(())
    }

    /// GET a path and deserialize the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }

    /// POST a JSON body to a path and deserialize the JSON response.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send(self.request(Method::POST, path).json(body))
            .await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }

    /// Check if a response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Ask the server to (re)set the HttpOnly refresh cookie.
    pub(crate) async fn push_refresh_cookie(&self, refresh_token: &str) -> Result<(), ApiError> {
        push_refresh_cookie(&self.http, &self.config, refresh_token).await
    }

    /// The sign-out procedure: best-effort server notification, then an
    /// unconditional local clear. A server unreachable during logout must
    /// never leave stale credentials active on the client.
    pub(crate) async fn sign_out(&self, notify_server: bool) {
        if notify_server {
            // Dispatched outside the 401 machinery: a logout rejected with
            // 401 must not recurse into another refresh attempt.
            match self.request(Method::POST, "/auth/logout").build() {
                Ok(mut request) => {
                    if let Err(e) = self.attach_outbound_headers(&mut request) {
                        warn!(err = %e, "failed to build logout request");
                    } else {
                        match self.http.execute(request).await {
                            Ok(response) if response.status().is_success() => {
                                debug!("logout acknowledged by server")
                            }
                            Ok(response) => {
                                warn!(status = %response.status(), "logout rejected by server")
                            }
                            Err(e) => warn!(err = %e, "logout request failed"),
                        }
                    }
                }
                Err(e) => warn!(err = %e, "failed to build logout request"),
            }
        }

        self.tokens.clear();
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.is_authenticated = false;
            state.user = None;
        }
        // Listeners react by navigating to the sign-in entry point. A send
        // error only means nobody is subscribed.
        let _ = self.events.send(SessionEvent::SignedOut);
    }
}
