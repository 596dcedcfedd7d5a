//! Concept2 Logbook API client
//!
//! Two calls are used: the OAuth refresh-token grant and the results upload.
//! Both sit behind [`LogbookApi`] so the sync engine can be exercised
//! without a network.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    error::{ErgbookError, Result},
    protocol::WorkoutPayload,
    types::UserCredential,
};

/// OAuth application id registered with the Logbook
pub const DEFAULT_CLIENT_ID: &str = "ymMRExBCsS6HqDm9ShMEPRvpR3Hh2DPb3FTtiazX";

/// Redirect target registered for the OAuth application
pub const DEFAULT_REDIRECT_URI: &str = "https://auth.pm5-book.workers.dev/c2";

/// Production Logbook host
pub const DEFAULT_BASE_URL: &str = "https://log.concept2.com";

/// Scope needed to upload results
pub const DEFAULT_SCOPE: &str = "results:write";

/// Fresh credentials from a refresh-token grant
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    /// New bearer token
    pub access_token: String,
    /// New refresh token, replacing the one just used
    pub refresh_token: String,
}

/// Result of uploading a workout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// The Logbook stored the result
    Created,
    /// The Logbook already had this result
    AlreadyRecorded,
}

/// Remote operations the sync engine relies on
#[async_trait]
pub trait LogbookApi: Send + Sync {
    /// Exchange the user's refresh token for a new token pair
    async fn refresh_token(&self, user: &UserCredential) -> Result<TokenPair>;

    /// Upload one workout with the given bearer token
    async fn post_workout(&self, access_token: &str, payload: &WorkoutPayload)
        -> Result<PostOutcome>;
}

/// Connection settings for [`LogbookClient`]
#[derive(Debug, Clone)]
pub struct LogbookSettings {
    /// Scheme and host, without a trailing slash
    pub base_url: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// OAuth scope
    pub scope: String,
    /// OAuth redirect URI
    pub redirect_uri: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for LogbookSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: String::new(),
            scope: DEFAULT_SCOPE.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the Logbook
pub struct LogbookClient {
    client: Client,
    settings: LogbookSettings,
}

impl LogbookClient {
    /// Build a client
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Http`] if the TLS backend cannot be initialized.
    pub fn new(settings: LogbookSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("ergbook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, settings })
    }

    /// URL an operator visits to authorize uploads
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Config`] if the base URL is malformed.
    pub fn auth_url(&self) -> Result<String> {
        let url = Url::parse_with_params(
            &self.endpoint("/oauth/authorize"),
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("scope", self.settings.scope.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
            ],
        )
        .map_err(|e| ErgbookError::Config(format!("invalid logbook url: {e}")))?;
        Ok(url.into())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }
}

async fn remote_error(response: reqwest::Response) -> ErgbookError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("unreadable body: {e}"));
    ErgbookError::RemoteApi { status, message }
}

#[async_trait]
impl LogbookApi for LogbookClient {
    async fn refresh_token(&self, user: &UserCredential) -> Result<TokenPair> {
        debug!(user = %user.uuid, "refreshing token");

        let response = self
            .client
            .post(self.endpoint("/oauth/access_token"))
            .form(&[
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("scope", self.settings.scope.as_str()),
                ("refresh_token", user.refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let tokens: TokenPair = response.json().await?;
        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            return Err(ErgbookError::RemoteApi {
                status: StatusCode::OK.as_u16(),
                message: "token response is missing a token".to_string(),
            });
        }

        info!(user = %user.uuid, "refreshed token");
        Ok(tokens)
    }

    async fn post_workout(
        &self,
        access_token: &str,
        payload: &WorkoutPayload,
    ) -> Result<PostOutcome> {
        let response = self
            .client
            .post(self.endpoint("/api/users/me/results"))
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(PostOutcome::Created)
        } else if status == StatusCode::CONFLICT {
            Ok(PostOutcome::AlreadyRecorded)
        } else {
            Err(remote_error(response).await)
        }
    }
}

/// Out-of-band notification of persistent failures
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Deliver one alert message
    async fn alert(&self, message: &str) -> Result<()>;
}

/// Posts `{"text": "PM5 alert: ..."}` to a chat webhook
pub struct WebhookAlerter {
    client: Client,
    url: String,
}

impl WebhookAlerter {
    /// Create an alerter for the given webhook URL
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, message: &str) -> Result<()> {
        let body = serde_json::json!({ "text": format!("PM5 alert: {message}") });
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        Ok(())
    }
}
