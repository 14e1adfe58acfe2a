use std::time::{Duration, Instant};

use graph_smtpd_common::internal;
use reqwest::Url;
use tokio::sync::Mutex;

use crate::{config::Secret, error::TokenError, model::TokenResponse};

/// Tokens are refreshed this long before the identity provider says they
/// expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Client-credentials token source with a single cached token.
///
/// Concurrent callers that find the cache stale wait on the same mutex, so
/// only one of them refreshes.
#[derive(Debug)]
pub struct TokenProvider {
    http: reqwest::Client,
    endpoint: Url,
    client_id: String,
    secret: Secret,
    scope: String,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(
        http: reqwest::Client,
        endpoint: Url,
        client_id: String,
        secret: Secret,
        scope: String,
    ) -> Self {
        Self {
            http,
            endpoint,
            client_id,
            secret,
            scope,
            cache: Mutex::new(None),
        }
    }

    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// A bearer token valid for at least [`EXPIRY_MARGIN`].
    ///
    /// # Errors
    /// If the identity provider cannot be reached or refuses the client.
    pub async fn token(&self) -> Result<String, TokenError> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref()
            && Instant::now() < cached.expires_at
        {
            return Ok(cached.token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);

        Ok(token)
    }

    /// Drop the cached token, e.g. after the API rejected it
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }

    async fn fetch(&self) -> Result<CachedToken, TokenError> {
        internal!(level = DEBUG, "Requesting access token from {}", self.endpoint);

        let response = self
            .http
            .post(self.endpoint.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.secret.expose()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                detail: String::from_utf8_lossy(&body).chars().take(200).collect(),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(|err| TokenError::Malformed(err.to_string()))?;

        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_MARGIN);

        Ok(CachedToken {
            token: parsed.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}
