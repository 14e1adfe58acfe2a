use std::time::Duration;

use async_trait::async_trait;
use graph_smtpd_common::{internal, outgoing};
use graph_smtpd_core::{ApiError, Directory, OutboundMessage, ResolveError, UserHandle};
use reqwest::{
    StatusCode, Url,
    header::{HeaderMap, RETRY_AFTER},
};

use crate::{
    config::GraphConfig,
    error::{GraphError, TokenError},
    model::{ErrorResponse, SendMailRequest, User},
    token::TokenProvider,
};

/// Directory backed by the Microsoft Graph REST API
#[derive(Debug)]
pub struct GraphClient {
    http: reqwest::Client,
    endpoint: Url,
    tokens: TokenProvider,
}

impl GraphClient {
    /// Validate `config` and build a client. No request is made yet.
    ///
    /// # Errors
    /// - [`GraphError::MissingCredential`] if tenant id, client id or secret
    ///   is blank
    /// - [`GraphError::InvalidUrl`] if the authority or endpoint is not a URL
    /// - [`GraphError::Client`] if the HTTP client cannot be created
    pub fn new(config: GraphConfig) -> Result<Self, GraphError> {
        if config.tenant_id.trim().is_empty() {
            return Err(GraphError::MissingCredential("tenant id"));
        }

        if config.client_id.trim().is_empty() {
            return Err(GraphError::MissingCredential("client id"));
        }

        if config.secret.is_blank() {
            return Err(GraphError::MissingCredential("client secret"));
        }

        let token_endpoint = parse_url(&format!(
            "{}/{}/oauth2/v2.0/token",
            config.authority.trim_end_matches('/'),
            config.tenant_id.trim()
        ))?;
        let endpoint = parse_url(config.endpoint.trim_end_matches('/'))?;

        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            tokens: TokenProvider::new(
                http.clone(),
                token_endpoint,
                config.client_id,
                config.secret,
                config.scope,
            ),
            http,
            endpoint,
        })
    }

    pub const fn token_endpoint(&self) -> &Url {
        self.tokens.endpoint()
    }

    /// Acquire a token now, so bad credentials or an unreachable identity
    /// provider surface at startup instead of on the first message. The
    /// token is cached for later requests.
    ///
    /// # Errors
    /// [`TokenError`] if no token could be obtained.
    pub async fn verify(&self) -> Result<(), TokenError> {
        self.tokens.token().await?;

        internal!(level = DEBUG, "Obtained access token from {}", self.token_endpoint());
        Ok(())
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::Other(format!("{} cannot be a base URL", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        Ok(format!("Bearer {}", self.tokens.token().await?))
    }

    /// Turn a failed response into an [`ApiError`], dropping the cached token
    /// if Graph rejected it.
    async fn failure(&self, response: reqwest::Response) -> ApiError {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }

        classify(status, retry_after, &body)
    }
}

#[async_trait]
impl Directory for GraphClient {
    async fn resolve_user(&self, address: &str) -> Result<UserHandle, ResolveError> {
        if address.trim().is_empty() {
            return Err(ResolveError::NotFound(address.to_string()));
        }

        let mut url = self.url(&["users", address])?;
        url.query_pairs_mut().append_pair("$select", "id");

        outgoing!(level = DEBUG, "GET {}", url);

        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?)
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK => {
                let user: User = response
                    .json()
                    .await
                    .map_err(|err| ApiError::Other(format!("malformed user response: {err}")))?;
                Ok(UserHandle::new(user.id))
            }
            StatusCode::NOT_FOUND => Err(ResolveError::NotFound(address.to_string())),
            _ => Err(ResolveError::Api(self.failure(response).await)),
        }
    }

    async fn send_mail(
        &self,
        user: &UserHandle,
        message: &OutboundMessage,
    ) -> Result<(), ApiError> {
        let url = self.url(&["users", user.as_str(), "sendMail"])?;

        outgoing!(level = DEBUG, "POST {}", url);

        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?)
            .json(&SendMailRequest::from(message))
            .send()
            .await
            .map_err(transport)?;

        if matches!(response.status(), StatusCode::ACCEPTED | StatusCode::OK) {
            return Ok(());
        }

        let err = self.failure(response).await;
        internal!(level = DEBUG, "sendMail as {} failed: {}", user, err);

        Err(err)
    }
}

/// Map an unsuccessful Graph response onto the relay's error kinds.
pub fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ApiError::Throttled { retry_after },
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ApiError::Unavailable(status.to_string()),
        _ => ApiError::Other(format!("{}: {}", status.as_u16(), excerpt(body))),
    }
}

fn excerpt(body: &str) -> String {
    if let Ok(ErrorResponse { error }) = serde_json::from_str::<ErrorResponse>(body) {
        return format!("{}: {}", error.code, error.message);
    }

    body.chars().take(200).collect()
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Unavailable(err.to_string())
}

fn parse_url(url: &str) -> Result<Url, GraphError> {
    Url::parse(url).map_err(|err| GraphError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })
}
