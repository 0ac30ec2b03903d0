//! HTTP client for the authentication endpoints

use std::time::Duration;

use async_trait::async_trait;
use folio_core::{AuthError, ClientError};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::session::User;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("folio/", env!("CARGO_PKG_VERSION"));

/// Used when an error response carries no `{"error": ...}` body.
pub const FALLBACK_ERROR_MESSAGE: &str = "An unexpected error occurred";

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Body of a successful login or refresh.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: User,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Remote session operations.
///
/// [`HttpApi`] is the real implementation; the seam exists so the session
/// protocol can run against a scripted server.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Client used for authorized requests.
    fn http(&self) -> &reqwest::Client;

    /// Absolute URL for a path made of the given segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError>;

    async fn login(&self, credentials: &Credentials) -> Result<SessionResponse, ClientError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<SessionResponse, ClientError>;

    async fn logout(&self, refresh_token: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::validation(format!("invalid base URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::validation(format!(
                "invalid base URL {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn session_response(resp: Response) -> Result<SessionResponse, ClientError> {
        if !resp.status().is_success() {
            return Err(auth_error(resp).await);
        }
        let body = resp.bytes().await.map_err(ClientError::from_reqwest)?;
        serde_json::from_slice(&body)
            .map_err(|e| AuthError::InvalidSession(e.to_string()).into())
    }
}

#[async_trait]
impl SessionApi for HttpApi {
    fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::validation(format!("invalid base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn login(&self, credentials: &Credentials) -> Result<SessionResponse, ClientError> {
        let resp = self
            .client
            .post(self.endpoint(&["auth", "login"])?)
            .timeout(REQUEST_TIMEOUT)
            .json(credentials)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        Self::session_response(resp).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<SessionResponse, ClientError> {
        let resp = self
            .client
            .post(self.endpoint(&["auth", "refresh-token"])?)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(refresh_token)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        Self::session_response(resp).await
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(self.endpoint(&["auth", "logout"])?)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(refresh_token)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(auth_error(resp).await)
        }
    }
}

/// Extract `error` from a `{"error": "..."}` body.
pub fn error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|b| b.error)
        .filter(|m| !m.is_empty())
}

/// Status and server-provided message of a failed response.
pub async fn read_error(resp: Response) -> (StatusCode, String) {
    let status = resp.status();
    let message = match resp.bytes().await {
        Ok(body) => error_message(&body),
        Err(e) => {
            log::debug!("error body unreadable: {}", e.without_url());
            None
        }
    };
    (
        status,
        message.unwrap_or_else(|| FALLBACK_ERROR_MESSAGE.to_string()),
    )
}

/// Classify a failed response from an authentication endpoint.
pub async fn auth_error(resp: Response) -> ClientError {
    let (status, message) = read_error(resp).await;
    match status {
        StatusCode::BAD_REQUEST => AuthError::InvalidCredentials(message).into(),
        StatusCode::UNAUTHORIZED => AuthError::Unauthorized(message).into(),
        status => ClientError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_from_body() {
        assert_eq!(
            error_message(br#"{"error":"Invalid email or password"}"#).as_deref(),
            Some("Invalid email or password")
        );
        assert_eq!(error_message(br#"{"message":"nope"}"#), None);
        assert_eq!(error_message(br#"{"error":""}"#), None);
        assert_eq!(error_message(b"<html>"), None);
    }

    #[test]
    fn endpoint_joins_and_encodes_segments() {
        let api = HttpApi::new("http://localhost:8080/api/").unwrap();
        let url = api.endpoint(&["novels", "chapters", "a b/c", "scrape"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/novels/chapters/a%20b%2Fc/scrape"
        );

        let api = HttpApi::new("http://localhost:8080").unwrap();
        let url = api.endpoint(&["auth", "login"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/auth/login");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            HttpApi::new("not a url"),
            Err(ClientError::Validation { .. })
        ));
        assert!(matches!(
            HttpApi::new("mailto:someone@example.com"),
            Err(ClientError::Validation { .. })
        ));
    }

    #[test]
    fn session_response_without_refresh_token() {
        let body = r#"{"accessToken":"a","user":{"ID":1,"username":"u","email":"u@example.com"}}"#;
        let resp: SessionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.access_token, "a");
        assert!(resp.refresh_token.is_none());
        assert_eq!(resp.user.username, "u");
    }
}
