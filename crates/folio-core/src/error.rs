//! Error taxonomy shared by the session, import and cache layers

/// Authentication failures, kept apart so callers can decide whether a
/// session is still usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Login rejected the submitted credentials (HTTP 400).
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// The server refused the bearer credential (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A refresh was requested but no refresh token is stored.
    #[error("no refresh token available")]
    MissingRefreshToken,
    /// The server answered but the session payload was unusable.
    #[error("invalid session data: {0}")]
    InvalidSession(String),
}

/// Error returned by every fallible client operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Authentication(#[from] AuthError),
    /// No response was obtained (DNS, connect, reset, timeout).
    #[error("network error: {message}")]
    Network { message: String },
    /// A response arrived with a non-success status outside the auth cases.
    #[error("HTTP {status}: {message}")]
    Server { status: u16, message: String },
    /// Response body did not match the expected shape.
    #[error("malformed response: {message}")]
    Validation { message: String },
    /// Persistent store failure.
    #[error("store error: {message}")]
    Resource { message: String },
    /// The import stream reported an `error` event.
    #[error("import failed: {message}")]
    ImportFailed { message: String },
}

impl ClientError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Classify a reqwest error.
    ///
    /// Errors carrying a status came from `error_for_status`; decode errors
    /// mean the body was readable but malformed; everything else means no
    /// usable response was obtained.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let status = e.status();
        let is_decode = e.is_decode();
        // Strip URL so tokens in query strings never reach the logs
        let message = e.without_url().to_string();
        if let Some(status) = status {
            Self::Server {
                status: status.as_u16(),
                message,
            }
        } else if is_decode {
            Self::Validation { message }
        } else {
            Self::Network { message }
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// HTTP status attached to the error, if the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::Authentication(AuthError::InvalidCredentials(_)) => Some(400),
            Self::Authentication(AuthError::Unauthorized(_)) => Some(401),
            _ => None,
        }
    }
}
