//! Session value and its on-disk copy

use std::io;
use std::path::{Path, PathBuf};

use folio_core::ClientError;
use serde::{Deserialize, Serialize};

use crate::api::SessionResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "ID", default)]
    pub id: u64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub roles: String,
}

/// Credentials and identity of the signed-in user.
///
/// `access_token == None` with a refresh token present is a valid state: the
/// next authorized call refreshes before sending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

impl Session {
    /// Build the session that replaces `previous` after a login or refresh.
    ///
    /// A response without a refresh token keeps the previous one.
    pub fn from_response(resp: SessionResponse, previous: &Session) -> Self {
        Self {
            access_token: Some(resp.access_token),
            refresh_token: resp.refresh_token.or_else(|| previous.refresh_token.clone()),
            user: Some(resp.user),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user.is_none()
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
    Refreshing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged out"),
            Self::LoggedIn => write!(f, "logged in"),
            Self::Refreshing => write!(f, "refreshing"),
        }
    }
}

/// JSON file holding the last persisted [`Session`].
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no session has been saved.
    pub async fn load(&self) -> Result<Option<Session>, ClientError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let session = serde_json::from_slice(&bytes).map_err(|e| {
            ClientError::resource(format!("{}: invalid session file: {e}", self.path.display()))
        })?;
        Ok(Some(session))
    }

    pub async fn save(&self, session: &Session) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| ClientError::resource(format!("encode session: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    pub async fn remove(&self) -> Result<(), ClientError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, e: io::Error) -> ClientError {
        ClientError::resource(format!("{}: {e}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: 7,
            username: "reader".into(),
            email: "reader@example.com".into(),
            email_verified: true,
            roles: "user".into(),
        }
    }

    #[test]
    fn response_without_refresh_token_keeps_previous() {
        let previous = Session {
            access_token: Some("old".into()),
            refresh_token: Some("r1".into()),
            user: None,
        };
        let resp = SessionResponse {
            access_token: "new".into(),
            refresh_token: None,
            user: user(),
        };
        let session = Session::from_response(resp, &previous);
        assert_eq!(session.access_token.as_deref(), Some("new"));
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert_eq!(session.user, Some(user()));
    }

    #[test]
    fn response_refresh_token_replaces_previous() {
        let previous = Session {
            refresh_token: Some("r1".into()),
            ..Default::default()
        };
        let resp = SessionResponse {
            access_token: "a".into(),
            refresh_token: Some("r2".into()),
            user: user(),
        };
        assert_eq!(
            Session::from_response(resp, &previous).refresh_token.as_deref(),
            Some("r2")
        );
    }

    #[test]
    fn user_wire_format() {
        let json = r#"{"ID":3,"username":"u","email":"u@x","emailVerified":true,"roles":"admin","bio":"ignored"}"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user.id, 3);
        assert!(user.email_verified);
        assert_eq!(user.roles, "admin");
    }

    #[tokio::test]
    async fn file_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("nested").join("session.json"));

        assert_eq!(file.load().await.unwrap(), None);

        let session = Session {
            access_token: Some("a".into()),
            refresh_token: Some("r".into()),
            user: Some(user()),
        };
        file.save(&session).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Some(session));

        file.remove().await.unwrap();
        assert_eq!(file.load().await.unwrap(), None);
        // Removing twice is fine
        file.remove().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{").unwrap();
        let err = SessionFile::new(path).load().await.unwrap_err();
        assert!(matches!(err, ClientError::Resource { .. }));
    }
}
