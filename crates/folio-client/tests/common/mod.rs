#![allow(dead_code)]

use std::sync::Arc;

use folio_client::{Credentials, HttpApi, Session, SessionConfig, SessionFile, SessionManager};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{Value, json};

pub fn user_json() -> Value {
    json!({
        "ID": 1,
        "username": "reader",
        "email": "reader@example.com",
        "emailVerified": true,
        "roles": "user"
    })
}

pub fn session_json(access: &str, refresh: Option<&str>) -> Value {
    let mut body = json!({ "accessToken": access, "user": user_json() });
    if let Some(refresh) = refresh {
        body["refreshToken"] = json!(refresh);
    }
    body
}

pub fn credentials() -> Credentials {
    Credentials {
        email: "reader@example.com".into(),
        password: "secret".into(),
    }
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

pub fn manager(server: &MockServer) -> SessionManager {
    let api = HttpApi::new(&server.base_url()).unwrap();
    SessionManager::new(Arc::new(api), SessionConfig::default(), None)
}

/// Manager logged in through a mocked `/auth/login` with the given tokens.
pub async fn logged_in(server: &MockServer, access: &str, refresh: &str) -> SessionManager {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/auth/login");
            then.status(200).json_body(session_json(access, Some(refresh)));
        })
        .await;
    let manager = manager(server);
    manager.login(&credentials()).await.unwrap();
    manager
}

/// Manager restored from a saved session holding only `refresh`.
pub async fn refresh_only(
    server: &MockServer,
    dir: &std::path::Path,
    refresh: &str,
) -> SessionManager {
    let file = SessionFile::new(dir.join("session.json"));
    file.save(&Session {
        refresh_token: Some(refresh.to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    let api = HttpApi::new(&server.base_url()).unwrap();
    let manager = SessionManager::new(Arc::new(api), SessionConfig::default(), Some(file));
    assert!(manager.restore().await.unwrap());
    manager
}
