//! Chapter fetching for the window cache

use async_trait::async_trait;
use folio_core::ClientError;
use folio_store::ContentSource;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::api::read_error;
use crate::manager::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(rename = "ID", default)]
    pub id: u64,
    #[serde(rename = "chapterNo")]
    pub chapter_no: u32,
    #[serde(rename = "novelId", default)]
    pub novel_id: u64,
    pub title: String,
    #[serde(rename = "chapterUrl", default)]
    pub chapter_url: String,
    #[serde(default)]
    pub body: String,
}

/// Fetches chapters from `GET /novels/chapters/novel/{id}/chapter/{no}`.
#[derive(Clone)]
pub struct HttpContentSource {
    manager: SessionManager,
    authorized: bool,
}

impl HttpContentSource {
    /// With `authorized`, requests go through the session protocol;
    /// otherwise they are sent without credentials.
    pub fn new(manager: SessionManager, authorized: bool) -> Self {
        Self {
            manager,
            authorized,
        }
    }

    pub async fn fetch_chapter(&self, novel_id: &str, chapter_no: u32) -> Result<Chapter, ClientError> {
        let chapter_no = chapter_no.to_string();
        let url = self.manager.api().endpoint(&[
            "novels",
            "chapters",
            "novel",
            novel_id,
            "chapter",
            &chapter_no,
        ])?;
        log::debug!("fetching {novel_id} chapter {chapter_no}");

        let resp = if self.authorized {
            self.manager
                .authorized_call(|client| client.get(url.clone()))
                .await?
        } else {
            self.manager
                .api()
                .http()
                .get(url)
                .send()
                .await
                .map_err(ClientError::from_reqwest)?
        };

        if !resp.status().is_success() {
            let (status, message) = read_error(resp).await;
            return Err(match status {
                StatusCode::BAD_REQUEST => ClientError::validation(message),
                status => ClientError::Server {
                    status: status.as_u16(),
                    message,
                },
            });
        }
        resp.json().await.map_err(ClientError::from_reqwest)
    }
}

#[async_trait]
impl ContentSource<Chapter> for HttpContentSource {
    async fn fetch_unit(&self, collection_id: &str, sequence: u32) -> Result<Chapter, ClientError> {
        self.fetch_chapter(collection_id, sequence).await
    }
}
