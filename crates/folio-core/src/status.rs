//! Throttled aggregation of partial status updates

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ClientError;
use crate::rate_limit::ThrottleWithFlush;

/// Status per key (chapter number → status text).
pub type StatusMap = BTreeMap<String, String>;

/// Merges partial status maps and publishes throttled snapshots.
///
/// Every update is merged into the accumulated map as soon as it arrives;
/// only publication to subscribers is throttled. The throttle always carries
/// the full merged map, so a trailing publication never loses an update.
pub struct StatusAggregator {
    merged: Mutex<StatusMap>,
    publisher: ThrottleWithFlush<StatusMap>,
    published: Arc<watch::Sender<StatusMap>>,
}

impl StatusAggregator {
    pub fn new(interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(StatusMap::new());
        let published = Arc::new(tx);
        let sink = Arc::clone(&published);
        let publisher = ThrottleWithFlush::new(interval, move |snapshot: StatusMap| {
            sink.send_replace(snapshot);
        });
        Self {
            merged: Mutex::new(StatusMap::new()),
            publisher,
            published,
        }
    }

    /// Merge `incoming` (incoming wins per key) and schedule publication.
    pub fn push(&self, incoming: StatusMap) {
        let mut merged = self.merged.lock().unwrap_or_else(|e| e.into_inner());
        merged.extend(incoming);
        // Publication stays under the lock so snapshots leave in merge order
        self.publisher.call(merged.clone());
    }

    /// Publish any pending snapshot immediately.
    pub fn flush(&self) {
        self.publisher.flush();
    }

    /// Start a new operation: drop accumulated state and publish an empty map.
    pub fn reset(&self) {
        let mut merged = self.merged.lock().unwrap_or_else(|e| e.into_inner());
        merged.clear();
        self.publisher.flush();
        self.published.send_replace(StatusMap::new());
    }

    /// Watch the published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<StatusMap> {
        self.published.subscribe()
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> StatusMap {
        self.published.borrow().clone()
    }

    /// Parse the payload of a `status` event.
    ///
    /// Non-string values are kept in their JSON text form.
    pub fn parse_update(data: &str) -> Result<StatusMap, ClientError> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(data)
            .map_err(|e| ClientError::validation(format!("status payload: {e}")))?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }
}
