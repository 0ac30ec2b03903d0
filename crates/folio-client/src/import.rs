//! Server-side chapter import driven through the progress stream
//!
//! `GET /novels/chapters/{id}/scrape` answers with an event stream:
//!
//! ```text
//! event: status
//! data: {"1":"in queue","2":"downloading"}
//!
//! event: complete
//! data: All 2 chapters processed
//! ```
//!
//! `status` payloads are partial maps merged into the [`StatusAggregator`].
//! `complete` and `error` end the import. Only one import runs at a time
//! in the whole process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use folio_core::{ClientError, EventStream, StatusAggregator, StatusMap};
use folio_store::derived_progress;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;

use crate::api::read_error;
use crate::manager::SessionManager;

static IMPORT_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

const EVENT_STATUS: &str = "status";
const EVENT_COMPLETE: &str = "complete";
const EVENT_ERROR: &str = "error";

/// Whether an import is currently running anywhere in the process.
pub fn import_in_flight() -> bool {
    IMPORT_IN_FLIGHT.load(Ordering::Acquire)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The server sent `complete`, with its message.
    Finished { message: String },
    /// Another import was already running; nothing was sent.
    AlreadyRunning,
    Cancelled,
}

/// Holds the in-flight flag; flushes the aggregator and releases the flag
/// on every exit path.
struct InFlightGuard<'a> {
    aggregator: &'a StatusAggregator,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(aggregator: &'a StatusAggregator) -> Option<Self> {
        IMPORT_IN_FLIGHT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { aggregator })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.aggregator.flush();
        IMPORT_IN_FLIGHT.store(false, Ordering::Release);
    }
}

pub struct Importer {
    manager: SessionManager,
    aggregator: Arc<StatusAggregator>,
}

impl Importer {
    pub fn new(manager: SessionManager, aggregator: Arc<StatusAggregator>) -> Self {
        Self {
            manager,
            aggregator,
        }
    }

    pub fn aggregator(&self) -> &Arc<StatusAggregator> {
        &self.aggregator
    }

    /// Run one import of `collection_id` until the server ends it.
    ///
    /// When this returns, the aggregator holds every status received.
    pub async fn import(
        &self,
        collection_id: &str,
        cancel: CancellationToken,
    ) -> Result<ImportOutcome, ClientError> {
        let Some(_guard) = InFlightGuard::acquire(&self.aggregator) else {
            log::info!("import already in progress, ignoring request for {collection_id}");
            return Ok(ImportOutcome::AlreadyRunning);
        };
        self.aggregator.reset();

        let url = self
            .manager
            .api()
            .endpoint(&["novels", "chapters", collection_id, "scrape"])?;
        log::info!("importing {collection_id}");

        let request = self.manager.authorized_call(|client| {
            client
                .get(url.clone())
                .header(ACCEPT, "text/event-stream")
        });
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ImportOutcome::Cancelled),
            resp = request => resp?,
        };
        if !resp.status().is_success() {
            let (status, message) = read_error(resp).await;
            return Err(ClientError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let mut events = EventStream::new(Box::pin(resp.bytes_stream()));
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("import of {collection_id} cancelled");
                    return Ok(ImportOutcome::Cancelled);
                }
                event = events.next_event() => event?,
            };
            let Some(event) = event else {
                return Err(ClientError::network(
                    "import stream ended before completion",
                ));
            };

            match event.event_type.as_str() {
                EVENT_STATUS => match StatusAggregator::parse_update(&event.data) {
                    Ok(update) => self.aggregator.push(update),
                    Err(e) => log::warn!("dropping status update: {e}"),
                },
                EVENT_COMPLETE => {
                    log::info!("import of {collection_id} complete: {}", event.data);
                    return Ok(ImportOutcome::Finished {
                        message: event.data,
                    });
                }
                EVENT_ERROR => {
                    return Err(ClientError::ImportFailed {
                        message: event.data,
                    });
                }
                other => log::debug!("ignoring {other} event"),
            }
        }
    }
}

/// Whether a status value means the unit will not change any more.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "done" | "downloaded" | "skipped" | "error") || status.starts_with("save error")
}

/// Percentage of units with a terminal status.
pub fn import_progress(statuses: &StatusMap) -> f64 {
    let finished = statuses.values().filter(|s| is_terminal_status(s)).count();
    derived_progress(Some(finished as f64), Some(statuses.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> StatusMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn terminal_statuses() {
        for status in ["done", "downloaded", "skipped", "error", "save error: disk full"] {
            assert!(is_terminal_status(status), "{status}");
        }
        for status in ["to download", "in queue", "downloading"] {
            assert!(!is_terminal_status(status), "{status}");
        }
    }

    #[test]
    fn progress_counts_terminal_entries() {
        let statuses = map(&[
            ("1", "downloaded"),
            ("2", "downloading"),
            ("3", "in queue"),
            ("4", "skipped"),
        ]);
        assert_eq!(import_progress(&statuses), 50.0);
        assert_eq!(import_progress(&StatusMap::new()), 0.0);
    }
}
