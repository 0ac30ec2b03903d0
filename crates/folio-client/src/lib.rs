//! folio-client: authenticated access to the reading service
//!
//! [`SessionManager`] owns the session and wraps every outgoing request in
//! the refresh-and-retry protocol. [`Importer`] drives the server-pushed
//! import stream into a [`folio_core::StatusAggregator`], and
//! [`HttpContentSource`] feeds the chapter window cache.

pub mod api;
pub mod content;
pub mod import;
pub mod manager;
pub mod session;

pub use api::{Credentials, HttpApi, SessionApi, SessionResponse};
pub use content::{Chapter, HttpContentSource};
pub use import::{ImportOutcome, Importer, import_in_flight, import_progress, is_terminal_status};
pub use manager::{MIN_REFRESH_DELAY, SessionConfig, SessionManager};
pub use session::{Session, SessionFile, SessionState, User};
