//! Folio Core - shared infrastructure for the reading client
//!
//! This crate provides the error taxonomy, logging setup, rate limiting
//! primitives, event-stream framing and status aggregation used by the
//! session, import and cache layers.

pub mod error;
pub mod event_stream;
pub mod logging;
pub mod progress;
pub mod rate_limit;
pub mod status;

// Re-exports for convenience
pub use error::{AuthError, ClientError};
pub use event_stream::{EventStream, EventStreamDecoder, StreamEvent};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::ProgressContext;
pub use rate_limit::{Debounce, Throttle, ThrottleWithFlush};
pub use status::{StatusAggregator, StatusMap};
