//! Output Sink
//!
//! Progress, error and command-output events emitted by remote operations.
//! The surrounding tool decides how to render them; the core only reports.

use std::error::Error as StdError;

use tracing::{error, info};

/// Receiver for user-facing activity
pub trait OutputSink: Send + Sync {
    /// Free-text progress or status message
    fn message(&self, text: &str);

    /// Error message with an optional underlying cause
    fn error(&self, text: &str, cause: Option<&(dyn StdError + 'static)>);

    /// Raw chunk of captured command output, delivered as it arrives
    fn stream(&self, chunk: &str);
}

/// Sink that forwards everything to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn message(&self, text: &str) {
        info!(target: "labfleet::output", "{}", text);
    }

    fn error(&self, text: &str, cause: Option<&(dyn StdError + 'static)>) {
        match cause {
            Some(cause) => error!(target: "labfleet::output", "{}: {}", text, cause),
            None => error!(target: "labfleet::output", "{}", text),
        }
    }

    fn stream(&self, chunk: &str) {
        info!(target: "labfleet::output", "{}", chunk.trim_end());
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn message(&self, _text: &str) {}

    fn error(&self, _text: &str, _cause: Option<&(dyn StdError + 'static)>) {}

    fn stream(&self, _chunk: &str) {}
}
