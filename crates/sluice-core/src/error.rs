//! Error types for sluice-core using snafu.

use snafu::prelude::*;

/// Errors that can occur during pipe operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipeError {
    /// The pipe has been stopped and no longer accepts items.
    #[snafu(display("Pipe is stopped"))]
    Stopped,

    /// The pipe stayed full past the put deadline.
    #[snafu(display("Pipe is full (waited {waited_ms}ms)"))]
    Full { waited_ms: u64 },
}

impl PipeError {
    /// Check if this error represents backpressure rather than shutdown.
    pub fn is_full(&self) -> bool {
        matches!(self, PipeError::Full { .. })
    }
}
