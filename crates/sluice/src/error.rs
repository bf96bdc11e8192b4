//! Error types for the connector layer using snafu.
//!
//! This module defines structured error types with context selectors for
//! every failure path a connecting function can take.

use snafu::prelude::*;

use sluice_core::error::PipeError;

/// Boxed error type used for handler, hook, and predicate failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ============ Stream Errors ============

/// Errors raised by an external stream listener.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StreamError {
    /// The connection dropped or was reset; usually transient.
    #[snafu(display("Stream connection lost: {message}"))]
    Connection { message: String },

    /// The remote closed the stream.
    #[snafu(display("Stream closed by the remote end"))]
    Closed,

    /// The listener failed in a way reconnecting cannot fix.
    #[snafu(display("Stream protocol error: {message}"))]
    Protocol { message: String },
}

impl StreamError {
    /// Default classification of failures healed by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Connection { .. } | StreamError::Closed)
    }
}

// ============ Fitting Errors ============

/// Errors that can occur while assembling a fitting.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FittingError {
    /// No source was bound.
    #[snafu(display("Fitting '{name}' has no source"))]
    MissingSource { name: String },

    /// No destination was bound.
    #[snafu(display("Fitting '{name}' has no destination"))]
    MissingDestination { name: String },

    /// No handler was bound and the item types differ.
    #[snafu(display("Fitting '{name}' has no handler"))]
    MissingHandler { name: String },
}

// ============ Transfer Errors (top-level) ============

/// Errors raised while moving items from a source to a destination.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
    /// Reading the source stream failed.
    #[snafu(display("Failed to read from the source stream"))]
    SourceGet { source: StreamError },

    /// The get-side admission predicate failed.
    #[snafu(display("Get-side admission predicate failed"))]
    ConditionalGet { source: BoxError },

    /// The handler failed while transforming an item.
    #[snafu(display("Handler failed to transform an item"))]
    DataTransformer { source: BoxError },

    /// The handler's expanded output failed while being drained.
    #[snafu(display("Handler output sequence failed"))]
    DataGenerator { source: BoxError },

    /// The put-side admission predicate failed.
    #[snafu(display("Put-side admission predicate failed"))]
    ConditionalPut { source: BoxError },

    /// Writing the destination failed after the item already left the
    /// source. The lost count makes the data-loss risk explicit.
    #[snafu(display("Failed to write to the destination ({lost} item(s) lost)"))]
    DestinationPut { lost: usize, source: PipeError },

    /// A helper hook failed and escalation was requested.
    #[snafu(display("Helper hook '{hook}' failed"))]
    Hook { hook: &'static str, source: BoxError },

    /// Internal signal: the stream failure is recoverable by reconnecting.
    /// Consumed by the reconnecting connector, never surfaced past it.
    #[snafu(display("Stream disconnected, reconnect required"))]
    Reconnect {
        items_moved: usize,
        source: StreamError,
    },

    /// The reconnect budget was exhausted.
    #[snafu(display("Giving up after {attempts} reconnect attempt(s)"))]
    ConnectionExhausted { attempts: u32, source: StreamError },

    /// A fan worker task aborted abnormally.
    #[snafu(display("Fan worker aborted: {message}"))]
    FanAborted { message: String },

    /// Handler and destination counts do not line up for a fan-out.
    #[snafu(display("Fan shape mismatch: {handlers} handler(s) for {destinations} destination(s)"))]
    FanShape {
        handlers: usize,
        destinations: usize,
    },

    /// The connecting task was cancelled.
    #[snafu(display("Transfer cancelled"))]
    Cancelled,
}

impl TransferError {
    /// Check if this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Check if this is the internal reconnect signal.
    pub fn is_reconnect(&self) -> bool {
        matches!(self, TransferError::Reconnect { .. })
    }
}
