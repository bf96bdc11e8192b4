//! sluice: an asynchronous pipe and connector dataflow framework.
//!
//! This crate moves discrete items from a source (a bounded [`Pipe`] or an
//! external push stream) through an optional [`Handler`] into a destination
//! pipe, under cooperative cancellation, bounded backpressure, and
//! automatic reconnection. It is content-agnostic: nothing here interprets
//! the items flowing through.
//!
//! - `connect` - Transfer loops, retrying puts, stream connectors, fan helpers
//! - `fitting` - Named, restartable, supervised dataflow bindings
//! - `error` - The transfer error taxonomy

pub mod connect;
pub mod error;
pub mod fitting;

// Re-export commonly used items
pub use connect::{
    Condition, FanHandlers, Handler, Hook, Payload, StreamListener, TransferConfig, TransferHooks,
    multi_pipe_to_pipe, pipe_to_multi_pipe, put_on_condition, put_with_retry,
    reconnecting_stream_to_pipe, stream_to_pipe, transfer,
};
pub use error::{BoxError, FittingError, StreamError, TransferError};
pub use fitting::{Fitting, FittingBuilder};

// Re-export from sluice-core
pub use sluice_core::{
    ErrorLog, Pipe, PipeConfig, PipeError, PipeItem, PipeSink, PipeSource, ReconnectPolicy,
    RetryPolicy, Severity, TaskError, TaskManager, TaskOutput, TaskState, init_tracing,
    sentinelize,
};
