//! Connecting functions: the transfer engine between sources and
//! destinations.
//!
//! - `transfer`: the generic get, transform, put loop for pipe sources
//! - `put`: backpressure-aware puts with bounded retries
//! - `stream`: connectors from external push streams, plain and reconnecting
//! - `fan`: fan-in and fan-out across several pipes
//! - `handler`: the four transform shapes
//! - `hooks`: helper hooks wrapped uniformly

mod fan;
mod handler;
mod hooks;
mod put;
mod stream;
mod transfer;

pub use fan::{FanHandlers, multi_pipe_to_pipe, pipe_to_multi_pipe};
pub use handler::Handler;
pub use hooks::{Hook, TransferHooks};
pub use put::{Condition, Payload, put_on_condition, put_with_retry};
pub use stream::{Recoverable, StreamListener, reconnecting_stream_to_pipe, stream_to_pipe};
pub use transfer::{TransferConfig, transfer};
