//! Capability traits for pipe readers and writers.
//!
//! Connecting functions are written against these traits rather than
//! [`Pipe`](super::Pipe) directly, so tests and adapters can substitute
//! their own endpoints.

use std::time::Duration;

use async_trait::async_trait;

use super::{Pipe, PipeItem};
use crate::error::PipeError;

/// The readable end of a pipe: one consumer draining items in FIFO order.
#[async_trait]
pub trait PipeSource<T: Clone + Send + 'static>: Send + Sync {
    /// Get the next item, waiting until one is available.
    async fn get(&self) -> PipeItem<T>;

    /// Mark the most recently retrieved item as processed.
    fn task_done(&self);

    /// Wait until every retrieved item has been marked done.
    async fn join(&self);

    /// A copy of the buffered contents, oldest first.
    fn snapshot(&self) -> Vec<PipeItem<T>>;

    /// Number of buffered items.
    fn size(&self) -> usize;
}

/// The writable end of a pipe: one or more producers applying backpressure.
#[async_trait]
pub trait PipeSink<T: Send + 'static>: Send + Sync {
    /// Put an item, waiting up to `timeout` for buffer space.
    async fn put(&self, item: T, timeout: Duration) -> Result<(), PipeError>;

    /// Whether the buffer is at capacity.
    fn is_full(&self) -> bool;

    /// Return the endpoint to its active state.
    fn start(&self);

    /// Stop the endpoint, enqueueing the terminal sentinel.
    /// Returns `false` if it was already stopped.
    async fn stop(&self) -> bool;
}

#[async_trait]
impl<T: Clone + Send + 'static> PipeSource<T> for Pipe<T> {
    async fn get(&self) -> PipeItem<T> {
        Pipe::get(self).await
    }

    fn task_done(&self) {
        Pipe::task_done(self);
    }

    async fn join(&self) {
        Pipe::join(self).await;
    }

    fn snapshot(&self) -> Vec<PipeItem<T>> {
        Pipe::snapshot(self)
    }

    fn size(&self) -> usize {
        Pipe::size(self)
    }
}

#[async_trait]
impl<T: Send + 'static> PipeSink<T> for Pipe<T> {
    async fn put(&self, item: T, timeout: Duration) -> Result<(), PipeError> {
        Pipe::put(self, item, timeout).await
    }

    fn is_full(&self) -> bool {
        Pipe::is_full(self)
    }

    fn start(&self) {
        Pipe::start(self);
    }

    async fn stop(&self) -> bool {
        Pipe::stop(self).await
    }
}
