//! Bounded async pipes carrying domain items or a terminal sentinel.
//!
//! A [`Pipe`] is a FIFO buffer shared between one consumer task and one or
//! more producer tasks. Producers suspend when the buffer is full; the
//! consumer suspends when it is empty. Stopping a pipe enqueues a single
//! [`PipeItem::Sentinel`] so the consumer always observes a terminal marker,
//! even when the buffer is at capacity.

mod traits;

pub use traits::{PipeSink, PipeSource};

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{FullSnafu, PipeError, StoppedSnafu};
use snafu::prelude::*;

/// One slot of a pipe: either a domain item or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeItem<T> {
    /// A domain value flowing through the pipe.
    Item(T),
    /// Terminal marker: no further items will follow.
    Sentinel,
}

impl<T> PipeItem<T> {
    /// Returns true if this slot is the terminal marker.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, PipeItem::Sentinel)
    }

    /// Unwrap the domain value, if any.
    pub fn into_item(self) -> Option<T> {
        match self {
            PipeItem::Item(item) => Some(item),
            PipeItem::Sentinel => None,
        }
    }

    /// Borrow the domain value, if any.
    pub fn as_item(&self) -> Option<&T> {
        match self {
            PipeItem::Item(item) => Some(item),
            PipeItem::Sentinel => None,
        }
    }
}

/// Normalize a drained buffer so it ends with exactly one sentinel.
///
/// Truncates at the first embedded sentinel, discarding anything queued
/// after it, or appends one if absent. Idempotent.
pub fn sentinelize<T>(mut items: Vec<PipeItem<T>>) -> Vec<PipeItem<T>> {
    match items.iter().position(PipeItem::is_sentinel) {
        Some(index) => items.truncate(index + 1),
        None => items.push(PipeItem::Sentinel),
    }
    items
}

struct PipeState<T> {
    buffer: VecDeque<PipeItem<T>>,
    stopped: bool,
    /// Items put but not yet acknowledged via `task_done`.
    unfinished: usize,
}

/// Outcome of a single non-blocking put attempt.
enum Offer<T> {
    Accepted,
    Stopped,
    Full(T),
}

/// A bounded FIFO queue of items terminated by a sentinel.
///
/// FIFO order is preserved per producer. All mutation goes through the
/// internal lock, so a pipe can be freely shared behind an [`Arc`].
pub struct Pipe<T> {
    capacity: usize,
    state: Mutex<PipeState<T>>,
    /// Signalled when an item becomes available to get.
    readable: Notify,
    /// Signalled when buffer space frees up.
    writable: Notify,
    /// Signalled when the unfinished count reaches zero.
    drained: Notify,
}

impl<T> Pipe<T> {
    /// Create a pipe holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PipeState {
                buffer: VecDeque::new(),
                stopped: false,
                unfinished: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipeState<T>> {
        // The lock is only held for short, non-suspending sections, so a
        // poisoned lock still leaves the state consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of buffered items (including a queued sentinel).
    pub fn size(&self) -> usize {
        self.state().buffer.len()
    }

    /// Maximum number of items the pipe buffers before applying backpressure.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer is at or above capacity.
    pub fn is_full(&self) -> bool {
        self.state().buffer.len() >= self.capacity
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.state().buffer.is_empty()
    }

    /// Whether the pipe has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    /// Get the next item in FIFO order, waiting until one is available.
    pub async fn get(&self) -> PipeItem<T> {
        loop {
            // Register for wakeups before checking, so a put landing between
            // the check and the await is not lost.
            let notified = self.readable.notified();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    fn try_get(&self) -> Option<PipeItem<T>> {
        let mut state = self.state();
        let item = state.buffer.pop_front()?;
        drop(state);
        self.writable.notify_one();
        Some(item)
    }

    /// Put an item, waiting up to `timeout` for buffer space.
    ///
    /// Fails with [`PipeError::Stopped`] once the pipe has been stopped and
    /// with [`PipeError::Full`] when the deadline passes without space
    /// freeing up. The item is never silently dropped: an error means the
    /// caller still decides what to do with it.
    pub async fn put(&self, item: T, timeout: Duration) -> Result<(), PipeError> {
        match tokio::time::timeout(timeout, self.put_when_writable(item)).await {
            Ok(result) => result,
            Err(_) => FullSnafu {
                waited_ms: timeout.as_millis() as u64,
            }
            .fail(),
        }
    }

    async fn put_when_writable(&self, item: T) -> Result<(), PipeError> {
        let mut pending = Some(item);
        loop {
            let notified = self.writable.notified();
            if let Some(item) = pending.take() {
                match self.offer(item) {
                    Offer::Accepted => return Ok(()),
                    Offer::Stopped => return StoppedSnafu.fail(),
                    Offer::Full(item) => pending = Some(item),
                }
            }
            notified.await;
        }
    }

    fn offer(&self, item: T) -> Offer<T> {
        let mut state = self.state();
        if state.stopped {
            return Offer::Stopped;
        }
        if state.buffer.len() >= self.capacity {
            return Offer::Full(item);
        }
        state.buffer.push_back(PipeItem::Item(item));
        state.unfinished += 1;
        drop(state);
        self.readable.notify_one();
        Offer::Accepted
    }

    /// Stop the pipe: reject further puts and enqueue the sentinel.
    ///
    /// The sentinel bypasses the capacity bound, so termination never
    /// deadlocks on a full buffer. Returns `false` if already stopped.
    pub async fn stop(&self) -> bool {
        {
            let mut state = self.state();
            if state.stopped {
                return false;
            }
            state.buffer.push_back(PipeItem::Sentinel);
            state.unfinished += 1;
            state.stopped = true;
        }
        self.readable.notify_one();
        // Wake blocked producers so they observe the stop and fail fast.
        self.writable.notify_waiters();
        // Let the consumer observe the sentinel promptly.
        tokio::task::yield_now().await;
        true
    }

    /// Return the pipe to `ACTIVE`, clearing the buffer and counters.
    pub fn start(&self) {
        {
            let mut state = self.state();
            state.buffer.clear();
            state.unfinished = 0;
            state.stopped = false;
        }
        self.writable.notify_waiters();
        self.drained.notify_waiters();
    }

    /// Mark the most recently retrieved item as processed.
    pub fn task_done(&self) {
        let mut state = self.state();
        if state.unfinished == 0 {
            drop(state);
            warn!("task_done called with no outstanding items");
            return;
        }
        state.unfinished -= 1;
        let drained = state.unfinished == 0;
        drop(state);
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every retrieved item has been marked done.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if self.state().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Pipe<T> {
    /// A copy of the buffered contents, oldest first, without consuming them.
    ///
    /// Used for best-effort draining when a connecting task is cancelled.
    pub fn snapshot(&self) -> Vec<PipeItem<T>> {
        self.state().buffer.iter().cloned().collect()
    }
}

impl<T: Send + 'static> Pipe<T> {
    /// Consume the pipe as an async stream, ending at the sentinel.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = T> + Send {
        futures::stream::unfold(self, |pipe| async move {
            match pipe.get().await {
                PipeItem::Item(item) => {
                    pipe.task_done();
                    Some((item, pipe))
                }
                PipeItem::Sentinel => {
                    pipe.task_done();
                    None
                }
            }
        })
    }
}

impl<T> std::fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Pipe")
            .field("capacity", &self.capacity)
            .field("size", &state.buffer.len())
            .field("stopped", &state.stopped)
            .finish_non_exhaustive()
    }
}
