//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a dataflow.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! counter metric, labelled by the fitting (or task) that produced it so
//! multi-fitting deployments stay observable per component.

use metrics::counter;
use tracing::trace;

use crate::task::TaskState;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when items are written to a destination pipe.
pub struct ItemsMoved {
    pub count: u64,
    /// Fitting label for multi-fitting deployments.
    pub fitting: String,
}

impl InternalEvent for ItemsMoved {
    fn emit(self) {
        trace!(count = self.count, fitting = %self.fitting, "Items moved");
        counter!("sluice_items_moved_total", "fitting" => self.fitting).increment(self.count);
    }
}

/// Event emitted when buffered items are dropped on a failure path.
pub struct ItemsLost {
    pub count: u64,
    /// Fitting label for multi-fitting deployments.
    pub fitting: String,
}

impl InternalEvent for ItemsLost {
    fn emit(self) {
        trace!(count = self.count, fitting = %self.fitting, "Items lost");
        counter!("sluice_items_lost_total", "fitting" => self.fitting).increment(self.count);
    }
}

/// Event emitted when a put is retried because the destination is full.
pub struct PutRetried {
    /// Fitting label for multi-fitting deployments.
    pub fitting: String,
}

impl InternalEvent for PutRetried {
    fn emit(self) {
        trace!(fitting = %self.fitting, "Put retried");
        counter!("sluice_put_retries_total", "fitting" => self.fitting).increment(1);
    }
}

/// Event emitted when a stream connector schedules a reconnect.
pub struct ReconnectAttempted {
    pub attempt: u32,
    /// Fitting label for multi-fitting deployments.
    pub fitting: String,
}

impl InternalEvent for ReconnectAttempted {
    fn emit(self) {
        trace!(attempt = self.attempt, fitting = %self.fitting, "Reconnect attempted");
        counter!("sluice_reconnects_total", "fitting" => self.fitting).increment(1);
    }
}

/// Event emitted when a supervised task reaches a terminal state.
pub struct TaskTerminated {
    pub task: String,
    pub state: TaskState,
}

impl InternalEvent for TaskTerminated {
    fn emit(self) {
        trace!(task = %self.task, state = self.state.as_str(), "Task terminated");
        counter!("sluice_tasks_terminated_total", "state" => self.state.as_str(), "task" => self.task)
            .increment(1);
    }
}
