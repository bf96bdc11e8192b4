//! Task wrapper and lifecycle supervision for connecting tasks.
//!
//! Provides a unified way to represent async dataflow tasks with
//! identification, terminal-state tracking, and completion callbacks.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::emit;
use crate::metrics::events::TaskTerminated;

/// Result type for task execution.
pub type TaskResult = Result<TaskOutput, TaskError>;

/// Successful output from a task.
///
/// Tasks can optionally return a message about what they accomplished.
#[derive(Debug, Default)]
pub struct TaskOutput {
    /// Optional message describing what the task accomplished.
    pub message: Option<String>,
}

impl TaskOutput {
    /// Create an empty task output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a task output with a message.
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// Error type for task execution.
#[derive(Debug)]
pub enum TaskError {
    /// Task was cancelled via its cancellation token.
    Cancelled,
    /// Task panicked during execution.
    Panicked(String),
    /// Task failed with an error.
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "task cancelled"),
            Self::Panicked(msg) => write!(f, "task panicked: {}", msg),
            Self::Failed(err) => write!(f, "task failed: {}", err),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl TaskError {
    /// Create a Failed error from any error type.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Box::new(err))
    }

    /// Check if this is a cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this is a panic error.
    pub fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// Lifecycle of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NotStarted => "not_started",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Callback invoked once when the task completes normally.
pub type SuccessCallback = Box<dyn FnOnce(&TaskOutput) + Send>;
/// Callback invoked once when the task fails. This is the sole notification
/// channel for task failures; errors are not re-raised into the caller.
pub type FailureCallback = Box<dyn FnOnce(&TaskError) + Send>;

type SharedCallback<C> = Arc<Mutex<Option<C>>>;

fn shared<C>(value: Option<C>) -> SharedCallback<C> {
    Arc::new(Mutex::new(value))
}

fn take_callback<C>(slot: &SharedCallback<C>) -> Option<C> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Supervisor for one long-running connecting task.
///
/// `start` spawns the task plus a watcher that records the terminal state,
/// stores the last error, and fires the success or failure callback exactly
/// once. State transitions are only ever driven by that owned watcher, so
/// no external synchronization is needed.
pub struct TaskManager {
    name: String,
    cancel: CancellationToken,
    state_tx: watch::Sender<TaskState>,
    supervisor: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<Arc<TaskError>>>>,
    on_success: SharedCallback<SuccessCallback>,
    on_failure: SharedCallback<FailureCallback>,
}

impl TaskManager {
    /// Create a manager with no task attached yet.
    pub fn new(name: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(TaskState::NotStarted);
        Self {
            name: name.into(),
            cancel: CancellationToken::new(),
            state_tx,
            supervisor: None,
            last_error: Arc::new(Mutex::new(None)),
            on_success: shared(None),
            on_failure: shared(None),
        }
    }

    /// Register a callback fired exactly once on normal completion.
    pub fn on_success(&mut self, callback: impl FnOnce(&TaskOutput) + Send + 'static) {
        *self
            .on_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Register a callback fired exactly once on failure.
    pub fn on_failure(&mut self, callback: impl FnOnce(&TaskError) + Send + 'static) {
        *self
            .on_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// The name this manager reports in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state_tx.borrow()
    }

    /// Whether the task is currently running.
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// The last failure captured from the task, if any.
    pub fn last_error(&self) -> Option<Arc<TaskError>> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the task reaches a terminal state.
    ///
    /// Returns immediately if the task never started.
    pub async fn wait_terminal(&self) -> TaskState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != TaskState::Running {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Start the task built by `build`, handing it a fresh cancellation
    /// token. Returns `false` (without side effects) if already running.
    pub fn start<B, F>(&mut self, build: B) -> bool
    where
        B: FnOnce(CancellationToken) -> F,
        F: Future<Output = TaskResult> + Send + 'static,
    {
        if self.is_running() {
            warn!(task = %self.name, "start requested while already running");
            return false;
        }

        self.cancel = CancellationToken::new();
        let future = build(self.cancel.clone());
        self.state_tx.send_replace(TaskState::Running);

        let name = self.name.clone();
        let state_tx = self.state_tx.clone();
        let last_error = self.last_error.clone();
        let on_success = self.on_success.clone();
        let on_failure = self.on_failure.clone();

        let inner = tokio::spawn(future);
        self.supervisor = Some(tokio::spawn(async move {
            let result = match inner.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => Err(TaskError::Cancelled),
                Err(join_err) => Err(TaskError::Panicked(join_err.to_string())),
            };

            let state = match result {
                Ok(output) => {
                    debug!(task = %name, message = output.message.as_deref().unwrap_or(""), "task completed");
                    state_tx.send_replace(TaskState::Completed);
                    if let Some(callback) = take_callback(&on_success) {
                        callback(&output);
                    }
                    TaskState::Completed
                }
                Err(TaskError::Cancelled) => {
                    info!(task = %name, "task cancelled");
                    state_tx.send_replace(TaskState::Cancelled);
                    TaskState::Cancelled
                }
                Err(err) => {
                    error!(task = %name, error = %err, "task failed");
                    let err = Arc::new(err);
                    *last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(err.clone());
                    state_tx.send_replace(TaskState::Failed);
                    if let Some(callback) = take_callback(&on_failure) {
                        callback(&err);
                    }
                    TaskState::Failed
                }
            };
            emit!(TaskTerminated { task: name, state });
        }));
        true
    }

    /// Request cancellation and wait for the task to fully unwind,
    /// including any drain-and-flush work on the cancellation path.
    ///
    /// Returns the terminal state, or `None` if the task never started.
    pub async fn stop(&mut self) -> Option<TaskState> {
        let handle = self.supervisor.take()?;
        self.cancel.cancel();
        if let Err(join_err) = handle.await {
            error!(task = %self.name, error = %join_err, "task supervisor aborted");
        }
        Some(self.state())
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        // A dropped manager cannot be awaited, so the best it can do for a
        // still-running task is request cooperative cancellation.
        if self.is_running() {
            warn!(task = %self.name, "manager dropped while running, cancelling task");
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_output() {
        assert!(TaskOutput::empty().message.is_none());
        assert_eq!(
            TaskOutput::with_message("moved 3 items").message.as_deref(),
            Some("moved 3 items")
        );
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(format!("{}", TaskError::Cancelled), "task cancelled");
        assert_eq!(
            format!("{}", TaskError::Panicked("oops".to_string())),
            "task panicked: oops"
        );
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(format!("{}", TaskError::failed(io_err)).contains("task failed"));
    }

    #[test]
    fn test_task_error_predicates() {
        assert!(TaskError::Cancelled.is_cancelled());
        assert!(!TaskError::Panicked("x".to_string()).is_cancelled());
        assert!(TaskError::Panicked("x".to_string()).is_panicked());
    }

    #[tokio::test]
    async fn test_completion_fires_success_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = TaskManager::new("worker");
        {
            let calls = calls.clone();
            manager.on_success(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(manager.state(), TaskState::NotStarted);

        manager.start(|_token| async { Ok(TaskOutput::empty()) });
        assert_eq!(manager.wait_terminal().await, TaskState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_running());
        assert!(manager.last_error().is_none());

        // A second run does not re-fire the callback.
        manager.start(|_token| async { Ok(TaskOutput::empty()) });
        assert_eq!(manager.wait_terminal().await, TaskState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_stores_error_and_fires_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = TaskManager::new("worker");
        {
            let calls = calls.clone();
            manager.on_failure(move |err| {
                assert!(!err.is_cancelled());
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        manager.start(|_token| async {
            Err(TaskError::failed(std::io::Error::other("boom")))
        });
        assert_eq!(manager.wait_terminal().await, TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = manager.last_error().expect("error stored");
        assert!(format!("{err}").contains("boom"));
    }

    #[tokio::test]
    async fn test_stop_cancels_and_waits() {
        let mut manager = TaskManager::new("worker");
        manager.start(|token| async move {
            token.cancelled().await;
            Err(TaskError::Cancelled)
        });
        assert!(manager.is_running());

        let state = manager.stop().await;
        assert_eq!(state, Some(TaskState::Cancelled));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut manager = TaskManager::new("worker");
        assert_eq!(manager.stop().await, None);
        assert_eq!(manager.state(), TaskState::NotStarted);
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let mut manager = TaskManager::new("worker");
        manager.start(|token| async move {
            token.cancelled().await;
            Err(TaskError::Cancelled)
        });
        assert!(!manager.start(|_token| async { Ok(TaskOutput::empty()) }));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_failure() {
        let mut manager = TaskManager::new("worker");
        manager.start(|_token| async { panic!("kaboom") });
        assert_eq!(manager.wait_terminal().await, TaskState::Failed);
        let err = manager.last_error().expect("error stored");
        assert!(err.is_panicked());
    }
}
