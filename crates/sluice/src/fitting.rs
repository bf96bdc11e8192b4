//! Fittings: named, restartable bindings of source, handler, destination.
//!
//! A fitting owns everything one dataflow needs: the source (a pipe or an
//! external stream listener), at most one handler, the destination, and
//! the task manager that supervises the connecting task. Constructed
//! inert; `start` hands the connecting future to the manager, `stop`
//! cancels it and waits for the drain to finish.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use sluice_core::config::{ReconnectPolicy, RetryPolicy};
use sluice_core::logging::{ErrorLog, ShieldPolicy, Shielded, shielded};
use sluice_core::pipe::{PipeSink, PipeSource};
use sluice_core::task::{TaskError, TaskManager, TaskOutput, TaskState};

use crate::connect::{
    Condition, Handler, StreamListener, TransferConfig, TransferHooks,
    reconnecting_stream_to_pipe, stream_to_pipe, transfer,
};
use crate::error::{FittingError, MissingDestinationSnafu, MissingHandlerSnafu, MissingSourceSnafu, StreamError, TransferError};
use snafu::prelude::*;

/// Classifier shared by a fitting's stream connectors.
type RecoverableFn = Arc<dyn Fn(&StreamError) -> bool + Send + Sync>;

/// The source end a fitting reads from.
enum FittingSource<In> {
    Pipe(Arc<dyn PipeSource<In>>),
    Stream(Arc<Mutex<Box<dyn StreamListener<Item = In>>>>),
}

impl<In> Clone for FittingSource<In> {
    fn clone(&self) -> Self {
        match self {
            FittingSource::Pipe(pipe) => FittingSource::Pipe(pipe.clone()),
            FittingSource::Stream(listener) => FittingSource::Stream(listener.clone()),
        }
    }
}

/// Mutable pieces handed to one run of the connecting task.
struct RunState<In, Out> {
    handler: Handler<In, Out>,
    config: TransferConfig<In, Out>,
    hooks: TransferHooks,
}

/// A named binding of one source, at most one handler, and one
/// destination, run as a supervised background dataflow.
pub struct Fitting<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    name: String,
    source: FittingSource<In>,
    destination: Arc<dyn PipeSink<Out>>,
    run_state: Arc<Mutex<RunState<In, Out>>>,
    errlog: Arc<ErrorLog>,
    reconnect: Option<ReconnectPolicy>,
    recoverable: RecoverableFn,
    manager: TaskManager,
}

impl<In, Out> Fitting<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> FittingBuilder<In, Out> {
        FittingBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.manager.state()
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    pub fn last_error(&self) -> Option<Arc<TaskError>> {
        self.manager.last_error()
    }

    /// Wait until the connecting task reaches a terminal state.
    pub async fn wait_terminal(&self) -> TaskState {
        self.manager.wait_terminal().await
    }

    /// The per-fitting de-duplicating error log.
    pub fn errlog(&self) -> &Arc<ErrorLog> {
        &self.errlog
    }

    /// Register a callback fired exactly once on normal completion.
    pub fn on_success(&mut self, callback: impl FnOnce(&TaskOutput) + Send + 'static) {
        self.manager.on_success(callback);
    }

    /// Register a callback fired exactly once on failure.
    pub fn on_failure(&mut self, callback: impl FnOnce(&TaskError) + Send + 'static) {
        self.manager.on_failure(callback);
    }

    /// Hand the connecting task to the task manager.
    ///
    /// Returns `false` if the fitting is already running.
    pub fn start(&mut self) -> bool {
        let source = self.source.clone();
        let destination = self.destination.clone();
        let run_state = self.run_state.clone();
        let errlog = self.errlog.clone();
        let reconnect = self.reconnect.clone();
        let recoverable = self.recoverable.clone();

        self.manager.start(move |token| async move {
            let mut state = run_state.lock_owned().await;
            let RunState {
                handler,
                config,
                hooks,
            } = &mut *state;

            let connector = async {
                match source {
                    FittingSource::Pipe(pipe) => {
                        transfer(pipe, handler, destination.clone(), config, hooks, &errlog, token)
                            .await
                    }
                    FittingSource::Stream(listener) => {
                        let mut listener = listener.lock_owned().await;
                        match reconnect {
                            Some(policy) => {
                                reconnecting_stream_to_pipe(
                                    listener.as_mut(),
                                    handler,
                                    destination.clone(),
                                    config,
                                    hooks,
                                    &errlog,
                                    &policy,
                                    recoverable.as_ref(),
                                    token,
                                )
                                .await
                            }
                            None => {
                                if let Err(source) = listener.connect().await {
                                    destination.stop().await;
                                    return Err(TransferError::SourceGet { source });
                                }
                                let result = stream_to_pipe(
                                    listener.as_mut(),
                                    handler,
                                    &destination,
                                    config,
                                    hooks,
                                    &errlog,
                                    recoverable.as_ref(),
                                    &token,
                                )
                                .await;
                                if let Err(err) = listener.disconnect().await {
                                    warn!("disconnect failed: {err}");
                                }
                                result
                            }
                        }
                    }
                }
            };

            let policy = ShieldPolicy::new(|err: &TransferError| err.is_cancelled());
            match shielded(connector, &policy, &errlog, TaskError::failed).await {
                Shielded::Done(()) => Ok(TaskOutput::with_message("dataflow finished")),
                Shielded::Cancelled { .. } => Err(TaskError::Cancelled),
                Shielded::Raised(err) => Err(TaskError::failed(err)),
                Shielded::Converted(err) => Err(err),
            }
        })
    }

    /// Request cancellation and wait for the connecting task to unwind,
    /// including its drain-and-flush work.
    pub async fn stop(&mut self) -> Option<TaskState> {
        self.manager.stop().await
    }
}

impl<In, Out> std::fmt::Debug for Fitting<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fitting")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Fitting`] from its parts.
pub struct FittingBuilder<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    name: String,
    source: Option<FittingSource<In>>,
    handler: Option<Handler<In, Out>>,
    destination: Option<Arc<dyn PipeSink<Out>>>,
    retry: RetryPolicy,
    reconnect: Option<ReconnectPolicy>,
    recoverable: RecoverableFn,
    get_condition: Option<Condition<In>>,
    put_condition: Option<Condition<Out>>,
    hooks: TransferHooks,
}

impl<In, Out> FittingBuilder<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            handler: None,
            destination: None,
            retry: RetryPolicy::default(),
            reconnect: None,
            recoverable: Arc::new(StreamError::is_recoverable),
            get_condition: None,
            put_condition: None,
            hooks: TransferHooks::default(),
        }
    }

    /// Read from a pipe.
    pub fn source_pipe(mut self, source: Arc<dyn PipeSource<In>>) -> Self {
        self.source = Some(FittingSource::Pipe(source));
        self
    }

    /// Read from an external stream listener.
    pub fn source_stream(mut self, listener: impl StreamListener<Item = In> + 'static) -> Self {
        self.source = Some(FittingSource::Stream(Arc::new(Mutex::new(Box::new(
            listener,
        )))));
        self
    }

    pub fn handler(mut self, handler: Handler<In, Out>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn destination(mut self, destination: Arc<dyn PipeSink<Out>>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Supervise stream sources with automatic reconnection.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Override the classification of recoverable stream failures.
    pub fn recoverable(
        mut self,
        classify: impl Fn(&StreamError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.recoverable = Arc::new(classify);
        self
    }

    pub fn get_condition(mut self, condition: Condition<In>) -> Self {
        self.get_condition = Some(condition);
        self
    }

    pub fn put_condition(mut self, condition: Condition<Out>) -> Self {
        self.put_condition = Some(condition);
        self
    }

    pub fn hooks(mut self, hooks: TransferHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<Fitting<In, Out>, FittingError> {
        let source = self.source.context(MissingSourceSnafu {
            name: self.name.clone(),
        })?;
        let destination = self.destination.context(MissingDestinationSnafu {
            name: self.name.clone(),
        })?;
        let handler = self.handler.context(MissingHandlerSnafu {
            name: self.name.clone(),
        })?;

        let mut config = TransferConfig::with_scope(self.name.clone());
        config.retry = self.retry;
        config.get_condition = self.get_condition;
        config.put_condition = self.put_condition;

        Ok(Fitting {
            manager: TaskManager::new(self.name.clone()),
            name: self.name,
            source,
            destination,
            run_state: Arc::new(Mutex::new(RunState {
                handler,
                config,
                hooks: self.hooks,
            })),
            errlog: Arc::new(ErrorLog::new()),
            reconnect: self.reconnect,
            recoverable: self.recoverable,
        })
    }
}

impl<T> FittingBuilder<T, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Forward items unchanged (the identity handler).
    pub fn passthrough(mut self) -> Self {
        self.handler = Some(Handler::identity());
        self
    }
}
