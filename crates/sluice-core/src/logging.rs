//! De-duplicating diagnostics and shielded task bodies.
//!
//! Errors in a dataflow get wrapped repeatedly as they climb from a put
//! failure through the transfer loop into the task supervisor. [`ErrorLog`]
//! keeps one set of already-logged messages per fitting (created with the
//! fitting, discarded with it) so a cause chain is only reported once no
//! matter how many layers re-log it.

use std::collections::HashSet;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Severity used when logging an error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Debug,
}

fn log_line(severity: Severity, message: &str) {
    match severity {
        Severity::Error => error!("{message}"),
        Severity::Warn => warn!("{message}"),
        Severity::Debug => debug!("{message}"),
    }
}

/// Per-fitting record of error messages that have already been logged.
#[derive(Debug, Default)]
pub struct ErrorLog {
    seen: Mutex<HashSet<String>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log `err` and its cause chain, skipping anything already logged.
    ///
    /// The error's display form is logged first, then each previously
    /// unseen cause, outermost first. An empty display falls back to the
    /// debug representation so a failure is never reported as a blank line.
    /// Returns the number of lines actually emitted.
    pub fn log_chain(&self, err: &(dyn StdError + 'static), severity: Severity) -> usize {
        let mut emitted = 0;
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        let mut first = true;
        while let Some(err) = current {
            let mut message = err.to_string();
            if message.is_empty() {
                message = format!("{err:?}");
            }
            if self.seen().insert(message.clone()) {
                if first {
                    log_line(severity, &message);
                } else {
                    log_line(severity, &format!("caused by: {message}"));
                }
                emitted += 1;
            }
            first = false;
            current = err.source();
        }
        emitted
    }

    /// Forget everything logged so far.
    pub fn clear(&self) {
        self.seen().clear();
    }
}

/// What to do with a cancellation observed inside a shielded body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Report the cancellation to the caller.
    Propagate,
    /// Log it and treat the body as finished without a value.
    Swallow,
}

/// Classification rules for [`shielded`].
pub struct ShieldPolicy<E> {
    pub on_cancel: CancelPolicy,
    /// Recognizes the error value that represents cancellation.
    pub is_cancel: fn(&E) -> bool,
    /// Errors matching this predicate are re-raised unchanged.
    pub reraise: Option<fn(&E) -> bool>,
}

impl<E> ShieldPolicy<E> {
    pub fn new(is_cancel: fn(&E) -> bool) -> Self {
        Self {
            on_cancel: CancelPolicy::Propagate,
            is_cancel,
            reraise: None,
        }
    }

    pub fn swallow_cancel(mut self) -> Self {
        self.on_cancel = CancelPolicy::Swallow;
        self
    }

    pub fn reraise_if(mut self, predicate: fn(&E) -> bool) -> Self {
        self.reraise = Some(predicate);
        self
    }
}

/// Outcome of a shielded task body.
#[derive(Debug)]
pub enum Shielded<T, E, C> {
    /// The body ran to completion.
    Done(T),
    /// Cancellation was observed; `swallowed` reflects the policy applied.
    Cancelled { swallowed: bool },
    /// An allow-listed failure, re-raised unchanged.
    Raised(E),
    /// Any other failure, converted with the original preserved as cause.
    Converted(C),
}

/// Run a task body, classifying its failure per `policy`.
///
/// Cancellation is logged and never converted into a different error.
/// Allow-listed errors are logged and re-raised unchanged. Everything else
/// is logged and passed through `convert`, which is expected to wrap the
/// original error as the cause of the returned one.
pub async fn shielded<T, E, C, F>(
    future: F,
    policy: &ShieldPolicy<E>,
    errlog: &ErrorLog,
    convert: impl FnOnce(E) -> C,
) -> Shielded<T, E, C>
where
    F: Future<Output = Result<T, E>>,
    E: StdError + 'static,
{
    match future.await {
        Ok(value) => Shielded::Done(value),
        Err(err) if (policy.is_cancel)(&err) => {
            let swallowed = policy.on_cancel == CancelPolicy::Swallow;
            info!(swallowed, "shielded body cancelled");
            Shielded::Cancelled { swallowed }
        }
        Err(err) => {
            errlog.log_chain(&err, Severity::Error);
            if policy.reraise.is_some_and(|matches| matches(&err)) {
                Shielded::Raised(err)
            } else {
                Shielded::Converted(convert(err))
            }
        }
    }
}

/// Initialize tracing for applications embedding the framework.
///
/// Uses the `RUST_LOG` environment variable for filtering, defaulting to
/// `info` level.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
