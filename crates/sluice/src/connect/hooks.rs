//! Helper hooks observed around get, transform, and put.
//!
//! Hooks are wrapped uniformly: a [`Hook`] owns a named async callback and
//! captures any failure into [`TransferError::Hook`] carrying the hook name
//! with the original failure as cause. Hooks are owned by one transfer
//! invocation and dropped with it.

use std::future::Future;

use futures::future::BoxFuture;
use snafu::prelude::*;
use tracing::warn;

use sluice_core::logging::{ErrorLog, Severity};

use crate::error::{BoxError, HookSnafu, TransferError};

type HookFn = Box<dyn FnMut() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// A named async callback invoked through a uniform wrapper.
pub struct Hook {
    name: &'static str,
    call: HookFn,
}

impl Hook {
    pub fn new<F, Fut>(name: &'static str, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name,
            call: Box::new(move || Box::pin(callback())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    async fn invoke(&mut self) -> Result<(), TransferError> {
        (self.call)().await.context(HookSnafu { hook: self.name })
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook").field("name", &self.name).finish()
    }
}

/// The optional helper hooks observed by a transfer loop.
#[derive(Debug, Default)]
pub struct TransferHooks {
    pub on_successful_get: Option<Hook>,
    pub on_failed_get: Option<Hook>,
    pub on_failed_transform: Option<Hook>,
    pub on_successful_put: Option<Hook>,
    pub on_failed_put: Option<Hook>,
    /// Escalate success-path hook failures instead of suppressing them.
    /// Failure-path hooks are always suppressed so they cannot mask the
    /// primary failure that triggered them.
    pub raise_for_helpers: bool,
}

impl TransferHooks {
    pub(crate) async fn successful_get(&mut self, errlog: &ErrorLog) -> Result<(), TransferError> {
        fire_conditional(&mut self.on_successful_get, self.raise_for_helpers, errlog).await
    }

    pub(crate) async fn successful_put(&mut self, errlog: &ErrorLog) -> Result<(), TransferError> {
        fire_conditional(&mut self.on_successful_put, self.raise_for_helpers, errlog).await
    }

    pub(crate) async fn failed_get(&mut self, errlog: &ErrorLog) {
        fire_log_only(&mut self.on_failed_get, errlog).await;
    }

    pub(crate) async fn failed_transform(&mut self, errlog: &ErrorLog) {
        fire_log_only(&mut self.on_failed_transform, errlog).await;
    }

    pub(crate) async fn failed_put(&mut self, errlog: &ErrorLog) {
        fire_log_only(&mut self.on_failed_put, errlog).await;
    }
}

/// Fire a success-path hook: log failures, escalate when requested.
async fn fire_conditional(
    hook: &mut Option<Hook>,
    escalate: bool,
    errlog: &ErrorLog,
) -> Result<(), TransferError> {
    let Some(hook) = hook.as_mut() else {
        return Ok(());
    };
    match hook.invoke().await {
        Ok(()) => Ok(()),
        Err(err) => {
            errlog.log_chain(&err, Severity::Error);
            if escalate {
                Err(err)
            } else {
                warn!(hook = hook.name(), "helper hook failed (suppressed)");
                Ok(())
            }
        }
    }
}

/// Fire a failure-path hook: log failures, never escalate.
async fn fire_log_only(hook: &mut Option<Hook>, errlog: &ErrorLog) {
    let Some(hook) = hook.as_mut() else {
        return;
    };
    if let Err(err) = hook.invoke().await {
        errlog.log_chain(&err, Severity::Error);
        warn!(hook = hook.name(), "helper hook failed (suppressed)");
    }
}
