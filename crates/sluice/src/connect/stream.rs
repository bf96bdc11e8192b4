//! Connectors from an external push stream into a pipe.
//!
//! [`stream_to_pipe`] adapts anything implementing [`StreamListener`] into
//! the same deliver path as the pipe-to-pipe transfer. The reconnecting
//! variant supervises it, treating classified-transient failures as a cue
//! to disconnect, back off, and connect again.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::config::ReconnectPolicy;
use sluice_core::emit;
use sluice_core::logging::{ErrorLog, Severity};
use sluice_core::metrics::events::{ItemsMoved, ReconnectAttempted};
use sluice_core::pipe::PipeSink;

use super::handler::Handler;
use super::hooks::TransferHooks;
use super::transfer::{TransferConfig, deliver};
use crate::error::{ConnectionExhaustedSnafu, StreamError, TransferError};

/// The external-stream capability: a connectable push source of items.
#[async_trait]
pub trait StreamListener: Send {
    type Item: Send;

    /// Establish the underlying connection.
    async fn connect(&mut self) -> Result<(), StreamError>;

    /// Tear down the underlying connection.
    async fn disconnect(&mut self) -> Result<(), StreamError>;

    /// The pushed items. The stream ends when the remote shuts down
    /// gracefully; failures surface as [`StreamError`] items.
    fn messages(&mut self) -> BoxStream<'_, Result<Self::Item, StreamError>>;
}

/// Classifies which stream failures can be healed by reconnecting.
pub type Recoverable = dyn Fn(&StreamError) -> bool + Send + Sync;

/// Drive a connected stream into a destination pipe.
///
/// Normal stream exhaustion stops the destination. A failure the
/// classifier deems recoverable returns the internal
/// [`TransferError::Reconnect`] signal and leaves the destination running
/// so a reconnecting supervisor can resume it. Any other failure, and
/// cancellation, stops the destination before propagating.
///
/// The caller is responsible for `connect`/`disconnect`.
pub async fn stream_to_pipe<In, Out>(
    source: &mut dyn StreamListener<Item = In>,
    handler: &mut Handler<In, Out>,
    destination: &Arc<dyn PipeSink<Out>>,
    config: &mut TransferConfig<In, Out>,
    hooks: &mut TransferHooks,
    errlog: &ErrorLog,
    recoverable: &Recoverable,
    token: &CancellationToken,
) -> Result<(), TransferError>
where
    In: Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let run = async {
        let mut moved = 0usize;
        let mut messages = source.messages();
        while let Some(next) = messages.next().await {
            let item = match next {
                Ok(item) => item,
                Err(err) if recoverable(&err) => {
                    warn!(
                        "{}: recoverable stream failure, requesting reconnect: {err}",
                        config.scope
                    );
                    return Err(TransferError::Reconnect {
                        items_moved: moved,
                        source: err,
                    });
                }
                Err(err) => {
                    hooks.failed_get(errlog).await;
                    let err = TransferError::SourceGet { source: err };
                    errlog.log_chain(&err, Severity::Error);
                    return Err(err);
                }
            };

            if let Some(condition) = config.get_condition.as_mut() {
                match condition.admit(&item) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("{}: item rejected by get predicate", config.scope);
                        continue;
                    }
                    Err(source_err) => {
                        hooks.failed_get(errlog).await;
                        let err = TransferError::ConditionalGet { source: source_err };
                        errlog.log_chain(&err, Severity::Error);
                        return Err(err);
                    }
                }
            }
            hooks.successful_get(errlog).await?;

            let written =
                deliver(item, handler, destination.as_ref(), config, hooks, errlog).await?;
            if written > 0 {
                moved += written;
                emit!(ItemsMoved {
                    count: written as u64,
                    fitting: config.scope.clone()
                });
            }
            tokio::task::yield_now().await;
        }
        info!("{}: stream ended", config.scope);
        Ok(())
    };

    match token.run_until_cancelled(run).await {
        Some(Ok(())) => {
            if config.stop_destination {
                destination.stop().await;
            }
            Ok(())
        }
        Some(Err(err)) => {
            // The reconnect signal leaves the destination running so the
            // supervising connector can resume it after reconnecting.
            if !err.is_reconnect() && config.stop_destination {
                destination.stop().await;
            }
            Err(err)
        }
        None => {
            warn!("{}: cancelled, stopping destination", config.scope);
            if config.stop_destination {
                destination.stop().await;
            }
            Err(TransferError::Cancelled)
        }
    }
}

/// Supervise [`stream_to_pipe`], reconnecting on transient failures.
///
/// On the internal reconnect signal: disconnect, wait `policy.interval()`,
/// connect, and retry. The attempt counter resets after any pass that
/// moved at least one item. Exceeding `policy.max_attempts` disconnects
/// once more, stops the destination, and escalates to a fatal connection
/// error. Cancellation and non-recoverable failures propagate immediately.
pub async fn reconnecting_stream_to_pipe<In, Out>(
    source: &mut dyn StreamListener<Item = In>,
    handler: &mut Handler<In, Out>,
    destination: Arc<dyn PipeSink<Out>>,
    config: &mut TransferConfig<In, Out>,
    hooks: &mut TransferHooks,
    errlog: &ErrorLog,
    policy: &ReconnectPolicy,
    recoverable: &Recoverable,
    token: CancellationToken,
) -> Result<(), TransferError>
where
    In: Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let mut attempts: u32 = 0;
    loop {
        if let Err(err) = source.connect().await {
            errlog.log_chain(&err, Severity::Warn);
            if !recoverable(&err) {
                destination.stop().await;
                return Err(TransferError::SourceGet { source: err });
            }
            attempts += 1;
            if attempts > policy.max_attempts {
                error!(
                    "{}: giving up after {} reconnect attempt(s)",
                    config.scope, policy.max_attempts
                );
                destination.stop().await;
                return Err(err).context(ConnectionExhaustedSnafu {
                    attempts: policy.max_attempts,
                });
            }
            wait_reconnect(config, policy, attempts, &destination, &token).await?;
            continue;
        }

        match stream_to_pipe(
            source,
            handler,
            &destination,
            config,
            hooks,
            errlog,
            recoverable,
            &token,
        )
        .await
        {
            Ok(()) => {
                disconnect_quietly(source, &config.scope).await;
                return Ok(());
            }
            Err(TransferError::Reconnect {
                items_moved,
                source: cause,
            }) => {
                if items_moved > 0 {
                    // A pass that moved data proves the route works; the
                    // budget applies to consecutive dead connections only.
                    attempts = 0;
                }
                attempts += 1;
                disconnect_quietly(source, &config.scope).await;
                if attempts > policy.max_attempts {
                    error!(
                        "{}: giving up after {} reconnect attempt(s)",
                        config.scope, policy.max_attempts
                    );
                    destination.stop().await;
                    return Err(cause).context(ConnectionExhaustedSnafu {
                        attempts: policy.max_attempts,
                    });
                }
                wait_reconnect(config, policy, attempts, &destination, &token).await?;
            }
            Err(err) => {
                // Cancellation and fatal failures: the base connector has
                // already stopped the destination.
                disconnect_quietly(source, &config.scope).await;
                return Err(err);
            }
        }
    }
}

/// Sleep out the reconnect interval, aborting promptly on cancellation.
async fn wait_reconnect<In, Out>(
    config: &TransferConfig<In, Out>,
    policy: &ReconnectPolicy,
    attempt: u32,
    destination: &Arc<dyn PipeSink<Out>>,
    token: &CancellationToken,
) -> Result<(), TransferError>
where
    Out: Send + 'static,
{
    info!(
        "{}: reconnecting in {:?} (attempt {}/{})",
        config.scope,
        policy.interval(),
        attempt,
        policy.max_attempts
    );
    emit!(ReconnectAttempted {
        attempt,
        fitting: config.scope.clone()
    });
    tokio::select! {
        biased;

        _ = token.cancelled() => {
            warn!("{}: cancelled while waiting to reconnect", config.scope);
            if config.stop_destination {
                destination.stop().await;
            }
            Err(TransferError::Cancelled)
        }
        _ = tokio::time::sleep(policy.interval()) => Ok(()),
    }
}

async fn disconnect_quietly<In: Send>(source: &mut dyn StreamListener<Item = In>, scope: &str) {
    if let Err(err) = source.disconnect().await {
        warn!("{scope}: disconnect failed: {err}");
    }
}
