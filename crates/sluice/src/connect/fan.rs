//! Fan-in and fan-out across several pipes.
//!
//! Fan-in runs one transfer per source into a shared destination, which is
//! stopped exactly once after every source has finished. Fan-out reads one
//! source and distributes each item to every destination through its own
//! handler.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::config::RetryPolicy;
use sluice_core::emit;
use sluice_core::logging::{ErrorLog, Severity};
use sluice_core::metrics::events::ItemsLost;
use sluice_core::pipe::{PipeItem, PipeSink, PipeSource, sentinelize};

use super::handler::Handler;
use super::hooks::TransferHooks;
use super::transfer::{TransferConfig, deliver, transfer};
use crate::error::TransferError;

/// Drive one transfer per source into a shared destination.
///
/// The destination is stopped exactly once, after all sources finish.
/// The first worker failure is reported; later ones are logged. Ordering
/// is only guaranteed within each source's own sequence.
pub async fn multi_pipe_to_pipe<In, Out>(
    links: Vec<(Arc<dyn PipeSource<In>>, Handler<In, Out>)>,
    destination: Arc<dyn PipeSink<Out>>,
    retry: RetryPolicy,
    scope: String,
    errlog: Arc<ErrorLog>,
    token: CancellationToken,
) -> Result<(), TransferError>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let mut workers: JoinSet<Result<(), TransferError>> = JoinSet::new();
    for (index, (source, mut handler)) in links.into_iter().enumerate() {
        let destination = destination.clone();
        let errlog = errlog.clone();
        let token = token.child_token();
        let mut config = TransferConfig::with_scope(format!("{scope}[{index}]"));
        config.retry = retry.clone();
        config.stop_destination = false;
        workers.spawn(async move {
            let mut hooks = TransferHooks::default();
            transfer(
                source,
                &mut handler,
                destination,
                &mut config,
                &mut hooks,
                &errlog,
                token,
            )
            .await
        });
    }
    info!("{scope}: spawned fan-in workers");

    let mut first_failure: Option<TransferError> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_failure.is_none() {
                    first_failure = Some(err);
                } else {
                    errlog.log_chain(&err, Severity::Error);
                }
            }
            Err(join_err) => {
                error!("{scope}: fan-in worker aborted: {join_err}");
                if first_failure.is_none() {
                    first_failure = Some(TransferError::FanAborted {
                        message: join_err.to_string(),
                    });
                }
            }
        }
    }

    destination.stop().await;
    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Handlers for a fan-out: one shared transform, or one per destination.
pub enum FanHandlers<In, Out> {
    Shared(Handler<In, Out>),
    PerDestination(Vec<Handler<In, Out>>),
}

impl<In, Out> FanHandlers<In, Out> {
    fn lane(&mut self, index: usize) -> &mut Handler<In, Out> {
        match self {
            FanHandlers::Shared(handler) => handler,
            FanHandlers::PerDestination(handlers) => &mut handlers[index],
        }
    }
}

/// Distribute each item from one source to several destinations.
///
/// The sentinel stops every destination. On a delivery failure the
/// remaining destinations are stopped before the error propagates, so no
/// consumer is left waiting on a dead distributor.
pub async fn pipe_to_multi_pipe<In, Out>(
    source: Arc<dyn PipeSource<In>>,
    mut handlers: FanHandlers<In, Out>,
    destinations: Vec<Arc<dyn PipeSink<Out>>>,
    retry: RetryPolicy,
    scope: String,
    errlog: Arc<ErrorLog>,
    token: CancellationToken,
) -> Result<(), TransferError>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    if let FanHandlers::PerDestination(ref lanes) = handlers
        && lanes.len() != destinations.len()
    {
        return Err(TransferError::FanShape {
            handlers: lanes.len(),
            destinations: destinations.len(),
        });
    }

    let mut config = TransferConfig::with_scope(scope.clone());
    config.retry = retry;
    let mut hooks = TransferHooks::default();

    let main_loop = async {
        loop {
            let item = match source.get().await {
                PipeItem::Sentinel => {
                    debug!("{scope}: sentinel received, stopping destinations");
                    stop_all(&destinations).await;
                    source.task_done();
                    return Ok(());
                }
                PipeItem::Item(item) => item,
            };
            for (index, destination) in destinations.iter().enumerate() {
                deliver(
                    item.clone(),
                    handlers.lane(index),
                    destination.as_ref(),
                    &mut config,
                    &mut hooks,
                    &errlog,
                )
                .await?;
            }
            source.task_done();
            tokio::task::yield_now().await;
        }
    };

    match token.run_until_cancelled(main_loop).await {
        Some(Ok(())) => Ok(()),
        Some(Err(err)) => {
            stop_all(&destinations).await;
            Err(err)
        }
        None => {
            warn!("{scope}: cancelled, flushing buffered source items");
            let residue = sentinelize(source.snapshot());
            let pending = residue.len().saturating_sub(1);
            'flush: for (index, item) in residue.into_iter().enumerate() {
                let PipeItem::Item(item) = item else { break };
                for (lane, destination) in destinations.iter().enumerate() {
                    if let Err(err) = deliver(
                        item.clone(),
                        handlers.lane(lane),
                        destination.as_ref(),
                        &mut config,
                        &mut hooks,
                        &errlog,
                    )
                    .await
                    {
                        let dropped = pending - index;
                        error!(
                            "{scope}: data loss while flushing on cancellation: {dropped} buffered item(s) dropped"
                        );
                        emit!(ItemsLost {
                            count: dropped as u64,
                            fitting: scope.clone()
                        });
                        errlog.log_chain(&err, Severity::Error);
                        break 'flush;
                    }
                }
            }
            stop_all(&destinations).await;
            Err(TransferError::Cancelled)
        }
    }
}

async fn stop_all<Out: Send + 'static>(destinations: &[Arc<dyn PipeSink<Out>>]) {
    for destination in destinations {
        destination.stop().await;
    }
}
