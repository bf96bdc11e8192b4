//! The generic get, transform, put loop with drain-on-cancel.
//!
//! [`transfer`] drives one source pipe into one destination until the
//! source's sentinel arrives. Cancellation is cooperative: the loop is
//! interrupted at its current suspension point, the source's buffered
//! snapshot is normalized with a sentinel and best-effort flushed to the
//! destination, and only then does the cancellation propagate.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::config::RetryPolicy;
use sluice_core::emit;
use sluice_core::logging::{ErrorLog, Severity};
use sluice_core::metrics::events::{ItemsLost, ItemsMoved};
use sluice_core::pipe::{PipeItem, PipeSink, PipeSource, sentinelize};

use std::sync::Arc;

use super::handler::{Applied, Handler};
use super::hooks::TransferHooks;
use super::put::{Condition, Payload, put_on_condition};
use crate::error::TransferError;

/// Settings shared by the connector loops.
pub struct TransferConfig<In, Out> {
    pub retry: RetryPolicy,
    /// Optional admission predicate applied to items read from the source.
    pub get_condition: Option<Condition<In>>,
    /// Optional admission predicate applied to items before each put.
    pub put_condition: Option<Condition<Out>>,
    /// Stop the destination when this connector finishes. Fan-in workers
    /// sharing a destination disable this and stop it once at the end.
    pub stop_destination: bool,
    /// Label used in logs and metrics.
    pub scope: String,
}

impl<In, Out> Default for TransferConfig<In, Out> {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            get_condition: None,
            put_condition: None,
            stop_destination: true,
            scope: "transfer".to_string(),
        }
    }
}

impl<In, Out> TransferConfig<In, Out> {
    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }
}

/// Move items from a source pipe to a destination until the sentinel
/// arrives, applying the handler to each item.
///
/// The sentinel is not forwarded: the destination is stopped instead,
/// which enqueues its own terminal marker. Helper hooks are invoked
/// through the uniform wrapper in [`TransferHooks`]; the primary
/// get/transform/put failure always propagates after being logged.
pub async fn transfer<In, Out>(
    source: Arc<dyn PipeSource<In>>,
    handler: &mut Handler<In, Out>,
    destination: Arc<dyn PipeSink<Out>>,
    config: &mut TransferConfig<In, Out>,
    hooks: &mut TransferHooks,
    errlog: &ErrorLog,
    token: CancellationToken,
) -> Result<(), TransferError>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let main_loop = async {
        loop {
            let item = match source.get().await {
                PipeItem::Sentinel => {
                    debug!("{}: sentinel received, finishing", config.scope);
                    if config.stop_destination {
                        destination.stop().await;
                    }
                    source.task_done();
                    return Ok(());
                }
                PipeItem::Item(item) => item,
            };

            if let Some(condition) = config.get_condition.as_mut() {
                match condition.admit(&item) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("{}: item rejected by get predicate", config.scope);
                        source.task_done();
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

            let moved = deliver(
                item,
                handler,
                destination.as_ref(),
                config,
                hooks,
                errlog,
            )
            .await?;
            if moved > 0 {
                emit!(ItemsMoved {
                    count: moved as u64,
                    fitting: config.scope.clone()
                });
            }
            source.task_done();
            // Release the run loop so consumers keep pace with producers.
            tokio::task::yield_now().await;
        }
    };

    match token.run_until_cancelled(main_loop).await {
        Some(result) => result,
        None => {
            warn!(
                "{}: cancelled, flushing buffered source items",
                config.scope
            );
            flush_residue(source.as_ref(), handler, destination.as_ref(), config, errlog).await;
            if config.stop_destination {
                destination.stop().await;
            }
            Err(TransferError::Cancelled)
        }
    }
}

/// Apply the handler to one item and put everything it produced.
///
/// Returns the number of items written. Data-loss failures are logged
/// here, with the count, before they propagate.
pub(crate) async fn deliver<In, Out>(
    item: In,
    handler: &mut Handler<In, Out>,
    destination: &dyn PipeSink<Out>,
    config: &mut TransferConfig<In, Out>,
    hooks: &mut TransferHooks,
    errlog: &ErrorLog,
) -> Result<usize, TransferError>
where
    In: Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let applied = match handler.apply(item).await {
        Ok(applied) => applied,
        Err(err) => {
            hooks.failed_transform(errlog).await;
            errlog.log_chain(&err, Severity::Error);
            return Err(err);
        }
    };
    let payload = match applied {
        Applied::Skipped => return Ok(0),
        Applied::One(out) => Payload::One(out),
        Applied::Many(items) => Payload::Many(items),
        Applied::Stream(stream) => Payload::Stream(stream),
    };

    match put_on_condition(
        payload,
        destination,
        config.put_condition.as_mut(),
        &config.retry,
        &config.scope,
    )
    .await
    {
        Ok(written) => {
            hooks.successful_put(errlog).await?;
            Ok(written)
        }
        Err(err) => {
            hooks.failed_put(errlog).await;
            if let TransferError::DestinationPut { lost, .. } = &err {
                error!(
                    "{}: data loss: {lost} item(s) dropped after leaving the source",
                    config.scope
                );
                emit!(ItemsLost {
                    count: *lost as u64,
                    fitting: config.scope.clone()
                });
            }
            errlog.log_chain(&err, Severity::Error);
            Err(err)
        }
    }
}

/// Best-effort flush of the source's buffered snapshot after cancellation.
///
/// Bounded by the destination's own backpressure: if a flush put exhausts
/// its retries the remaining items are dropped, and that loss is logged
/// explicitly rather than silently ignored.
async fn flush_residue<In, Out>(
    source: &dyn PipeSource<In>,
    handler: &mut Handler<In, Out>,
    destination: &dyn PipeSink<Out>,
    config: &mut TransferConfig<In, Out>,
    errlog: &ErrorLog,
) where
    In: Clone + Send + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let residue = sentinelize(source.snapshot());
    let pending = residue.len().saturating_sub(1);
    if pending == 0 {
        return;
    }
    info!(
        "{}: flushing {pending} buffered item(s) to the destination",
        config.scope
    );

    let mut flushed = 0usize;
    for (index, item) in residue.into_iter().enumerate() {
        let PipeItem::Item(item) = item else {
            break;
        };
        let outcome = match handler.apply(item).await {
            Ok(Applied::Skipped) => Ok(0),
            Ok(Applied::One(out)) => {
                put_on_condition(
                    Payload::One(out),
                    destination,
                    config.put_condition.as_mut(),
                    &config.retry,
                    &config.scope,
                )
                .await
            }
            Ok(Applied::Many(items)) => {
                put_on_condition(
                    Payload::Many(items),
                    destination,
                    config.put_condition.as_mut(),
                    &config.retry,
                    &config.scope,
                )
                .await
            }
            Ok(Applied::Stream(stream)) => {
                put_on_condition(
                    Payload::Stream(stream),
                    destination,
                    config.put_condition.as_mut(),
                    &config.retry,
                    &config.scope,
                )
                .await
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(written) => flushed += written,
            Err(err) => {
                let dropped = pending - index;
                error!(
                    "{}: data loss while flushing on cancellation: {dropped} buffered item(s) dropped",
                    config.scope
                );
                emit!(ItemsLost {
                    count: dropped as u64,
                    fitting: config.scope.clone()
                });
                errlog.log_chain(&err, Severity::Error);
                break;
            }
        }
    }
    if flushed > 0 {
        emit!(ItemsMoved {
            count: flushed as u64,
            fitting: config.scope.clone()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::pipe::Pipe;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(50);

    async fn drain<T: Clone + Send + 'static>(pipe: &Pipe<T>) -> (Vec<T>, bool) {
        let mut items = Vec::new();
        loop {
            match pipe.get().await {
                PipeItem::Item(item) => items.push(item),
                PipeItem::Sentinel => return (items, true),
            }
        }
    }

    #[tokio::test]
    async fn test_identity_transfer_preserves_order() {
        let source = Arc::new(Pipe::new(8));
        let destination = Arc::new(Pipe::new(8));
        for i in 0..5 {
            source.put(i, TIMEOUT).await.unwrap();
        }
        source.stop().await;

        let mut handler = Handler::identity();
        let mut config = TransferConfig::with_scope("test");
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        transfer(
            source.clone() as Arc<dyn PipeSource<i32>>,
            &mut handler,
            destination.clone() as Arc<dyn PipeSink<i32>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (items, terminated) = drain(&destination).await;
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert!(terminated);
        // Every retrieved item was acknowledged.
        source.join().await;
    }

    #[tokio::test]
    async fn test_filter_map_none_is_skipped() {
        let source = Arc::new(Pipe::new(8));
        let destination = Arc::new(Pipe::new(8));
        for i in 1..=4 {
            source.put(i, TIMEOUT).await.unwrap();
        }
        source.stop().await;

        let mut handler = Handler::filter_map(|x: i32| (x % 2 == 0).then_some(x));
        let mut config = TransferConfig::with_scope("test");
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        transfer(
            source as Arc<dyn PipeSource<i32>>,
            &mut handler,
            destination.clone() as Arc<dyn PipeSink<i32>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (items, _) = drain(&destination).await;
        assert_eq!(items, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_optional_items_forward_absent_values() {
        // Pipes carrying Option<T> forward an absent value as a real item.
        let source = Arc::new(Pipe::new(8));
        let destination: Arc<Pipe<Option<i32>>> = Arc::new(Pipe::new(8));
        for item in [Some(1), None, Some(2)] {
            source.put(item, TIMEOUT).await.unwrap();
        }
        source.stop().await;

        let mut handler = Handler::identity();
        let mut config = TransferConfig::with_scope("test");
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        transfer(
            source as Arc<dyn PipeSource<Option<i32>>>,
            &mut handler,
            destination.clone() as Arc<dyn PipeSink<Option<i32>>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (items, _) = drain(&destination).await;
        assert_eq!(items, vec![Some(1), None, Some(2)]);
    }

    #[tokio::test]
    async fn test_expand_handler_fans_items_out() {
        let source = Arc::new(Pipe::new(8));
        let destination = Arc::new(Pipe::new(8));
        source.put(1, TIMEOUT).await.unwrap();
        source.put(2, TIMEOUT).await.unwrap();
        source.stop().await;

        let mut handler = Handler::expand(|x: i32| vec![x, x * 10]);
        let mut config = TransferConfig::with_scope("test");
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        transfer(
            source as Arc<dyn PipeSource<i32>>,
            &mut handler,
            destination.clone() as Arc<dyn PipeSink<i32>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (items, _) = drain(&destination).await;
        assert_eq!(items, vec![1, 10, 2, 20]);
    }

    #[tokio::test]
    async fn test_transform_failure_propagates() {
        let source = Arc::new(Pipe::new(8));
        let destination: Arc<Pipe<i32>> = Arc::new(Pipe::new(8));
        source.put(1, TIMEOUT).await.unwrap();

        let mut handler: Handler<i32, i32> = Handler::try_map(|_| Err("broken".into()));
        let mut config = TransferConfig::with_scope("test");
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        let err = transfer(
            source as Arc<dyn PipeSource<i32>>,
            &mut handler,
            destination as Arc<dyn PipeSink<i32>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::DataTransformer { .. }));
    }

    #[tokio::test]
    async fn test_get_condition_filters_and_fails() {
        let source = Arc::new(Pipe::new(8));
        let destination = Arc::new(Pipe::new(8));
        for i in 1..=4 {
            source.put(i, TIMEOUT).await.unwrap();
        }
        source.stop().await;

        let mut handler = Handler::identity();
        let mut config = TransferConfig::with_scope("test");
        config.get_condition = Some(Condition::new(|item: &i32| Ok(*item != 3)));
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        transfer(
            source as Arc<dyn PipeSource<i32>>,
            &mut handler,
            destination.clone() as Arc<dyn PipeSink<i32>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let (items, _) = drain(&destination).await;
        assert_eq!(items, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_failing_get_condition_is_conditional_get_error() {
        let source = Arc::new(Pipe::new(8));
        let destination: Arc<Pipe<i32>> = Arc::new(Pipe::new(8));
        source.put(1, TIMEOUT).await.unwrap();

        let mut handler = Handler::identity();
        let mut config = TransferConfig::with_scope("test");
        config.get_condition = Some(Condition::new(|_: &i32| Err("gate exploded".into())));
        let mut hooks = TransferHooks::default();
        let errlog = ErrorLog::new();
        let err = transfer(
            source as Arc<dyn PipeSource<i32>>,
            &mut handler,
            destination as Arc<dyn PipeSink<i32>>,
            &mut config,
            &mut hooks,
            &errlog,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::ConditionalGet { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_flushes_buffered_items() {
        let source = Arc::new(Pipe::new(8));
        let destination = Arc::new(Pipe::new(8));
        for i in 0..4 {
            source.put(i, TIMEOUT).await.unwrap();
        }
        // No stop: the source keeps waiting after the buffer drains.

        let token = CancellationToken::new();
        let worker = {
            let source = source.clone() as Arc<dyn PipeSource<i32>>;
            let destination = destination.clone() as Arc<dyn PipeSink<i32>>;
            let token = token.clone();
            tokio::spawn(async move {
                let mut handler = Handler::identity();
                let mut config = TransferConfig::with_scope("test");
                let mut hooks = TransferHooks::default();
                let errlog = ErrorLog::new();
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
            })
        };

        // Let the worker drain the buffer, then cancel while it waits on get.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 10..13 {
            source.put(i, TIMEOUT).await.unwrap();
        }
        token.cancel();
        let result = worker.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));

        let (items, terminated) = drain(&destination).await;
        // Everything put before cancellation arrives, in order, then the
        // buffered residue flushed by the cancellation path.
        assert_eq!(items, vec![0, 1, 2, 3, 10, 11, 12]);
        assert!(terminated);
    }
}
