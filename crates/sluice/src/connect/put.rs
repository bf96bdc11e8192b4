//! Backpressure-aware puts with bounded, jittered retries.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use rand::Rng;
use snafu::prelude::*;
use tracing::{debug, error};

use sluice_core::config::RetryPolicy;
use sluice_core::emit;
use sluice_core::error::PipeError;
use sluice_core::metrics::events::PutRetried;
use sluice_core::pipe::PipeSink;

use crate::error::{BoxError, DataGeneratorSnafu, DestinationPutSnafu, TransferError};

/// A fallible admission predicate evaluated before each put.
pub struct Condition<T> {
    check: Box<dyn FnMut(&T) -> Result<bool, BoxError> + Send + Sync>,
}

impl<T> Condition<T> {
    pub fn new<F>(check: F) -> Self
    where
        F: FnMut(&T) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self {
            check: Box::new(check),
        }
    }

    pub(crate) fn admit(&mut self, item: &T) -> Result<bool, BoxError> {
        (self.check)(item)
    }
}

impl<T> std::fmt::Debug for Condition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").finish_non_exhaustive()
    }
}

/// One or more items headed for a destination.
pub enum Payload<T> {
    One(T),
    Many(Vec<T>),
    Stream(BoxStream<'static, Result<T, BoxError>>),
}

/// Put a single item, retrying with backoff while the destination is full.
///
/// Each attempt waits `retry.put_timeout()` for buffer space; between
/// attempts the delay grows per the policy's backoff curve, with jitter so
/// synchronized producers do not retry in lockstep. Anything other than
/// backpressure (for example a stopped destination) fails immediately.
pub async fn put_with_retry<T>(
    item: &T,
    destination: &dyn PipeSink<T>,
    retry: &RetryPolicy,
    scope: &str,
) -> Result<(), PipeError>
where
    T: Clone + Send + Sync + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        match destination.put(item.clone(), retry.put_timeout()).await {
            Ok(()) => return Ok(()),
            Err(err @ PipeError::Full { .. }) => {
                if attempt >= retry.max_retries {
                    error!(
                        attempts = attempt + 1,
                        "{scope}: destination still full after all retries"
                    );
                    return Err(err);
                }
                attempt += 1;
                let delay = with_jitter(retry.backoff_for(attempt));
                debug!(
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "{scope}: destination full, retrying"
                );
                emit!(PutRetried {
                    fitting: scope.to_string()
                });
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Add up to 20% random jitter to a backoff delay.
fn with_jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    let extra = rand::rng().random_range(0..=base_ms / 5);
    base + Duration::from_millis(extra)
}

/// Expand a payload and put each admitted item, retrying on backpressure.
///
/// Returns the number of items written. A put that stays full past all
/// retries surfaces as [`TransferError::DestinationPut`]: the item already
/// left the source, so the caller must treat it as explicit data loss.
pub async fn put_on_condition<T>(
    payload: Payload<T>,
    destination: &dyn PipeSink<T>,
    mut condition: Option<&mut Condition<T>>,
    retry: &RetryPolicy,
    scope: &str,
) -> Result<usize, TransferError>
where
    T: Clone + Send + Sync + 'static,
{
    let mut written = 0;
    match payload {
        Payload::One(item) => {
            put_admitted(item, destination, condition, retry, scope, &mut written).await?;
        }
        Payload::Many(items) => {
            for item in items {
                put_admitted(
                    item,
                    destination,
                    condition.as_deref_mut(),
                    retry,
                    scope,
                    &mut written,
                )
                .await?;
            }
        }
        Payload::Stream(mut stream) => {
            while let Some(next) = stream.next().await {
                let item = next.context(DataGeneratorSnafu)?;
                put_admitted(
                    item,
                    destination,
                    condition.as_deref_mut(),
                    retry,
                    scope,
                    &mut written,
                )
                .await?;
            }
        }
    }
    Ok(written)
}

async fn put_admitted<T>(
    item: T,
    destination: &dyn PipeSink<T>,
    condition: Option<&mut Condition<T>>,
    retry: &RetryPolicy,
    scope: &str,
    written: &mut usize,
) -> Result<(), TransferError>
where
    T: Clone + Send + Sync + 'static,
{
    if let Some(condition) = condition {
        match condition.admit(&item) {
            Ok(true) => {}
            Ok(false) => {
                debug!("{scope}: item rejected by admission predicate");
                return Ok(());
            }
            Err(source) => return Err(TransferError::ConditionalPut { source }),
        }
    }
    put_with_retry(&item, destination, retry, scope)
        .await
        .context(DestinationPutSnafu { lost: 1usize })?;
    *written += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// A sink that rejects the first `failures` puts with a full error.
    struct FlakySink {
        failures: usize,
        attempts: AtomicUsize,
        accepted: Mutex<Vec<u32>>,
    }

    impl FlakySink {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: AtomicUsize::new(0),
                accepted: Mutex::new(Vec::new()),
            }
        }

        fn accepted(&self) -> Vec<u32> {
            self.accepted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl PipeSink<u32> for FlakySink {
        async fn put(&self, item: u32, _timeout: Duration) -> Result<(), PipeError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(PipeError::Full { waited_ms: 0 });
            }
            self.accepted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item);
            Ok(())
        }

        fn is_full(&self) -> bool {
            false
        }

        fn start(&self) {}

        async fn stop(&self) -> bool {
            false
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            put_timeout_ms: 10,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_put_succeeds_on_third_attempt_without_duplicates() {
        let sink = FlakySink::new(2);
        put_with_retry(&7, &sink, &fast_retry(3), "test")
            .await
            .unwrap();
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.accepted(), vec![7]);
    }

    #[tokio::test]
    async fn test_put_fails_after_exhausting_retries() {
        let sink = FlakySink::new(10);
        let err = put_with_retry(&7, &sink, &fast_retry(2), "test")
            .await
            .unwrap_err();
        assert!(err.is_full());
        // One initial attempt plus two retries.
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert!(sink.accepted().is_empty());
    }

    #[tokio::test]
    async fn test_put_on_condition_counts_writes() {
        let sink = FlakySink::new(0);
        let written = put_on_condition(
            Payload::Many(vec![1, 2, 3]),
            &sink,
            None,
            &fast_retry(0),
            "test",
        )
        .await
        .unwrap();
        assert_eq!(written, 3);
        assert_eq!(sink.accepted(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_condition_rejects_items() {
        let sink = FlakySink::new(0);
        let mut even_only = Condition::new(|item: &u32| Ok(item % 2 == 0));
        let written = put_on_condition(
            Payload::Many(vec![1, 2, 3, 4]),
            &sink,
            Some(&mut even_only),
            &fast_retry(0),
            "test",
        )
        .await
        .unwrap();
        assert_eq!(written, 2);
        assert_eq!(sink.accepted(), vec![2, 4]);
    }

    #[tokio::test]
    async fn test_failing_condition_is_conditional_put_error() {
        let sink = FlakySink::new(0);
        let mut broken = Condition::new(|_: &u32| Err("predicate exploded".into()));
        let err = put_on_condition(
            Payload::One(1),
            &sink,
            Some(&mut broken),
            &fast_retry(0),
            "test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::ConditionalPut { .. }));
        assert!(sink.accepted().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_data_loss() {
        let sink = FlakySink::new(10);
        let err = put_on_condition(
            Payload::One(1),
            &sink,
            None,
            &fast_retry(1),
            "test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::DestinationPut { lost: 1, .. }));
    }

    #[tokio::test]
    async fn test_stream_payload_failure_is_generator_error() {
        let sink = FlakySink::new(0);
        let stream = futures::stream::iter([Ok(1), Err::<u32, BoxError>("mid-stream".into())]);
        let err = put_on_condition(
            Payload::Stream(Box::pin(stream)),
            &sink,
            None,
            &fast_retry(0),
            "test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::DataGenerator { .. }));
        // The item before the failure was still written.
        assert_eq!(sink.accepted(), vec![1]);
    }
}
