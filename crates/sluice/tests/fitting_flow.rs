//! End-to-end dataflow tests through supervised fittings.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sluice::{Fitting, Handler, Hook, Pipe, PipeItem, PipeSink, PipeSource, TaskState, TransferHooks};

const TIMEOUT: Duration = Duration::from_millis(100);

async fn drain<T: Clone + Send + 'static>(pipe: &Pipe<T>) -> Vec<T> {
    let mut items = Vec::new();
    loop {
        match pipe.get().await {
            PipeItem::Item(item) => items.push(item),
            PipeItem::Sentinel => return items,
        }
    }
}

#[tokio::test]
async fn test_doubling_dataflow_end_to_end() {
    let source = Arc::new(Pipe::new(8));
    let destination = Arc::new(Pipe::new(8));
    for i in [1, 2, 3] {
        source.put(i, TIMEOUT).await.unwrap();
    }
    source.stop().await;

    let completions = Arc::new(AtomicUsize::new(0));
    let mut fitting = Fitting::builder("doubler")
        .source_pipe(source.clone() as Arc<dyn PipeSource<i32>>)
        .handler(Handler::map(|x: i32| x * 2))
        .destination(destination.clone() as Arc<dyn PipeSink<i32>>)
        .build()
        .unwrap();
    {
        let completions = completions.clone();
        fitting.on_success(move |_| {
            completions.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(fitting.state(), TaskState::NotStarted);
    assert!(fitting.start());

    assert_eq!(drain(&destination).await, vec![2, 4, 6]);
    // The task winds down promptly once the sentinel has been observed.
    let state = tokio::time::timeout(Duration::from_secs(1), fitting.wait_terminal())
        .await
        .expect("task did not terminate");
    assert_eq!(state, TaskState::Completed);
    assert!(!fitting.is_running());
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(fitting.last_error().is_none());
}

#[tokio::test]
async fn test_stopping_a_fitting_flushes_buffered_items() {
    let source = Arc::new(Pipe::new(16));
    let destination = Arc::new(Pipe::new(16));
    for i in 1..=3 {
        source.put(i, TIMEOUT).await.unwrap();
    }
    // The source is never stopped: without cancellation the dataflow
    // would wait for more items forever.

    let mut fitting = Fitting::builder("flusher")
        .source_pipe(source.clone() as Arc<dyn PipeSource<i32>>)
        .destination(destination.clone() as Arc<dyn PipeSink<i32>>)
        .passthrough()
        .build()
        .unwrap();
    assert!(fitting.start());

    // Wait until the first batch has moved through.
    while destination.size() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    source.put(4, TIMEOUT).await.unwrap();
    source.put(5, TIMEOUT).await.unwrap();

    let state = fitting.stop().await;
    assert_eq!(state, Some(TaskState::Cancelled));

    // Everything put before the stop arrives, then the sentinel.
    assert_eq!(drain(&destination).await, vec![1, 2, 3, 4, 5]);
    assert!(destination.is_stopped());
}

#[tokio::test]
async fn test_hooks_observe_each_item() {
    let source = Arc::new(Pipe::new(8));
    let destination = Arc::new(Pipe::new(8));
    for i in 0..4 {
        source.put(i, TIMEOUT).await.unwrap();
    }
    source.stop().await;

    let gets = Arc::new(AtomicUsize::new(0));
    let puts = Arc::new(AtomicUsize::new(0));
    let hooks = TransferHooks {
        on_successful_get: Some(Hook::new("count_get", {
            let gets = gets.clone();
            move || {
                let gets = gets.clone();
                async move {
                    gets.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })),
        on_successful_put: Some(Hook::new("count_put", {
            let puts = puts.clone();
            move || {
                let puts = puts.clone();
                async move {
                    puts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })),
        ..TransferHooks::default()
    };

    let mut fitting = Fitting::builder("counted")
        .source_pipe(source as Arc<dyn PipeSource<i32>>)
        .destination(destination.clone() as Arc<dyn PipeSink<i32>>)
        .passthrough()
        .hooks(hooks)
        .build()
        .unwrap();
    fitting.start();
    assert_eq!(fitting.wait_terminal().await, TaskState::Completed);

    assert_eq!(drain(&destination).await, vec![0, 1, 2, 3]);
    assert_eq!(gets.load(Ordering::SeqCst), 4);
    assert_eq!(puts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_failing_handler_marks_fitting_failed() {
    let source = Arc::new(Pipe::new(8));
    let destination: Arc<Pipe<i32>> = Arc::new(Pipe::new(8));
    source.put(1, TIMEOUT).await.unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    let mut fitting = Fitting::builder("broken")
        .source_pipe(source as Arc<dyn PipeSource<i32>>)
        .handler(Handler::<i32, i32>::try_map(|_| Err("unusable input".into())))
        .destination(destination as Arc<dyn PipeSink<i32>>)
        .build()
        .unwrap();
    {
        let failures = failures.clone();
        fitting.on_failure(move |err| {
            assert!(err.to_string().contains("task failed"));
            failures.fetch_add(1, Ordering::SeqCst);
        });
    }
    fitting.start();

    assert_eq!(fitting.wait_terminal().await, TaskState::Failed);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    let err = fitting.last_error().expect("failure should be stored");
    assert!(format!("{err}").contains("task failed"));
}

#[tokio::test]
async fn test_fitting_restarts_after_completion() {
    let source = Arc::new(Pipe::new(8));
    let destination = Arc::new(Pipe::new(8));
    source.put(1, TIMEOUT).await.unwrap();
    source.stop().await;

    let mut fitting = Fitting::builder("restartable")
        .source_pipe(source.clone() as Arc<dyn PipeSource<i32>>)
        .destination(destination.clone() as Arc<dyn PipeSink<i32>>)
        .passthrough()
        .build()
        .unwrap();
    fitting.start();
    assert_eq!(fitting.wait_terminal().await, TaskState::Completed);
    assert_eq!(drain(&destination).await, vec![1]);

    // Reset both endpoints and run the same fitting again.
    source.start();
    destination.start();
    source.put(2, TIMEOUT).await.unwrap();
    source.stop().await;

    assert!(fitting.start());
    assert_eq!(fitting.wait_terminal().await, TaskState::Completed);
    assert_eq!(drain(&destination).await, vec![2]);
}

#[tokio::test]
async fn test_backpressure_through_a_tiny_destination() {
    // A destination with capacity 2 forces the dataflow to pace itself
    // against a slow consumer instead of growing unbounded.
    let source = Arc::new(Pipe::new(16));
    let destination = Arc::new(Pipe::new(2));
    for i in 0..10 {
        source.put(i, TIMEOUT).await.unwrap();
    }
    source.stop().await;

    let mut fitting = Fitting::builder("paced")
        .source_pipe(source as Arc<dyn PipeSource<i32>>)
        .destination(destination.clone() as Arc<dyn PipeSink<i32>>)
        .passthrough()
        .build()
        .unwrap();
    fitting.start();

    let mut received = Vec::new();
    loop {
        match destination.get().await {
            PipeItem::Item(item) => {
                received.push(item);
                destination.task_done();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            PipeItem::Sentinel => break,
        }
    }
    assert_eq!(received, (0..10).collect::<Vec<_>>());
    assert_eq!(fitting.wait_terminal().await, TaskState::Completed);
}
