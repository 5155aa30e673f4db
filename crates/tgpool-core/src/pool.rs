//! Fixed-size worker pool for per-account batch operations.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug)]
pub(crate) struct BatchOutput<R> {
    pub results: Vec<R>,
    /// The batch was cancelled before every item produced a result.
    pub cancelled: bool,
}

/// Run `job` over `items` with at most `workers` jobs in flight.
///
/// Workers pull from a shared queue, so the number of concurrently running
/// jobs never exceeds the budget regardless of batch size. On cancellation,
/// workers stop pulling, in-flight jobs are aborted, and whatever finished is
/// returned.
pub(crate) async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    workers: usize,
    cancel: CancellationToken,
    job: F,
) -> BatchOutput<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return BatchOutput {
            results: Vec::new(),
            cancelled: false,
        };
    }

    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let job = Arc::new(job);
    let (tx, mut rx) = mpsc::unbounded_channel::<R>();

    let mut set = JoinSet::new();
    for _ in 0..workers.max(1).min(total) {
        let queue = queue.clone();
        let job = job.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some(item) = next else {
                    break;
                };
                let out = (*job)(item).await;
                if tx.send(out).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut aborted = false;
    loop {
        tokio::select! {
            () = cancel.cancelled(), if !aborted => {
                aborted = true;
                set.abort_all();
            }
            res = set.join_next() => {
                match res {
                    Some(Ok(())) => {}
                    Some(Err(e)) if e.is_panic() => {
                        warn!("batch worker panicked: {e}");
                    }
                    Some(Err(_)) => {}
                    None => break,
                }
            }
        }
    }

    let mut results = Vec::with_capacity(total);
    while let Ok(r) = rx.try_recv() {
        results.push(r);
    }
    let cancelled = cancel.is_cancelled() && results.len() < total;
    BatchOutput { results, cancelled }
}
