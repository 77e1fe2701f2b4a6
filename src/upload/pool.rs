use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use tracing::debug;

/// Number of workers actually started for `len` items
pub fn effective_concurrency(configured: usize, len: usize) -> usize {
    configured.min(len).max(1)
}

/// Drain `items` with at most `concurrency` workers in flight
///
/// Workers share one cursor over the list: each claims the next unclaimed
/// item, runs `worker` on it and immediately claims another until the list
/// is exhausted. Items are claimed in list order and never twice. Workers
/// run interleaved on the calling task; `worker` is expected to record its
/// own failures, the pool only waits.
pub async fn run_pool<T, F, Fut>(items: Vec<T>, concurrency: usize, worker: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    if items.is_empty() {
        return;
    }

    let lanes = effective_concurrency(concurrency, items.len());
    debug!("Draining {} item(s) with {} worker(s)", items.len(), lanes);

    let cursor = Mutex::new(items.into_iter());
    let cursor = &cursor;
    let worker = &worker;

    join_all((0..lanes).map(|lane| async move {
        let mut handled = 0usize;
        loop {
            let next = cursor.lock().next();
            let Some(item) = next else {
                break;
            };
            worker(item).await;
            handled += 1;
        }
        debug!("Worker {} finished after {} item(s)", lane, handled);
    }))
    .await;
}
