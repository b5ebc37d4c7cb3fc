//! Bounded fan-out executor
//!
//! Runs an async worker over a sequence of items with at most `limit`
//! in-flight tasks. Cancellation is propagated through a *child* token linked
//! to the caller's, so an abort inside one pool never cancels the caller's
//! sibling work. Results are always index-aligned with the input.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use eyre::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::options::{PoolError, PoolOptions, Settled};

/// Normalize a requested limit to `1..=len`
fn normalize_limit(limit: usize, len: usize) -> usize {
    limit.clamp(1, len.max(1))
}

/// Compute the dispatch order: insertion order, or descending weight when
/// priority scheduling is fully specified
fn dispatch_order<T>(items: &[T], options: &PoolOptions<T>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..items.len()).collect();

    if options.use_priority
        && !options.item_weights.is_empty()
        && let Some(get_id) = &options.get_item_id
    {
        let weights: Vec<f64> = items
            .iter()
            .map(|item| options.item_weights.get(&get_id(item)).copied().unwrap_or(0.0))
            .collect();
        order.sort_by(|&a, &b| weights[b].partial_cmp(&weights[a]).unwrap_or(std::cmp::Ordering::Equal));
    }

    order
}

/// Shared executor: returns one slot per input, `None` when the item was
/// never pulled (abort or cancellation)
async fn run_pool<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    worker: F,
    options: &PoolOptions<T>,
) -> Vec<Option<Result<R>>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let len = items.len();
    if len == 0 {
        return Vec::new();
    }

    let limit = normalize_limit(limit, len);
    let order = Arc::new(dispatch_order(&items, options));

    // Pool-owned child token: the pool can signal it on abort without
    // touching the caller's handle.
    let child = match &options.cancel {
        Some(caller) => caller.child_token(),
        None => CancellationToken::new(),
    };

    let slots: Arc<Vec<Mutex<Option<T>>>> = Arc::new(items.into_iter().map(|i| Mutex::new(Some(i))).collect());
    let results: Arc<Mutex<Vec<Option<Result<R>>>>> =
        Arc::new(Mutex::new((0..len).map(|_| None).collect()));
    let cursor = Arc::new(AtomicUsize::new(0));
    let first_error = Arc::new(AtomicBool::new(false));
    let worker = Arc::new(worker);
    let abort_on_error = options.abort_on_error;

    debug!(len, limit, "pool: starting");

    let mut handles = Vec::with_capacity(limit);
    for _ in 0..limit {
        let order = order.clone();
        let slots = slots.clone();
        let results = results.clone();
        let cursor = cursor.clone();
        let first_error = first_error.clone();
        let worker = worker.clone();
        let child = child.clone();

        handles.push(tokio::spawn(async move {
            loop {
                // Cancellation checkpoint before each pull
                if child.is_cancelled() {
                    break;
                }

                let pos = cursor.fetch_add(1, Ordering::SeqCst);
                if pos >= order.len() {
                    break;
                }
                let index = order[pos];

                let item = slots[index].lock().await.take();
                let Some(item) = item else { continue };

                let outcome = worker(item, index).await;
                let failed = outcome.is_err();
                results.lock().await[index] = Some(outcome);

                // First-error slot is written once; on abort-on-error it
                // cancels the pool's own token, not the caller's.
                if failed && abort_on_error && !first_error.swap(true, Ordering::SeqCst) {
                    debug!(index, "pool: first worker error, aborting remaining pulls");
                    child.cancel();
                }

                // Cancellation checkpoint after each completion
                if child.is_cancelled() {
                    break;
                }
            }
        }));
    }

    for joined in futures::future::join_all(handles).await {
        if let Err(e) = joined {
            warn!(error = %e, "pool: worker task join failed");
        }
    }

    match Arc::try_unwrap(results) {
        Ok(m) => m.into_inner(),
        // A worker task leaked its Arc (aborted join); fall back to draining
        Err(arc) => {
            let mut guard = arc.lock().await;
            guard.drain(..).collect()
        }
    }
}

fn caller_cancelled<T>(options: &PoolOptions<T>) -> bool {
    options.cancel.as_ref().is_some_and(|c| c.is_cancelled())
}

/// Execute `worker` over `items` with at most `limit` in flight, raising the
/// first-in-input-order worker error ("throw" mode)
///
/// On success the result vector is index-aligned with the input. When the
/// caller's token fires before every item completes, the error downcasts to
/// [`PoolError::Cancelled`]; a worker error always takes precedence over a
/// post-hoc cancellation.
pub async fn run_with_limit<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    worker: F,
    options: PoolOptions<T>,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let slots = run_pool(items, limit, worker, &options).await;

    let mut out = Vec::with_capacity(slots.len());
    let mut first_error: Option<eyre::Report> = None;
    let mut missing = false;

    for slot in slots {
        match slot {
            Some(Ok(value)) => out.push(value),
            Some(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            None => missing = true,
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if missing {
        if caller_cancelled(&options) {
            return Err(PoolError::Cancelled.into());
        }
        return Err(PoolError::WorkerPanicked.into());
    }

    Ok(out)
}

/// Execute `worker` over `items`, collecting a [`Settled`] outcome per input
/// instead of raising worker errors
///
/// Items never pulled (internal abort) settle as rejected; only the caller's
/// own cancellation surfaces as an error.
pub async fn run_all_settled<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    worker: F,
    options: PoolOptions<T>,
) -> Result<Vec<Settled<R>>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let slots = run_pool(items, limit, worker, &options).await;

    if caller_cancelled(&options) && slots.iter().any(|s| s.is_none()) {
        return Err(PoolError::Cancelled.into());
    }

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| match slot {
            Some(Ok(value)) => Settled::Fulfilled { index, value },
            Some(Err(e)) => Settled::Rejected {
                index,
                reason: format!("{:#}", e),
            },
            None => Settled::Rejected {
                index,
                reason: "aborted before start".to_string(),
            },
        })
        .collect())
}
