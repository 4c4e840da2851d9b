//! Bounded-concurrency executor used for parallel shard fetches during sync
//! (§4.6, §5, §6 `fetch_concurrency`).

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

/// Run `tasks` with at most `capacity` futures in flight at once, waiting
/// for all of them to settle before returning.
///
/// Every task runs to completion even if an earlier one failed — partial
/// sync progress on other shards should not be thrown away because one
/// shard's fetch failed (§4.6, §7). The first error encountered, if any, is
/// returned alongside every successful result.
pub async fn run_bounded<F, T, E>(capacity: usize, tasks: Vec<F>) -> (Vec<T>, Option<E>)
where
    F: Future<Output = Result<T, E>>,
{
    let capacity = capacity.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut pending = tasks.into_iter();
    let mut results = Vec::new();
    let mut first_error = None;

    for task in pending.by_ref().take(capacity) {
        in_flight.push(task);
    }

    while let Some(outcome) = in_flight.next().await {
        match outcome {
            Ok(value) => results.push(value),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(_) => {}
        }
        if let Some(next) = pending.next() {
            in_flight.push(next);
        }
    }

    (results, first_error)
}
