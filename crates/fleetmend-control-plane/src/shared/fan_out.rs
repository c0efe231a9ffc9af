//! Bounded scatter-gather across cells.
//!
//! One task per cell, at most `parallelism` of them running at once. Results
//! come back keyed by cell id in a `BTreeMap`, so callers merge them in cell
//! order no matter which task finished first. Dropping a `PartitionTaskSet`
//! aborts whatever is still in flight.

use crate::shared::config::PartitionFailurePolicy;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use fleetmend_core::CellId;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub struct PartitionTaskSet<T> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<(CellId, ControlPlaneResult<T>)>,
    spawned: Vec<CellId>,
}

impl<T: Send + 'static> PartitionTaskSet<T> {
    pub fn new(parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            set: JoinSet::new(),
            spawned: Vec::new(),
        }
    }

    /// Queue a query against one cell. It starts once a permit frees up.
    pub fn spawn<F>(&mut self, cell: CellId, query: F)
    where
        F: Future<Output = ControlPlaneResult<T>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.spawned.push(cell.clone());
        self.set.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(permit) => {
                    let result = query.await;
                    drop(permit);
                    result
                }
                Err(_) => Err(ControlPlaneError::Internal(
                    "cell worker pool closed".to_string(),
                )),
            };
            (cell, result)
        });
    }

    /// Wait for every queued cell. A task that panicked or was cancelled is
    /// reported as an unreachable cell.
    pub async fn join_all(mut self) -> BTreeMap<CellId, ControlPlaneResult<T>> {
        let mut results = BTreeMap::new();

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((cell, result)) => {
                    results.insert(cell, result);
                }
                Err(error) => {
                    warn!(error = %error, "Cell query task did not complete");
                }
            }
        }

        for cell in self.spawned.drain(..) {
            results.entry(cell.clone()).or_insert_with(|| {
                Err(ControlPlaneError::PartitionUnavailable {
                    cell,
                    reason: "cell query task did not complete".to_string(),
                })
            });
        }

        results
    }
}

/// Query every cell with `query`, bounded by `parallelism`.
pub async fn scatter_gather<T, F, Fut>(
    cells: impl IntoIterator<Item = CellId>,
    parallelism: usize,
    query: F,
) -> BTreeMap<CellId, ControlPlaneResult<T>>
where
    T: Send + 'static,
    F: Fn(CellId) -> Fut,
    Fut: Future<Output = ControlPlaneResult<T>> + Send + 'static,
{
    let mut tasks = PartitionTaskSet::new(parallelism);
    for cell in cells {
        debug!(cell = %cell, "Scheduling cell query");
        tasks.spawn(cell.clone(), query(cell));
    }
    tasks.join_all().await
}

/// Apply the partition failure policy to gathered results.
///
/// `FailClosed` returns the first failure in cell order. `Degrade` drops failed
/// cells and hands them back so the caller can log and count them.
pub fn apply_failure_policy<T>(
    results: BTreeMap<CellId, ControlPlaneResult<T>>,
    policy: PartitionFailurePolicy,
) -> ControlPlaneResult<(BTreeMap<CellId, T>, Vec<(CellId, ControlPlaneError)>)> {
    let mut succeeded = BTreeMap::new();
    let mut skipped = Vec::new();

    for (cell, result) in results {
        match result {
            Ok(value) => {
                succeeded.insert(cell, value);
            }
            Err(error) => match policy {
                PartitionFailurePolicy::FailClosed => return Err(error),
                PartitionFailurePolicy::Degrade => {
                    warn!(cell = %cell, error = %error, "Excluding unreachable cell from result");
                    skipped.push((cell, error));
                }
            },
        }
    }

    Ok((succeeded, skipped))
}
