/// Bounded-concurrency dispatch of a fixed batch of work items.
///
/// At most `max_workers` items run at once. The dispatching task waits for a
/// permit before starting each item, in submission order, and `execute()`
/// returns only after every item has finished.
use crate::permit::PermitPool;
use crate::work_item::{BoxError, FailureKind, WorkItem, WorkItemFailure};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinError, JoinSet};

/// Errors raised when building a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// `max_workers` must be at least 1.
    InvalidConfiguration { max_workers: usize },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::InvalidConfiguration { max_workers } => {
                write!(f, "max_workers must be at least 1, got {}", max_workers)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Outcome of one `execute()` call.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// Number of items submitted.
    pub total: usize,
    /// Items that returned `Ok(())`.
    pub succeeded: usize,
    /// Items that returned an error or panicked, in completion order.
    pub failures: Vec<WorkItemFailure>,
    /// Highest number of items observed running at the same time.
    pub peak_concurrency: usize,
    /// Wall-clock time of the whole `execute()` call.
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Runs a fixed collection of work items with a concurrency cap.
#[derive(Debug)]
pub struct BoundedDispatcher {
    items: Vec<WorkItem>,
    max_workers: usize,
}

impl BoundedDispatcher {
    /// Build a dispatcher. Fails if `max_workers` is 0.
    pub fn new(items: Vec<WorkItem>, max_workers: usize) -> Result<Self, DispatchError> {
        if max_workers < 1 {
            return Err(DispatchError::InvalidConfiguration { max_workers });
        }
        Ok(Self { items, max_workers })
    }

    /// Build a dispatcher that calls `function` once per entry of `list_args`.
    pub fn from_args<F, A>(
        function: F,
        list_args: Vec<A>,
        max_workers: usize,
    ) -> Result<Self, DispatchError>
    where
        F: Fn(A) -> Result<(), BoxError> + Send + Sync + 'static,
        A: Send + 'static,
    {
        let function = Arc::new(function);
        let items = list_args
            .into_iter()
            .map(|args| {
                let function = Arc::clone(&function);
                WorkItem::with_args(move |a| function(a), args)
            })
            .collect();
        Self::new(items, max_workers)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run every item and wait for all of them to finish.
    ///
    /// Failures are collected into the report; one item failing never
    /// prevents the others from running.
    pub async fn execute(self) -> DispatchReport {
        let total = self.items.len();
        tracing::debug!(total, max_workers = self.max_workers, "dispatch starting");

        let start = Instant::now();
        let (failures, peak_concurrency) = if self.max_workers == 1 {
            (run_sequential(self.items).await, total.min(1))
        } else {
            run_bounded(self.items, self.max_workers).await
        };
        let elapsed = start.elapsed();

        let report = DispatchReport {
            total,
            succeeded: total - failures.len(),
            failures,
            peak_concurrency,
            elapsed,
        };
        tracing::info!(
            total,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            peak = report.peak_concurrency,
            elapsed_ms = elapsed.as_millis() as u64,
            "dispatch completed"
        );
        report
    }
}

/// One item at a time, in submission order, no permits involved.
async fn run_sequential(items: Vec<WorkItem>) -> Vec<WorkItemFailure> {
    let mut failures = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let outcome = tokio::task::spawn_blocking(move || item.run()).await;
        if let Some(failure) = record(index, outcome) {
            failures.push(failure);
        }
    }
    failures
}

async fn run_bounded(items: Vec<WorkItem>, max_workers: usize) -> (Vec<WorkItemFailure>, usize) {
    // More permits than items is never useful, and the semaphore has a
    // hard upper limit.
    let pool = PermitPool::new(max_workers.min(items.len()).max(1));
    let mut running = JoinSet::new();
    let mut indices = HashMap::new();
    let mut failures = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        // Reap whatever already finished so failures are logged promptly.
        while let Some(joined) = running.try_join_next_with_id() {
            collect(joined, &mut indices, &mut failures);
        }

        let Some(permit) = pool.acquire().await else {
            tracing::error!(item = index, "permit pool closed during dispatch");
            break;
        };
        tracing::trace!(item = index, in_flight = pool.in_flight(), "work item admitted");

        let task = running.spawn_blocking(move || {
            let outcome = item.run();
            drop(permit);
            outcome
        });
        indices.insert(task.id(), index);
    }

    while let Some(joined) = running.join_next_with_id().await {
        collect(joined, &mut indices, &mut failures);
    }

    (failures, pool.peak())
}

/// Map a finished task back to its item and record the outcome. A task that
/// did not complete (cancelled, or a panic that escaped `WorkItem::run`)
/// counts as a failure of that item.
fn collect(
    joined: Result<(Id, Result<(), FailureKind>), JoinError>,
    indices: &mut HashMap<Id, usize>,
    failures: &mut Vec<WorkItemFailure>,
) {
    let (id, outcome) = match joined {
        Ok((id, outcome)) => (id, Ok(outcome)),
        Err(e) => (e.id(), Err(e)),
    };
    let Some(index) = indices.remove(&id) else {
        tracing::error!(task = %id, "finished task has no work item");
        return;
    };
    if let Some(failure) = record(index, outcome) {
        failures.push(failure);
    }
}

fn record(
    index: usize,
    outcome: Result<Result<(), FailureKind>, JoinError>,
) -> Option<WorkItemFailure> {
    let kind = match outcome {
        Ok(Ok(())) => {
            tracing::debug!(item = index, "work item completed");
            return None;
        }
        Ok(Err(kind)) => kind,
        Err(e) if e.is_panic() => FailureKind::Panicked(e.to_string()),
        Err(e) => FailureKind::Error(e.to_string()),
    };
    let failure = WorkItemFailure { index, kind };
    tracing::warn!(item = index, error = %failure, "work item failed");
    Some(failure)
}
