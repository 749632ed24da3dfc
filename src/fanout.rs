/// Fire-and-forget fan-out: the same function on several workers at once.
///
/// Unlike `BoundedDispatcher`, nothing waits for the workers unless the
/// caller joins the returned handles.
use crate::work_item::{BoxError, FailureKind, WorkItem, WorkItemFailure};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Errors raised when building a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutError {
    /// `num_workers` must be at least 1.
    InvalidConfiguration { num_workers: usize },
}

impl std::fmt::Display for FanoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanoutError::InvalidConfiguration { num_workers } => {
                write!(f, "num_workers must be at least 1, got {}", num_workers)
            }
        }
    }
}

impl std::error::Error for FanoutError {}

type SharedFn = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

/// Runs one function on `num_workers` workers.
pub struct WorkerFanout {
    function: SharedFn,
    num_workers: usize,
}

impl WorkerFanout {
    pub fn new<F>(function: F, num_workers: usize) -> Result<Self, FanoutError>
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        if num_workers < 1 {
            return Err(FanoutError::InvalidConfiguration { num_workers });
        }
        Ok(Self {
            function: Arc::new(function),
            num_workers,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Start the workers and return without waiting for them.
    ///
    /// With a single worker the function runs inline on the blocking pool
    /// and has already finished when this returns.
    pub async fn launch(self) -> FanoutHandles {
        if self.num_workers == 1 {
            let item = worker_item(&self.function);
            let outcome = match tokio::task::spawn_blocking(move || item.run()).await {
                Ok(outcome) => outcome,
                Err(e) => Err(FailureKind::Panicked(e.to_string())),
            };
            return FanoutHandles {
                pending: Vec::new(),
                finished: vec![outcome],
            };
        }

        let pending = (0..self.num_workers)
            .map(|worker| {
                let item = worker_item(&self.function);
                tracing::debug!(worker, "starting fan-out worker");
                tokio::task::spawn_blocking(move || item.run())
            })
            .collect();
        FanoutHandles {
            pending,
            finished: Vec::new(),
        }
    }
}

impl std::fmt::Debug for WorkerFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFanout")
            .field("num_workers", &self.num_workers)
            .finish_non_exhaustive()
    }
}

fn worker_item(function: &SharedFn) -> WorkItem {
    let function = Arc::clone(function);
    WorkItem::new(move || function())
}

/// Handles to launched workers. Dropping them detaches the workers.
#[derive(Debug)]
pub struct FanoutHandles {
    pending: Vec<JoinHandle<Result<(), FailureKind>>>,
    finished: Vec<Result<(), FailureKind>>,
}

impl FanoutHandles {
    /// Number of workers launched.
    pub fn len(&self) -> usize {
        self.pending.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every worker and return the failures, indexed by worker.
    pub async fn join(self) -> Vec<WorkItemFailure> {
        let mut outcomes = self.finished;
        for handle in self.pending {
            outcomes.push(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FailureKind::Panicked(e.to_string())),
            });
        }

        outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.err().map(|kind| WorkItemFailure { index, kind }))
            .inspect(|failure| tracing::warn!(error = %failure, "fan-out worker failed"))
            .collect()
    }
}
