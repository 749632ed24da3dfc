/// Work items and the failures they can produce.
use std::any::Any;

/// Error type a work item may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Job = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

/// One independent unit of work submitted to a `BoundedDispatcher`.
///
/// Arguments are bound when the item is built, so running it is always a
/// plain zero-argument call.
pub struct WorkItem {
    job: Job,
}

impl WorkItem {
    /// Wrap a zero-argument callable.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        Self { job: Box::new(f) }
    }

    /// Pair a callable with its argument value (a tuple for several
    /// positional arguments, a struct for named ones).
    pub fn with_args<F, A>(f: F, args: A) -> Self
    where
        F: FnOnce(A) -> Result<(), BoxError> + Send + 'static,
        A: Send + 'static,
    {
        Self::new(move || f(args))
    }

    /// Run the item, converting a panic into `FailureKind::Panicked`.
    pub(crate) fn run(self) -> Result<(), FailureKind> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(self.job)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FailureKind::Error(e.to_string())),
            Err(payload) => Err(FailureKind::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").finish_non_exhaustive()
    }
}

/// How a work item failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureKind {
    /// The item returned an error.
    Error(String),
    /// The item panicked.
    Panicked(String),
}

/// A failure reported by one work item, tagged with its submission index.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkItemFailure {
    pub index: usize,
    #[serde(flatten)]
    pub kind: FailureKind,
}

impl std::fmt::Display for WorkItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Error(msg) => write!(f, "work item {} failed: {}", self.index, msg),
            FailureKind::Panicked(msg) => {
                write!(f, "work item {} panicked: {}", self.index, msg)
            }
        }
    }
}

impl std::error::Error for WorkItemFailure {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
