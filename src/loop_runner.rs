/// A task loop that stops on request.
///
/// The loop checks its state once per iteration, before calling the task.
/// A task that never returns therefore delays a graceful stop until it does;
/// only a forced exit interrupts it.
use crate::config::ShutdownConfig;
use crate::signals::{
    parse_signals, ForceExit, ForceExitHook, LoopState, SignalError, SignalListener, StopHandle,
};
use std::future::Future;

/// Repeats a task until a stop signal arrives.
///
/// Owns its signal listeners: dropping the loop stops listening.
#[derive(Debug)]
pub struct CancellableLoop {
    handle: StopHandle,
    _listener: SignalListener,
}

impl CancellableLoop {
    /// Install listeners for the configured signals. A second signal exits
    /// the process with `config.force_exit_code`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install(config: &ShutdownConfig) -> Result<Self, SignalError> {
        Self::with_action(config, ForceExit::Process)
    }

    /// Like `install`, but a forced exit runs `force_exit` instead of
    /// terminating the process.
    pub fn with_force_exit(
        config: &ShutdownConfig,
        force_exit: ForceExitHook,
    ) -> Result<Self, SignalError> {
        Self::with_action(config, ForceExit::Hook(force_exit))
    }

    fn with_action(config: &ShutdownConfig, force_exit: ForceExit) -> Result<Self, SignalError> {
        let signals = parse_signals(&config.signals)?;
        let handle = StopHandle::new(force_exit, config.force_exit_code);
        let listener = SignalListener::install(&signals, handle.clone())?;
        Ok(Self {
            handle,
            _listener: listener,
        })
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    /// Handle for requesting a stop from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.handle.clone()
    }

    /// Same effect as receiving one stop signal.
    pub fn request_stop(&self) -> LoopState {
        self.handle.request_stop()
    }

    /// Await `task()` repeatedly while the loop is running.
    ///
    /// Yields to the scheduler between iterations, so a task that never
    /// awaits does not starve the runtime's other tasks.
    ///
    /// Returns the number of completed iterations.
    pub async fn run<F, Fut>(&self, mut task: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut iterations = 0u64;
        while self.handle.is_running() {
            task().await;
            iterations += 1;
            tokio::task::yield_now().await;
        }
        tracing::info!(iterations, "loop stopped");
        iterations
    }

    /// Call a blocking `task` repeatedly while the loop is running.
    ///
    /// Each call runs on the blocking pool so signal delivery keeps working
    /// while the task is busy. A panic in the task propagates to the caller.
    pub async fn run_blocking<F>(&self, task: F) -> u64
    where
        F: FnMut() + Send + 'static,
    {
        let mut task = task;
        let mut iterations = 0u64;
        while self.handle.is_running() {
            let joined = tokio::task::spawn_blocking(move || {
                task();
                task
            })
            .await;
            task = match joined {
                Ok(task) => task,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    tracing::error!(error = %e, "loop task cancelled");
                    break;
                }
            };
            iterations += 1;
        }
        tracing::info!(iterations, "loop stopped");
        iterations
    }
}
