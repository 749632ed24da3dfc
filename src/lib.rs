//! workgate: bounded-concurrency dispatch and signal-driven cancellable loops.

pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod loop_runner;
pub mod permit;
pub mod signals;
pub mod work_item;

pub use config::{ConfigError, WorkgateConfig};
pub use dispatch::{BoundedDispatcher, DispatchError, DispatchReport};
pub use fanout::{FanoutError, FanoutHandles, WorkerFanout};
pub use loop_runner::CancellableLoop;
pub use permit::{Permit, PermitPool};
pub use signals::{ForceExit, ForceExitHook, LoopState, SignalError, StopHandle};
pub use work_item::{BoxError, FailureKind, WorkItem, WorkItemFailure};
