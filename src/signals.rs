/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C) and SIGTERM by default; the set is configurable.
/// First signal: finish the current iteration, then stop.
/// Second signal: exit the process immediately.
use nix::sys::signal::Signal;
use std::str::FromStr;
use signal_hook_registry::SigId;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// Lifecycle of a cancellable loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Running = 0,
    StopRequested = 1,
    ForceExit = 2,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Running,
            1 => LoopState::StopRequested,
            _ => LoopState::ForceExit,
        }
    }

    /// State reached after one more stop request.
    fn next(self) -> Self {
        match self {
            LoopState::Running => LoopState::StopRequested,
            LoopState::StopRequested | LoopState::ForceExit => LoopState::ForceExit,
        }
    }
}

/// Atomic holder for `LoopState`.
#[derive(Debug)]
pub struct StopFlag {
    state: AtomicU8,
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LoopState::Running as u8),
        }
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Advance one step and return `(previous, current)`.
    ///
    /// A single read-modify-write, so two requests racing each other always
    /// produce two distinct transitions.
    fn advance(&self) -> (LoopState, LoopState) {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some(LoopState::from_u8(raw).next() as u8)
            })
            .unwrap_or_else(|raw| raw);
        let prev = LoopState::from_u8(prev);
        (prev, prev.next())
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Called with the exit code when a second stop request forces exit.
pub type ForceExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// What a second stop request does.
#[derive(Clone)]
pub enum ForceExit {
    /// Terminate the process. On a signal this happens inside the signal
    /// handler, so it works even while every runtime thread is busy.
    Process,
    /// Run a callback instead, outside signal context.
    Hook(ForceExitHook),
}

impl std::fmt::Debug for ForceExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForceExit::Process => f.write_str("Process"),
            ForceExit::Hook(_) => f.write_str("Hook"),
        }
    }
}

/// Cloneable handle that performs stop requests.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<StopFlag>,
    force_exit: ForceExit,
    exit_code: i32,
    announced: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new(force_exit: ForceExit, exit_code: i32) -> Self {
        Self {
            flag: Arc::new(StopFlag::new()),
            force_exit,
            exit_code,
            announced: Arc::new(AtomicBool::new(false)),
            forced: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> LoopState {
        self.flag.state()
    }

    pub fn is_running(&self) -> bool {
        self.flag.is_running()
    }

    /// Request a stop. The first request asks for a graceful stop; the
    /// second one forces exit. Later requests are ignored.
    pub fn request_stop(&self) -> LoopState {
        match self.flag.advance() {
            (LoopState::Running, state) => {
                self.announce_graceful();
                state
            }
            (LoopState::StopRequested, state) => {
                self.force();
                state
            }
            (LoopState::ForceExit, state) => state,
        }
    }

    /// Catch up with a transition the signal handler already made.
    fn after_signal(&self) {
        match self.state() {
            LoopState::Running => {}
            LoopState::StopRequested => self.announce_graceful(),
            LoopState::ForceExit => self.force(),
        }
    }

    fn announce_graceful(&self) {
        if !self.announced.swap(true, Ordering::AcqRel) {
            tracing::warn!("graceful stop requested, send the signal again to force exit");
        }
    }

    fn force(&self) {
        if self.forced.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(exit_code = self.exit_code, "force exiting");
        match &self.force_exit {
            ForceExit::Process => std::process::exit(self.exit_code),
            ForceExit::Hook(hook) => hook(self.exit_code),
        }
    }

    /// Action run inside the signal handler: only async-signal-safe work.
    fn signal_action(&self) -> impl Fn() + Send + Sync + 'static {
        let flag = Arc::clone(&self.flag);
        let exit_code = match self.force_exit {
            ForceExit::Process => Some(self.exit_code),
            ForceExit::Hook(_) => None,
        };
        move || {
            let (prev, _) = flag.advance();
            if prev == LoopState::StopRequested {
                if let Some(code) = exit_code {
                    const MSG: &[u8] = b"force exiting\n";
                    // SAFETY: write(2) and _exit(2) are async-signal-safe.
                    unsafe {
                        libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
                        libc::_exit(code);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("state", &self.state())
            .field("force_exit", &self.force_exit)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur while installing signal listeners.
#[derive(Debug)]
pub enum SignalError {
    /// The configured name is not a known signal.
    UnknownSignal(String),
    /// The OS refused to install a handler for this signal.
    Install {
        signal: Signal,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::UnknownSignal(name) => write!(f, "unknown signal name: {}", name),
            SignalError::Install { signal, source } => {
                write!(f, "failed to install {} handler: {}", signal, source)
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::UnknownSignal(_) => None,
            SignalError::Install { source, .. } => Some(source),
        }
    }
}

/// Parse names like "SIGINT" (or "INT") into signals.
pub fn parse_signals(names: &[String]) -> Result<Vec<Signal>, SignalError> {
    names
        .iter()
        .map(|name| {
            let upper = name.trim().to_ascii_uppercase();
            let full = if upper.starts_with("SIG") {
                upper
            } else {
                format!("SIG{upper}")
            };
            Signal::from_str(&full).map_err(|_| SignalError::UnknownSignal(name.clone()))
        })
        .collect()
}

/// Signal handlers feeding a `StopHandle`.
///
/// Every delivery advances the state inside the handler itself, so
/// back-to-back signals are each counted. A tokio task per signal follows
/// up with logging and the force-exit hook. Both are removed on drop.
#[derive(Debug, Default)]
pub struct SignalListener {
    actions: Vec<SigId>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalListener {
    /// Register `signals` and forward each delivery to `handle`.
    ///
    /// Must be called from within a Tokio runtime. All handlers are
    /// registered before this returns, so signals sent afterwards are seen.
    pub fn install(signals: &[Signal], handle: StopHandle) -> Result<Self, SignalError> {
        // Partially installed handlers are removed by Drop on early return.
        let mut listener = Self::default();
        for &sig in signals {
            // tokio rejects uncatchable signals with an error; register it
            // first so the registry below never sees them.
            let mut stream = signal(SignalKind::from_raw(sig as i32))
                .map_err(|e| SignalError::Install { signal: sig, source: e })?;

            // SAFETY: the action only touches an atomic and, for a forced
            // process exit, calls write(2) and _exit(2).
            let id = unsafe { signal_hook_registry::register(sig as i32, handle.signal_action()) }
                .map_err(|e| SignalError::Install { signal: sig, source: e })?;
            listener.actions.push(id);

            let handle = handle.clone();
            listener.tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    tracing::info!(signal = %sig, "received stop signal");
                    handle.after_signal();
                }
            }));
        }

        tracing::debug!(signals = ?signals, "stop signal listeners installed");
        Ok(listener)
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        for id in self.actions.drain(..) {
            signal_hook_registry::unregister(id);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handle() -> (StopHandle, Arc<Mutex<Vec<i32>>>) {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exits);
        let hook: ForceExitHook = Arc::new(move |code: i32| sink.lock().unwrap().push(code));
        (StopHandle::new(ForceExit::Hook(hook), 0), exits)
    }

    #[test]
    fn test_flag_starts_running() {
        let flag = StopFlag::new();
        assert_eq!(flag.state(), LoopState::Running);
        assert!(flag.is_running());
    }

    #[test]
    fn test_flag_transitions() {
        let flag = StopFlag::new();
        assert_eq!(
            flag.advance(),
            (LoopState::Running, LoopState::StopRequested)
        );
        assert_eq!(
            flag.advance(),
            (LoopState::StopRequested, LoopState::ForceExit)
        );
        // ForceExit is terminal
        assert_eq!(flag.advance(), (LoopState::ForceExit, LoopState::ForceExit));
    }

    #[test]
    fn test_first_request_is_graceful() {
        let (handle, exits) = recording_handle();
        assert_eq!(handle.request_stop(), LoopState::StopRequested);
        assert!(!handle.is_running());
        assert!(exits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_second_request_forces_exit_once() {
        let (handle, exits) = recording_handle();
        handle.request_stop();
        assert_eq!(handle.request_stop(), LoopState::ForceExit);
        handle.request_stop();
        assert_eq!(*exits.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_force_exit_uses_configured_code() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exits);
        let hook: ForceExitHook = Arc::new(move |code: i32| sink.lock().unwrap().push(code));
        let handle = StopHandle::new(ForceExit::Hook(hook), 7);
        handle.request_stop();
        handle.request_stop();
        assert_eq!(*exits.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_concurrent_requests_are_not_lost() {
        let (handle, exits) = recording_handle();
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || handle.request_stop())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(handle.state(), LoopState::ForceExit);
        assert_eq!(exits.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_signals() {
        let names = vec!["SIGINT".to_string(), "term".to_string(), " SIGUSR1 ".to_string()];
        assert_eq!(
            parse_signals(&names).unwrap(),
            vec![Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1]
        );
    }

    #[test]
    fn test_parse_unknown_signal() {
        let err = parse_signals(&["SIGNOPE".to_string()]).unwrap_err();
        assert!(matches!(err, SignalError::UnknownSignal(ref n) if n == "SIGNOPE"));
        assert_eq!(err.to_string(), "unknown signal name: SIGNOPE");
    }

    #[tokio::test]
    async fn test_uncatchable_signal_fails_to_install() {
        let (handle, _) = recording_handle();
        let err = SignalListener::install(&[Signal::SIGKILL], handle).unwrap_err();
        assert!(matches!(
            err,
            SignalError::Install {
                signal: Signal::SIGKILL,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_back_to_back_signals_force_exit() {
        // SIGUSR1 is raised by this test only.
        let (handle, exits) = recording_handle();
        let _listener = SignalListener::install(&[Signal::SIGUSR1], handle.clone()).unwrap();

        // raise() returns only after the handler ran, so the state is
        // already final here, with no task having been polled.
        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(handle.state(), LoopState::ForceExit);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while exits.lock().unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("force-exit hook never ran");
        assert_eq!(*exits.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_dropped_listener_stops_counting() {
        // SIGPROF is raised by this test only.
        let (handle, _) = recording_handle();
        let listener = SignalListener::install(&[Signal::SIGPROF], handle.clone()).unwrap();
        drop(listener);

        nix::sys::signal::raise(Signal::SIGPROF).unwrap();
        assert_eq!(handle.state(), LoopState::Running);
    }
}
