//! End-to-end tests for `workgate loop`: the real binary, real SIGINTs.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(10);

/// Start `workgate loop` with default shutdown settings and stream its
/// stdout lines into a channel.
fn spawn_loop(dir: &Path, interval_ms: u64) -> (Child, Receiver<String>) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_workgate"))
        .arg("--config")
        .arg(dir.join("missing.toml"))
        .arg("loop")
        .arg("--interval-ms")
        .arg(interval_ms.to_string())
        .env("RUST_LOG", "workgate=info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start workgate");

    let stdout = child.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    (child, rx)
}

/// Block until a stdout line containing `needle` shows up.
fn wait_for_line(rx: &Receiver<String>, needle: &str) -> String {
    let start = Instant::now();
    loop {
        let left = DEADLINE.saturating_sub(start.elapsed());
        match rx.recv_timeout(left) {
            Ok(line) if line.contains(needle) => return line,
            Ok(_) => continue,
            Err(e) => panic!("no line containing {needle:?}: {e}"),
        }
    }
}

fn wait_for_exit(child: &mut Child) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if start.elapsed() > DEADLINE {
            let _ = child.kill();
            panic!("workgate did not exit");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn interrupt(child: &Child) {
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
}

#[test]
fn test_second_interrupt_exits_during_long_iteration() {
    let dir = tempfile::tempdir().unwrap();
    // Each iteration sleeps far longer than the test is willing to wait.
    let (mut child, lines) = spawn_loop(dir.path(), 60_000);

    wait_for_line(&lines, "tick 1");
    interrupt(&child);
    wait_for_line(&lines, "graceful stop requested");
    interrupt(&child);

    let status = wait_for_exit(&mut child);
    assert_eq!(status.code(), Some(0));

    let rest: Vec<String> = lines.try_iter().collect();
    assert!(
        !rest.iter().any(|l| l.contains("stopped after")),
        "loop finished normally instead of being forced: {rest:?}"
    );

    let mut stderr = String::new();
    std::io::Read::read_to_string(child.stderr.as_mut().unwrap(), &mut stderr).unwrap();
    assert!(stderr.contains("force exiting"), "stderr: {stderr}");
}

#[test]
fn test_single_interrupt_finishes_current_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let (mut child, lines) = spawn_loop(dir.path(), 50);

    wait_for_line(&lines, "tick 1");
    interrupt(&child);

    let summary = wait_for_line(&lines, "stopped after");
    let status = wait_for_exit(&mut child);

    assert_eq!(status.code(), Some(0));
    assert!(summary.contains("iterations"), "summary: {summary}");
}
