use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use workgate::{BoundedDispatcher, CancellableLoop, WorkItem, WorkerFanout, WorkgateConfig};

/// Bounded-concurrency task dispatch and signal-driven cancellable loops.
#[derive(Parser, Debug)]
#[command(name = "workgate", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "workgate.toml", global = true)]
    config: PathBuf,

    /// Print the resolved config and exit
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (admissions, per-item completions)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sleeping work item per delay under a concurrency cap
    Dispatch {
        /// Comma-separated sleep durations in milliseconds
        #[arg(long, value_delimiter = ',', default_value = "200,0,100")]
        delays_ms: Vec<u64>,

        /// Max concurrent items (overrides config)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Print the dispatch report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tick until interrupted: once to stop gracefully, twice to force exit
    Loop {
        /// Pause between ticks in milliseconds (overrides config)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Run a greeting on several workers at once and wait for them
    Fanout {
        /// Number of workers (overrides config max_workers)
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "workgate=debug"
    } else {
        "workgate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "workgate failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = WorkgateConfig::load(&cli.config)?;
    apply_overrides(&mut config, &cli.command);

    if cli.dry_run {
        println!("Config file: {}", cli.config.display());
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    match cli.command {
        Command::Dispatch {
            delays_ms, json, ..
        } => dispatch(&config, delays_ms, json).await,
        Command::Loop { .. } => run_loop(&config).await,
        Command::Fanout { .. } => fanout(&config).await,
    }
}

fn apply_overrides(config: &mut WorkgateConfig, command: &Command) {
    match command {
        Command::Dispatch {
            max_workers: Some(n),
            ..
        }
        | Command::Fanout { workers: Some(n) } => config.dispatch.max_workers = *n,
        Command::Loop {
            interval_ms: Some(ms),
        } => config.loop_.interval_ms = *ms,
        _ => {}
    }
}

async fn dispatch(
    config: &WorkgateConfig,
    delays_ms: Vec<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let finished = Arc::new(Mutex::new(Vec::new()));
    let items = delays_ms
        .iter()
        .enumerate()
        .map(|(i, &delay)| {
            let finished = Arc::clone(&finished);
            WorkItem::new(move || {
                std::thread::sleep(Duration::from_millis(delay));
                println!("item {} slept for {}ms", i + 1, delay);
                finished
                    .lock()
                    .map_err(|e| e.to_string())?
                    .push(i + 1);
                Ok(())
            })
        })
        .collect();

    let report = BoundedDispatcher::new(items, config.dispatch.max_workers)?
        .execute()
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let order = finished.lock().map_err(|e| e.to_string())?.clone();
        println!("completion order: {:?}", order);
        println!(
            "{}/{} succeeded, peak concurrency {}, {}ms",
            report.succeeded,
            report.total,
            report.peak_concurrency,
            report.elapsed.as_millis()
        );
    }

    if report.is_success() {
        Ok(())
    } else {
        Err(format!("{} work item(s) failed", report.failures.len()).into())
    }
}

async fn run_loop(config: &WorkgateConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runner = CancellableLoop::install(&config.shutdown)?;
    let interval = Duration::from_millis(config.loop_.interval_ms);
    tracing::info!(
        signals = ?config.shutdown.signals,
        interval_ms = config.loop_.interval_ms,
        "loop running, interrupt to stop"
    );

    let mut tick = 0u64;
    let iterations = runner
        .run_blocking(move || {
            tick += 1;
            println!("tick {}", tick);
            std::thread::sleep(interval);
        })
        .await;

    println!("stopped after {} iterations", iterations);
    Ok(())
}

async fn fanout(config: &WorkgateConfig) -> Result<(), Box<dyn std::error::Error>> {
    let fanout = WorkerFanout::new(
        || {
            println!("hello from {:?}", std::thread::current().id());
            Ok(())
        },
        config.dispatch.max_workers,
    )?;
    let failures = fanout.launch().await.join().await;
    if failures.is_empty() {
        Ok(())
    } else {
        Err(format!("{} worker(s) failed", failures.len()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_defaults() {
        let cli = Cli::try_parse_from(["workgate", "dispatch"]).unwrap();
        match cli.command {
            Command::Dispatch {
                delays_ms,
                max_workers,
                json,
            } => {
                assert_eq!(delays_ms, vec![200, 0, 100]);
                assert_eq!(max_workers, None);
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("workgate.toml"));
    }

    #[test]
    fn test_dispatch_override_applied() {
        let cli = Cli::try_parse_from([
            "workgate",
            "dispatch",
            "--delays-ms",
            "5,10",
            "--max-workers",
            "1",
        ])
        .unwrap();
        let mut config = WorkgateConfig::default();
        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.dispatch.max_workers, 1);
    }

    #[test]
    fn test_loop_override_applied() {
        let cli =
            Cli::try_parse_from(["workgate", "--verbose", "loop", "--interval-ms", "25"]).unwrap();
        assert!(cli.verbose);
        let mut config = WorkgateConfig::default();
        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.loop_.interval_ms, 25);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["workgate", "fanout", "--workers", "3", "--dry-run"]).unwrap();
        assert!(cli.dry_run);
        let mut config = WorkgateConfig::default();
        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.dispatch.max_workers, 3);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_zero_workers() {
        let mut config = WorkgateConfig::default();
        config.dispatch.max_workers = 0;
        let err = dispatch(&config, vec![1, 2], false).await.unwrap_err();
        assert!(err.to_string().contains("max_workers must be at least 1"));
    }
}
