//! scatter-worker — starts a number of worker components that perform
//! distributed partial computations requested by coordinators.
//!
//! Run with -h for usage.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use scatter_cluster::{Tracker, Worker};
use scatter_compute::Registry;
use scatter_core::NatsSubstrate;

const DEFAULT_SUBSTRATE_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_WORKERS: usize = 10;
const MAX_WORKERS: usize = 100;

struct Args {
    url: String,
    verbose: bool,
    help: bool,
    count: Option<String>,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut args = Args {
        url: DEFAULT_SUBSTRATE_URL.to_string(),
        verbose: false,
        help: false,
        count: None,
    };
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-l" => args.verbose = true,
            "-b" => {
                args.url = raw.next().ok_or("flag -b requires a broker URL")?;
            }
            _ => {
                if args.count.is_some() || raw.next().is_some() {
                    return Err("too many arguments".to_string());
                }
                args.count = Some(arg);
                break;
            }
        }
    }
    Ok(args)
}

fn usage() {
    println!("usage: scatter-worker [-h|--help] [-l] [-b url] [count]");
    println!();
    println!("Starts the given number of worker components (default {DEFAULT_WORKERS}, maximum {MAX_WORKERS}).");
    println!();
    println!("Flags:");
    println!("  -b url   substrate broker URL (default {DEFAULT_SUBSTRATE_URL})");
    println!("  -l       show diagnostic logging");
    println!("  -h       show usage information");
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "failed installing SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            usage();
            return ExitCode::FAILURE;
        }
    };
    if args.help {
        usage();
        return ExitCode::SUCCESS;
    }

    let count = match args.count.as_deref() {
        None => DEFAULT_WORKERS,
        Some(raw) => match raw.parse::<usize>() {
            Ok(count) if (1..=MAX_WORKERS).contains(&count) => count,
            _ => {
                eprintln!("Number of workers must be between 1 and {MAX_WORKERS}");
                return ExitCode::FAILURE;
            }
        },
    };

    init_tracing(args.verbose);

    let substrate = match NatsSubstrate::connect(&args.url).await {
        Ok(substrate) => Arc::new(substrate),
        Err(e) => {
            tracing::error!(url = %args.url, error = %e, "failed connecting to substrate");
            return ExitCode::FAILURE;
        }
    };
    let registry = Arc::new(Registry::with_builtins());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("termination signal received, shutting down workers");
            shutdown.cancel();
        });
    }

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..count {
        let worker = Worker::new(
            registry.clone(),
            Arc::new(Tracker::new()),
            substrate.clone(),
        );
        let shutdown = shutdown.clone();
        workers.spawn(async move {
            if let Err(e) = worker.run(shutdown).await {
                tracing::error!(error = %e, "worker failed");
            }
        });
    }
    tracing::info!(count, "workers running");

    // Wait for every worker to shut down gracefully.
    while workers.join_next().await.is_some() {}
    ExitCode::SUCCESS
}
