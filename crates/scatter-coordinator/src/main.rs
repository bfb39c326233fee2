//! scatter-coordinator — starts a coordinator for one compute request.
//!
//! The request is partitioned across the live worker fleet; the final result
//! goes to stdout, diagnostics to stderr. Run with -h for usage.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use scatter_cluster::{Coordinator, Outcome, Tracker};
use scatter_compute::{ComputeRequest, OutputSink, Registry};
use scatter_core::NatsSubstrate;

const DEFAULT_SUBSTRATE_URL: &str = "nats://127.0.0.1:4222";

struct Args {
    url: String,
    verbose: bool,
    help: bool,
    computation: Option<String>,
    computation_args: Vec<String>,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut args = Args {
        url: DEFAULT_SUBSTRATE_URL.to_string(),
        verbose: false,
        help: false,
        computation: None,
        computation_args: Vec::new(),
    };
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-l" => args.verbose = true,
            "-d" => {
                args.url = raw.next().ok_or("flag -d requires a substrate URL")?;
            }
            _ => {
                args.computation = Some(arg);
                args.computation_args = raw.collect();
                break;
            }
        }
    }
    Ok(args)
}

fn usage() {
    println!("usage: scatter-coordinator [-h|--help] [-l] [-d url] computation [arguments...]");
    println!();
    println!("Starts a coordinator component for a computation with specific input arguments.");
    println!();
    println!("The following distributed computations are predefined:");
    println!();
    let registry = Registry::with_builtins();
    let width = registry.names().iter().map(|n| n.len()).max().unwrap_or(0);
    for name in registry.names() {
        if let Some(description) = registry.description(name) {
            println!("  {name:>width$}: {description}");
        }
    }
    println!();
    println!("Flags:");
    println!("  -d url   substrate broker URL (default {DEFAULT_SUBSTRATE_URL})");
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
    let Some(computation) = args.computation.clone() else {
        usage();
        return ExitCode::SUCCESS;
    };
    if args.help {
        usage();
        return ExitCode::SUCCESS;
    }

    init_tracing(args.verbose);

    let substrate = match NatsSubstrate::connect(&args.url).await {
        Ok(substrate) => Arc::new(substrate),
        Err(e) => {
            tracing::error!(url = %args.url, error = %e, "failed connecting to substrate");
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(Registry::with_builtins());
    let tracker = Arc::new(Tracker::new());
    let coordinator = Coordinator::new(registry, tracker, substrate);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("termination signal received, shutting down");
            shutdown.cancel();
        });
    }

    let request = ComputeRequest {
        name: computation,
        args: args.computation_args,
        output: OutputSink::stdout(),
    };
    tracing::info!(computation = %request.display_name(), "starting coordinator");

    match coordinator.run(request, shutdown).await {
        Ok(Outcome::Finalized) => ExitCode::SUCCESS,
        Ok(Outcome::FailedFast) | Ok(Outcome::InvalidRequest) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "coordinator failed");
            ExitCode::FAILURE
        }
    }
}
