//! Integration test harness.
//!
//! Scenarios run real coordinator and worker instances in one process over
//! the in-process bus; the broker-backed tests in `nats.rs` skip gracefully
//! when no NATS server is reachable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use scatter_cluster::{Coordinator, Outcome, Tracker, Worker};
use scatter_compute::{
    ArgumentError, BinaryData, Computation, ComputeRequest, OutputSink, Registry,
};
use scatter_core::{wire, LocalBus, SubscriptionFilter, Substrate};

mod census;
mod pca;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn substrate(bus: &Arc<LocalBus>) -> Arc<dyn Substrate> {
    bus.clone()
}

/// Poll `condition` every few milliseconds until it holds or the timeout
/// elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct WorkerHandle {
    pub tracker: Arc<Tracker>,
    pub shutdown: CancellationToken,
    pub done: JoinHandle<()>,
}

pub fn start_worker(registry: &Arc<Registry>, bus: &Arc<LocalBus>) -> WorkerHandle {
    let tracker = Arc::new(Tracker::new());
    let worker = Worker::new(registry.clone(), tracker.clone(), substrate(bus));
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let done = tokio::spawn(async move {
        if let Err(e) = worker.run(token).await {
            panic!("worker failed: {e}");
        }
    });
    WorkerHandle {
        tracker,
        shutdown,
        done,
    }
}

/// Start `n` workers and wait until each one's join announcement is
/// observable on the bus. A worker announces only after its subscriptions
/// are up, so a coordinator started afterwards is guaranteed census replies.
pub async fn start_workers(
    n: usize,
    registry: &Arc<Registry>,
    bus: &Arc<LocalBus>,
) -> Vec<WorkerHandle> {
    let mut hello = bus
        .subscribe_event(SubscriptionFilter::of(wire::TYPE_ANNOUNCE_WORKER))
        .await
        .unwrap();
    let handles: Vec<WorkerHandle> = (0..n).map(|_| start_worker(registry, bus)).collect();
    for _ in 0..n {
        let event = tokio::time::timeout(Duration::from_secs(5), hello.recv())
            .await
            .expect("worker never announced")
            .unwrap();
        assert_eq!(event.data.as_ref(), wire::ANNOUNCE_JOIN);
    }
    handles
}

pub struct CoordinatorRun {
    pub tracker: Arc<Tracker>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<(Outcome, String)>,
}

pub fn spawn_coordinator(
    registry: &Arc<Registry>,
    bus: &Arc<LocalBus>,
    name: &str,
    args: &[&str],
) -> CoordinatorRun {
    let tracker = Arc::new(Tracker::new());
    let coordinator = Coordinator::new(registry.clone(), tracker.clone(), substrate(bus));
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let (output, buffer) = OutputSink::buffer();
    let request = ComputeRequest {
        name: name.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        output,
    };
    let handle = tokio::spawn(async move {
        let outcome = coordinator
            .run(request, token)
            .await
            .expect("coordinator setup failed");
        (outcome, buffer.contents())
    });
    CoordinatorRun {
        tracker,
        shutdown,
        handle,
    }
}

pub async fn run_coordinator(
    registry: &Arc<Registry>,
    bus: &Arc<LocalBus>,
    name: &str,
    args: &[&str],
) -> (Outcome, String) {
    spawn_coordinator(registry, bus, name, args)
        .handle
        .await
        .expect("coordinator task panicked")
}

// ── Test computations ─────────────────────────────────────────────────────────

/// Per-input worker behavior of an [`EchoCollect`] run.
#[derive(Clone, Copy)]
pub enum PartialBehavior {
    Echo,
    Decline,
    Fail,
}

pub type Behavior = Arc<dyn Fn(&str) -> PartialBehavior + Send + Sync>;

pub fn always_echo() -> Behavior {
    Arc::new(|_| PartialBehavior::Echo)
}

/// Echoes scripted inputs through the fleet and collects them; behavior per
/// input is injectable so fault scenarios can be staged.
pub struct EchoCollect {
    name: &'static str,
    inputs: Vec<String>,
    behavior: Behavior,
    timeout: Duration,
    request: Option<ComputeRequest>,
    collected: Vec<String>,
}

impl EchoCollect {
    pub fn new(
        name: &'static str,
        inputs: Vec<String>,
        timeout: Duration,
        behavior: Behavior,
    ) -> Self {
        Self {
            name,
            inputs,
            behavior,
            timeout,
            request: None,
            collected: Vec::new(),
        }
    }
}

impl Computation for EchoCollect {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "echoes scripted inputs (test computation)"
    }

    fn partition(
        &mut self,
        request: ComputeRequest,
    ) -> Result<mpsc::Receiver<BinaryData>, ArgumentError> {
        self.request = Some(request);
        self.collected.clear();
        let inputs = self.inputs.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for input in inputs {
                if tx.send(Bytes::from(input)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn partial_compute(&self, input: &BinaryData) -> Option<BinaryData> {
        let text = std::str::from_utf8(input).ok()?;
        match (self.behavior)(text) {
            PartialBehavior::Echo => Some(input.clone()),
            PartialBehavior::Decline => None,
            PartialBehavior::Fail => Some(Bytes::new()),
        }
    }

    fn partial_compute_timeout(&self) -> Duration {
        self.timeout
    }

    fn accumulate(&mut self, output: BinaryData) {
        self.collected
            .push(String::from_utf8_lossy(&output).into_owned());
    }

    fn finalize(&mut self, _start: Instant) {
        use std::io::Write;
        let Some(request) = self.request.as_ref() else {
            return;
        };
        self.collected.sort();
        let mut sink = request.output.clone();
        let _ = writeln!(sink, "result: {}", self.collected.join(","));
    }
}

/// Emits no partials; its partition channel stays open until the gate is
/// notified. Keeps a coordinator alive for census scenarios.
pub struct Trickle {
    name: &'static str,
    gate: Arc<tokio::sync::Notify>,
    request: Option<ComputeRequest>,
}

impl Trickle {
    pub fn new(name: &'static str, gate: Arc<tokio::sync::Notify>) -> Self {
        Self {
            name,
            gate,
            request: None,
        }
    }
}

impl Computation for Trickle {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "holds the partition open until notified (test computation)"
    }

    fn partition(
        &mut self,
        request: ComputeRequest,
    ) -> Result<mpsc::Receiver<BinaryData>, ArgumentError> {
        self.request = Some(request);
        let gate = self.gate.clone();
        let (tx, rx) = mpsc::channel::<BinaryData>(1);
        tokio::spawn(async move {
            gate.notified().await;
            drop(tx);
        });
        Ok(rx)
    }

    fn partial_compute(&self, input: &BinaryData) -> Option<BinaryData> {
        Some(input.clone())
    }

    fn partial_compute_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn accumulate(&mut self, _output: BinaryData) {}

    fn finalize(&mut self, _start: Instant) {
        use std::io::Write;
        if let Some(request) = self.request.as_ref() {
            let mut sink = request.output.clone();
            let _ = writeln!(sink, "result:");
        }
    }
}
