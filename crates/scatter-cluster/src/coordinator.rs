//! Coordinator — services one compute request with the
//! Partition-Compute-Accumulate pattern.
//!
//! Splits the request into partial computations dispatched to workers over
//! the shared group, accumulates partial results, and writes the final result
//! to the request's output sink. Participates in distributed lifecycle
//! tracking so its dispatch rate follows the live fleet.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scatter_compute::{BinaryData, ComputeRequest, Registry};
use scatter_core::substrate::{InboundAction, Substrate, SubstrateError};
use scatter_core::wire::{self, Action, ActionResult, Event, Role, SubscriptionFilter};

use crate::action_log::ActionLog;
use crate::tracker::Tracker;

/// Bound on queued resubmissions; overflow fails the whole request.
const RESUBMIT_CAPACITY: usize = 100;
const COMPLETION_BUFFER: usize = 64;

/// Terminal state of a serviced request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every partial accumulated; `finalize` ran.
    Finalized,
    /// Abandoned: a failure line was written and `finalize` skipped.
    FailedFast,
    /// Unknown computation or rejected arguments; nothing dispatched.
    InvalidRequest,
}

pub struct Coordinator {
    id: String,
    registry: Arc<Registry>,
    tracker: Arc<Tracker>,
    substrate: Arc<dyn Substrate>,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, tracker: Arc<Tracker>, substrate: Arc<dyn Substrate>) -> Self {
        Self {
            id: wire::instance_id(),
            registry,
            tracker,
            substrate,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Service one compute request, then leave the fleet.
    ///
    /// Cancelling `shutdown` fails the request fast and still runs the
    /// leave half of the lifecycle protocol.
    pub async fn run(
        &self,
        request: ComputeRequest,
        shutdown: CancellationToken,
    ) -> Result<Outcome, SubstrateError> {
        // Preregister self before any peer is tracked.
        self.tracker.try_join(Role::Coordinator, &self.id);

        // Announcement listeners must be receiving before our own join goes
        // out, so concurrently joining peers converge.
        let announcements = self
            .substrate
            .subscribe_action(SubscriptionFilter::of(wire::TYPE_ANNOUNCE_COORDINATOR))
            .await?;
        let worker_events = self
            .substrate
            .subscribe_event(SubscriptionFilter::of(wire::TYPE_ANNOUNCE_WORKER))
            .await?;

        let listeners = CancellationToken::new();
        tokio::spawn(track_coordinator_announcements(
            announcements,
            self.tracker.clone(),
            self.id.clone(),
            listeners.child_token(),
        ));
        tokio::spawn(track_worker_announcements(
            worker_events,
            self.tracker.clone(),
            listeners.child_token(),
        ));

        self.announce(true).await;

        let outcome = self.partition_accumulate(request, &shutdown).await;

        self.announce(false).await;
        // Give the leave announcement time to reach the substrate before the
        // listeners are torn down.
        tokio::time::sleep(wire::LEAVE_GRACE).await;
        listeners.cancel();

        Ok(outcome)
    }

    /// Publish a join or leave announcement. On join, census replies are
    /// collected into the tracker until the announce deadline; deadline and
    /// cancellation end collection silently.
    async fn announce(&self, join: bool) {
        let payload = if join {
            wire::ANNOUNCE_JOIN
        } else {
            wire::ANNOUNCE_LEAVE
        };
        let action = Action {
            action_type: wire::TYPE_ANNOUNCE_COORDINATOR.to_string(),
            id: self.id.clone(),
            source: Role::Coordinator.to_string(),
            params: Bytes::from_static(payload),
        };
        tracing::debug!(
            coordinator = wire::short_id(&self.id),
            announcement = %String::from_utf8_lossy(payload),
            "sending announcement"
        );

        let mut replies = match self.substrate.publish_action(action).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "announcement failed");
                return;
            }
        };
        if !join {
            return; // a leaving coordinator is not interested in responses
        }

        replies.set_deadline(wire::ANNOUNCE_DEADLINE);
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            loop {
                match replies.recv().await {
                    Ok(reply) => {
                        let id = String::from_utf8_lossy(&reply.data).into_owned();
                        tracing::debug!(
                            peer = wire::short_id(&id),
                            role = %reply.context,
                            "census reply"
                        );
                        if let Some(role) = Role::parse(&reply.context) {
                            tracker.try_join(role, &id);
                        }
                    }
                    Err(SubstrateError::Canceled) | Err(SubstrateError::DeadlineExceeded) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "census stream ended");
                        break;
                    }
                }
            }
        });
    }

    /// The coordinator half of the Partition-Compute-Accumulate pattern.
    async fn partition_accumulate(
        &self,
        request: ComputeRequest,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let start = Instant::now();
        let mut output = request.output.clone();
        let label = request.display_name();

        let Some(mut computation) = self.registry.create(&request.name) else {
            let _ = writeln!(output, "{} is not defined", request.name);
            return Outcome::InvalidRequest;
        };
        let name = computation.name();
        let timeout = computation.partial_compute_timeout();

        let mut inputs = match computation.partition(request) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = writeln!(output, "Invalid input arguments: {e}");
                return Outcome::InvalidRequest;
            }
        };
        let mut input_open = true;

        let (completion_tx, mut completions) = mpsc::channel::<Completion>(COMPLETION_BUFFER);
        // Bounded retry queue; both ends stay with this loop.
        let (resubmit_tx, mut resubmits) = mpsc::channel::<BinaryData>(RESUBMIT_CAPACITY);
        let mut queued_resubmits = 0usize;
        let mut census = self.tracker.watch();
        let mut census_alive = true;
        let partials = CancellationToken::new();

        let mut log = ActionLog::new();
        let mut in_flight = 0usize;
        let mut fail_fast = false;
        let mut last_state: Option<FreeEstimate> = None;

        loop {
            // Re-derive the free-worker estimate every iteration; dispatch is
            // suspended whenever no fair share of the fleet is free.
            let (coordinators, workers) = self.tracker.count();
            let state = FreeEstimate {
                coordinators,
                workers,
                in_flight,
            };
            if last_state != Some(state) {
                tracing::debug!(
                    coordinators,
                    workers,
                    in_flight,
                    free = state.free(),
                    "fleet state"
                );
                last_state = Some(state);
            }
            let can_dispatch = state.free() > 0;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("canceled by termination signal");
                    fail_fast = true;
                    break;
                }
                maybe = inputs.recv(), if can_dispatch && input_open => match maybe {
                    Some(input) => {
                        in_flight += 1;
                        tracing::debug!(computation = name, "dispatching partial input");
                        self.dispatch_partial(name, timeout, input, &completion_tx, &partials, &mut log);
                    }
                    None => {
                        input_open = false; // partitioning exhausted
                        if in_flight == 0 && queued_resubmits == 0 {
                            break;
                        }
                    }
                },
                Some(input) = resubmits.recv(), if can_dispatch && queued_resubmits > 0 => {
                    queued_resubmits -= 1;
                    in_flight += 1;
                    tracing::debug!(computation = name, "dispatching resubmitted partial input");
                    self.dispatch_partial(name, timeout, input, &completion_tx, &partials, &mut log);
                }
                Some(done) = completions.recv() => {
                    in_flight -= 1;
                    match done.kind {
                        CompletionKind::Completed { result } => {
                            tracing::debug!(
                                worker = wire::short_id(&result.context),
                                "partial output received"
                            );
                            log.record_result(done.seq, &result);
                            computation.accumulate(result.data);
                            if !input_open && in_flight == 0 && queued_resubmits == 0 {
                                break;
                            }
                        }
                        CompletionKind::ComputationalError { worker_id } => {
                            tracing::error!(
                                worker = wire::short_id(&worker_id),
                                "computational or encoding error from worker"
                            );
                            log.record_error(done.seq, "computational or encoding error");
                            fail_fast = true;
                            break;
                        }
                        CompletionKind::Resubmit { input, cause } => {
                            tracing::warn!(
                                error = %cause,
                                "partial computation failed, queuing input for resubmission"
                            );
                            log.record_error(done.seq, &cause.to_string());
                            match resubmit_tx.try_send(input) {
                                Ok(()) => queued_resubmits += 1,
                                Err(_) => {
                                    tracing::error!(
                                        capacity = RESUBMIT_CAPACITY,
                                        "resubmission queue overflow"
                                    );
                                    fail_fast = true;
                                    break;
                                }
                            }
                        }
                    }
                }
                changed = census.changed(), if census_alive => {
                    // Wakes the loop so the estimate above is re-derived.
                    if changed.is_err() {
                        census_alive = false;
                    }
                }
            }
        }

        partials.cancel();
        tracing::debug!(dispatched = log.len(), "partial dispatch log closed");

        if fail_fast {
            let _ = writeln!(output, "Computation {label} failed");
            Outcome::FailedFast
        } else {
            computation.finalize(start);
            Outcome::Finalized
        }
    }

    /// Publish one partial-compute action and hand its single result to the
    /// loop as a completion.
    fn dispatch_partial(
        &self,
        name: &str,
        timeout: Duration,
        input: BinaryData,
        completions: &mpsc::Sender<Completion>,
        cancel: &CancellationToken,
        log: &mut ActionLog,
    ) {
        let action = Action {
            action_type: wire::TYPE_PARTIAL_COMPUTE.to_string(),
            // The action id carries the computation name so workers can look
            // it up without decoding params.
            id: name.to_string(),
            source: self.id.clone(),
            params: input.clone(),
        };
        let seq = log.record_action(&action);
        let substrate = self.substrate.clone();
        let completions = completions.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Some(done) = perform_partial(substrate, action, input, timeout, seq, &cancel).await {
                let _ = completions.send(done).await;
            }
        });
    }
}

/// Await the single result of one dispatched partial. Cancellation is
/// silent; the parent loop is already winding down.
async fn perform_partial(
    substrate: Arc<dyn Substrate>,
    action: Action,
    input: BinaryData,
    timeout: Duration,
    seq: usize,
    cancel: &CancellationToken,
) -> Option<Completion> {
    let published = tokio::select! {
        _ = cancel.cancelled() => return None,
        published = substrate.publish_action(action) => published,
    };
    let mut results = match published {
        Ok(stream) => stream,
        Err(SubstrateError::Canceled) => return None,
        Err(cause) => return Some(Completion::resubmit(seq, input, cause)),
    };
    results.set_deadline(timeout);

    tokio::select! {
        _ = cancel.cancelled() => None,
        received = results.recv() => match received {
            Ok(result) if result.data.is_empty() => Some(Completion {
                seq,
                kind: CompletionKind::ComputationalError {
                    worker_id: result.context,
                },
            }),
            Ok(result) => Some(Completion {
                seq,
                kind: CompletionKind::Completed { result },
            }),
            Err(SubstrateError::Canceled) => None,
            Err(cause) => Some(Completion::resubmit(seq, input, cause)),
        },
    }
}

struct Completion {
    seq: usize,
    kind: CompletionKind,
}

impl Completion {
    fn resubmit(seq: usize, input: BinaryData, cause: SubstrateError) -> Self {
        Self {
            seq,
            kind: CompletionKind::Resubmit { input, cause },
        }
    }
}

enum CompletionKind {
    /// Non-empty partial output from a worker.
    Completed { result: ActionResult },
    /// Empty output: no worker can complete this partial.
    ComputationalError { worker_id: String },
    /// Transport failure or timeout; the input goes back into the queue.
    Resubmit {
        input: BinaryData,
        cause: SubstrateError,
    },
}

/// Fair-share estimate of workers free to take the next partial.
///
/// Each coordinator targets `workers / coordinators` concurrent partials.
/// The estimate matches reality only when the substrate dispatches the
/// shared group round-robin; sticky dispatch skews load but stays correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeEstimate {
    coordinators: usize,
    workers: usize,
    in_flight: usize,
}

impl FreeEstimate {
    fn free(&self) -> i64 {
        if self.coordinators == 0 {
            return 0;
        }
        (self.workers / self.coordinators) as i64 - self.in_flight as i64
    }
}

async fn track_coordinator_announcements(
    mut announcements: mpsc::Receiver<InboundAction>,
    tracker: Arc<Tracker>,
    self_id: String,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = announcements.recv() => match maybe {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let action = &inbound.action;
        tracing::debug!(
            peer = wire::short_id(&action.id),
            source = %action.source,
            announcement = %String::from_utf8_lossy(&action.params),
            "coordinator announcement"
        );
        if action.params.as_ref() == wire::ANNOUNCE_JOIN {
            if action.id == self_id {
                continue; // echo of our own join
            }
            if let Some(role) = Role::parse(&action.source) {
                tracker.try_join(role, &action.id);
            }
            // Reply so the joining coordinator can track this one.
            let reply = ActionResult {
                context: Role::Coordinator.to_string(),
                sequence_number: 0,
                data: Bytes::from(self_id.clone()),
            };
            if let Err(e) = inbound.respond(reply).await {
                tracing::warn!(error = %e, "failed replying to coordinator announcement");
            }
        } else if let Some(role) = Role::parse(&action.source) {
            tracker.leave(role, &action.id);
        }
    }
}

async fn track_worker_announcements(
    mut events: mpsc::Receiver<Event>,
    tracker: Arc<Tracker>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = events.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
        };
        tracing::debug!(
            peer = wire::short_id(&event.id),
            source = %event.source,
            announcement = %String::from_utf8_lossy(&event.data),
            "worker announcement"
        );
        let Some(role) = Role::parse(&event.source) else {
            continue;
        };
        if event.data.as_ref() == wire::ANNOUNCE_JOIN {
            tracker.try_join(role, &event.id);
        } else {
            tracker.leave(role, &event.id);
        }
    }
}
