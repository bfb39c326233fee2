//! Worker — performs partial computations dispatched over the shared group.
//!
//! Stateless with respect to individual partials; any worker can service any
//! partial of a registered computation. Partials are handled one at a time:
//! the broker's round-robin dispatch and the pool size provide parallelism,
//! not the worker.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scatter_compute::Registry;
use scatter_core::substrate::{InboundAction, Substrate, SubstrateError};
use scatter_core::wire::{self, ActionResult, Event, Role, SubscriptionFilter};

use crate::tracker::Tracker;

pub struct Worker {
    id: String,
    registry: Arc<Registry>,
    tracker: Arc<Tracker>,
    substrate: Arc<dyn Substrate>,
}

impl Worker {
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

    /// Serve partial computations until `shutdown` is cancelled, then leave
    /// the fleet cleanly.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SubstrateError> {
        // Subscriptions first, so announcements from concurrently joining
        // coordinators and partials dispatched right after our HELLO are not
        // missed.
        let announcements = self
            .substrate
            .subscribe_action(SubscriptionFilter::of(wire::TYPE_ANNOUNCE_COORDINATOR))
            .await?;
        let partials = self
            .substrate
            .subscribe_action(SubscriptionFilter::shared(
                wire::TYPE_PARTIAL_COMPUTE,
                wire::SHARE_PARTIAL_COMPUTE,
            ))
            .await?;

        let listeners = CancellationToken::new();
        tokio::spawn(respond_to_coordinators(
            announcements,
            self.tracker.clone(),
            self.id.clone(),
            listeners.child_token(),
        ));
        tokio::spawn(serve_partials(
            partials,
            self.registry.clone(),
            self.id.clone(),
            listeners.child_token(),
        ));

        self.announce(true).await;
        tracing::debug!(worker = wire::short_id(&self.id), "serving partial computations");

        shutdown.cancelled().await;

        tracing::debug!(worker = wire::short_id(&self.id), "leaving");
        self.announce(false).await;
        // Give the leave announcement time to reach the substrate before the
        // subscriptions are torn down.
        tokio::time::sleep(wire::LEAVE_GRACE).await;
        listeners.cancel();
        Ok(())
    }

    async fn announce(&self, join: bool) {
        let payload = if join {
            wire::ANNOUNCE_JOIN
        } else {
            wire::ANNOUNCE_LEAVE
        };
        let event = Event {
            event_type: wire::TYPE_ANNOUNCE_WORKER.to_string(),
            id: self.id.clone(),
            source: Role::Worker.to_string(),
            data: Bytes::from_static(payload),
        };
        tracing::debug!(
            worker = wire::short_id(&self.id),
            announcement = %String::from_utf8_lossy(payload),
            "sending announcement"
        );
        if let Err(e) = self.substrate.publish_event(event).await {
            tracing::warn!(error = %e, "announcement failed");
        }
    }
}

/// Track announcing coordinators and reply to joins so they can track this
/// worker.
async fn respond_to_coordinators(
    mut announcements: mpsc::Receiver<InboundAction>,
    tracker: Arc<Tracker>,
    worker_id: String,
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
            if let Some(role) = Role::parse(&action.source) {
                tracker.try_join(role, &action.id);
            }
            let reply = ActionResult {
                context: Role::Worker.to_string(),
                sequence_number: 0,
                data: Bytes::from(worker_id.clone()),
            };
            if let Err(e) = inbound.respond(reply).await {
                tracing::warn!(error = %e, "failed replying to coordinator announcement");
            }
        } else if let Some(role) = Role::parse(&action.source) {
            tracker.leave(role, &action.id);
        }
    }
}

/// Handle inbound partial computations one by one. No backpressure handling
/// needed here: coordinators make provision against overloading workers.
async fn serve_partials(
    mut partials: mpsc::Receiver<InboundAction>,
    registry: Arc<Registry>,
    worker_id: String,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = partials.recv() => match maybe {
                Some(inbound) => inbound,
                None => break,
            },
        };
        handle_partial(&registry, &worker_id, inbound).await;
    }
}

/// Run one partial computation and publish its result, unless the
/// computation is unknown (silent drop; the coordinator's timeout resubmits
/// elsewhere) or declines.
async fn handle_partial(registry: &Registry, worker_id: &str, inbound: InboundAction) {
    let name = inbound.action.id.clone();
    let Some(computation) = registry.create(&name) else {
        tracing::warn!(computation = %name, "unknown computation, dropping partial");
        return;
    };
    tracing::debug!(
        computation = %name,
        coordinator = wire::short_id(&inbound.action.source),
        "partial input received"
    );

    let input = inbound.action.params.clone();
    let output =
        match tokio::task::spawn_blocking(move || computation.partial_compute(&input)).await {
            Ok(output) => output,
            Err(e) => {
                // A panicked partial is treated like a decline; the input is
                // resubmitted to another worker by timeout.
                tracing::warn!(computation = %name, error = %e, "partial computation panicked");
                return;
            }
        };

    let Some(data) = output else {
        tracing::warn!(computation = %name, "partial computation declined, publishing no result");
        return;
    };
    if data.is_empty() {
        tracing::warn!(computation = %name, "partial computation failed, publishing error result");
    }

    let result = ActionResult {
        // Identifies the worker that handled the partial computation.
        context: worker_id.to_string(),
        sequence_number: 0,
        data,
    };
    if let Err(e) = inbound.respond(result).await {
        tracing::warn!(error = %e, "failed publishing partial result");
    }
}
