//! Partition-Compute-Accumulate scenarios over the in-process bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use scatter_cluster::Outcome;
use scatter_compute::Registry;
use scatter_core::wire::{self, Event, SubscriptionFilter};
use scatter_core::{LocalBus, Role, Substrate};

use crate::*;

/// Factorial smoke: four partials over two workers multiply to 120.
#[tokio::test]
async fn factorial_smoke() {
    let bus = LocalBus::new();
    let registry = Arc::new(Registry::with_builtins());

    let workers = start_workers(2, &registry, &bus).await;

    let (outcome, output) = run_coordinator(&registry, &bus, "fac", &["5"]).await;
    assert_eq!(outcome, Outcome::Finalized);
    assert!(
        output.contains("Computation fac[5] = 120"),
        "unexpected output:\n{output}"
    );
    // A clean run writes nothing but the time and result lines.
    assert!(!output.contains("failed"), "unexpected output:\n{output}");

    for worker in workers {
        worker.shutdown.cancel();
        worker.done.await.unwrap();
    }
}

/// Zero inputs finalize immediately: 0! = 1.
#[tokio::test]
async fn factorial_of_zero_finalizes_without_dispatch() {
    let bus = LocalBus::new();
    let registry = Arc::new(Registry::with_builtins());
    let mut workers = start_workers(1, &registry, &bus).await;
    let worker = workers.remove(0);

    let (outcome, output) = run_coordinator(&registry, &bus, "fac", &["0"]).await;
    assert_eq!(outcome, Outcome::Finalized);
    assert!(
        output.contains("Computation fac[0] = 1"),
        "unexpected output:\n{output}"
    );

    worker.shutdown.cancel();
    worker.done.await.unwrap();
}

/// A declining worker leaves a partial unanswered; the coordinator resubmits
/// it and the final result matches the all-workers-correct case.
#[tokio::test]
async fn declined_partial_is_resubmitted() {
    let bus = LocalBus::new();
    let declined = Arc::new(AtomicBool::new(false));
    let behavior: Behavior = {
        let declined = declined.clone();
        Arc::new(move |input| {
            if input == "b" && !declined.swap(true, Ordering::SeqCst) {
                PartialBehavior::Decline
            } else {
                PartialBehavior::Echo
            }
        })
    };
    let mut registry = Registry::new();
    registry.register(move || {
        Box::new(EchoCollect::new(
            "tdefect",
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            Duration::from_millis(500),
            behavior.clone(),
        ))
    });
    let registry = Arc::new(registry);

    let workers = start_workers(2, &registry, &bus).await;

    let (outcome, output) = run_coordinator(&registry, &bus, "tdefect", &[]).await;
    assert_eq!(outcome, Outcome::Finalized);
    assert!(
        output.contains("result: a,b,c,d"),
        "unexpected output:\n{output}"
    );
    assert!(declined.load(Ordering::SeqCst), "the decline never happened");

    for worker in workers {
        worker.shutdown.cancel();
        worker.done.await.unwrap();
    }
}

/// Empty partial output is a computational error: fail fast, no finalize.
#[tokio::test]
async fn computational_error_fails_fast() {
    let bus = LocalBus::new();
    let behavior: Behavior = Arc::new(|input| {
        if input == "b" {
            PartialBehavior::Fail
        } else {
            PartialBehavior::Echo
        }
    });
    let mut registry = Registry::new();
    registry.register(move || {
        Box::new(EchoCollect::new(
            "tfatal",
            vec!["a".into(), "b".into(), "c".into()],
            Duration::from_millis(500),
            behavior.clone(),
        ))
    });
    let registry = Arc::new(registry);

    let workers = start_workers(2, &registry, &bus).await;

    let (outcome, output) = run_coordinator(&registry, &bus, "tfatal", &[]).await;
    assert_eq!(outcome, Outcome::FailedFast);
    assert!(
        output.contains("Computation tfatal[] failed"),
        "unexpected output:\n{output}"
    );
    assert!(!output.contains("result:"), "finalize ran:\n{output}");

    for worker in workers {
        worker.shutdown.cancel();
        worker.done.await.unwrap();
    }
}

/// With every partial lost, resubmissions pile up to the queue bound and the
/// request fails fast instead of deadlocking.
#[tokio::test]
async fn resubmit_overflow_fails_fast() {
    let bus = LocalBus::new();
    let inputs: Vec<String> = (0..200).map(|i| format!("input-{i}")).collect();
    let mut registry = Registry::new();
    registry.register(move || {
        Box::new(EchoCollect::new(
            "tflood",
            inputs.clone(),
            Duration::from_millis(200),
            always_echo(),
        ))
    });
    let registry = Arc::new(registry);

    // No worker subscribes to partials; an announced-but-deaf worker makes
    // the coordinator believe it can dispatch. Announce repeatedly until the
    // coordinator's event subscription has observed it.
    let run = spawn_coordinator(&registry, &bus, "tflood", &[]);
    let mut tracked = false;
    for _ in 0..200 {
        bus.publish_event(Event {
            event_type: wire::TYPE_ANNOUNCE_WORKER.to_string(),
            id: "phantom-worker".to_string(),
            source: Role::Worker.to_string(),
            data: Bytes::from_static(wire::ANNOUNCE_JOIN),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        if run.tracker.count().1 == 1 {
            tracked = true;
            break;
        }
    }
    assert!(tracked, "phantom worker never tracked");

    let (outcome, output) = tokio::time::timeout(Duration::from_secs(30), run.handle)
        .await
        .expect("overflow deadlocked")
        .unwrap();
    assert_eq!(outcome, Outcome::FailedFast);
    assert!(
        output.contains("Computation tflood[] failed"),
        "unexpected output:\n{output}"
    );
}

/// With no workers in the census nothing is dispatched; the first worker
/// announcement wakes the loop.
#[tokio::test]
async fn dispatch_waits_for_a_free_worker() {
    let bus = LocalBus::new();
    let mut registry = Registry::new();
    registry.register(|| {
        Box::new(EchoCollect::new(
            "tidle",
            vec!["x".into()],
            Duration::from_millis(200),
            always_echo(),
        ))
    });
    let registry = Arc::new(registry);

    // Observe every partial-compute action without joining the share group.
    let mut spy = bus
        .subscribe_action(SubscriptionFilter::of(wire::TYPE_PARTIAL_COMPUTE))
        .await
        .unwrap();

    let run = spawn_coordinator(&registry, &bus, "tidle", &[]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        spy.try_recv().is_err(),
        "partial dispatched with zero workers"
    );

    bus.publish_event(Event {
        event_type: wire::TYPE_ANNOUNCE_WORKER.to_string(),
        id: "phantom-worker".to_string(),
        source: Role::Worker.to_string(),
        data: Bytes::from_static(wire::ANNOUNCE_JOIN),
    })
    .await
    .unwrap();

    let dispatched = tokio::time::timeout(Duration::from_secs(2), spy.recv())
        .await
        .expect("census change never woke the dispatch loop")
        .unwrap();
    assert_eq!(dispatched.action.id, "tidle");

    run.shutdown.cancel();
    let (outcome, _) = run.handle.await.unwrap();
    assert_eq!(outcome, Outcome::FailedFast);
}

/// Unknown computation and rejected arguments terminate before any dispatch.
#[tokio::test]
async fn invalid_requests_are_rejected() {
    let bus = LocalBus::new();
    let registry = Arc::new(Registry::with_builtins());

    let (outcome, output) = run_coordinator(&registry, &bus, "nope", &[]).await;
    assert_eq!(outcome, Outcome::InvalidRequest);
    assert!(output.contains("nope is not defined"), "{output}");

    let (outcome, output) = run_coordinator(&registry, &bus, "fac", &["many", "args"]).await;
    assert_eq!(outcome, Outcome::InvalidRequest);
    assert!(output.contains("Invalid input arguments"), "{output}");
}

/// Cancellation from the termination signal fails the request fast.
#[tokio::test]
async fn cancellation_fails_fast() {
    let bus = LocalBus::new();
    let gate = Arc::new(tokio::sync::Notify::new());
    let mut registry = Registry::new();
    {
        let gate = gate.clone();
        registry.register(move || Box::new(Trickle::new("thold", gate.clone())));
    }
    let registry = Arc::new(registry);

    let run = spawn_coordinator(&registry, &bus, "thold", &[]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    run.shutdown.cancel();

    let (outcome, output) = run.handle.await.unwrap();
    assert_eq!(outcome, Outcome::FailedFast);
    assert!(
        output.contains("Computation thold[] failed"),
        "unexpected output:\n{output}"
    );
    let _ = gate; // never opened; the loop must not depend on it
}
