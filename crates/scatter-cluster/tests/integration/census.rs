//! Dynamic census: joins and leaves observed by every coordinator.

use std::sync::Arc;
use std::time::Duration;

use scatter_cluster::Outcome;
use scatter_compute::Registry;
use scatter_core::{LocalBus, Substrate};

use crate::*;

const CENSUS_WAIT: Duration = Duration::from_secs(5);

/// Two coordinators and three workers converge on the same census; a clean
/// worker leave is observed by both coordinators.
#[tokio::test]
async fn coordinators_agree_on_the_fleet() {
    let bus = LocalBus::new();
    let gate_a = Arc::new(tokio::sync::Notify::new());
    let gate_b = Arc::new(tokio::sync::Notify::new());
    let mut registry = Registry::new();
    {
        let gate = gate_a.clone();
        registry.register(move || Box::new(Trickle::new("thold-a", gate.clone())));
    }
    {
        let gate = gate_b.clone();
        registry.register(move || Box::new(Trickle::new("thold-b", gate.clone())));
    }
    let registry = Arc::new(registry);

    // Observe A's join announcement; it is published only once A's own
    // subscriptions are receiving, so everything announced afterwards is
    // visible to A.
    let mut announce_spy = bus
        .subscribe_action(scatter_core::SubscriptionFilter::of(
            scatter_core::wire::TYPE_ANNOUNCE_COORDINATOR,
        ))
        .await
        .unwrap();
    let a = spawn_coordinator(&registry, &bus, "thold-a", &[]);
    let joined = tokio::time::timeout(CENSUS_WAIT, announce_spy.recv())
        .await
        .expect("coordinator A never announced")
        .unwrap();
    assert_eq!(
        joined.action.params.as_ref(),
        scatter_core::wire::ANNOUNCE_JOIN
    );
    assert_eq!(a.tracker.count(), (1, 0), "A must preregister itself");

    let mut workers = start_workers(3, &registry, &bus).await;
    assert!(
        wait_until(CENSUS_WAIT, || a.tracker.count() == (1, 3)).await,
        "coordinator A missed worker joins: {:?}",
        a.tracker.count()
    );

    let b = spawn_coordinator(&registry, &bus, "thold-b", &[]);
    assert!(
        wait_until(CENSUS_WAIT, || {
            a.tracker.count() == (2, 3) && b.tracker.count() == (2, 3)
        })
        .await,
        "census did not converge: A {:?}, B {:?}",
        a.tracker.count(),
        b.tracker.count()
    );

    // Workers track coordinators that announced after they joined, B here;
    // A's join predates the workers and is only known to repliers.
    assert!(
        wait_until(CENSUS_WAIT, || workers[0].tracker.count().0 == 1).await,
        "worker missed coordinator join: {:?}",
        workers[0].tracker.count()
    );

    // One worker leaves cleanly; both coordinators observe the BYE.
    let leaving = workers.remove(0);
    leaving.shutdown.cancel();
    leaving.done.await.unwrap();
    assert!(
        wait_until(CENSUS_WAIT, || {
            a.tracker.count() == (2, 2) && b.tracker.count() == (2, 2)
        })
        .await,
        "worker leave unobserved: A {:?}, B {:?}",
        a.tracker.count(),
        b.tracker.count()
    );

    gate_a.notify_one();
    gate_b.notify_one();
    let (outcome_a, _) = a.handle.await.unwrap();
    let (outcome_b, _) = b.handle.await.unwrap();
    assert_eq!(outcome_a, Outcome::Finalized);
    assert_eq!(outcome_b, Outcome::Finalized);

    for worker in workers {
        worker.shutdown.cancel();
        worker.done.await.unwrap();
    }
}

/// A coordinator's own id stays in its census exactly once, whatever echoes
/// its announcement produces.
#[tokio::test]
async fn self_announcement_echo_is_ignored() {
    let bus = LocalBus::new();
    let gate = Arc::new(tokio::sync::Notify::new());
    let mut registry = Registry::new();
    {
        let gate = gate.clone();
        registry.register(move || Box::new(Trickle::new("thold", gate.clone())));
    }
    let registry = Arc::new(registry);

    let run = spawn_coordinator(&registry, &bus, "thold", &[]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // The bus delivered the coordinator's own join back to it; had it
    // replied to itself, collecting the reply would still only re-join the
    // same id. Either way the census must hold exactly one coordinator.
    assert_eq!(run.tracker.count().0, 1);

    // End-of-input is only observed while dispatch is possible, so give the
    // census a worker before opening the gate.
    let worker = start_workers(1, &registry, &bus).await.remove(0);
    assert!(
        wait_until(CENSUS_WAIT, || run.tracker.count().1 == 1).await,
        "worker join unobserved"
    );

    gate.notify_one();
    let (outcome, _) = run.handle.await.unwrap();
    assert_eq!(outcome, Outcome::Finalized);

    worker.shutdown.cancel();
    worker.done.await.unwrap();
}
