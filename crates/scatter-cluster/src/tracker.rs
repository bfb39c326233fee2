//! Tracks coordinator and worker instances currently alive in the system.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use scatter_core::Role;
use tokio::sync::watch;

#[derive(Default)]
struct RoleSets {
    coordinators: HashSet<String>,
    workers: HashSet<String>,
}

impl RoleSets {
    fn of(&mut self, role: Role) -> &mut HashSet<String> {
        match role {
            Role::Coordinator => &mut self.coordinators,
            Role::Worker => &mut self.workers,
        }
    }
}

/// Thread-safe census of alive coordinators and workers.
///
/// Entries are created on observed join announcements (or for self at
/// startup) and removed only on observed leaves; there is no timeout-based
/// eviction, so temporary isolation is tolerated.
pub struct Tracker {
    sets: RwLock<RoleSets>,
    epoch: watch::Sender<u64>,
}

impl Tracker {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            sets: RwLock::new(RoleSets::default()),
            epoch,
        }
    }

    /// Register an instance. Returns `true` iff it was not yet tracked.
    pub fn try_join(&self, role: Role, id: &str) -> bool {
        let inserted = self.write().of(role).insert(id.to_string());
        if inserted {
            self.epoch.send_modify(|epoch| *epoch += 1);
        }
        inserted
    }

    /// Deregister a leaving instance. No-op if absent.
    pub fn leave(&self, role: Role, id: &str) {
        let removed = self.write().of(role).remove(id);
        if removed {
            self.epoch.send_modify(|epoch| *epoch += 1);
        }
    }

    /// Consistent snapshot of `(coordinators, workers)` counts.
    pub fn count(&self) -> (usize, usize) {
        let sets = self.read();
        (sets.coordinators.len(), sets.workers.len())
    }

    /// Receiver ticked whenever the census effectively changes, so loops
    /// keyed on fleet size can re-evaluate without polling.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, RoleSets> {
        match self.sets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, RoleSets> {
        match self.sets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
