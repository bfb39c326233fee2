//! Name → computation lookup shared by coordinators and workers.

use std::collections::BTreeMap;

use crate::computation::Computation;
use crate::{fac, wf};

type Constructor = Box<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

/// Registry of available computations.
///
/// `create` hands out a fresh instance per use: coordinators hold one per
/// request (it accumulates state), workers one per partial (partial computes
/// are stateless).
#[derive(Default)]
pub struct Registry {
    computations: BTreeMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all predefined computations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(|| Box::new(fac::Factorial::new()));
        registry.register(|| Box::new(wf::WordFrequency::new()));
        registry
    }

    /// Register a computation by its constructor. The name is taken from a
    /// probe instance; re-registering a name replaces the previous entry.
    pub fn register<F>(&mut self, make: F)
    where
        F: Fn() -> Box<dyn Computation> + Send + Sync + 'static,
    {
        let name = make().name().to_string();
        self.computations.insert(name, Box::new(make));
    }

    /// Create an instance of the named computation, if registered.
    pub fn create(&self, name: &str) -> Option<Box<dyn Computation>> {
        self.computations.get(name).map(|make| make())
    }

    /// Description of the named computation, if registered.
    pub fn description(&self, name: &str) -> Option<&'static str> {
        self.create(name).map(|computation| computation.description())
    }

    /// All registered names, ascending.
    pub fn names(&self) -> Vec<&str> {
        self.computations.keys().map(String::as_str).collect()
    }
}
