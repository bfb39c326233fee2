//! scatter-compute — the Partition-Compute-Accumulate contract, the
//! computation registry, and the built-in demo computations.

pub mod computation;
pub mod fac;
pub mod registry;
pub mod wf;

pub use computation::{ArgumentError, BinaryData, Computation, ComputeRequest, OutputSink, SharedBuffer};
pub use registry::Registry;
