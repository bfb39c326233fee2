//! scatter-cluster — application components realizing the
//! Partition-Compute-Accumulate pattern over a pub/sub substrate: the
//! coordinator, the worker, and the lifecycle tracker they share.

mod action_log;
mod coordinator;
mod tracker;
mod worker;

pub use action_log::{ActionLog, ActionLogEntry, LoggedResult};
pub use coordinator::{Coordinator, Outcome};
pub use tracker::Tracker;
pub use worker::Worker;
