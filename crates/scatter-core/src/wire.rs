//! Wire-level message envelopes and protocol constants.
//!
//! The envelopes mirror what the pub/sub substrate carries; payload bytes are
//! uninterpreted here. Encoding of `data`/`params` is owned by whatever
//! publishes them.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Action type of partial computations.
pub const TYPE_PARTIAL_COMPUTE: &str = "ddaexmpls.compute.pcomp";
/// Shared subscription group for partial computations. The substrate delivers
/// each matching action to exactly one member of the group.
pub const SHARE_PARTIAL_COMPUTE: &str = "pcompute";
/// Action type of coordinator announcements (responders reply via result).
pub const TYPE_ANNOUNCE_COORDINATOR: &str = "ddaexmpls.compute.announceCoordinator";
/// Event type of worker announcements (no reply).
pub const TYPE_ANNOUNCE_WORKER: &str = "ddaexmpls.compute.announceWorker";

/// Announcement payload on joining or being alive.
pub const ANNOUNCE_JOIN: &[u8] = b"HELLO";
/// Announcement payload on leaving.
pub const ANNOUNCE_LEAVE: &[u8] = b"BYE";

/// How long a joining coordinator collects census replies.
pub const ANNOUNCE_DEADLINE: Duration = Duration::from_secs(2);
/// Delay between publishing a leave announcement and closing the transport,
/// so the substrate has time to forward the leave.
pub const LEAVE_GRACE: Duration = Duration::from_millis(500);

/// One-shot pub/sub notification. No reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    pub source: String,
    pub data: Bytes,
}

/// Request expecting zero or more correlated results.
///
/// For partial computations the `id` field carries the computation name, not
/// a unique request id, so workers can look the computation up without
/// decoding `params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    pub id: String,
    pub source: String,
    pub params: Bytes,
}

/// Correlated reply to an [`Action`]. `context` conveys the role or the
/// emitting instance id, depending on the action type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub context: String,
    pub sequence_number: i32,
    pub data: Bytes,
}

/// Subscription selector. A filter with a `share` group joins exclusive
/// round-robin dispatch among all subscribers naming the same group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,
}

impl SubscriptionFilter {
    pub fn of(filter_type: &str) -> Self {
        Self {
            filter_type: filter_type.to_string(),
            share: None,
        }
    }

    pub fn shared(filter_type: &str, group: &str) -> Self {
        Self {
            filter_type: filter_type.to_string(),
            share: Some(group.to_string()),
        }
    }
}

/// Role of an application component. Carried on the wire as a plain string
/// separate from the instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Worker => "worker",
        }
    }

    /// Parse a wire role label. Unknown labels yield `None` and are skipped
    /// by lifecycle tracking.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "coordinator" => Some(Role::Coordinator),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a globally unique instance id (128-bit random, textual).
pub fn instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// First segment of a UUID-shaped id, for log output. Ids without a `-` are
/// returned whole.
pub fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}
