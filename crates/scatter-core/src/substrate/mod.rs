//! Uniform API over the pub/sub substrate.
//!
//! The [`Substrate`] trait is the only surface the coordinator and worker
//! components talk to. It hides whether the substrate is an in-process bus
//! ([`LocalBus`]) or a broker reached over the network ([`NatsSubstrate`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::wire::{Action, ActionResult, Event, SubscriptionFilter};

mod local;
mod nats;

pub use local::LocalBus;
pub use nats::NatsSubstrate;

/// Errors surfaced by substrate operations and result streams.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// The substrate is unreachable or the stream ended unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),
    /// The operation was canceled locally. Not worth logging.
    #[error("canceled")]
    Canceled,
    /// The stream deadline was reached before a result arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Callback bound to the correlation id of an inbound action. May be invoked
/// multiple times for multi-result actions.
pub type ResultCallback =
    Arc<dyn Fn(ActionResult) -> BoxFuture<'static, Result<(), SubstrateError>> + Send + Sync>;

/// An action delivered to a subscriber, with the correlated reply channel.
pub struct InboundAction {
    pub action: Action,
    callback: ResultCallback,
}

impl InboundAction {
    pub fn new(action: Action, callback: ResultCallback) -> Self {
        Self { action, callback }
    }

    /// Publish a result correlated to this action.
    pub async fn respond(&self, result: ActionResult) -> Result<(), SubstrateError> {
        (self.callback)(result).await
    }
}

/// Lazy sequence of correlated action results.
///
/// The stream is closed by end-of-stream, cancellation, or its deadline.
/// Dropping the stream cancels it, which also releases any substrate
/// resources (reply subscriptions) held on its behalf.
pub struct ResultStream {
    rx: mpsc::Receiver<ActionResult>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ResultStream {
    pub fn new(rx: mpsc::Receiver<ActionResult>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            deadline: None,
        }
    }

    /// Bound the stream: `recv` fails with [`SubstrateError::DeadlineExceeded`]
    /// once the given duration has elapsed.
    pub fn set_deadline(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Cancel the stream. Pending and future `recv` calls fail with
    /// [`SubstrateError::Canceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the next correlated result.
    pub async fn recv(&mut self) -> Result<ActionResult, SubstrateError> {
        let deadline = self.deadline;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SubstrateError::Canceled),
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => Err(SubstrateError::DeadlineExceeded),
            result = self.rx.recv() => {
                result.ok_or_else(|| SubstrateError::Transport("result stream closed".to_string()))
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Adapter over the pub/sub substrate.
///
/// Subscriptions are channels; dropping the receiver ends the subscription.
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Fire-and-forget event publication.
    async fn publish_event(&self, event: Event) -> Result<(), SubstrateError>;

    /// Publish an action and return the stream of correlated results.
    async fn publish_action(&self, action: Action) -> Result<ResultStream, SubstrateError>;

    /// Subscribe to events matching the filter.
    async fn subscribe_event(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<Event>, SubstrateError>;

    /// Subscribe to actions matching the filter. A filter with a `share`
    /// group joins exclusive round-robin dispatch: each matching action is
    /// delivered to exactly one subscriber in the group.
    async fn subscribe_action(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<InboundAction>, SubstrateError>;
}
