//! NATS-backed substrate.
//!
//! Type names map to subjects, share groups to queue groups, and correlated
//! action results to per-action reply inboxes. Envelopes travel as JSON.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{InboundAction, ResultCallback, ResultStream, Substrate, SubstrateError};
use crate::wire::{Action, Event, SubscriptionFilter};

const SUBSCRIPTION_BUFFER: usize = 64;
const RESULT_BUFFER: usize = 16;

fn transport(err: impl std::fmt::Display) -> SubstrateError {
    SubstrateError::Transport(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, SubstrateError> {
    let raw = serde_json::to_vec(value).map_err(transport)?;
    Ok(Bytes::from(raw))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, SubstrateError> {
    serde_json::from_slice(payload).map_err(transport)
}

/// Substrate adapter speaking to a NATS broker.
pub struct NatsSubstrate {
    client: async_nats::Client,
}

impl NatsSubstrate {
    /// Connect to the broker at the given URL (e.g. `nats://127.0.0.1:4222`).
    pub async fn connect(url: &str) -> Result<Self, SubstrateError> {
        let client = async_nats::connect(url).await.map_err(transport)?;
        tracing::debug!(url, "connected to substrate broker");
        Ok(Self { client })
    }
}

#[async_trait]
impl Substrate for NatsSubstrate {
    async fn publish_event(&self, event: Event) -> Result<(), SubstrateError> {
        let payload = encode(&event)?;
        self.client
            .publish(event.event_type.clone(), payload)
            .await
            .map_err(transport)?;
        // Announcements are fire-and-forget; flush so a leave published right
        // before teardown actually reaches the broker.
        self.client.flush().await.map_err(transport)
    }

    async fn publish_action(&self, action: Action) -> Result<ResultStream, SubstrateError> {
        let inbox = self.client.new_inbox();
        let replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(transport)?;
        let payload = encode(&action)?;
        self.client
            .publish_with_reply(action.action_type.clone(), inbox, payload)
            .await
            .map_err(transport)?;

        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(forward_results(replies, tx, cancel.clone()));
        Ok(ResultStream::new(rx, cancel))
    }

    async fn subscribe_event(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<Event>, SubstrateError> {
        let subscriber = self
            .client
            .subscribe(filter.filter_type.clone())
            .await
            .map_err(transport)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(forward_events(subscriber, tx));
        Ok(rx)
    }

    async fn subscribe_action(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<InboundAction>, SubstrateError> {
        let subject = filter.filter_type.clone();
        let subscriber = match filter.share {
            Some(group) => self
                .client
                .queue_subscribe(subject, group)
                .await
                .map_err(transport)?,
            None => self.client.subscribe(subject).await.map_err(transport)?,
        };
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(forward_actions(subscriber, tx, self.client.clone()));
        Ok(rx)
    }
}

/// Drain reply-inbox messages into the publisher's result stream. Exits and
/// unsubscribes when the stream is dropped or canceled.
async fn forward_results(
    mut replies: async_nats::Subscriber,
    tx: mpsc::Sender<crate::wire::ActionResult>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            message = replies.next() => {
                let Some(message) = message else { break };
                match decode(&message.payload) {
                    Ok(result) => {
                        if tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "undecodable action result, dropping"),
                }
            }
        }
    }
    if let Err(e) = replies.unsubscribe().await {
        tracing::debug!(error = %e, "reply unsubscribe failed");
    }
}

async fn forward_events(mut subscriber: async_nats::Subscriber, tx: mpsc::Sender<Event>) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                match decode(&message.payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "undecodable event, dropping"),
                }
            }
        }
    }
    if let Err(e) = subscriber.unsubscribe().await {
        tracing::debug!(error = %e, "event unsubscribe failed");
    }
}

async fn forward_actions(
    mut subscriber: async_nats::Subscriber,
    tx: mpsc::Sender<InboundAction>,
    client: async_nats::Client,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let action: Action = match decode(&message.payload) {
                    Ok(action) => action,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable action, dropping");
                        continue;
                    }
                };
                let Some(reply) = message.reply else {
                    tracing::warn!(action_type = %action.action_type, "action without reply subject, dropping");
                    continue;
                };
                let callback = reply_callback(client.clone(), reply);
                if tx.send(InboundAction::new(action, callback)).await.is_err() {
                    break;
                }
            }
        }
    }
    if let Err(e) = subscriber.unsubscribe().await {
        tracing::debug!(error = %e, "action unsubscribe failed");
    }
}

/// Callback publishing correlated results to the action's reply subject.
fn reply_callback(client: async_nats::Client, reply: async_nats::Subject) -> ResultCallback {
    Arc::new(move |result| {
        let client = client.clone();
        let reply = reply.clone();
        async move {
            let payload = encode(&result)?;
            client.publish(reply, payload).await.map_err(transport)
        }
        .boxed()
    })
}
