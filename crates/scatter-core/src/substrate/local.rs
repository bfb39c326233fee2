//! In-process substrate.
//!
//! Routes envelopes between components sharing one `LocalBus`. Share groups
//! rotate a cursor over their live members so dispatch is round-robin, which
//! is what the coordinator's rate-limit heuristic assumes of the substrate.
//!
//! A published action whose callback ends up unreferenced (no subscriber, or
//! all handlers already done) closes its result stream; publishers observe
//! that as a transport-level stream end, the same way a lost message on a
//! real broker surfaces as silence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{InboundAction, ResultCallback, ResultStream, Substrate, SubstrateError};
use crate::wire::{Action, ActionResult, Event, SubscriptionFilter};

const SUBSCRIPTION_BUFFER: usize = 64;
const RESULT_BUFFER: usize = 16;

/// In-process pub/sub substrate. Cheap to clone handles via `Arc`.
#[derive(Default)]
pub struct LocalBus {
    events: DashMap<String, Vec<mpsc::Sender<Event>>>,
    actions: DashMap<String, ActionRoutes>,
}

#[derive(Default)]
struct ActionRoutes {
    /// Subscribers receiving every matching action.
    direct: Vec<mpsc::Sender<InboundAction>>,
    /// Share groups receiving each matching action exactly once.
    groups: HashMap<String, ShareGroup>,
}

#[derive(Default)]
struct ShareGroup {
    members: Vec<mpsc::Sender<InboundAction>>,
    cursor: usize,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn action_recipients(&self, action_type: &str) -> Vec<mpsc::Sender<InboundAction>> {
        let Some(mut routes) = self.actions.get_mut(action_type) else {
            return Vec::new();
        };
        routes.direct.retain(|tx| !tx.is_closed());
        let mut recipients = routes.direct.clone();
        for group in routes.groups.values_mut() {
            group.members.retain(|tx| !tx.is_closed());
            if group.members.is_empty() {
                continue;
            }
            let pick = group.cursor % group.members.len();
            group.cursor = group.cursor.wrapping_add(1);
            recipients.push(group.members[pick].clone());
        }
        recipients
    }
}

/// Callback feeding results back over the publisher's stream channel.
fn channel_callback(tx: mpsc::Sender<ActionResult>) -> ResultCallback {
    Arc::new(move |result| {
        let tx = tx.clone();
        async move {
            tx.send(result)
                .await
                .map_err(|_| SubstrateError::Transport("result stream closed".to_string()))
        }
        .boxed()
    })
}

#[async_trait]
impl Substrate for LocalBus {
    async fn publish_event(&self, event: Event) -> Result<(), SubstrateError> {
        let subscribers = match self.events.get_mut(&event.event_type) {
            Some(mut entry) => {
                entry.retain(|tx| !tx.is_closed());
                entry.clone()
            }
            None => return Ok(()),
        };
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }

    async fn publish_action(&self, action: Action) -> Result<ResultStream, SubstrateError> {
        let (result_tx, result_rx) = mpsc::channel(RESULT_BUFFER);
        let callback = channel_callback(result_tx);
        let recipients = self.action_recipients(&action.action_type);
        for tx in recipients {
            let _ = tx
                .send(InboundAction::new(action.clone(), callback.clone()))
                .await;
        }
        Ok(ResultStream::new(result_rx, CancellationToken::new()))
    }

    async fn subscribe_event(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<Event>, SubstrateError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.events.entry(filter.filter_type).or_default().push(tx);
        Ok(rx)
    }

    async fn subscribe_action(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<InboundAction>, SubstrateError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut routes = self.actions.entry(filter.filter_type).or_default();
        match filter.share {
            Some(group) => routes.groups.entry(group).or_default().members.push(tx),
            None => routes.direct.push(tx),
        }
        Ok(rx)
    }
}
