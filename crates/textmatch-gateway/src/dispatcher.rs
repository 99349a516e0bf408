use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use textmatch_types::events::GatewayEvent;

use crate::subscription::Subscription;

/// Per-topic channel capacity. A receiver that falls further behind than
/// this sees `Lagged` and must resynchronise.
const TOPIC_CAPACITY: usize = 256;

/// What a realtime subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Messages and read receipts of one conversation
    Conversation(String),
    /// Notification changes for one user
    User(String),
}

/// Routes realtime events to whoever currently listens on a topic.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// topic -> broadcast sender; created on first subscribe, dropped once idle
    topics: RwLock<HashMap<Topic, broadcast::Sender<GatewayEvent>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw receiver for a topic. Callers that need gap-free delivery handle
    /// `RecvError::Lagged` themselves.
    pub async fn subscribe(&self, topic: Topic) -> broadcast::Receiver<GatewayEvent> {
        if let Some(tx) = self.inner.topics.read().await.get(&topic) {
            return tx.subscribe();
        }

        let mut topics = self.inner.topics.write().await;
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Cancellable stream over a topic. Lagged events are skipped with a warning.
    pub async fn subscription(&self, topic: Topic) -> Subscription<GatewayEvent> {
        let rx = self.subscribe(topic.clone()).await;
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => return Some((event, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Subscriber on {:?} lagged by {} events", topic, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Subscription::new(stream.boxed())
    }

    /// Publishes to everyone listening on `topic`. Returns how many receivers got it.
    pub async fn publish(&self, topic: Topic, event: GatewayEvent) -> usize {
        let delivered = {
            let topics = self.inner.topics.read().await;
            match topics.get(&topic) {
                Some(tx) => tx.send(event).unwrap_or(0),
                None => 0,
            }
        };

        if delivered == 0 {
            self.prune(&topic).await;
        }
        delivered
    }

    /// Drops the topic's channel when nobody listens any more.
    async fn prune(&self, topic: &Topic) {
        let mut topics = self.inner.topics.write().await;
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
            debug!("Dropped idle topic {:?}", topic);
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.inner.topics.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event(conversation_id: &str) -> GatewayEvent {
        GatewayEvent::MessagesRead {
            conversation_id: conversation_id.into(),
            reader_id: "alice".into(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_the_topic() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe(Topic::Conversation("a".into())).await;
        let mut b = dispatcher.subscribe(Topic::Conversation("b".into())).await;

        assert_eq!(dispatcher.publish(Topic::Conversation("a".into()), read_event("a")).await, 1);

        let got = a.recv().await.unwrap();
        assert_eq!(got.conversation_id(), Some("a"));
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn idle_topics_are_pruned() {
        let dispatcher = Dispatcher::new();
        let rx = dispatcher.subscribe(Topic::User("alice".into())).await;
        assert_eq!(dispatcher.topic_count().await, 1);
        drop(rx);

        let delivered = dispatcher
            .publish(
                Topic::User("alice".into()),
                GatewayEvent::NotificationsChanged {
                    user_id: "alice".into(),
                    unread: 1,
                },
            )
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(dispatcher.topic_count().await, 0);
    }
}
