//! Realtime feeds of one WebSocket, built on the component streams.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::ready;
use futures_util::stream::select;
use tracing::error;

use textmatch_gateway::{Dispatcher, FeedSource, Subscription, Topic};
use textmatch_types::error::MarketError;
use textmatch_types::events::GatewayEvent;

use crate::messages::MessageChannel;
use crate::notifications::NotificationDispatcher;
use crate::session::Session;
use crate::state::AppState;

pub struct SessionFeeds {
    session: Session,
    dispatcher: Dispatcher,
    messages: MessageChannel,
    notifications: NotificationDispatcher,
}

impl SessionFeeds {
    pub fn new(state: &AppState, session: Session) -> Self {
        Self {
            session,
            dispatcher: state.dispatcher.clone(),
            messages: state.messages.clone(),
            notifications: state.notifications.clone(),
        }
    }
}

fn refusal(e: MarketError) -> String {
    match e {
        MarketError::NotFound { .. } => "conversation not found".to_string(),
        MarketError::Authorization(_) => "not a participant".to_string(),
        other => {
            error!("Conversation feed failed: {}", other);
            "internal error".to_string()
        }
    }
}

#[async_trait]
impl FeedSource for SessionFeeds {
    /// Messages in sequence order, backlog first, interleaved with read receipts.
    async fn conversation_feed(&self, conversation_id: &str) -> Result<Subscription<GatewayEvent>, String> {
        let mut messages = self
            .messages
            .subscribe(&self.session, conversation_id)
            .await
            .map_err(refusal)?;
        let created = async_stream::stream! {
            let mut prev_seq = 0;
            while let Some(message) = messages.next().await {
                let seq = message.seq;
                yield GatewayEvent::MessageCreate { message, prev_seq };
                prev_seq = seq;
            }
        };
        let receipts = self
            .dispatcher
            .subscription(Topic::Conversation(conversation_id.to_string()))
            .await
            .filter(|event| ready(matches!(event, GatewayEvent::MessagesRead { .. })));

        Ok(Subscription::new(select(created.boxed(), receipts.boxed()).boxed()))
    }

    async fn notification_feed(&self) -> Result<Subscription<GatewayEvent>, String> {
        let user_id = self.session.user_id.clone();
        let snapshots = self.notifications.subscribe(&self.session).await;
        let changes = snapshots.map(move |list| GatewayEvent::NotificationsChanged {
            user_id: user_id.clone(),
            unread: list.iter().filter(|n| !n.is_read).count() as i64,
        });
        Ok(Subscription::new(changes.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notifications::NotificationDraft;
    use crate::testing::TestApp;

    async fn next_event(sub: &mut Subscription<GatewayEvent>) -> GatewayEvent {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn conversation_feed_replays_then_follows() {
        let app = TestApp::new();
        let (seller, buyer, _listing, conv) = app.conversation().await;
        let first = app.state.messages.send(&buyer, &conv, "hello").await.unwrap();

        let feeds = SessionFeeds::new(&app.state, seller.clone());
        let mut sub = feeds.conversation_feed(&conv).await.unwrap();
        match next_event(&mut sub).await {
            GatewayEvent::MessageCreate { message, prev_seq } => {
                assert_eq!(message.text, "hello");
                assert_eq!(prev_seq, 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        app.state.messages.send(&buyer, &conv, "again").await.unwrap();
        match next_event(&mut sub).await {
            GatewayEvent::MessageCreate { message, prev_seq } => {
                assert_eq!(message.text, "again");
                assert_eq!(prev_seq, first.seq);
            }
            other => panic!("unexpected {:?}", other),
        }

        app.state.messages.mark_read(&seller, &conv).await.unwrap();
        assert!(matches!(
            next_event(&mut sub).await,
            GatewayEvent::MessagesRead { reader_id, .. } if reader_id == seller.user_id
        ));

        sub.unsubscribe();
        app.state.messages.send(&buyer, &conv, "gone").await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn outsiders_are_refused() {
        let app = TestApp::new();
        let (_seller, _buyer, _listing, conv) = app.conversation().await;

        let feeds = SessionFeeds::new(&app.state, Session::user("outsider", "X"));
        let reason = feeds.conversation_feed(&conv).await.err().unwrap();
        assert_eq!(reason, "not a participant");
        let reason = feeds.conversation_feed("missing").await.err().unwrap();
        assert_eq!(reason, "conversation not found");
    }

    #[tokio::test]
    async fn notification_feed_reports_unread_counts() {
        let app = TestApp::new();
        let (seller, _buyer, listing, _conv) = app.conversation().await;

        let feeds = SessionFeeds::new(&app.state, seller.clone());
        let mut sub = feeds.notification_feed().await.unwrap();
        assert!(matches!(
            next_event(&mut sub).await,
            GatewayEvent::NotificationsChanged { unread: 0, .. }
        ));

        app.state
            .notifications
            .notify(NotificationDraft::payment_received(&seller.user_id, &listing.title, listing.id))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut sub).await,
            GatewayEvent::NotificationsChanged { unread: 1, ref user_id } if *user_id == seller.user_id
        ));
    }
}
