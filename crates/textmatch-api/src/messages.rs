use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use textmatch_db::models::{MessageRow, NewMessage};
use textmatch_db::{Database, now};
use textmatch_gateway::{Dispatcher, Subscription, Topic};
use textmatch_types::api::{CountResponse, SendMessageRequest};
use textmatch_types::error::MarketError;
use textmatch_types::events::GatewayEvent;
use textmatch_types::models::{Message, SYSTEM_SENDER};

use crate::conversations::load_conversation;
use crate::error::ApiResult;
use crate::notifications::{MessageSent, NotificationDispatcher};
use crate::session::Session;
use crate::state::{AppState, blocking};

const MAX_MESSAGE_CHARS: usize = 2000;
const CATCH_UP_ATTEMPTS: u32 = 3;
const CATCH_UP_RETRY: Duration = Duration::from_millis(200);

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, MarketError> {
    rows.into_iter()
        .map(|r| r.into_message().map_err(MarketError::Store))
        .collect()
}

/// Append-only, ordered message log per conversation with a live feed.
#[derive(Clone)]
pub struct MessageChannel {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    notifications: NotificationDispatcher,
}

impl MessageChannel {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, notifications: NotificationDispatcher) -> Self {
        Self {
            db,
            dispatcher,
            notifications,
        }
    }

    /// Persists the message, then fires the side channels without awaiting them.
    pub async fn send(&self, session: &Session, conversation_id: &str, text: &str) -> Result<Message, MarketError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MarketError::validation("message text must not be empty"));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(MarketError::validation(format!(
                "message is longer than {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let conversation = load_conversation(&self.db, session, conversation_id).await?;
        let recipient_id = conversation
            .other_participant(&session.user_id)
            .map(str::to_string)
            .ok_or_else(|| MarketError::unauthorized("not a participant of this conversation"))?;

        let message = self
            .append(conversation_id, &session.user_id, text, false, Some(recipient_id.clone()))
            .await?;

        self.notifications.message_sent(MessageSent {
            conversation,
            sender_name: session.display_name.clone(),
            recipient_id,
            text: text.to_string(),
        });
        Ok(message)
    }

    /// Posts a marketplace message. It bumps no unread counter.
    pub async fn post_system(&self, conversation_id: &str, text: &str) -> Result<Message, MarketError> {
        self.append(conversation_id, SYSTEM_SENDER, text, true, None).await
    }

    async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
        is_system: bool,
        recipient_id: Option<String>,
    ) -> Result<Message, MarketError> {
        let new = NewMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            is_system,
            created_at: now(),
        };
        let (message, prev_seq) = blocking(&self.db, move |db| {
            let (seq, prev_seq) = db.insert_message(&new, recipient_id.as_deref())?;
            let message = MessageRow {
                seq,
                id: new.id,
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                text: new.text,
                is_read: false,
                is_system: new.is_system,
                created_at: new.created_at,
            }
            .into_message()?;
            Ok((message, prev_seq))
        })
        .await?;

        self.dispatcher
            .publish(
                Topic::Conversation(conversation_id.to_string()),
                GatewayEvent::MessageCreate {
                    message: message.clone(),
                    prev_seq,
                },
            )
            .await;
        Ok(message)
    }

    /// One page ending before sequence `before` (newest page when `None`), ascending.
    pub async fn history(
        &self,
        session: &Session,
        conversation_id: &str,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<Message>, MarketError> {
        load_conversation(&self.db, session, conversation_id).await?;
        let cid = conversation_id.to_string();
        let limit = limit.clamp(1, 200);
        let rows = blocking(&self.db, move |db| db.message_page(&cid, limit, before)).await?;
        into_messages(rows)
    }

    /// Marks the other side's messages read and clears the caller's counter.
    pub async fn mark_read(&self, session: &Session, conversation_id: &str) -> Result<usize, MarketError> {
        load_conversation(&self.db, session, conversation_id).await?;
        let (cid, reader) = (conversation_id.to_string(), session.user_id.clone());
        let flipped = blocking(&self.db, move |db| db.mark_conversation_read(&cid, &reader)).await?;

        if flipped > 0 {
            self.dispatcher
                .publish(
                    Topic::Conversation(conversation_id.to_string()),
                    GatewayEvent::MessagesRead {
                        conversation_id: conversation_id.to_string(),
                        reader_id: session.user_id.clone(),
                    },
                )
                .await;
        }
        Ok(flipped)
    }

    /// Unread messages across every conversation of the user; a failing store reads as zero.
    pub async fn unread_total(&self, user_id: &str) -> i64 {
        let uid = user_id.to_string();
        blocking(&self.db, move |db| db.unread_total(&uid))
            .await
            .unwrap_or_else(|e| {
                warn!("Unread total for {} failed: {}", user_id, e);
                0
            })
    }

    /// Existing messages in order, then live ones, until unsubscribed.
    ///
    /// A live message whose predecessor was not delivered, or a receiver that
    /// lags behind the live feed, triggers a re-read from the store by
    /// sequence number, so nothing is skipped or repeated.
    pub async fn subscribe(&self, session: &Session, conversation_id: &str) -> Result<Subscription<Message>, MarketError> {
        load_conversation(&self.db, session, conversation_id).await?;

        // Listen first, then read the backlog: anything sent in between shows
        // up in both and is dropped by the sequence check.
        let mut rx = self
            .dispatcher
            .subscribe(Topic::Conversation(conversation_id.to_string()))
            .await;
        let db = self.db.clone();
        let cid = conversation_id.to_string();

        let stream = async_stream::stream! {
            let mut last_seq = 0i64;
            let mut catch_up = true;
            let mut failures = 0u32;
            // Live message that exposed a gap, held until the re-read succeeds.
            let mut held: Option<Message> = None;

            loop {
                if catch_up {
                    let (db, id) = (db.clone(), cid.clone());
                    match blocking(&db, move |db| db.messages_after(&id, last_seq)).await.and_then(into_messages) {
                        Ok(backlog) => {
                            for message in backlog {
                                last_seq = message.seq;
                                yield message;
                            }
                            held = None;
                            failures = 0;
                            catch_up = false;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!("Message catch-up for {} failed (attempt {}): {}", cid, failures, e);
                            if failures < CATCH_UP_ATTEMPTS {
                                tokio::time::sleep(CATCH_UP_RETRY).await;
                                continue;
                            }
                            if let Some(message) = held.take() {
                                if message.seq > last_seq {
                                    last_seq = message.seq;
                                    yield message;
                                }
                            }
                            failures = 0;
                            catch_up = false;
                        }
                    }
                }

                match rx.recv().await {
                    Ok(GatewayEvent::MessageCreate { message, prev_seq }) => {
                        if message.seq <= last_seq {
                            continue;
                        }
                        if prev_seq != last_seq {
                            held = Some(message);
                            catch_up = true;
                            continue;
                        }
                        last_seq = message.seq;
                        yield message;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Message feed for {} lagged by {}, resyncing", cid, n);
                        catch_up = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Subscription::new(stream.boxed()))
    }
}

// -- Handlers --

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: sequence number of the oldest message already shown.
    pub before: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state.messages.send(&session, &conversation_id, &req.text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .messages
        .history(&session, &conversation_id, query.limit, query.before)
        .await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let count = state.messages.mark_read(&session, &conversation_id).await?;
    Ok(Json(CountResponse { count: count as i64 }))
}

pub async fn unread_total(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> impl IntoResponse {
    Json(CountResponse {
        count: state.messages.unread_total(&session.user_id).await,
    })
}

#[cfg(test)]
mod tests {
    use textmatch_types::models::PushPlatform;

    use super::*;
    use crate::testing::{RecordingEmail, RecordingPush, TestApp};

    async fn next_within(sub: &mut Subscription<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn send_then_subscribe_ends_with_the_message() {
        let app = TestApp::new();
        let (_seller, buyer, _listing, conv) = app.conversation().await;

        app.state.messages.send(&buyer, &conv, "hello").await.unwrap();
        let mut sub = app.state.messages.subscribe(&buyer, &conv).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(first.sender_id, buyer.user_id);
    }

    #[tokio::test]
    async fn live_messages_follow_the_backlog_in_order() {
        let app = TestApp::new();
        let (seller, buyer, _listing, conv) = app.conversation().await;
        let channel = app.state.messages.clone();

        channel.send(&buyer, &conv, "one").await.unwrap();
        let mut sub = channel.subscribe(&seller, &conv).await.unwrap();
        assert_eq!(sub.next().await.unwrap().text, "one");

        channel.send(&seller, &conv, "two").await.unwrap();
        channel.send(&buyer, &conv, "three").await.unwrap();
        let texts = vec![sub.next().await.unwrap().text, sub.next().await.unwrap().text];
        assert_eq!(texts, ["two", "three"]);

        sub.unsubscribe();
        channel.send(&buyer, &conv, "four").await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn message_missing_from_the_live_feed_is_recovered() {
        let app = TestApp::new();
        let (seller, buyer, _listing, conv) = app.conversation().await;
        let channel = app.state.messages.clone();

        channel.send(&buyer, &conv, "one").await.unwrap();
        let mut sub = channel.subscribe(&seller, &conv).await.unwrap();
        assert_eq!(sub.next().await.unwrap().text, "one");

        // Written without a publish, as if the event had been dropped.
        let silent = NewMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conv.clone(),
            sender_id: buyer.user_id.clone(),
            text: "two".into(),
            is_system: false,
            created_at: now(),
        };
        app.state.db.insert_message(&silent, None).unwrap();
        channel.send(&buyer, &conv, "three").await.unwrap();

        assert_eq!(next_within(&mut sub).await.text, "two");
        assert_eq!(next_within(&mut sub).await.text, "three");
    }

    #[tokio::test]
    async fn other_conversations_do_not_disturb_the_feed() {
        let app = TestApp::new();
        let (seller, buyer, listing, conv) = app.conversation().await;
        let other_buyer = Session::user("buyer-2", "Jiro");
        let other = app
            .state
            .conversations
            .create_or_get(&other_buyer, &seller.user_id, listing.id)
            .await
            .unwrap();
        let channel = app.state.messages.clone();
        let mut sub = channel.subscribe(&seller, &conv).await.unwrap();

        channel.send(&buyer, &conv, "a").await.unwrap();
        channel.send(&other_buyer, &other, "elsewhere").await.unwrap();
        channel.send(&buyer, &conv, "b").await.unwrap();

        assert_eq!(next_within(&mut sub).await.text, "a");
        assert_eq!(next_within(&mut sub).await.text, "b");
    }

    #[tokio::test]
    async fn message_survives_push_failure() {
        let app = TestApp::with_gateways(RecordingPush::failing(), RecordingEmail::default());
        let (_seller, buyer, _listing, conv) = app.conversation().await;
        app.state
            .push_tokens
            .save("seller-1", "tok", true, PushPlatform::Web)
            .await
            .unwrap();

        app.state.messages.send(&buyer, &conv, "hi").await.unwrap();
        let push = app.push.clone();
        crate::testing::eventually(|| !push.sent().is_empty()).await;

        let mut sub = app.state.messages.subscribe(&buyer, &conv).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(got.text, "hi");
    }

    #[tokio::test]
    async fn sending_is_validated() {
        let app = TestApp::new();
        let (_seller, buyer, _listing, conv) = app.conversation().await;
        let channel = &app.state.messages;

        let err = channel.send(&buyer, &conv, "   ").await.unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));

        let outsider = Session::user("outsider", "X");
        let err = channel.send(&outsider, &conv, "hi").await.unwrap_err();
        assert!(matches!(err, MarketError::Authorization(_)));

        let err = channel.send(&buyer, "missing", "hi").await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unread_counter_tracks_send_and_read() {
        let app = TestApp::new();
        let (seller, buyer, _listing, conv) = app.conversation().await;
        let channel = &app.state.messages;

        channel.send(&buyer, &conv, "a").await.unwrap();
        channel.send(&buyer, &conv, "b").await.unwrap();
        assert_eq!(channel.unread_total(&seller.user_id).await, 2);
        assert_eq!(channel.unread_total(&buyer.user_id).await, 0);

        assert_eq!(channel.mark_read(&seller, &conv).await.unwrap(), 2);
        assert_eq!(channel.unread_total(&seller.user_id).await, 0);

        let convo = app.state.conversations.get(&seller, &conv).await.unwrap();
        assert_eq!(convo.last_message.as_deref(), Some("b"));
        assert_eq!(convo.unread_for(&seller.user_id), 0);
    }

    #[tokio::test]
    async fn history_pages_backwards() {
        let app = TestApp::new();
        let (_seller, buyer, _listing, conv) = app.conversation().await;
        for i in 0..5 {
            app.state.messages.send(&buyer, &conv, &format!("m{}", i)).await.unwrap();
        }

        let newest = app.state.messages.history(&buyer, &conv, 3, None).await.unwrap();
        assert_eq!(newest.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["m2", "m3", "m4"]);
        let older = app
            .state
            .messages
            .history(&buyer, &conv, 3, Some(newest[0].seq))
            .await
            .unwrap();
        assert_eq!(older.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["m0", "m1"]);
    }
}
