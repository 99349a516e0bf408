use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use textmatch_db::models::NotificationRow;
use textmatch_db::{Database, now};
use textmatch_gateway::{Dispatcher, EmailGateway, EmailMessage, PushGateway, PushMessage, Subscription, Topic};
use textmatch_types::api::{CountResponse, MarkNotificationsReadRequest};
use textmatch_types::error::MarketError;
use textmatch_types::events::GatewayEvent;
use textmatch_types::models::{Conversation, Notification, NotificationType};

use crate::error::ApiResult;
use crate::push_tokens::PushTokenRegistry;
use crate::session::Session;
use crate::state::{AppState, blocking};

const PUSH_PREVIEW_CHARS: usize = 30;
const EMAIL_PREVIEW_CHARS: usize = 50;
const FALLBACK_TITLE: &str = "教科書";

/// A notification about to be recorded for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub user_id: String,
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub related_id: Option<String>,
    pub action_url: Option<String>,
}

impl NotificationDraft {
    pub fn new_message(recipient_id: &str, sender_name: &str, listing_title: &str, conversation_id: &str) -> Self {
        Self {
            user_id: recipient_id.to_string(),
            kind: NotificationType::Message,
            title: format!("{}からメッセージ", sender_name),
            message: format!("「{}」について新しいメッセージが届きました", listing_title),
            related_id: Some(conversation_id.to_string()),
            action_url: Some(format!("/messages/{}", conversation_id)),
        }
    }

    pub fn trade_established(recipient_id: &str, listing_title: &str, for_buyer: bool, conversation_id: &str) -> Self {
        let (title, message) = if for_buyer {
            (
                "取引成立！".to_string(),
                format!(
                    "「{}」の取引が成立しました。商品を受け取ったら受取完了ボタンを押してください。",
                    listing_title
                ),
            )
        } else {
            (
                "商品が売れました！".to_string(),
                format!("「{}」が売れました。購入者と連絡を取り、商品をお渡しください。", listing_title),
            )
        };
        Self {
            user_id: recipient_id.to_string(),
            kind: NotificationType::Transaction,
            title,
            message,
            related_id: Some(conversation_id.to_string()),
            action_url: Some(format!("/messages/{}", conversation_id)),
        }
    }

    pub fn receipt_confirmed(seller_id: &str, listing_title: &str, buyer_name: &str, conversation_id: &str) -> Self {
        Self {
            user_id: seller_id.to_string(),
            kind: NotificationType::Transaction,
            title: "取引完了".to_string(),
            message: format!("{}さんが「{}」を受け取りました。取引完了です！", buyer_name, listing_title),
            related_id: Some(conversation_id.to_string()),
            action_url: Some(format!("/messages/{}", conversation_id)),
        }
    }

    pub fn relisted(recipient_id: &str, listing_title: &str, listing_id: Uuid) -> Self {
        Self {
            user_id: recipient_id.to_string(),
            kind: NotificationType::System,
            title: "教科書が再出品されました".to_string(),
            message: format!("「{}」が再び購入可能になりました。", listing_title),
            related_id: Some(listing_id.to_string()),
            action_url: Some(format!("/marketplace/{}", listing_id)),
        }
    }

    pub fn payment_received(seller_id: &str, listing_title: &str, listing_id: Uuid) -> Self {
        Self {
            user_id: seller_id.to_string(),
            kind: NotificationType::Transaction,
            title: "支払いが完了しました".to_string(),
            message: format!("「{}」の代金が支払われました。購入者に商品をお渡しください。", listing_title),
            related_id: Some(listing_id.to_string()),
            action_url: Some(format!("/marketplace/{}", listing_id)),
        }
    }
}

/// A message that was just persisted; drives the three side channels.
#[derive(Debug, Clone)]
pub struct MessageSent {
    pub conversation: Conversation,
    pub sender_name: String,
    pub recipient_id: String,
    pub text: String,
}

/// Cuts `text` to `max` characters, marking the cut with "...".
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let mut cut: String = text.chars().take(max).collect();
        cut.push_str("...");
        cut
    } else {
        text.to_string()
    }
}

/// Writes in-app records and fans out, best-effort, to push and email.
#[derive(Clone)]
pub struct NotificationDispatcher {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    push_tokens: PushTokenRegistry,
    push: Arc<dyn PushGateway>,
    email: Arc<dyn EmailGateway>,
    app_url: String,
}

impl NotificationDispatcher {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        push_tokens: PushTokenRegistry,
        push: Arc<dyn PushGateway>,
        email: Arc<dyn EmailGateway>,
        app_url: String,
    ) -> Self {
        Self {
            db,
            dispatcher,
            push_tokens,
            push,
            email,
            app_url,
        }
    }

    /// Records the notification. Independent of any delivery channel.
    pub async fn notify(&self, draft: NotificationDraft) -> Result<Notification, MarketError> {
        let row = NotificationRow {
            id: Uuid::new_v4().to_string(),
            user_id: draft.user_id.clone(),
            kind: draft.kind.as_str().to_string(),
            title: draft.title,
            message: draft.message,
            is_read: false,
            related_id: draft.related_id,
            action_url: draft.action_url,
            created_at: now(),
        };
        let notification = blocking(&self.db, move |db| {
            db.insert_notification(&row)?;
            row.into_notification()
        })
        .await?;

        self.publish_changed(&draft.user_id).await;
        Ok(notification)
    }

    /// Like [`notify`](Self::notify) but only logs a failure.
    pub async fn notify_best_effort(&self, draft: NotificationDraft) {
        let user_id = draft.user_id.clone();
        if let Err(e) = self.notify(draft).await {
            warn!("Failed to record notification for {}: {}", user_id, e);
        }
    }

    /// Push to the user's enabled device, if any. Never fails the caller.
    pub async fn deliver_push(&self, user_id: &str, title: &str, body: &str, data: HashMap<String, String>) {
        let token = match self.push_tokens.enabled_token(user_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No enabled push token for {}, skipping push", user_id);
                return;
            }
            Err(e) => {
                warn!("Push token lookup failed for {}: {}", user_id, e);
                return;
            }
        };

        let message = PushMessage {
            token,
            title: title.to_string(),
            body: body.to_string(),
            data,
        };
        if let Err(e) = self.push.send(&message).await {
            warn!("Push delivery to {} failed: {}", user_id, e);
        }
    }

    /// Never fails the caller.
    pub async fn deliver_email(&self, message: EmailMessage) {
        if let Err(e) = self.email.send(&message).await {
            warn!("Email delivery to {} failed: {}", message.to, e);
        }
    }

    /// Fans a sent message out to the in-app record, push and email. Each
    /// channel runs on its own task; none is awaited by the sender.
    pub fn message_sent(&self, event: MessageSent) {
        let this = self.clone();
        tokio::spawn(async move {
            let listing_id = event.conversation.listing_id.to_string();
            let listing_title = match blocking(&this.db, move |db| db.get_listing(&listing_id)).await {
                Ok(Some(row)) => row.title,
                Ok(None) => FALLBACK_TITLE.to_string(),
                Err(e) => {
                    warn!("Listing lookup for message notification failed: {}", e);
                    FALLBACK_TITLE.to_string()
                }
            };
            let event = Arc::new(event);
            let listing_title = Arc::new(listing_title);

            let (n, e, t) = (this.clone(), event.clone(), listing_title.clone());
            tokio::spawn(async move {
                n.notify_best_effort(NotificationDraft::new_message(
                    &e.recipient_id,
                    &e.sender_name,
                    &t,
                    &e.conversation.id,
                ))
                .await;
            });

            let (n, e) = (this.clone(), event.clone());
            tokio::spawn(async move {
                let action_url = format!("/messages/{}", e.conversation.id);
                let data = HashMap::from([
                    ("type".to_string(), "message".to_string()),
                    ("conversationId".to_string(), e.conversation.id.clone()),
                    ("actionUrl".to_string(), action_url),
                ]);
                n.deliver_push(
                    &e.recipient_id,
                    &format!("{}さんからメッセージ", e.sender_name),
                    &preview(&e.text, PUSH_PREVIEW_CHARS),
                    data,
                )
                .await;
            });

            tokio::spawn(async move {
                this.email_message_sent(&event, &listing_title).await;
            });
        });
    }

    async fn email_message_sent(&self, event: &MessageSent, listing_title: &str) {
        let uid = event.recipient_id.clone();
        let profile = match blocking(&self.db, move |db| db.get_profile(&uid)).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Profile lookup for {} failed: {}", event.recipient_id, e);
                return;
            }
        };
        let Some((name, email)) = profile.and_then(|p| p.email.map(|email| (p.display_name, email))) else {
            debug!("No email on file for {}, skipping email", event.recipient_id);
            return;
        };

        let message = message_email(
            &self.app_url,
            &email,
            &name,
            &event.sender_name,
            listing_title,
            &preview(&event.text, EMAIL_PREVIEW_CHARS),
        );
        self.deliver_email(message).await;
    }

    // -- Reads and recipient mutations --

    pub async fn list(&self, session: &Session) -> Result<Vec<Notification>, MarketError> {
        let uid = session.user_id.clone();
        let rows = blocking(&self.db, move |db| db.notifications_for_user(&uid)).await?;
        rows.into_iter()
            .map(|r| r.into_notification().map_err(MarketError::Store))
            .collect()
    }

    /// Badge count; a failing store reads as zero.
    pub async fn unread_count(&self, user_id: &str) -> i64 {
        let uid = user_id.to_string();
        blocking(&self.db, move |db| db.count_unread_notifications(&uid))
            .await
            .unwrap_or_else(|e| {
                warn!("Unread notification count for {} failed: {}", user_id, e);
                0
            })
    }

    /// Loads the notification and checks it belongs to the caller.
    async fn owned(&self, session: &Session, id: Uuid) -> Result<NotificationRow, MarketError> {
        let key = id.to_string();
        let row = blocking(&self.db, move |db| db.get_notification(&key))
            .await?
            .ok_or_else(|| MarketError::not_found("notification", id))?;
        if row.user_id != session.user_id {
            return Err(MarketError::unauthorized("notification belongs to another user"));
        }
        Ok(row)
    }

    pub async fn mark_read(&self, session: &Session, id: Uuid) -> Result<(), MarketError> {
        self.mark_many_read(session, &[id]).await.map(|_| ())
    }

    /// Every id is checked before any is written.
    pub async fn mark_many_read(&self, session: &Session, ids: &[Uuid]) -> Result<usize, MarketError> {
        for id in ids {
            self.owned(session, *id).await?;
        }
        let keys: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let touched = blocking(&self.db, move |db| db.mark_notifications_read(&keys)).await?;
        self.publish_changed(&session.user_id).await;
        Ok(touched)
    }

    pub async fn mark_all_read(&self, session: &Session) -> Result<usize, MarketError> {
        let uid = session.user_id.clone();
        let flipped = blocking(&self.db, move |db| db.mark_all_notifications_read(&uid)).await?;
        self.publish_changed(&session.user_id).await;
        Ok(flipped)
    }

    pub async fn delete(&self, session: &Session, id: Uuid) -> Result<(), MarketError> {
        self.owned(session, id).await?;
        let key = id.to_string();
        blocking(&self.db, move |db| db.delete_notification(&key)).await?;
        self.publish_changed(&session.user_id).await;
        Ok(())
    }

    async fn publish_changed(&self, user_id: &str) {
        let unread = self.unread_count(user_id).await;
        self.dispatcher
            .publish(
                Topic::User(user_id.to_string()),
                GatewayEvent::NotificationsChanged {
                    user_id: user_id.to_string(),
                    unread,
                },
            )
            .await;
    }

    /// The caller's notification list, re-sent whenever it changes.
    pub async fn subscribe(&self, session: &Session) -> Subscription<Vec<Notification>> {
        let mut rx = self.dispatcher.subscribe(Topic::User(session.user_id.clone())).await;
        let this = self.clone();
        let session = session.clone();

        let stream = async_stream::stream! {
            // Subscribed before the first snapshot, so no change slips between them.
            match this.list(&session).await {
                Ok(snapshot) => yield snapshot,
                Err(e) => warn!("Notification snapshot for {} failed: {}", session.user_id, e),
            }
            loop {
                match rx.recv().await {
                    Ok(GatewayEvent::NotificationsChanged { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        match this.list(&session).await {
                            Ok(snapshot) => yield snapshot,
                            Err(e) => warn!("Notification snapshot for {} failed: {}", session.user_id, e),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Subscription::new(stream.boxed())
    }
}

fn message_email(
    app_url: &str,
    to: &str,
    recipient_name: &str,
    sender_name: &str,
    listing_title: &str,
    message_preview: &str,
) -> EmailMessage {
    let link = format!("{}/messages", app_url);
    let text = format!(
        "{recipient}さん\n\n\
         教科書「{title}」について、{sender}さんから新しいメッセージが届きました。\n\n\
         メッセージの内容:\n\"{preview}\"\n\n\
         詳細を確認してやり取りを続けるには、以下のリンクからTextMatchにログインしてください。\n\
         {link}\n\n\
         このメールは自動送信されています。\n\n---\nTextMatch チーム",
        recipient = recipient_name,
        title = listing_title,
        sender = sender_name,
        preview = message_preview,
        link = link,
    );
    let html = format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h2 style="color: #2563eb;">新しいメッセージが届きました</h2>
  <p>こんにちは、{recipient}さん</p>
  <p>教科書「<strong>{title}</strong>」について、<strong>{sender}</strong>さんから新しいメッセージが届きました。</p>
  <div style="background-color: #f3f4f6; padding: 15px; border-left: 4px solid #2563eb; margin: 20px 0;">
    <p style="margin: 0; font-style: italic;">"{preview}"</p>
  </div>
  <div style="text-align: center; margin: 30px 0;">
    <a href="{link}" style="background-color: #2563eb; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; display: inline-block;">メッセージを確認する</a>
  </div>
  <p style="color: #6b7280; font-size: 14px;">このメールは自動送信されています。<br>TextMatch チーム</p>
</div>"#,
        recipient = recipient_name,
        title = listing_title,
        sender = sender_name,
        preview = message_preview,
        link = link,
    );

    EmailMessage {
        to: to.to_string(),
        subject: format!("[TextMatch] {}について新しいメッセージが届きました", listing_title),
        text,
        html: Some(html),
    }
}

// -- Handlers --

pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.notifications.list(&session).await?))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> impl IntoResponse {
    Json(CountResponse {
        count: state.notifications.unread_count(&session.user_id).await,
    })
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<MarkNotificationsReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let count = match req.ids {
        Some(ids) => state.notifications.mark_many_read(&session, &ids).await?,
        None => state.notifications.mark_all_read(&session).await?,
    };
    Ok(Json(CountResponse { count: count as i64 }))
}

pub async fn mark_one_read(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.notifications.mark_read(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.notifications.delete(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use textmatch_db::models::ProfileRow;
    use textmatch_types::models::PushPlatform;

    use super::*;
    use crate::testing::{RecordingEmail, RecordingPush, TestApp, buyer, eventually, seller};

    #[test]
    fn preview_counts_characters_not_bytes() {
        assert_eq!(preview("こんにちは", 30), "こんにちは");
        let long = "あ".repeat(31);
        assert_eq!(preview(&long, 30), format!("{}...", "あ".repeat(30)));
    }

    #[test]
    fn builders_link_to_their_cause() {
        let d = NotificationDraft::new_message("u", "Taro", "線形代数", "conv-1");
        assert_eq!(d.title, "Taroからメッセージ");
        assert_eq!(d.action_url.as_deref(), Some("/messages/conv-1"));
        assert_eq!(d.related_id.as_deref(), Some("conv-1"));

        let id = Uuid::new_v4();
        let d = NotificationDraft::relisted("u", "線形代数", id);
        assert_eq!(d.kind, NotificationType::System);
        assert_eq!(d.action_url, Some(format!("/marketplace/{}", id)));

        let buyer_side = NotificationDraft::trade_established("u", "t", true, "c");
        let seller_side = NotificationDraft::trade_established("u", "t", false, "c");
        assert_ne!(buyer_side.title, seller_side.title);
    }

    #[test]
    fn email_template_carries_subject_and_link() {
        let mail = message_email("https://textmatch.test", "a@x.jp", "Hanako", "Taro", "線形代数", "hello");
        assert_eq!(mail.subject, "[TextMatch] 線形代数について新しいメッセージが届きました");
        assert!(mail.text.contains("https://textmatch.test/messages"));
        assert!(mail.text.contains("\"hello\""));
        assert!(mail.html.unwrap().contains("Taro"));
    }

    #[tokio::test]
    async fn mark_all_read_leaves_nothing_unread() {
        let app = TestApp::new();
        let n = &app.state.notifications;
        for i in 0..3 {
            n.notify(NotificationDraft::relisted("buyer-1", &format!("t{}", i), Uuid::new_v4()))
                .await
                .unwrap();
        }
        assert_eq!(n.unread_count("buyer-1").await, 3);

        n.mark_all_read(&buyer()).await.unwrap();
        assert_eq!(n.unread_count("buyer-1").await, 0);
        assert!(n.list(&buyer()).await.unwrap().iter().all(|x| x.is_read));
    }

    #[tokio::test]
    async fn mutations_require_ownership() {
        let app = TestApp::new();
        let n = &app.state.notifications;
        let mine = n
            .notify(NotificationDraft::relisted("buyer-1", "t", Uuid::new_v4()))
            .await
            .unwrap();

        let err = n.mark_read(&seller(), mine.id).await.unwrap_err();
        assert!(matches!(err, MarketError::Authorization(_)));
        let err = n.delete(&seller(), mine.id).await.unwrap_err();
        assert!(matches!(err, MarketError::Authorization(_)));
        let err = n.mark_many_read(&seller(), &[mine.id]).await.unwrap_err();
        assert!(matches!(err, MarketError::Authorization(_)));
        assert_eq!(n.unread_count("buyer-1").await, 1);

        n.delete(&buyer(), mine.id).await.unwrap();
        let err = n.delete(&buyer(), mine.id).await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound { .. }));
    }

    #[tokio::test]
    async fn push_is_skipped_without_enabled_token() {
        let app = TestApp::new();
        let n = &app.state.notifications;
        n.deliver_push("buyer-1", "t", "b", HashMap::new()).await;
        assert!(app.push.sent().is_empty());

        app.state
            .push_tokens
            .save("buyer-1", "tok", false, PushPlatform::Web)
            .await
            .unwrap();
        n.deliver_push("buyer-1", "t", "b", HashMap::new()).await;
        assert!(app.push.sent().is_empty());

        app.state
            .push_tokens
            .save("buyer-1", "tok", true, PushPlatform::Web)
            .await
            .unwrap();
        n.deliver_push("buyer-1", "t", "b", HashMap::new()).await;
        assert_eq!(app.push.sent().len(), 1);
        assert_eq!(app.push.sent()[0].token, "tok");
    }

    #[tokio::test]
    async fn failing_gateways_are_absorbed() {
        let app = TestApp::with_gateways(RecordingPush::failing(), RecordingEmail::failing());
        let (_seller, buyer, _listing, conv) = app.conversation().await;
        app.state
            .push_tokens
            .save("seller-1", "tok", true, PushPlatform::Web)
            .await
            .unwrap();
        app.state
            .db
            .upsert_profile(&ProfileRow {
                user_id: "seller-1".into(),
                display_name: "Taro".into(),
                email: Some("taro@example.ac.jp".into()),
                updated_at: now(),
            })
            .unwrap();

        let msg = app.state.messages.send(&buyer, &conv, "hello").await.unwrap();
        assert_eq!(msg.text, "hello");

        let (push, email) = (app.push.clone(), app.email.clone());
        eventually(|| !push.sent().is_empty() && !email.sent().is_empty()).await;
        let db = app.state.db.clone();
        eventually(|| db.count_unread_notifications("seller-1").unwrap() == 1).await;

        assert_eq!(email.sent()[0].to, "taro@example.ac.jp");
        assert_eq!(push.sent()[0].title, "Hanakoさんからメッセージ");
        assert_eq!(app.state.messages.history(&buyer, &conv, 50, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscription_sends_snapshot_then_updates() {
        let app = TestApp::new();
        let n = app.state.notifications.clone();
        let mut sub = n.subscribe(&buyer()).await;

        assert!(sub.next().await.unwrap().is_empty());

        n.notify(NotificationDraft::relisted("buyer-1", "t", Uuid::new_v4()))
            .await
            .unwrap();
        let snapshot = sub.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        sub.unsubscribe();
        n.notify(NotificationDraft::relisted("buyer-1", "t2", Uuid::new_v4()))
            .await
            .unwrap();
        assert!(sub.next().await.is_none());
    }
}
