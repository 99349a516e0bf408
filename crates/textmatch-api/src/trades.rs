//! The trade flow driven from inside a conversation.
//!
//! Each step writes the listing first and then posts a system message and a
//! notification. A failure in the later writes is logged and leaves the
//! listing change in place.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::{info, warn};
use uuid::Uuid;

use textmatch_db::Database;
use textmatch_types::error::MarketError;
use textmatch_types::models::{Listing, ListingStatus, TransactionStatus};

use crate::conversations::{load_conversation, load_listing};
use crate::error::ApiResult;
use crate::listings::ListingStore;
use crate::messages::MessageChannel;
use crate::notifications::{NotificationDispatcher, NotificationDraft};
use crate::profiles;
use crate::session::Session;
use crate::state::AppState;

const FALLBACK_BUYER_NAME: &str = "購入者";

/// A trade left over from before a reopen: finished, or with someone else.
fn belongs_to_earlier_sale(listing: &Listing, buyer_id: &str) -> bool {
    listing.transaction_status == Some(TransactionStatus::Completed)
        || listing.buyer_id.as_deref() != Some(buyer_id)
}

#[derive(Clone)]
pub struct TradeDesk {
    db: Arc<Database>,
    listings: ListingStore,
    messages: MessageChannel,
    notifications: NotificationDispatcher,
}

impl TradeDesk {
    pub fn new(
        db: Arc<Database>,
        listings: ListingStore,
        messages: MessageChannel,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            db,
            listings,
            messages,
            notifications,
        }
    }

    /// The seller closes the deal with the buyer of this conversation.
    pub async fn sell_to(&self, session: &Session, conversation_id: &str) -> Result<Listing, MarketError> {
        let conversation = load_conversation(&self.db, session, conversation_id).await?;
        if conversation.seller_id != session.user_id {
            return Err(MarketError::unauthorized("only the seller can close the deal"));
        }

        let previous = load_listing(&self.db, conversation.listing_id).await?;
        let mut listing = self
            .listings
            .update_status(
                session,
                conversation.listing_id,
                ListingStatus::Sold,
                Some(conversation.buyer_id.clone()),
            )
            .await?;
        if listing.transaction_status.is_none() {
            listing = self
                .listings
                .advance_unchecked(listing, TransactionStatus::Pending)
                .await?;
        } else if belongs_to_earlier_sale(&previous, &conversation.buyer_id) {
            listing = self.listings.restart_trade(&previous).await?;
        }
        info!(
            "Listing {} sold to {} in conversation {}",
            listing.id, conversation.buyer_id, conversation.id
        );

        let buyer_name = profiles::display_name(&self.db, &conversation.buyer_id)
            .await
            .unwrap_or_else(|| FALLBACK_BUYER_NAME.to_string());
        self.post_notice(
            &conversation.id,
            &format!(
                "🎉 成約完了！{}さんとの取引が成立しました。引き続きメッセージで詳細をやり取りしてください。",
                buyer_name
            ),
        )
        .await;
        self.notifications
            .notify_best_effort(NotificationDraft::trade_established(
                &conversation.buyer_id,
                &listing.title,
                true,
                &conversation.id,
            ))
            .await;
        Ok(listing)
    }

    /// Payment confirmation; only an administrator records it.
    pub async fn mark_paid(&self, session: &Session, listing_id: Uuid) -> Result<Listing, MarketError> {
        session.require_admin()?;
        let listing = load_listing(&self.db, listing_id).await?;
        let listing = self.listings.advance_unchecked(listing, TransactionStatus::Paid).await?;

        self.notifications
            .notify_best_effort(NotificationDraft::payment_received(
                &listing.seller_id,
                &listing.title,
                listing.id,
            ))
            .await;
        Ok(listing)
    }

    /// The buyer confirms the book arrived; completes the trade.
    ///
    /// An unpaid trade steps through `paid` on the way, since the hand-over
    /// itself settles it.
    pub async fn confirm_receipt(&self, session: &Session, conversation_id: &str) -> Result<Listing, MarketError> {
        let conversation = load_conversation(&self.db, session, conversation_id).await?;
        if conversation.buyer_id != session.user_id {
            return Err(MarketError::unauthorized("only the buyer can confirm receipt"));
        }

        let mut listing = load_listing(&self.db, conversation.listing_id).await?;
        if listing.buyer_id.as_deref() != Some(session.user_id.as_str()) {
            return Err(MarketError::validation("this listing was not sold to you"));
        }
        match listing.transaction_status {
            None => return Err(MarketError::validation("the trade has not started")),
            Some(TransactionStatus::Completed) => {
                return Err(MarketError::validation("the trade is already completed"));
            }
            Some(TransactionStatus::Pending) => {
                listing = self.listings.advance_unchecked(listing, TransactionStatus::Paid).await?;
            }
            Some(TransactionStatus::Paid) => {}
        }
        let listing = self
            .listings
            .advance_unchecked(listing, TransactionStatus::Completed)
            .await?;
        info!("Trade for listing {} completed by {}", listing.id, session.user_id);

        let buyer_name = if session.display_name.trim().is_empty() {
            FALLBACK_BUYER_NAME
        } else {
            session.display_name.as_str()
        };
        self.post_notice(
            &conversation.id,
            &format!(
                "✅ {}さんが商品を受け取りました。取引完了です！お疲れ様でした。",
                buyer_name
            ),
        )
        .await;
        self.notifications
            .notify_best_effort(NotificationDraft::receipt_confirmed(
                &conversation.seller_id,
                &listing.title,
                buyer_name,
                &conversation.id,
            ))
            .await;
        Ok(listing)
    }

    async fn post_notice(&self, conversation_id: &str, text: &str) {
        if let Err(e) = self.messages.post_system(conversation_id, text).await {
            warn!("System message for conversation {} failed: {}", conversation_id, e);
        }
    }
}

// -- Handlers --

pub async fn sell(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trades.sell_to(&session, &conversation_id).await?))
}

pub async fn confirm_receipt(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trades.confirm_receipt(&session, &conversation_id).await?))
}

pub async fn mark_paid(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trades.mark_paid(&session, listing_id).await?))
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use textmatch_types::models::NotificationType;

    use super::*;
    use crate::testing::{TestApp, admin};

    #[tokio::test]
    async fn sell_paid_receipt_walks_the_trade() {
        let app = TestApp::new();
        let (seller, buyer, listing, conv) = app.conversation().await;
        profiles::remember(&app.state.db, &buyer).await.unwrap();
        let desk = &app.state.trades;

        let sold = desk.sell_to(&seller, &conv).await.unwrap();
        assert_eq!(sold.status, ListingStatus::Sold);
        assert_eq!(sold.buyer_id.as_deref(), Some("buyer-1"));
        assert_eq!(sold.transaction_status, Some(TransactionStatus::Pending));

        let buyer_notes = app.state.notifications.list(&buyer).await.unwrap();
        assert_eq!(buyer_notes.len(), 1);
        assert_eq!(buyer_notes[0].kind, NotificationType::Transaction);
        assert_eq!(buyer_notes[0].related_id.as_deref(), Some(conv.as_str()));

        let paid = desk.mark_paid(&admin(), listing.id).await.unwrap();
        assert_eq!(paid.transaction_status, Some(TransactionStatus::Paid));

        let done = desk.confirm_receipt(&buyer, &conv).await.unwrap();
        assert_eq!(done.transaction_status, Some(TransactionStatus::Completed));
        assert!(done.completed_at.is_some());
        // payment_received + receipt_confirmed
        assert_eq!(app.state.notifications.list(&seller).await.unwrap().len(), 2);

        let mut sub = app.state.messages.subscribe(&seller, &conv).await.unwrap();
        let first = sub.next().await.unwrap();
        assert!(first.is_system);
        assert!(first.text.contains("Hanakoさんとの取引が成立しました"));
        let second = sub.next().await.unwrap();
        assert!(second.text.starts_with("✅ Hanakoさんが商品を受け取りました"));
    }

    #[tokio::test]
    async fn receipt_from_pending_completes() {
        let app = TestApp::new();
        let (seller, buyer, _listing, conv) = app.conversation().await;
        app.state.trades.sell_to(&seller, &conv).await.unwrap();

        let done = app.state.trades.confirm_receipt(&buyer, &conv).await.unwrap();
        assert_eq!(done.transaction_status, Some(TransactionStatus::Completed));
        let err = app.state.trades.confirm_receipt(&buyer, &conv).await.unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let app = TestApp::new();
        let (seller, buyer, listing, conv) = app.conversation().await;
        let desk = &app.state.trades;

        assert!(matches!(
            desk.sell_to(&buyer, &conv).await.unwrap_err(),
            MarketError::Authorization(_)
        ));
        assert!(matches!(
            desk.confirm_receipt(&buyer, &conv).await.unwrap_err(),
            MarketError::Validation(_)
        ));
        desk.sell_to(&seller, &conv).await.unwrap();
        assert!(matches!(
            desk.confirm_receipt(&seller, &conv).await.unwrap_err(),
            MarketError::Authorization(_)
        ));
        assert!(matches!(
            desk.mark_paid(&seller, listing.id).await.unwrap_err(),
            MarketError::Authorization(_)
        ));
        // Selling twice is an edge outside the table.
        assert!(matches!(
            desk.sell_to(&seller, &conv).await.unwrap_err(),
            MarketError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn resale_after_reopen_starts_a_new_trade() {
        let app = TestApp::new();
        let (seller, first_buyer, listing, first_conv) = app.conversation().await;
        let desk = &app.state.trades;
        desk.sell_to(&seller, &first_conv).await.unwrap();
        desk.confirm_receipt(&first_buyer, &first_conv).await.unwrap();
        app.state
            .listings
            .update_status(&seller, listing.id, ListingStatus::Available, None)
            .await
            .unwrap();

        let second_buyer = Session::user("buyer-2", "Jiro");
        let second_conv = app
            .state
            .conversations
            .create_or_get(&second_buyer, &seller.user_id, listing.id)
            .await
            .unwrap();
        let resold = desk.sell_to(&seller, &second_conv).await.unwrap();
        assert_eq!(resold.buyer_id.as_deref(), Some("buyer-2"));
        assert_eq!(resold.transaction_status, Some(TransactionStatus::Pending));
        assert!(resold.completed_at.is_none());
        assert_eq!(app.state.listings.list_in_transaction("seller-1").await.unwrap().len(), 1);

        let done = desk.confirm_receipt(&second_buyer, &second_conv).await.unwrap();
        assert_eq!(done.transaction_status, Some(TransactionStatus::Completed));
        let err = desk.confirm_receipt(&first_buyer, &first_conv).await.unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));

        let history = app.state.db.trade_log(&listing.id.to_string()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].buyer_id.as_deref(), Some("buyer-1"));
        assert_eq!(history[0].transaction_status, "completed");
    }

    #[tokio::test]
    async fn reserved_trade_carries_into_the_sale() {
        let app = TestApp::new();
        let (seller, buyer, listing, conv) = app.conversation().await;
        let store = &app.state.listings;
        store
            .update_status(&seller, listing.id, ListingStatus::Reserved, Some(buyer.user_id.clone()))
            .await
            .unwrap();
        store
            .advance_transaction(&buyer, listing.id, TransactionStatus::Pending)
            .await
            .unwrap();
        store
            .advance_transaction(&admin(), listing.id, TransactionStatus::Paid)
            .await
            .unwrap();

        let sold = app.state.trades.sell_to(&seller, &conv).await.unwrap();
        assert_eq!(sold.transaction_status, Some(TransactionStatus::Paid));
        assert!(app.state.db.trade_log(&listing.id.to_string()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_buyer_name_falls_back() {
        let app = TestApp::new();
        let (seller, _buyer, _listing, conv) = app.conversation().await;
        app.state.trades.sell_to(&seller, &conv).await.unwrap();

        let page = app.state.messages.history(&seller, &conv, 10, None).await.unwrap();
        assert!(page[0].text.contains("購入者さんとの取引が成立しました"));
    }
}
