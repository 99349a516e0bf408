use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use textmatch_db::models::ConversationRecord;
use textmatch_db::{Database, now};
use textmatch_types::api::{ContactSellerRequest, ConversationCreated};
use textmatch_types::error::MarketError;
use textmatch_types::models::{Conversation, Listing};

use crate::error::ApiResult;
use crate::session::Session;
use crate::state::{AppState, blocking};

/// Deterministic conversation id for a (buyer, seller, listing) triple.
///
/// Participants are ordered first, so the same pair always lands on the same
/// key regardless of who opened the thread.
pub fn conversation_key(buyer_id: &str, seller_id: &str, listing_id: Uuid) -> String {
    let (first, second) = if buyer_id <= seller_id {
        (buyer_id, seller_id)
    } else {
        (seller_id, buyer_id)
    };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());
    hasher.update(b"|");
    hasher.update(listing_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Loads a live listing or fails with NotFound.
pub(crate) async fn load_listing(db: &Arc<Database>, id: Uuid) -> Result<Listing, MarketError> {
    let key = id.to_string();
    let row = blocking(db, move |db| db.get_listing(&key)).await?;
    let listing = row
        .map(|r| r.into_listing())
        .transpose()
        .map_err(MarketError::Store)?
        .filter(|l| !l.is_deleted())
        .ok_or_else(|| MarketError::not_found("listing", id))?;
    Ok(listing)
}

/// Loads a conversation and checks the caller takes part in it.
pub(crate) async fn load_conversation(
    db: &Arc<Database>,
    session: &Session,
    id: &str,
) -> Result<Conversation, MarketError> {
    let key = id.to_string();
    let record = blocking(db, move |db| db.get_conversation(&key))
        .await?
        .ok_or_else(|| MarketError::not_found("conversation", id))?;
    let conversation = record.into_conversation().map_err(MarketError::Store)?;
    if !conversation.is_participant(&session.user_id) {
        return Err(MarketError::unauthorized("not a participant of this conversation"));
    }
    Ok(conversation)
}

/// One thread per (buyer, seller, listing).
#[derive(Clone)]
pub struct ConversationRegistry {
    db: Arc<Database>,
}

impl ConversationRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Returns the thread for this triple, creating it on first contact.
    /// The caller is the buyer. Repeated and concurrent calls converge on one id.
    pub async fn create_or_get(
        &self,
        session: &Session,
        seller_id: &str,
        listing_id: Uuid,
    ) -> Result<String, MarketError> {
        let buyer_id = session.user_id.clone();
        if buyer_id == seller_id {
            return Err(MarketError::validation("cannot open a conversation with yourself"));
        }

        let listing = load_listing(&self.db, listing_id).await?;
        if listing.seller_id != seller_id {
            return Err(MarketError::validation("seller does not own this listing"));
        }

        let id = conversation_key(&buyer_id, seller_id, listing_id);
        let (seller, listing_key) = (seller_id.to_string(), listing_id.to_string());
        let (created, existing) = blocking(&self.db, move |db| {
            let created = db.insert_conversation_if_absent(&id, &buyer_id, &seller, &listing_key, &now())?;
            // The UNIQUE triple may already be held by a row under an older id.
            let existing = db.find_conversation_id(&buyer_id, &seller, &listing_key)?;
            Ok((created, existing))
        })
        .await?;

        let id = existing.ok_or_else(|| MarketError::Store(anyhow::anyhow!("conversation vanished after insert")))?;
        if created {
            info!("Conversation {} opened by {} on listing {}", id, session.user_id, listing_id);
        }
        Ok(id)
    }

    pub async fn get(&self, session: &Session, id: &str) -> Result<Conversation, MarketError> {
        load_conversation(&self.db, session, id).await
    }

    /// Threads where the user is buyer or seller, most recently active first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, MarketError> {
        let uid = user_id.to_string();
        let (as_buyer, as_seller) = blocking(&self.db, move |db| {
            Ok((db.conversations_as_buyer(&uid)?, db.conversations_as_seller(&uid)?))
        })
        .await?;
        merge_conversations(as_buyer, as_seller)
    }

    pub async fn for_listing(&self, listing_id: Uuid) -> Result<Vec<Conversation>, MarketError> {
        let key = listing_id.to_string();
        let records = blocking(&self.db, move |db| db.conversations_for_listing(&key)).await?;
        records
            .into_iter()
            .map(|r| r.into_conversation().map_err(MarketError::Store))
            .collect()
    }
}

fn merge_conversations(
    as_buyer: Vec<ConversationRecord>,
    as_seller: Vec<ConversationRecord>,
) -> Result<Vec<Conversation>, MarketError> {
    let mut merged: HashMap<String, Conversation> = HashMap::new();
    for record in as_buyer.into_iter().chain(as_seller) {
        match record.into_conversation() {
            Ok(c) => {
                merged.entry(c.id.clone()).or_insert(c);
            }
            Err(e) => warn!("Skipping unreadable conversation: {}", e),
        }
    }

    let mut list: Vec<Conversation> = merged.into_values().collect();
    list.sort_by(|a, b| {
        let a_at = a.last_message_at.unwrap_or(a.created_at);
        let b_at = b.last_message_at.unwrap_or(b.created_at);
        b_at.cmp(&a_at)
    });
    Ok(list)
}

// -- Handlers --

pub async fn create_or_get(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<ContactSellerRequest>,
) -> ApiResult<impl IntoResponse> {
    let conversation_id = state
        .conversations
        .create_or_get(&session, &req.seller_id, req.listing_id)
        .await?;
    Ok((StatusCode::OK, Json(ConversationCreated { conversation_id })))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.conversations.list_for_user(&session.user_id).await?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.conversations.get(&session, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestApp, buyer, seller};

    #[test]
    fn key_is_order_independent_and_listing_specific() {
        let listing = Uuid::new_v4();
        assert_eq!(conversation_key("a", "b", listing), conversation_key("b", "a", listing));
        assert_ne!(conversation_key("a", "b", listing), conversation_key("a", "b", Uuid::new_v4()));
        assert_eq!(conversation_key("a", "b", listing).len(), 64);
    }

    #[tokio::test]
    async fn repeated_contact_returns_the_same_id() {
        let app = TestApp::new();
        let listing = app.listing(&seller()).await;
        let reg = &app.state.conversations;

        let first = reg.create_or_get(&buyer(), "seller-1", listing.id).await.unwrap();
        let second = reg.create_or_get(&buyer(), "seller-1", listing.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.list_for_user("buyer-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_contact_converges() {
        let app = TestApp::new();
        let listing = app.listing(&seller()).await;
        let reg = app.state.conversations.clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.create_or_get(&buyer(), "seller-1", listing.id).await.unwrap() })
            })
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(reg.for_listing(listing.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contact_is_validated() {
        let app = TestApp::new();
        let listing = app.listing(&seller()).await;
        let reg = &app.state.conversations;

        let err = reg.create_or_get(&seller(), "seller-1", listing.id).await.unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));

        let err = reg.create_or_get(&buyer(), "someone-else", listing.id).await.unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));

        let err = reg.create_or_get(&buyer(), "seller-1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_merges_both_roles_and_checks_participation() {
        let app = TestApp::new();
        let (seller, buyer, _listing, conv) = app.conversation().await;

        // The seller also buys something from the buyer.
        let other = app.listing(&buyer).await;
        let reverse = app
            .state
            .conversations
            .create_or_get(&seller, &buyer.user_id, other.id)
            .await
            .unwrap();
        assert_ne!(conv, reverse);

        let list = app.state.conversations.list_for_user(&seller.user_id).await.unwrap();
        assert_eq!(list.len(), 2);

        let outsider = Session::user("outsider", "X");
        let err = app.state.conversations.get(&outsider, &conv).await.unwrap_err();
        assert!(matches!(err, MarketError::Authorization(_)));
        assert_eq!(app.state.conversations.get(&buyer, &conv).await.unwrap().id, conv);
    }
}
