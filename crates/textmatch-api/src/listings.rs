use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{SubsecRound, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use textmatch_db::listings::StatusChange;
use textmatch_db::models::{DeleteLogRow, ListingRow, TradeLogRow};
use textmatch_db::{Database, now, timestamp};
use textmatch_types::api::{
    AdvanceTransactionRequest, CreateListingRequest, HardDeleteRequest, ModerateListingRequest, OverrideStatusRequest,
    UpdateStatusRequest,
};
use textmatch_types::error::MarketError;
use textmatch_types::models::{Listing, ListingStatus, TransactionStatus};

use crate::conversations::load_listing;
use crate::error::ApiResult;
use crate::messages::MessageChannel;
use crate::notifications::{NotificationDispatcher, NotificationDraft};
use crate::session::Session;
use crate::state::{AppState, blocking};

const MAX_TITLE_CHARS: usize = 200;

fn into_listings(rows: Vec<ListingRow>) -> Result<Vec<Listing>, MarketError> {
    rows.into_iter()
        .map(|r| r.into_listing().map_err(MarketError::Store))
        .collect()
}

fn relist_message(title: &str) -> String {
    format!(
        "📢 システム通知: 「{}」が再び出品されました。購入をご希望の場合は、出品者にメッセージをお送りください。",
        title
    )
}

/// Textbook listings and their sale-status state machine.
#[derive(Clone)]
pub struct ListingStore {
    db: Arc<Database>,
    min_price: i64,
    messages: MessageChannel,
    notifications: NotificationDispatcher,
}

impl ListingStore {
    pub fn new(
        db: Arc<Database>,
        min_price: i64,
        messages: MessageChannel,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            db,
            min_price,
            messages,
            notifications,
        }
    }

    pub async fn create(&self, session: &Session, req: CreateListingRequest) -> Result<Listing, MarketError> {
        let title = req.title.trim().to_string();
        if title.is_empty() {
            return Err(MarketError::validation("title is required"));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(MarketError::validation(format!(
                "title is longer than {} characters",
                MAX_TITLE_CHARS
            )));
        }
        if req.price < self.min_price {
            return Err(MarketError::validation(format!(
                "price must be at least {}",
                self.min_price
            )));
        }
        let image_urls: Vec<String> = req
            .image_urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if image_urls.is_empty() {
            return Err(MarketError::validation("at least one image is required"));
        }

        // Stored at microsecond precision; keep the returned value identical.
        let at = Utc::now().trunc_subsecs(6);
        let listing = Listing {
            id: Uuid::new_v4(),
            title,
            description: req.description.filter(|d| !d.trim().is_empty()),
            condition: req.condition,
            price: req.price,
            image_urls,
            seller_id: session.user_id.clone(),
            buyer_id: None,
            status: ListingStatus::Available,
            transaction_status: None,
            views: 0,
            is_approved: None,
            admin_notes: None,
            created_at: at,
            updated_at: at,
            purchased_at: None,
            completed_at: None,
            deleted_at: None,
        };

        let stored = listing.clone();
        blocking(&self.db, move |db| db.insert_listing(&stored)).await?;
        info!("Listing {} created by {}", listing.id, session.user_id);
        Ok(listing)
    }

    pub async fn get(&self, id: Uuid) -> Result<Listing, MarketError> {
        load_listing(&self.db, id).await
    }

    /// Moves a listing along the transition table.
    ///
    /// Selling stamps `purchased_at` and records the buyer; reopening leaves
    /// `buyer_id` and `transaction_status` as they were.
    pub async fn update_status(
        &self,
        session: &Session,
        id: Uuid,
        next: ListingStatus,
        buyer_id: Option<String>,
    ) -> Result<Listing, MarketError> {
        let listing = load_listing(&self.db, id).await?;
        let is_seller = listing.seller_id == session.user_id;
        if !is_seller && !session.is_admin() {
            return Err(MarketError::unauthorized("only the seller may change the listing status"));
        }

        let current = listing.status;
        if !current.can_transition_to(next) {
            return Err(MarketError::validation(format!(
                "cannot move listing from {} to {}",
                current, next
            )));
        }
        if current.is_reopen(next) && !is_seller {
            return Err(MarketError::unauthorized("only the seller may reopen a listing"));
        }

        let buyer_id = buyer_id.filter(|b| !b.trim().is_empty());
        if buyer_id.as_deref() == Some(listing.seller_id.as_str()) {
            return Err(MarketError::validation("seller cannot buy their own listing"));
        }
        if next == ListingStatus::Sold && buyer_id.is_none() && listing.buyer_id.is_none() {
            return Err(MarketError::validation("a buyer is required to mark a listing sold"));
        }

        let at = now();
        let purchased_at = (next == ListingStatus::Sold).then(|| at.clone());
        let key = id.to_string();
        let swapped = blocking(&self.db, move |db| {
            let change = StatusChange {
                status: next.as_str(),
                buyer_id: buyer_id.as_deref(),
                purchased_at: purchased_at.as_deref(),
                updated_at: &at,
            };
            db.set_listing_status(&key, current.as_str(), &change)
        })
        .await?;
        if !swapped {
            return Err(MarketError::validation("listing status changed concurrently, reload and retry"));
        }

        let updated = load_listing(&self.db, id).await?;
        info!("Listing {} moved {} -> {} by {}", id, current, next, session.user_id);
        if current.is_reopen(next) {
            self.announce_relist(&updated).await;
        }
        Ok(updated)
    }

    /// Favoriters and everyone who asked about the listing hear it is back.
    async fn announce_relist(&self, listing: &Listing) {
        let key = listing.id.to_string();
        let fetched = blocking(&self.db, move |db| {
            Ok((db.favoriter_ids(&key)?, db.conversations_for_listing(&key)?))
        })
        .await;
        let (favoriters, records) = match fetched {
            Ok(found) => found,
            Err(e) => {
                warn!("Relist fan-out for {} skipped: {}", listing.id, e);
                return;
            }
        };

        let conversations: Vec<_> = records
            .into_iter()
            .filter_map(|r| r.into_conversation().ok())
            .collect();
        let recipients: BTreeSet<String> = favoriters
            .into_iter()
            .chain(conversations.iter().map(|c| c.buyer_id.clone()))
            .filter(|u| *u != listing.seller_id)
            .collect();

        for user_id in &recipients {
            self.notifications
                .notify_best_effort(NotificationDraft::relisted(user_id, &listing.title, listing.id))
                .await;
        }
        let text = relist_message(&listing.title);
        for conversation in &conversations {
            if let Err(e) = self.messages.post_system(&conversation.id, &text).await {
                warn!("Relist notice for conversation {} failed: {}", conversation.id, e);
            }
        }
        info!(
            "Listing {} relisted: {} notified, {} conversations",
            listing.id,
            recipients.len(),
            conversations.len()
        );
    }

    /// Trade progress by either party or an admin.
    pub async fn advance_transaction(
        &self,
        session: &Session,
        id: Uuid,
        next: TransactionStatus,
    ) -> Result<Listing, MarketError> {
        let listing = load_listing(&self.db, id).await?;
        let is_party = listing.seller_id == session.user_id || listing.buyer_id.as_deref() == Some(&session.user_id);
        if !is_party && !session.is_admin() {
            return Err(MarketError::unauthorized("only the trading parties may update the transaction"));
        }
        self.advance_unchecked(listing, next).await
    }

    /// Steps the transaction forward. The caller has already checked who is acting.
    pub(crate) async fn advance_unchecked(
        &self,
        listing: Listing,
        next: TransactionStatus,
    ) -> Result<Listing, MarketError> {
        if listing.buyer_id.is_none() {
            return Err(MarketError::validation("listing has no buyer yet"));
        }
        let current = listing.transaction_status;
        if !TransactionStatus::can_advance(current, next) {
            return Err(MarketError::validation(format!(
                "cannot move transaction from {} to {}",
                current.map_or("none", TransactionStatus::as_str),
                next
            )));
        }

        let at = now();
        let completed_at = (next == TransactionStatus::Completed).then(|| at.clone());
        let key = listing.id.to_string();
        let swapped = blocking(&self.db, move |db| {
            db.set_transaction_status(
                &key,
                current.map(TransactionStatus::as_str),
                next.as_str(),
                completed_at.as_deref(),
                &at,
            )
        })
        .await?;
        if !swapped {
            return Err(MarketError::validation("transaction changed concurrently, reload and retry"));
        }
        info!("Listing {} transaction -> {}", listing.id, next);
        load_listing(&self.db, listing.id).await
    }

    /// Archives the trade of an earlier sale and starts a new one at `pending`.
    /// `previous` is the listing as it was before the new sale was recorded.
    pub(crate) async fn restart_trade(&self, previous: &Listing) -> Result<Listing, MarketError> {
        let Some(current) = previous.transaction_status else {
            return Err(MarketError::validation("there is no earlier trade to archive"));
        };
        let at = now();
        let log = TradeLogRow {
            id: Uuid::new_v4().to_string(),
            listing_id: previous.id.to_string(),
            buyer_id: previous.buyer_id.clone(),
            transaction_status: current.as_str().to_string(),
            purchased_at: previous.purchased_at.map(timestamp),
            completed_at: previous.completed_at.map(timestamp),
            archived_at: at.clone(),
        };
        let swapped = blocking(&self.db, move |db| db.restart_transaction(&log, &at)).await?;
        if !swapped {
            return Err(MarketError::validation("transaction changed concurrently, reload and retry"));
        }
        info!(
            "Listing {} trade with {:?} archived at {}, new trade started",
            previous.id, previous.buyer_id, current
        );
        load_listing(&self.db, previous.id).await
    }

    /// Counts a view unless the seller is looking at their own listing.
    pub async fn increment_views(&self, id: Uuid, viewer: Option<&str>) {
        let key = id.to_string();
        let viewer = viewer.map(str::to_string);
        let result = blocking(&self.db, move |db| {
            let Some(row) = db.get_listing(&key)? else {
                return Ok(false);
            };
            if viewer.as_deref() == Some(row.seller_id.as_str()) {
                return Ok(false);
            }
            db.increment_listing_views(&key)
        })
        .await;
        if let Err(e) = result {
            warn!("View count for {} not updated: {}", id, e);
        }
    }

    // -- Favorites --

    pub async fn add_favorite(&self, session: &Session, id: Uuid) -> Result<bool, MarketError> {
        load_listing(&self.db, id).await?;
        let (uid, key) = (session.user_id.clone(), id.to_string());
        blocking(&self.db, move |db| db.add_favorite(&uid, &key, &now())).await
    }

    pub async fn remove_favorite(&self, session: &Session, id: Uuid) -> Result<bool, MarketError> {
        let (uid, key) = (session.user_id.clone(), id.to_string());
        blocking(&self.db, move |db| db.remove_favorite(&uid, &key)).await
    }

    pub async fn is_favorite(&self, user_id: &str, id: Uuid) -> Result<bool, MarketError> {
        let (uid, key) = (user_id.to_string(), id.to_string());
        blocking(&self.db, move |db| db.is_favorite(&uid, &key)).await
    }

    /// Best-effort: a failing store reads as no favorites.
    pub async fn list_favorites(&self, user_id: &str) -> Vec<Listing> {
        let uid = user_id.to_string();
        let listings = blocking(&self.db, move |db| db.favorite_listings(&uid))
            .await
            .and_then(into_listings);
        listings.unwrap_or_else(|e| {
            warn!("Favorites for {} unavailable: {}", user_id, e);
            Vec::new()
        })
    }

    // -- Queries --

    pub async fn list_recent(&self, limit: u32) -> Result<Vec<Listing>, MarketError> {
        let limit = limit.clamp(1, 100);
        into_listings(blocking(&self.db, move |db| db.recent_listings(limit)).await?)
    }

    pub async fn list_selling(&self, seller_id: &str) -> Result<Vec<Listing>, MarketError> {
        let uid = seller_id.to_string();
        into_listings(blocking(&self.db, move |db| db.selling_listings(&uid)).await?)
    }

    pub async fn list_purchases(&self, buyer_id: &str) -> Result<Vec<Listing>, MarketError> {
        let uid = buyer_id.to_string();
        into_listings(blocking(&self.db, move |db| db.purchased_listings(&uid)).await?)
    }

    pub async fn list_in_transaction(&self, seller_id: &str) -> Result<Vec<Listing>, MarketError> {
        let uid = seller_id.to_string();
        into_listings(blocking(&self.db, move |db| db.trading_listings(&uid)).await?)
    }

    // -- Deletion --

    pub async fn soft_delete(&self, session: &Session, id: Uuid) -> Result<(), MarketError> {
        let listing = load_listing(&self.db, id).await?;
        if listing.seller_id != session.user_id && !session.is_admin() {
            return Err(MarketError::unauthorized("only the seller may delete this listing"));
        }
        let key = id.to_string();
        let removed = blocking(&self.db, move |db| db.soft_delete_listing(&key, &now())).await?;
        if !removed {
            return Err(MarketError::not_found("listing", id));
        }
        info!("Listing {} soft-deleted by {}", id, session.user_id);
        Ok(())
    }

    // -- Admin --

    pub async fn moderate(
        &self,
        session: &Session,
        id: Uuid,
        approved: bool,
        notes: Option<String>,
    ) -> Result<Listing, MarketError> {
        session.require_admin()?;
        load_listing(&self.db, id).await?;
        let key = id.to_string();
        blocking(&self.db, move |db| {
            db.moderate_listing(&key, approved, notes.as_deref(), &now())
        })
        .await?;
        info!("Listing {} moderated by {}: approved={}", id, session.user_id, approved);
        load_listing(&self.db, id).await
    }

    /// Skips the transition table. A transaction status may jump ahead but
    /// never move back.
    pub async fn override_status(
        &self,
        session: &Session,
        id: Uuid,
        status: ListingStatus,
        transaction_status: Option<TransactionStatus>,
    ) -> Result<Listing, MarketError> {
        session.require_admin()?;
        let listing = load_listing(&self.db, id).await?;
        if let Some(next) = transaction_status {
            if TransactionStatus::is_regression(listing.transaction_status, next) {
                return Err(MarketError::validation(format!(
                    "transaction status cannot move back to {}",
                    next
                )));
            }
        }

        let at = now();
        let purchased_at = (status == ListingStatus::Sold && listing.purchased_at.is_none()).then(|| at.clone());
        let completed_at = (transaction_status == Some(TransactionStatus::Completed) && listing.completed_at.is_none())
            .then(|| at.clone());
        let key = id.to_string();
        let written = blocking(&self.db, move |db| {
            let change = StatusChange {
                status: status.as_str(),
                buyer_id: None,
                purchased_at: purchased_at.as_deref(),
                updated_at: &at,
            };
            db.override_listing_status(
                &key,
                &change,
                transaction_status.map(TransactionStatus::as_str),
                completed_at.as_deref(),
            )
        })
        .await?;
        if !written {
            return Err(MarketError::validation("transaction moved on concurrently, reload and retry"));
        }
        warn!(
            "Listing {} status overridden by {}: {} -> {}",
            id, session.user_id, listing.status, status
        );
        load_listing(&self.db, id).await
    }

    /// Removes the listing for good, leaving a snapshot in the delete log.
    pub async fn hard_delete(&self, session: &Session, id: Uuid, reason: &str) -> Result<(), MarketError> {
        session.require_admin()?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MarketError::validation("a reason is required"));
        }

        let key = id.to_string();
        let row = blocking(&self.db, move |db| db.get_listing(&key))
            .await?
            .ok_or_else(|| MarketError::not_found("listing", id))?;
        let listing = row.into_listing().map_err(MarketError::Store)?;
        let snapshot = serde_json::to_string(&listing).map_err(|e| MarketError::Store(e.into()))?;

        let log = DeleteLogRow {
            id: Uuid::new_v4().to_string(),
            listing_id: id.to_string(),
            snapshot,
            reason: reason.to_string(),
            deleted_by: session.user_id.clone(),
            deleted_at: now(),
        };
        let removed = blocking(&self.db, move |db| db.hard_delete_listing(&log)).await?;
        if !removed {
            return Err(MarketError::not_found("listing", id));
        }
        warn!("Listing {} hard-deleted by {}: {}", id, session.user_id, reason);
        Ok(())
    }
}

// -- Handlers --

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent")]
    pub limit: u32,
}

fn default_recent() -> u32 {
    20
}

pub async fn create_listing(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<CreateListingRequest>,
) -> ApiResult<impl IntoResponse> {
    let listing = state.listings.create(&session, req).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

pub async fn list_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.list_recent(query.limit).await?))
}

pub async fn get_listing(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.get(id).await?))
}

pub async fn delete_listing(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.listings.soft_delete(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_status(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let listing = state
        .listings
        .update_status(&session, id, req.status, req.buyer_id)
        .await?;
    Ok(Json(listing))
}

pub async fn advance_transaction(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdvanceTransactionRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.advance_transaction(&session, id, req.status).await?))
}

pub async fn record_view(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    state.listings.increment_views(id, Some(&session.user_id)).await;
    StatusCode::NO_CONTENT
}

pub async fn add_favorite(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.listings.add_favorite(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_favorite(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.listings.remove_favorite(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn my_favorites(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> impl IntoResponse {
    Json(state.listings.list_favorites(&session.user_id).await)
}

pub async fn my_selling(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.list_selling(&session.user_id).await?))
}

pub async fn my_purchases(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.list_purchases(&session.user_id).await?))
}

pub async fn my_trading(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.list_in_transaction(&session.user_id).await?))
}

pub async fn moderate_listing(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(req): Json<ModerateListingRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.listings.moderate(&session, id, req.approved, req.notes).await?))
}

pub async fn override_status(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(req): Json<OverrideStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let listing = state
        .listings
        .override_status(&session, id, req.status, req.transaction_status)
        .await?;
    Ok(Json(listing))
}

pub async fn hard_delete_listing(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(req): Json<HardDeleteRequest>,
) -> ApiResult<impl IntoResponse> {
    state.listings.hard_delete(&session, id, &req.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}
