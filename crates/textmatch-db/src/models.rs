//! Row types that map directly to SQLite rows. The `into_*` conversions are
//! where stored text becomes typed `textmatch_types` models.
use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::warn;
use uuid::Uuid;

use textmatch_types::models::{
    Conversation, Listing, Message, Notification, Profile, PushToken,
};

pub(crate) const LISTING_COLUMNS: &str = "id, title, description, condition, price, image_urls, \
     seller_id, buyer_id, status, transaction_status, views, is_approved, admin_notes, \
     created_at, updated_at, purchased_at, completed_at, deleted_at";

pub(crate) const CONVERSATION_COLUMNS: &str =
    "id, buyer_id, seller_id, listing_id, created_at, last_message, last_message_at";

pub(crate) const MESSAGE_COLUMNS: &str =
    "seq, id, conversation_id, sender_id, text, is_read, is_system, created_at";

pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, title, message, is_read, related_id, action_url, created_at";

pub struct ListingRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub price: i64,
    pub image_urls: String,
    pub seller_id: String,
    pub buyer_id: Option<String>,
    pub status: String,
    pub transaction_status: Option<String>,
    pub views: i64,
    pub is_approved: Option<bool>,
    pub admin_notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub purchased_at: Option<String>,
    pub completed_at: Option<String>,
    pub deleted_at: Option<String>,
}

impl ListingRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            condition: row.get("condition")?,
            price: row.get("price")?,
            image_urls: row.get("image_urls")?,
            seller_id: row.get("seller_id")?,
            buyer_id: row.get("buyer_id")?,
            status: row.get("status")?,
            transaction_status: row.get("transaction_status")?,
            views: row.get("views")?,
            is_approved: row.get("is_approved")?,
            admin_notes: row.get("admin_notes")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            purchased_at: row.get("purchased_at")?,
            completed_at: row.get("completed_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }

    pub fn into_listing(self) -> Result<Listing> {
        let image_urls: Vec<String> = serde_json::from_str(&self.image_urls)
            .with_context(|| format!("corrupt image_urls on listing '{}'", self.id))?;

        Ok(Listing {
            id: parse_uuid(&self.id)?,
            title: self.title,
            description: self.description,
            condition: self.condition,
            price: self.price,
            image_urls,
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            status: self.status.parse()?,
            transaction_status: self.transaction_status.as_deref().map(str::parse).transpose()?,
            views: self.views,
            is_approved: self.is_approved,
            admin_notes: self.admin_notes,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
            purchased_at: self.purchased_at.as_deref().map(parse_timestamp),
            completed_at: self.completed_at.as_deref().map(parse_timestamp),
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp),
        })
    }
}

pub struct ConversationRow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub listing_id: String,
    pub created_at: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
}

impl ConversationRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            buyer_id: row.get("buyer_id")?,
            seller_id: row.get("seller_id")?,
            listing_id: row.get("listing_id")?,
            created_at: row.get("created_at")?,
            last_message: row.get("last_message")?,
            last_message_at: row.get("last_message_at")?,
        })
    }

    pub fn into_conversation(self, unread_count: HashMap<String, i64>) -> Result<Conversation> {
        Ok(Conversation {
            listing_id: parse_uuid(&self.listing_id)?,
            id: self.id,
            buyer_id: self.buyer_id,
            seller_id: self.seller_id,
            created_at: parse_timestamp(&self.created_at),
            last_message: self.last_message,
            last_message_at: self.last_message_at.as_deref().map(parse_timestamp),
            unread_count,
        })
    }
}

/// A conversation row together with its unread counters.
pub struct ConversationRecord {
    pub row: ConversationRow,
    pub unread: HashMap<String, i64>,
}

impl ConversationRecord {
    pub fn into_conversation(self) -> Result<Conversation> {
        self.row.into_conversation(self.unread)
    }
}

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub is_read: bool,
    pub is_system: bool,
    pub created_at: String,
}

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get("seq")?,
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            sender_id: row.get("sender_id")?,
            text: row.get("text")?,
            is_read: row.get("is_read")?,
            is_system: row.get("is_system")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_uuid(&self.id)?,
            conversation_id: self.conversation_id,
            seq: self.seq,
            sender_id: self.sender_id,
            text: self.text,
            created_at: parse_timestamp(&self.created_at),
            is_read: self.is_read,
            is_system: self.is_system,
        })
    }
}

/// Insert payload for a message; `seq` is assigned by the store.
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub is_system: bool,
    pub created_at: String,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub related_id: Option<String>,
    pub action_url: Option<String>,
    pub created_at: String,
}

impl NotificationRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            kind: row.get("kind")?,
            title: row.get("title")?,
            message: row.get("message")?,
            is_read: row.get("is_read")?,
            related_id: row.get("related_id")?,
            action_url: row.get("action_url")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn into_notification(self) -> Result<Notification> {
        Ok(Notification {
            id: parse_uuid(&self.id)?,
            user_id: self.user_id,
            kind: self.kind.parse()?,
            title: self.title,
            message: self.message,
            is_read: self.is_read,
            created_at: parse_timestamp(&self.created_at),
            related_id: self.related_id,
            action_url: self.action_url,
        })
    }
}

pub struct PushTokenRow {
    pub user_id: String,
    pub token: String,
    pub enabled: bool,
    pub platform: String,
    pub updated_at: String,
}

impl PushTokenRow {
    pub fn into_push_token(self) -> Result<PushToken> {
        Ok(PushToken {
            user_id: self.user_id,
            token: self.token,
            enabled: self.enabled,
            platform: self.platform.parse()?,
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

pub struct ProfileRow {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub updated_at: String,
}

impl ProfileRow {
    pub fn into_profile(self) -> Profile {
        Profile {
            user_id: self.user_id,
            display_name: self.display_name,
            email: self.email,
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

pub struct DeleteLogRow {
    pub id: String,
    pub listing_id: String,
    pub snapshot: String,
    pub reason: String,
    pub deleted_by: String,
    pub deleted_at: String,
}

/// A finished or abandoned trade kept when the listing is sold again.
pub struct TradeLogRow {
    pub id: String,
    pub listing_id: String,
    pub buyer_id: Option<String>,
    pub transaction_status: String,
    pub purchased_at: Option<String>,
    pub completed_at: Option<String>,
    pub archived_at: String,
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>().with_context(|| format!("corrupt id '{}'", raw))
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; treat it as naive UTC.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_timestamp_shapes() {
        let rfc = parse_timestamp("2025-04-01T09:30:00.000000Z");
        let naive = parse_timestamp("2025-04-01 09:30:00");
        assert_eq!(rfc, naive);
        assert_eq!(parse_timestamp("garbage"), DateTime::<Utc>::default());
    }
}
