use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender id stamped on messages posted by the marketplace itself.
pub const SYSTEM_SENDER: &str = "system";

// -- Listings --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Available,
    Reserved,
    Sold,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Sold => "sold",
        }
    }

    /// Edges a listing may take without an administrative override.
    ///
    /// `available -> sold` is the direct-sale path (the reservation step is
    /// folded into the sale); it still needs a buyer. `sold -> available` is
    /// the seller's reopen.
    pub fn can_transition_to(self, next: ListingStatus) -> bool {
        use ListingStatus::*;
        matches!(
            (self, next),
            (Available, Reserved) | (Reserved, Sold) | (Available, Sold) | (Sold, Available)
        )
    }

    pub fn is_reopen(self, next: ListingStatus) -> bool {
        self == Self::Sold && next == Self::Available
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "reserved" => Ok(Self::Reserved),
            "sold" => Ok(Self::Sold),
            other => Err(anyhow::anyhow!("unknown listing status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Completed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Completed => "completed",
        }
    }

    /// The single state that may follow this one.
    pub fn next(self) -> Option<TransactionStatus> {
        match self {
            Self::Pending => Some(Self::Paid),
            Self::Paid => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// A transaction starts at `pending` and moves one step at a time.
    pub fn can_advance(current: Option<TransactionStatus>, next: TransactionStatus) -> bool {
        match current {
            None => next == Self::Pending,
            Some(current) => current.next() == Some(next),
        }
    }

    /// Used by overrides, which may skip ahead but never move back.
    pub fn is_regression(current: Option<TransactionStatus>, next: TransactionStatus) -> bool {
        current.is_some_and(|current| next < current)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "completed" => Ok(Self::Completed),
            other => Err(anyhow::anyhow!("unknown transaction status '{}'", other)),
        }
    }
}

/// A textbook offered for sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub price: i64,
    pub image_urls: Vec<String>,
    pub seller_id: String,
    pub buyer_id: Option<String>,
    pub status: ListingStatus,
    pub transaction_status: Option<TransactionStatus>,
    pub views: i64,
    pub is_approved: Option<bool>,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// -- Conversations --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub listing_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// user_id -> messages from the other participant not yet read
    pub unread_count: HashMap<String, i64>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    /// The participant on the other side of `user_id`, if `user_id` is one.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.buyer_id == user_id {
            Some(&self.seller_id)
        } else if self.seller_id == user_id {
            Some(&self.buyer_id)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: &str) -> i64 {
        self.unread_count.get(user_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    /// Store-assigned position; strictly increasing within a conversation.
    pub seq: i64,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_system: bool,
}

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Message,
    Transaction,
    System,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Transaction => "transaction",
            Self::System => "system",
        }
    }
}

impl FromStr for NotificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "transaction" => Ok(Self::Transaction),
            "system" => Ok(Self::System),
            other => Err(anyhow::anyhow!("unknown notification type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    /// Conversation or listing that caused the notification.
    pub related_id: Option<String>,
    pub action_url: Option<String>,
}

// -- Push tokens --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    #[default]
    Web,
    Android,
    Ios,
}

impl PushPlatform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }
}

impl FromStr for PushPlatform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            other => Err(anyhow::anyhow!("unknown push platform '{}'", other)),
        }
    }
}

/// Platform notification permission as reported by the client device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    #[default]
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushToken {
    pub user_id: String,
    pub token: String,
    pub enabled: bool,
    pub platform: PushPlatform,
    pub updated_at: DateTime<Utc>,
}

// -- Users --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Contact details cached from the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_edges_follow_the_table() {
        use ListingStatus::*;
        assert!(Available.can_transition_to(Reserved));
        assert!(Reserved.can_transition_to(Sold));
        assert!(Available.can_transition_to(Sold));
        assert!(Sold.can_transition_to(Available));

        assert!(!Reserved.can_transition_to(Available));
        assert!(!Sold.can_transition_to(Reserved));
        for s in [Available, Reserved, Sold] {
            assert!(!s.can_transition_to(s), "{} -> {} must be rejected", s, s);
        }
    }

    #[test]
    fn transaction_only_moves_forward_one_step() {
        use TransactionStatus::*;
        assert!(TransactionStatus::can_advance(None, Pending));
        assert!(!TransactionStatus::can_advance(None, Paid));
        assert!(TransactionStatus::can_advance(Some(Pending), Paid));
        assert!(!TransactionStatus::can_advance(Some(Pending), Completed));
        assert!(TransactionStatus::can_advance(Some(Paid), Completed));
        assert!(!TransactionStatus::can_advance(Some(Completed), Pending));
        assert!(!TransactionStatus::can_advance(Some(Paid), Paid));

        assert!(TransactionStatus::is_regression(Some(Paid), Pending));
        assert!(!TransactionStatus::is_regression(Some(Pending), Completed));
        assert!(!TransactionStatus::is_regression(None, Pending));
    }

    #[test]
    fn statuses_parse_their_own_names() {
        for s in [ListingStatus::Available, ListingStatus::Reserved, ListingStatus::Sold] {
            assert_eq!(s.as_str().parse::<ListingStatus>().unwrap(), s);
        }
        assert!("in_progress".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn other_participant_is_symmetric() {
        let conv = Conversation {
            id: "c".into(),
            buyer_id: "buyer".into(),
            seller_id: "seller".into(),
            listing_id: Uuid::new_v4(),
            created_at: Utc::now(),
            last_message: None,
            last_message_at: None,
            unread_count: HashMap::new(),
        };
        assert_eq!(conv.other_participant("buyer"), Some("seller"));
        assert_eq!(conv.other_participant("seller"), Some("buyer"));
        assert_eq!(conv.other_participant("stranger"), None);
    }

    #[test]
    fn notification_serializes_kind_as_type() {
        let n = Notification {
            id: Uuid::new_v4(),
            user_id: "u".into(),
            kind: NotificationType::Transaction,
            title: "t".into(),
            message: "m".into(),
            is_read: false,
            created_at: Utc::now(),
            related_id: None,
            action_url: None,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "transaction");
    }
}
