use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ListingStatus, PermissionState, PushPlatform, Role, TransactionStatus};

// -- JWT Claims --

/// Claims in tokens issued by the identity provider. Shared by the REST
/// middleware and the WebSocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Role,
    pub exp: usize,
}

// -- Listings --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateListingRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub status: ListingStatus,
    #[serde(default)]
    pub buyer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvanceTransactionRequest {
    pub status: TransactionStatus,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideStatusRequest {
    pub status: ListingStatus,
    #[serde(default)]
    pub transaction_status: Option<TransactionStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModerateListingRequest {
    pub approved: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardDeleteRequest {
    pub reason: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactSellerRequest {
    pub seller_id: String,
    pub listing_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ConversationCreated {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkNotificationsReadRequest {
    /// `None` marks every unread notification of the caller.
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: i64,
}

// -- Push --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavePushTokenRequest {
    pub token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub platform: PushPlatform,
}

fn default_enabled() -> bool {
    true
}

/// What the client platform reported when the user hit the toggle.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TogglePushRequest {
    pub permission: PermissionState,
    /// Freshly acquired device token, when the platform handed one out.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub platform: PushPlatform,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushSettings {
    pub token: Option<String>,
    pub enabled: bool,
    pub has_token: bool,
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub enabled: bool,
}
