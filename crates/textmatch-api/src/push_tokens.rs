use std::sync::Arc;

use async_trait::async_trait;
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{info, warn};

use textmatch_db::models::PushTokenRow;
use textmatch_db::{Database, now};
use textmatch_types::api::{PushSettings, SavePushTokenRequest, TogglePushRequest, ToggleResponse};
use textmatch_types::error::MarketError;
use textmatch_types::models::{PermissionState, PushPlatform, PushToken};

use crate::error::ApiResult;
use crate::session::Session;
use crate::state::{AppState, blocking};

/// The device side of push: platform permission and token acquisition.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn permission(&self) -> PermissionState;

    /// Asks the platform for a device token; `None` when it refuses.
    async fn acquire_token(&self) -> Option<String>;

    fn platform(&self) -> PushPlatform {
        PushPlatform::Web
    }
}

/// A token source built from what the client reported over HTTP.
pub struct ReportedTokenSource {
    pub permission: PermissionState,
    pub token: Option<String>,
    pub platform: PushPlatform,
}

#[async_trait]
impl TokenSource for ReportedTokenSource {
    fn permission(&self) -> PermissionState {
        self.permission
    }

    async fn acquire_token(&self) -> Option<String> {
        if self.permission != PermissionState::Granted {
            return None;
        }
        self.token.clone().filter(|t| !t.trim().is_empty())
    }

    fn platform(&self) -> PushPlatform {
        self.platform
    }
}

/// One push-capable device token per user plus an enabled flag.
#[derive(Clone)]
pub struct PushTokenRegistry {
    db: Arc<Database>,
}

impl PushTokenRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert; the last write wins.
    pub async fn save(
        &self,
        user_id: &str,
        token: &str,
        enabled: bool,
        platform: PushPlatform,
    ) -> Result<(), MarketError> {
        if token.trim().is_empty() {
            return Err(MarketError::validation("push token must not be empty"));
        }
        let row = PushTokenRow {
            user_id: user_id.to_string(),
            token: token.to_string(),
            enabled,
            platform: platform.as_str().to_string(),
            updated_at: now(),
        };
        blocking(&self.db, move |db| db.upsert_push_token(&row)).await
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<PushToken>, MarketError> {
        let uid = user_id.to_string();
        let row = blocking(&self.db, move |db| db.get_push_token(&uid)).await?;
        row.map(PushTokenRow::into_push_token).transpose().map_err(MarketError::Store)
    }

    /// The token, but only while push is enabled.
    pub async fn enabled_token(&self, user_id: &str) -> Result<Option<String>, MarketError> {
        Ok(self
            .get(user_id)
            .await?
            .filter(|t| t.enabled && !t.token.is_empty())
            .map(|t| t.token))
    }

    pub async fn settings(&self, user_id: &str) -> Result<PushSettings, MarketError> {
        Ok(match self.get(user_id).await? {
            Some(t) => PushSettings {
                has_token: !t.token.is_empty(),
                enabled: t.enabled,
                token: Some(t.token),
            },
            None => PushSettings {
                token: None,
                enabled: false,
                has_token: false,
            },
        })
    }

    /// Flips push on or off. Returns the resulting enabled state.
    ///
    /// Without a usable token, or when the platform permission is no longer
    /// granted, the acquisition path runs again instead of flipping the flag.
    pub async fn toggle(&self, user_id: &str, source: &dyn TokenSource) -> Result<bool, MarketError> {
        let permission = source.permission();
        if permission == PermissionState::Denied {
            info!("Push permission denied for {}, leaving settings untouched", user_id);
            return Ok(false);
        }

        let current = self.get(user_id).await?;
        match current {
            Some(t) if permission == PermissionState::Granted && !t.token.is_empty() => {
                let enabled = !t.enabled;
                self.save(user_id, &t.token, enabled, t.platform).await?;
                Ok(enabled)
            }
            _ => match source.acquire_token().await {
                Some(token) => {
                    self.save(user_id, &token, true, source.platform()).await?;
                    Ok(true)
                }
                None => {
                    warn!("Could not acquire a push token for {}", user_id);
                    Ok(false)
                }
            },
        }
    }
}

// -- Handlers --

pub async fn get_settings(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.push_tokens.settings(&session.user_id).await?))
}

pub async fn save_token(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<SavePushTokenRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .push_tokens
        .save(&session.user_id, &req.token, req.enabled, req.platform)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<TogglePushRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = ReportedTokenSource {
        permission: req.permission,
        token: req.token,
        platform: req.platform,
    };
    let enabled = state.push_tokens.toggle(&session.user_id, &source).await?;
    Ok(Json(ToggleResponse { enabled }))
}
