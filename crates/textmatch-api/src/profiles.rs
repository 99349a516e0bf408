use std::sync::Arc;

use axum::{Extension, Json, extract::State, response::IntoResponse};
use tracing::warn;

use textmatch_db::models::ProfileRow;
use textmatch_db::{Database, now};
use textmatch_types::error::MarketError;
use textmatch_types::models::Profile;

use crate::error::ApiResult;
use crate::session::Session;
use crate::state::{AppState, blocking};

/// Caches who the caller is so other participants can be addressed by name and email.
pub async fn remember(db: &Arc<Database>, session: &Session) -> Result<Profile, MarketError> {
    let row = ProfileRow {
        user_id: session.user_id.clone(),
        display_name: session.display_name.clone(),
        email: session.email.clone(),
        updated_at: now(),
    };
    blocking(db, move |db| {
        db.upsert_profile(&row)?;
        Ok(row.into_profile())
    })
    .await
}

/// Last known display name of a user; `None` if unknown or the lookup failed.
pub(crate) async fn display_name(db: &Arc<Database>, user_id: &str) -> Option<String> {
    let uid = user_id.to_string();
    match blocking(db, move |db| db.get_profile(&uid)).await {
        Ok(profile) => profile.map(|p| p.display_name).filter(|n| !n.trim().is_empty()),
        Err(e) => {
            warn!("Profile lookup for {} failed: {}", user_id, e);
            None
        }
    }
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(remember(&state.db, &session).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remember_then_look_up() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        assert_eq!(display_name(&db, "u1").await, None);

        let mut session = Session::user("u1", "Taro");
        session.email = Some("taro@example.ac.jp".into());
        let profile = remember(&db, &session).await.unwrap();
        assert_eq!(profile.email.as_deref(), Some("taro@example.ac.jp"));
        assert_eq!(display_name(&db, "u1").await.as_deref(), Some("Taro"));

        // A later token without email keeps the address on file.
        let profile = remember(&db, &Session::user("u1", "Taro Y")).await.unwrap();
        assert_eq!(profile.display_name, "Taro Y");
        let stored = db.get_profile("u1").unwrap().unwrap();
        assert_eq!(stored.email.as_deref(), Some("taro@example.ac.jp"));
    }
}
