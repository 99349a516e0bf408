use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use textmatch_types::api::Claims;

use crate::session::Session;
use crate::state::AppState;

/// Validates a token issued by the identity provider.
pub fn decode_session(token: &str, secret: &str) -> Option<Session> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| Session::from(data.claims))
}

/// Extract and validate JWT from Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let session = decode_session(token, &state.jwt_secret).ok_or(StatusCode::UNAUTHORIZED)?;
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}
