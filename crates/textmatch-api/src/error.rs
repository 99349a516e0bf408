use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use textmatch_types::error::MarketError;

/// HTTP face of [`MarketError`].
#[derive(Debug)]
pub struct ApiError(pub MarketError);

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            MarketError::Validation(_) => StatusCode::BAD_REQUEST,
            MarketError::NotFound { .. } => StatusCode::NOT_FOUND,
            MarketError::Authorization(_) => StatusCode::FORBIDDEN,
            MarketError::Delivery(_) => StatusCode::BAD_GATEWAY,
            MarketError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            MarketError::Store(e) => {
                error!("Store failure: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases = [
            (MarketError::validation("bad"), StatusCode::BAD_REQUEST),
            (MarketError::not_found("listing", "x"), StatusCode::NOT_FOUND),
            (MarketError::unauthorized("no"), StatusCode::FORBIDDEN),
            (MarketError::Store(anyhow::anyhow!("disk")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
