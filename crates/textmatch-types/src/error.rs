use thiserror::Error;

/// Failures surfaced by marketplace operations.
#[derive(Error, Debug)]
pub enum MarketError {
    /// Bad state transition, missing field, price below minimum.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Raised before any mutation happens.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Only produced by the delivery gateways; callers of primary actions never see it.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl MarketError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }
}

/// Push / email side-channel failures.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("push gateway: {0}")]
    Push(String),

    #[error("email gateway: {0}")]
    Email(String),

    #[error("failed to obtain gateway credentials: {0}")]
    Credentials(String),
}
