use textmatch_types::api::Claims;
use textmatch_types::error::MarketError;
use textmatch_types::models::Role;

/// Who is acting. Passed explicitly into every service call.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Role,
}

impl Session {
    pub fn user(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            email: None,
            role: Role::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Fails before anything is read or written.
    pub fn require_admin(&self) -> Result<(), MarketError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(MarketError::unauthorized("administrator role required"))
        }
    }
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            display_name: claims.name,
            email: claims.email,
            role: claims.role,
        }
    }
}
