use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Lowest accepted listing price, in yen.
    pub min_price: i64,
    /// Base for links placed in email bodies.
    pub app_url: String,
    pub email_endpoint: Option<String>,
    pub email_api_key: Option<String>,
    pub email_from: String,
    pub fcm_credentials: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("TEXTMATCH_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("TEXTMATCH_JWT_SECRET is unset or still a placeholder; it must match the identity provider's secret");
        }

        let port = match var("TEXTMATCH_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid TEXTMATCH_PORT '{}'", raw))?,
            None => 3000,
        };
        let min_price = match var("TEXTMATCH_MIN_PRICE") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid TEXTMATCH_MIN_PRICE '{}'", raw))?,
            None => 100,
        };

        Ok(Self {
            host: var("TEXTMATCH_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("TEXTMATCH_DB_PATH").unwrap_or_else(|| "textmatch.db".into()).into(),
            jwt_secret,
            min_price,
            app_url: var("TEXTMATCH_APP_URL")
                .unwrap_or_else(|| "https://textmatch.com".into())
                .trim_end_matches('/')
                .to_string(),
            email_endpoint: var("TEXTMATCH_EMAIL_ENDPOINT"),
            email_api_key: var("TEXTMATCH_EMAIL_API_KEY"),
            email_from: var("TEXTMATCH_EMAIL_FROM").unwrap_or_else(|| "noreply@textmatch.com".into()),
            fcm_credentials: var("TEXTMATCH_FCM_CREDENTIALS").map(PathBuf::from),
        })
    }
}
