use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use textmatch_types::error::DeliveryError;

/// One push delivery: `{token, title, body, data}`.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    /// String-valued payload; FCM rejects nested data.
    pub data: HashMap<String, String>,
}

/// External push delivery. Failures are opaque beyond success/failure.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), DeliveryError>;
}

/// Used when no push credentials are configured.
pub struct NoopPushGateway;

#[async_trait]
impl PushGateway for NoopPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<(), DeliveryError> {
        debug!("Push disabled, dropping '{}'", message.title);
        Ok(())
    }
}

// -- FCM HTTP v1 --

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'static str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: i64,
}

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Sends through Firebase Cloud Messaging with a service-account OAuth token.
pub struct FcmPushGateway {
    credentials: ServiceAccountKey,
    http: reqwest::Client,
    token_cache: Mutex<Option<CachedToken>>,
}

impl FcmPushGateway {
    pub fn new(credentials: ServiceAccountKey) -> Self {
        Self {
            credentials,
            http: reqwest::Client::new(),
            token_cache: Mutex::new(None),
        }
    }

    /// Loads a service-account JSON file.
    pub fn from_file(path: &Path) -> Result<Self, DeliveryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DeliveryError::Credentials(format!("{}: {}", path.display(), e)))?;
        let credentials: ServiceAccountKey =
            serde_json::from_str(&raw).map_err(|e| DeliveryError::Credentials(e.to_string()))?;
        info!("FCM push enabled for project {}", credentials.project_id);
        Ok(Self::new(credentials))
    }

    fn cached_token(&self) -> Option<String> {
        let cache = self.token_cache.lock().ok()?;
        let cached = cache.as_ref()?;
        // Keep a minute of slack so a token never expires mid-request.
        (cached.expires_at > Utc::now().timestamp() + 60).then(|| cached.access_token.clone())
    }

    async fn access_token(&self) -> Result<String, DeliveryError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.credentials.client_email,
            sub: &self.credentials.client_email,
            scope: FCM_SCOPE,
            aud: &self.credentials.token_uri,
            exp: (now + Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
        };
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .map_err(|e| DeliveryError::Credentials(format!("bad private key: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| DeliveryError::Credentials(format!("failed to sign assertion: {}", e)))?;

        let response = self
            .http
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DeliveryError::Credentials(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DeliveryError::Credentials(format!(
                "token exchange returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Credentials(e.to_string()))?;

        if let Ok(mut cache) = self.token_cache.lock() {
            *cache = Some(CachedToken {
                access_token: token.access_token.clone(),
                expires_at: Utc::now().timestamp() + token.expires_in,
            });
        }
        Ok(token.access_token)
    }
}

/// Request body for `messages:send`.
fn fcm_body(message: &PushMessage) -> serde_json::Value {
    let link = message
        .data
        .get("actionUrl")
        .map(String::as_str)
        .unwrap_or("/notifications");

    serde_json::json!({
        "message": {
            "token": message.token,
            "notification": { "title": message.title, "body": message.body },
            "data": message.data,
            "webpush": {
                "fcm_options": { "link": link },
                "notification": { "icon": "/logo.png", "badge": "/logo.png" },
            },
        }
    })
}

#[async_trait]
impl PushGateway for FcmPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<(), DeliveryError> {
        let access_token = self.access_token().await?;
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.credentials.project_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&fcm_body(message))
            .send()
            .await
            .map_err(|e| DeliveryError::Push(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Push(format!("FCM returned {}: {}", status, detail)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_links_to_action_url() {
        let mut data = HashMap::new();
        data.insert("actionUrl".to_string(), "/messages/abc".to_string());
        let body = fcm_body(&PushMessage {
            token: "tok".into(),
            title: "t".into(),
            body: "b".into(),
            data,
        });
        assert_eq!(body["message"]["token"], "tok");
        assert_eq!(body["message"]["webpush"]["fcm_options"]["link"], "/messages/abc");
        assert_eq!(body["message"]["data"]["actionUrl"], "/messages/abc");
    }

    #[test]
    fn body_falls_back_to_notifications_page() {
        let body = fcm_body(&PushMessage {
            token: "tok".into(),
            title: "t".into(),
            body: "b".into(),
            data: HashMap::new(),
        });
        assert_eq!(body["message"]["webpush"]["fcm_options"]["link"], "/notifications");
    }

    #[test]
    fn service_account_defaults_token_uri() {
        let key: ServiceAccountKey = serde_json::from_str(
            r#"{"project_id":"p","private_key":"k","client_email":"svc@p.iam.gserviceaccount.com"}"#,
        )
        .unwrap();
        assert_eq!(key.token_uri, "https://oauth2.googleapis.com/token");
    }
}
