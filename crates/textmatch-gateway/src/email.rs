use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use textmatch_types::error::DeliveryError;

/// One outgoing email: `{to, subject, body}` with an optional HTML rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

/// Writes the email to the log instead of sending it. Used when no relay is configured.
pub struct LogEmailGateway;

#[async_trait]
impl EmailGateway for LogEmailGateway {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        info!("Email (not sent) to {}: {}", message.to, message.subject);
        Ok(())
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

/// Posts emails as JSON to an HTTP relay authenticated with a bearer key.
pub struct HttpEmailGateway {
    endpoint: String,
    api_key: Option<String>,
    from: String,
    http: reqwest::Client,
}

impl HttpEmailGateway {
    pub fn new(endpoint: String, api_key: Option<String>, from: String) -> Self {
        Self {
            endpoint,
            api_key,
            from,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmailGateway for HttpEmailGateway {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        let body = RelayRequest {
            from: &self.from,
            to: &message.to,
            subject: &message.subject,
            text: &message.text,
            html: message.html.as_deref().unwrap_or(&message.text),
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Email(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DeliveryError::Email(format!("relay returned {}", response.status())));
        }
        Ok(())
    }
}
