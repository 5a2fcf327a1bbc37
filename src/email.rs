//! Outbound email. Fire-and-forget from the core's point of view: a delivery
//! failure is logged and reported, never retried here.

use crate::error::AppError;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_set_password_email(
        &self,
        recipient: &str,
        username: &str,
        reset_token: &str,
    ) -> Result<(), AppError>;
}

/// Posts the message as JSON to a relay endpoint.
pub struct HttpMailer {
    http: reqwest::Client,
    endpoint: String,
    from: String,
    public_url: String,
}

impl HttpMailer {
    pub fn new(endpoint: String, from: String, public_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            from,
            public_url,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send_set_password_email(
        &self,
        recipient: &str,
        username: &str,
        reset_token: &str,
    ) -> Result<(), AppError> {
        let link = format!(
            "{}/set-password?email={}&token={}",
            self.public_url, recipient, reset_token
        );
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "from": self.from,
                "to": recipient,
                "subject": "Set your password",
                "body": format!(
                    "Dear {},\n\nUse the link below to set your password. \
                     It is valid for one hour.\n\n{}\n",
                    username, link
                ),
            }))
            .send()
            .await
            .map_err(|e| AppError::Email(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::Email(format!(
                "relay responded {}",
                response.status()
            )));
        }
        info!("set-password email sent to {}", recipient);
        Ok(())
    }
}

/// Logs instead of sending. Used in tests and when email is disabled.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send_set_password_email(
        &self,
        recipient: &str,
        _username: &str,
        _reset_token: &str,
    ) -> Result<(), AppError> {
        info!("email delivery disabled; skipping message to {}", recipient);
        Ok(())
    }
}
