//! Transactional email delivery
//!
//! JSON POST against an external delivery provider. Like Stripe, the
//! provider may be unconfigured on self-hosted deployments; sends then fail
//! with `NotConfigured` and the caller decides whether that is fatal.

use std::time::Duration;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};

/// Email provider configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("EMAIL_API_URL").unwrap_or_default(),
            api_key: std::env::var("EMAIL_API_KEY").unwrap_or_default(),
            from_address: std::env::var("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|_| "hello@glimpse.com".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Transactional email sender.
#[derive(Clone)]
pub struct EmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_url.is_empty() && !self.config.api_key.is_empty()
    }

    /// Send a plain-text email. Delivery failures surface as
    /// `BillingError::Email` so job runners leave the job unprocessed and
    /// retry later.
    pub async fn send(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        if !self.is_configured() {
            return Err(BillingError::NotConfigured(
                "EMAIL_API_URL / EMAIL_API_KEY are not set",
            ));
        }

        let message = OutboundMessage {
            from: &self.config.from_address,
            to,
            subject,
            text: body,
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!("HTTP {}: {}", status, body)));
        }

        tracing::debug!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_sender_is_not_configured() {
        let service = EmailService::new(EmailConfig {
            api_url: String::new(),
            api_key: String::new(),
            from_address: "hello@glimpse.com".to_string(),
        })
        .unwrap();
        assert!(!service.is_configured());
    }

    #[test]
    fn test_partially_configured_sender_is_not_configured() {
        let service = EmailService::new(EmailConfig {
            api_url: "https://mail.example.com/send".to_string(),
            api_key: String::new(),
            from_address: "hello@glimpse.com".to_string(),
        })
        .unwrap();
        assert!(!service.is_configured());
    }
}
