//! Outbound email over SMTP via lettre, plus an in-memory outbox.
//!
//! Destinations are not known ahead of time (replies go to whoever sent the
//! receipt), so the send grant covers any mailbox.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::access::{AccessPolicy, Permission, Principal, Resource};
use crate::error::NotifyError;

/// A single outbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-ID of the email being replied to, if any.
    pub in_reply_to: Option<String>,
}

/// Sends email.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError>;
}

// ── SMTP ────────────────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `INTAKE_SMTP_HOST` is not set (SMTP disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("INTAKE_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("INTAKE_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("INTAKE_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("INTAKE_SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("INTAKE_SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

/// SMTP mailer. Sends on a blocking thread.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

fn send_failed(reason: String) -> NotifyError {
    NotifyError::SendFailed { reason }
}

/// Build the lettre message for an outbound email.
fn build_message(from: &str, email: &OutboundEmail) -> Result<Message, NotifyError> {
    let mut builder = Message::builder()
        .from(
            from.parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(email
            .to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(email.subject.clone());

    if let Some(ref id) = email.in_reply_to {
        let id = if id.starts_with('<') {
            id.clone()
        } else {
            format!("<{id}>")
        };
        builder = builder.in_reply_to(id.clone()).references(id);
    }

    builder
        .body(email.body.clone())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError> {
        let message = build_message(&self.config.from_address, email)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            );
            let transport = SmtpTransport::relay(&config.host)
                .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
                .port(config.port)
                .credentials(creds)
                .build();
            transport
                .send(&message)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
            Ok::<(), NotifyError>(())
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;

        info!(to = %email.to, subject = %email.subject, "Email sent");
        Ok(())
    }
}

// ── Outbox ──────────────────────────────────────────────────────────

/// Mailer that records messages instead of sending them.
#[derive(Default)]
pub struct Outbox {
    sent: RwLock<Vec<OutboundEmail>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Mailer for Outbox {
    async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError> {
        info!(to = %email.to, subject = %email.subject, "Email recorded in outbox");
        self.sent.write().await.push(email.clone());
        Ok(())
    }
}

// ── Scoped handle ───────────────────────────────────────────────────

/// A mailer seen through one principal's grants.
#[derive(Clone)]
pub struct MailerHandle {
    mailer: Arc<dyn Mailer>,
    policy: Arc<AccessPolicy>,
    principal: Principal,
}

impl MailerHandle {
    pub fn new(mailer: Arc<dyn Mailer>, policy: Arc<AccessPolicy>, principal: Principal) -> Self {
        Self {
            mailer,
            policy,
            principal,
        }
    }

    pub async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError> {
        self.policy.authorize(
            self.principal,
            Permission::EmailSend,
            &Resource::Mailbox(&email.to),
        )?;
        self.mailer.send(email).await
    }
}
