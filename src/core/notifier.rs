// src/core/notifier.rs

//! Report delivery. The SMTP channel does the sending; the dispatcher owns the
//! retry discipline and makes sure a report that could not be delivered surfaces as
//! an error instead of being dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::retry::sleep_with_cancellation;

pub const REPORT_SUBJECT: &str = "DNS-BLM Scanning Results";
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mail settings: {0}")]
    InvalidSettings(String),
    #[error("invalid mailbox {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("refusing to send an empty notification")]
    EmptyBody,
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("notification cancelled")]
    Cancelled,
}

/// SMTP connection and sender settings.
#[derive(Clone)]
pub struct MailSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
    pub enable_ssl: bool,
}

impl std::fmt::Debug for MailSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("enable_ssl", &self.enable_ssl)
            .finish()
    }
}

impl MailSettings {
    /// Checks the settings before the first connection attempt.
    pub fn validate(&self) -> Result<(), NotifyError> {
        let required = [
            ("host", &self.host),
            ("username", &self.username),
            ("password", &self.password),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(NotifyError::InvalidSettings(format!("{field} must not be empty")));
            }
        }
        if self.port == 0 {
            return Err(NotifyError::InvalidSettings("port must be positive".to_string()));
        }
        parse_mailbox(&self.from)?;
        parse_mailbox(&self.to)?;
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .trim()
        .parse()
        .map_err(|source| NotifyError::InvalidAddress {
            address: address.to_string(),
            source,
        })
}

/// A way of getting a report in front of the operator.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Delivers HTML reports by e-mail.
pub struct SmtpChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpChannel {
    pub fn new(settings: &MailSettings) -> Result<Self, NotifyError> {
        settings.validate()?;

        let credentials = Credentials::new(settings.username.clone(), settings.password.clone());
        let builder = if !settings.enable_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        } else if settings.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
        };
        let transport = builder.port(settings.port).credentials(credentials).build();

        Ok(Self {
            transport,
            from: parse_mailbox(&settings.from)?,
            to: parse_mailbox(&settings.to)?,
        })
    }
}

#[async_trait]
impl NotificationChannel for SmtpChannel {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Sends notifications with a fixed attempt budget and linear backoff.
pub struct NotificationDispatcher {
    channel: Arc<dyn NotificationChannel>,
    max_attempts: usize,
    backoff_step: Duration,
}

impl NotificationDispatcher {
    pub const DEFAULT_ATTEMPTS: usize = 3;
    pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(1);

    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            channel,
            max_attempts: Self::DEFAULT_ATTEMPTS,
            backoff_step: Self::DEFAULT_BACKOFF_STEP,
        }
    }

    pub fn with_attempts(mut self, max_attempts: usize, backoff_step: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_step = backoff_step;
        self
    }

    /// Delivers `body`, retrying failed sends.
    ///
    /// Waits `backoff_step * n` after the n-th failure. The error of the last attempt
    /// is returned once the budget is spent.
    pub async fn notify(
        &self,
        subject: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<(), NotifyError> {
        if body.trim().is_empty() {
            return Err(NotifyError::EmptyBody);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.channel.send(subject, body).await {
                Ok(()) => {
                    info!(subject, attempt, "Notification delivered.");
                    return Ok(());
                }
                Err(err) if attempt >= self.max_attempts => {
                    error!(subject, attempt, error = %err, "Notification delivery failed; giving up.");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff_step.saturating_mul(attempt as u32);
                    warn!(
                        subject,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Notification delivery failed; retrying."
                    );
                    sleep_with_cancellation::<NotifyError>(delay, Some(cancel))
                        .await
                        .map_err(|_| NotifyError::Cancelled)?;
                    debug!(subject, attempt = attempt + 1, "Retrying notification.");
                }
            }
        }
    }
}
