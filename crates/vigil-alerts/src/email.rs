//! Email alert with the intruder snapshot attached, over implicit-TLS SMTP.

use std::path::Path;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tokio::time::Duration;
use tracing::info;
use vigil_types::{config::EmailConfig, events::AlertEvent};

use crate::{AlertChannel, AlertError};

pub const EMAIL_SUBJECT: &str = "INTRUDER ALERT! - Unauthorized Person Detected";
const EMAIL_BODY: &str =
    "An unauthorized person was detected by your security system. An image is attached.";

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Email build error: {0}")]
    Build(String),

    #[error("Attachment read error: {0}")]
    Attachment(#[from] std::io::Error),
}

pub struct EmailChannel {
    smtp_host: String,
    smtp_port: u16,
    username: String,
    password: String,
    recipient: String,
    cooldown: Duration,
}

impl EmailChannel {
    /// `None` unless the username, password and recipient are all set.
    pub fn from_config(config: &EmailConfig) -> Option<Self> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            smtp_host: config.smtp_host.clone(),
            smtp_port: config.smtp_port,
            username: present(&config.username)?,
            password: present(&config.password)?,
            recipient: present(&config.recipient)?,
            cooldown: Duration::from_secs(config.cooldown_secs),
        })
    }

    async fn build_message(&self, image_path: &Path) -> Result<Message, EmailError> {
        let from: Mailbox = self.username.parse()?;
        let to: Mailbox = self.recipient.parse()?;
        let image = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "intruder.jpg".to_string());
        let content_type =
            ContentType::parse("image/jpeg").map_err(|err| EmailError::Build(err.to_string()))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(EMAIL_SUBJECT)
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(EMAIL_BODY.to_string()))
                    .singlepart(Attachment::new(file_name).body(image, content_type)),
            )
            .map_err(|err| EmailError::Build(err.to_string()))
    }

    async fn send(&self, image_path: &Path) -> Result<(), EmailError> {
        let message = self.build_message(image_path).await?;
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.smtp_host)?
            .port(self.smtp_port)
            .credentials(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ))
            .build();
        mailer.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn fire(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let Some(image_path) = &event.image_path else {
            info!("No intruder image captured, skipping email alert");
            return Ok(());
        };
        self.send(image_path).await?;
        info!(to = %self.recipient, image = ?image_path, "Email alert sent");
        Ok(())
    }
}
