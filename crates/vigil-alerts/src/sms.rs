use async_trait::async_trait;
use tokio::time::Duration;
use tracing::info;
use vigil_types::{config::SmsConfig, events::AlertEvent};

use crate::{AlertChannel, AlertError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Text message through the Twilio Messages REST API.
pub struct SmsChannel {
    client: reqwest::Client,
    endpoint: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    to_number: String,
    cooldown: Duration,
}

impl SmsChannel {
    /// `None` unless the account, token and both numbers are set.
    pub fn from_config(config: &SmsConfig) -> Option<Self> {
        let account_sid = non_empty(&config.account_sid)?;
        let auth_token = non_empty(&config.auth_token)?;
        let from_number = non_empty(&config.from_number)?;
        let to_number = non_empty(&config.to_number)?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;

        Some(Self {
            client,
            endpoint: messages_endpoint(&config.api_base, &account_sid),
            account_sid,
            auth_token,
            from_number,
            to_number,
            cooldown: Duration::from_secs(config.cooldown_secs),
        })
    }
}

#[async_trait]
impl AlertChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn fire(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let body = message_body(&event.subject_name);
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", self.to_number.as_str()),
                ("From", self.from_number.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlertError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(to = %self.to_number, "Intruder alert SMS accepted");
        Ok(())
    }
}

fn message_body(subject_name: &str) -> String {
    format!("ALERT: {subject_name} detected at your location!")
}

fn messages_endpoint(api_base: &str, account_sid: &str) -> String {
    format!(
        "{}/2010-04-01/Accounts/{account_sid}/Messages.json",
        api_base.trim_end_matches('/')
    )
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
