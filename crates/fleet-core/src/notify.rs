//! Slack notifications for garbage-collection reports.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

const SLACK_API: &str = "https://slack.com/api";

/// Posts messages to one Slack channel with a bot token.
#[derive(Clone)]
pub struct SlackNotifier {
    token: String,
    channel: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    pub fn new(token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            channel: channel.into(),
            base_url: SLACK_API.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the notifier at another API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn post(&self, text: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(&self.token)
            .json(&PostMessage {
                channel: &self.channel,
                text,
            })
            .send()
            .await?
            .error_for_status()?;

        // Slack reports most failures as 200 with `ok: false`.
        let body: SlackResponse = resp.json().await?;
        if !body.ok {
            return Err(Error::InvalidInput(format!(
                "slack rejected message: {}",
                body.error.as_deref().unwrap_or("unknown error")
            )));
        }
        debug!(channel = %self.channel, "slack: message posted");
        Ok(())
    }
}
