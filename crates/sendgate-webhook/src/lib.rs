//! Slack notifications for sendgate ops events (peripheral; spec §1, §6
//! `SLACK_WEBHOOK_URL`).
//!
//! The core never depends on a webhook succeeding — a failed notification
//! is logged and swallowed by the caller, never allowed to block a send or
//! an ops verb.
//!
//! # Example
//!
//! ```ignore
//! use sendgate_webhook::{SlackWebhook, stop_send_payload};
//!
//! let webhook = SlackWebhook::new("https://hooks.slack.com/services/...".to_string());
//! webhook.send(&stop_send_payload("kill switch engaged", "operator")).expect("send");
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

fn default_timeout() -> u64 {
    30
}

/// Slack incoming-webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackWebhook {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl SlackWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), timeout_secs: default_timeout() }
    }
}

/// Content for a Slack notification. `success` colors the attachment green
/// or red; `fields` render as Slack attachment fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackPayload {
    pub title: String,
    pub message: String,
    pub success: bool,
    #[serde(default)]
    pub fields: Vec<(String, String)>,
}

impl SlackWebhook {
    pub fn send(&self, payload: &SlackPayload) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .context("failed to create HTTP client")?;

        let body = slack_body(payload)?;

        let response = client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .context("failed to send Slack webhook request")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Slack webhook failed with status {}: {}",
                response.status(),
                response.text().unwrap_or_default()
            ));
        }

        Ok(())
    }
}

fn slack_body(payload: &SlackPayload) -> Result<String> {
    let color = if payload.success { "good" } else { "danger" };

    let fields: Vec<_> = payload
        .fields
        .iter()
        .map(|(title, value)| json!({ "title": title, "value": value, "short": true }))
        .collect();

    let slack_json = json!({
        "attachments": [{
            "color": color,
            "title": payload.title,
            "text": payload.message,
            "fields": fields,
        }]
    });

    Ok(serde_json::to_string(&slack_json)?)
}

pub fn stop_send_payload(reason: &str, set_by: &str) -> SlackPayload {
    SlackPayload {
        title: "Send stopped".to_string(),
        message: reason.to_string(),
        success: false,
        fields: vec![("set_by".to_string(), set_by.to_string())],
    }
}

pub fn resume_send_payload(reason: &str, set_by: &str) -> SlackPayload {
    SlackPayload {
        title: "Send resumed".to_string(),
        message: reason.to_string(),
        success: true,
        fields: vec![("set_by".to_string(), set_by.to_string())],
    }
}

pub fn rollback_payload(experiment_id: &str, reason: &str) -> SlackPayload {
    SlackPayload {
        title: "Experiment rollback".to_string(),
        message: reason.to_string(),
        success: false,
        fields: vec![("experiment_id".to_string(), experiment_id.to_string())],
    }
}
