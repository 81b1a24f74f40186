//! Gmail and CRM HTTP adapters (peripheral; spec §1, §6 "Provider contract").
//!
//! Thin wrappers in the same spirit as `sendgate-webhook`'s `SlackWebhook`:
//! one `reqwest::blocking::Client` per call, one wire shape in, one
//! `sendgate_core` type out. No retry or backoff lives here — that's the
//! dispatcher's job; these adapters only classify what the API told them.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use sendgate_config::{CrmCredentials, MailProviderCredentials};
use sendgate_core::provider::{AuditSource, AuditedDraft, MailProvider, ReplyRecord, SendOutcome, SentRecord};
use sendgate_types::ErrorCode;

fn default_timeout() -> u64 {
    30
}

fn client(timeout_secs: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to create HTTP client")
}

fn classify_status(status: reqwest::StatusCode) -> ErrorCode {
    match status.as_u16() {
        429 => ErrorCode::Gmail429,
        401 | 403 => ErrorCode::Auth,
        404 => ErrorCode::NotFound,
        400..=499 => ErrorCode::Gmail400,
        500..=599 => ErrorCode::Gmail5xx,
        _ => ErrorCode::Unknown,
    }
}

/// Exchanges a refresh token for a short-lived Gmail API access token on
/// every call. No caching: a token good for one request is cheap enough at
/// this volume, and it sidesteps expiry bookkeeping entirely.
fn access_token(credentials: &MailProviderCredentials, timeout_secs: u64) -> Result<String> {
    let client_id = credentials.client_id.as_deref().context("missing GMAIL_CLIENT_ID")?;
    let client_secret = credentials.client_secret.as_deref().context("missing GMAIL_CLIENT_SECRET")?;
    let refresh_token = credentials.refresh_token.as_deref().context("missing GMAIL_REFRESH_TOKEN")?;

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }

    let response = client(timeout_secs)?
        .post("https://oauth2.googleapis.com/token")
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .context("failed to reach the Gmail token endpoint")?;

    if !response.status().is_success() {
        return Err(anyhow!("Gmail token refresh failed with status {}", response.status()));
    }

    Ok(response.json::<TokenResponse>().context("malformed token response")?.access_token)
}

/// Implements `MailProvider` against the real Gmail API.
pub struct HttpMailProvider {
    credentials: MailProviderCredentials,
    timeout_secs: u64,
}

impl HttpMailProvider {
    pub fn new(credentials: MailProviderCredentials) -> Self {
        Self { credentials, timeout_secs: default_timeout() }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn authed_client(&self) -> Result<(reqwest::blocking::Client, String)> {
        let token = access_token(&self.credentials, self.timeout_secs)?;
        Ok((client(self.timeout_secs)?, token))
    }

    fn search(&self, query: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        #[derive(Deserialize)]
        struct Message {
            id: String,
            #[serde(rename = "internalDate")]
            internal_date: String,
        }
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            messages: Vec<Message>,
        }

        let (client, token) = self.authed_client()?;
        let response = client
            .get("https://gmail.googleapis.com/gmail/v1/users/me/messages")
            .bearer_auth(token)
            .query(&[("q", query)])
            .send()
            .context("failed to reach the Gmail API")?;

        if !response.status().is_success() {
            return Err(anyhow!("Gmail search failed with status {}", response.status()));
        }

        let parsed: ListResponse = response.json().context("malformed Gmail search response")?;
        let Some(first) = parsed.messages.into_iter().next() else { return Ok(None) };

        let millis: i64 = first.internal_date.parse().context("malformed internalDate")?;
        let at = DateTime::from_timestamp_millis(millis).context("internalDate out of range")?;
        Ok(Some((first.id, at)))
    }
}

impl MailProvider for HttpMailProvider {
    fn recipient_for_draft(&self, draft_id: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Draft {
            message: DraftMessage,
        }
        #[derive(Deserialize)]
        struct DraftMessage {
            #[serde(rename = "payload")]
            payload: DraftPayload,
        }
        #[derive(Deserialize)]
        struct DraftPayload {
            headers: Vec<Header>,
        }
        #[derive(Deserialize)]
        struct Header {
            name: String,
            value: String,
        }

        let (client, token) = self.authed_client()?;
        let response = client
            .get(format!("https://gmail.googleapis.com/gmail/v1/users/me/drafts/{draft_id}"))
            .bearer_auth(token)
            .query(&[("format", "metadata")])
            .send()
            .context("failed to reach the Gmail API")?;

        if !response.status().is_success() {
            return Err(anyhow!("fetching draft {draft_id} failed with status {}", response.status()));
        }

        let draft: Draft = response.json().context("malformed draft response")?;
        draft
            .message
            .payload
            .headers
            .into_iter()
            .find(|h| h.name.eq_ignore_ascii_case("To"))
            .map(|h| h.value)
            .context("draft has no To header")
    }

    fn send(&self, draft_id: &str) -> Result<SendOutcome> {
        #[derive(Deserialize)]
        struct SendResponse {
            id: String,
            #[serde(rename = "threadId")]
            thread_id: String,
        }

        let (client, token) = self.authed_client()?;
        let response = client
            .post("https://gmail.googleapis.com/gmail/v1/users/me/drafts/send")
            .bearer_auth(token)
            .json(&serde_json::json!({ "id": draft_id }))
            .send()
            .context("failed to reach the Gmail API")?;

        let status = response.status();
        if !status.is_success() {
            return Ok(SendOutcome::Error(classify_status(status)));
        }

        let sent: SendResponse = response.json().context("malformed send response")?;
        Ok(SendOutcome::Success { message_id: sent.id, thread_id: sent.thread_id })
    }

    fn search_sent(&self, tracking_id: &str) -> Result<Option<SentRecord>> {
        Ok(self
            .search(&format!("in:sent \"{tracking_id}\""))?
            .map(|(thread_id, sent_at)| SentRecord { thread_id, sent_at }))
    }

    fn search_inbox_replies(&self, tracking_id: &str) -> Result<Option<ReplyRecord>> {
        Ok(self
            .search(&format!("in:inbox \"{tracking_id}\""))?
            .map(|(thread_id, reply_at)| ReplyRecord { thread_id, reply_at }))
    }
}

/// Implements `AuditSource` against the CRM's audited-drafts feed.
pub struct HttpAuditSource {
    base_url: String,
    credentials: CrmCredentials,
    timeout_secs: u64,
}

impl HttpAuditSource {
    pub fn new(base_url: impl Into<String>, credentials: CrmCredentials) -> Self {
        Self { base_url: base_url.into(), credentials, timeout_secs: default_timeout() }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn session_token(&self) -> Result<String> {
        if let Some(token) = &self.credentials.session_token {
            return Ok(token.clone());
        }

        let email = self.credentials.login_email.as_deref().context("missing CRM_SESSION_TOKEN or CRM_LOGIN_EMAIL")?;
        let password = self.credentials.login_password.as_deref().context("missing CRM_LOGIN_PASSWORD")?;

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }

        let response = client(self.timeout_secs)?
            .post(format!("{}/login", self.base_url))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .context("failed to reach the CRM login endpoint")?;

        if !response.status().is_success() {
            return Err(anyhow!("CRM login failed with status {}", response.status()));
        }

        Ok(response.json::<LoginResponse>().context("malformed CRM login response")?.token)
    }
}

impl AuditSource for HttpAuditSource {
    fn audited_drafts(&self) -> Result<Vec<AuditedDraft>> {
        #[derive(Deserialize)]
        struct WireDraft {
            draft_id: String,
            tracking_id: String,
            company_id: String,
            template_id: String,
            ab_variant: Option<sendgate_types::AbVariant>,
            created_at: DateTime<Utc>,
        }

        let token = self.session_token()?;
        let response = client(self.timeout_secs)?
            .get(format!("{}/audited-drafts", self.base_url))
            .bearer_auth(token)
            .send()
            .context("failed to reach the CRM")?;

        if !response.status().is_success() {
            return Err(anyhow!("CRM audited-drafts query failed with status {}", response.status()));
        }

        let drafts: Vec<WireDraft> = response.json().context("malformed audited-drafts response")?;
        Ok(drafts
            .into_iter()
            .map(|d| AuditedDraft {
                draft_id: d.draft_id,
                tracking_id: d.tracking_id,
                company_id: d.company_id,
                template_id: d.template_id,
                ab_variant: d.ab_variant,
                created_at: d.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_gmail_status_codes() {
        assert_eq!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS), ErrorCode::Gmail429);
        assert_eq!(classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR), ErrorCode::Gmail5xx);
        assert_eq!(classify_status(reqwest::StatusCode::BAD_REQUEST), ErrorCode::Gmail400);
        assert_eq!(classify_status(reqwest::StatusCode::UNAUTHORIZED), ErrorCode::Auth);
        assert_eq!(classify_status(reqwest::StatusCode::NOT_FOUND), ErrorCode::NotFound);
    }

    #[test]
    fn http_mail_provider_defaults_to_thirty_second_timeout() {
        let provider = HttpMailProvider::new(MailProviderCredentials::default());
        assert_eq!(provider.timeout_secs, 30);
    }

    #[test]
    fn http_audit_source_prefers_session_token_over_login() {
        let creds = CrmCredentials {
            session_token: Some("tok-123".to_string()),
            login_email: Some("someone@example.com".to_string()),
            login_password: Some("hunter2".to_string()),
        };
        let source = HttpAuditSource::new("https://crm.example.com", creds);
        assert_eq!(source.session_token().expect("token"), "tok-123");
    }
}
