//! Trait seams for the peripheral collaborators the core depends on but
//! does not implement: the mail-provider client and the external audit log
//! of draft creations (spec §1 "Out of scope", §6 "Provider contract").
//!
//! Concrete implementations (a real Gmail client, a CRM-backed audit feed)
//! live outside this crate. Tests use stub implementations of both traits.

use anyhow::Result;
use chrono::{DateTime, Utc};

use sendgate_types::{AbVariant, ErrorCode};

/// A provider-confirmed sent message, surfaced by `search_sent`.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub thread_id: String,
    pub sent_at: DateTime<Utc>,
}

/// A provider-confirmed reply, surfaced by `search_inbox_replies`.
#[derive(Debug, Clone)]
pub struct ReplyRecord {
    pub thread_id: String,
    pub reply_at: DateTime<Utc>,
}

/// Outcome of a `send` call, already classified into the stable error
/// taxonomy (spec §4.6 step 6, §7). No body bytes or status-code details
/// cross this boundary — classification is the provider adapter's job.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Success { message_id: String, thread_id: String },
    Error(ErrorCode),
}

/// The mail-provider client (out of scope; §1 calls it a "peripheral").
/// The core only ever calls these four methods. `Send + Sync` so a handle
/// can be shared as `Arc<dyn MailProvider>` across the deadline-enforcing
/// background task in `call_with_deadline`.
pub trait MailProvider: Send + Sync {
    /// Resolve the full recipient address for a draft, out-of-band, for the
    /// duration of a single policy check. Never cached, never persisted —
    /// `SendJob` only ever carries `to_domain` (spec §7 "never persist: full
    /// email address").
    fn recipient_for_draft(&self, draft_id: &str) -> Result<String>;

    fn send(&self, draft_id: &str) -> Result<SendOutcome>;

    fn search_sent(&self, tracking_id: &str) -> Result<Option<SentRecord>>;

    fn search_inbox_replies(&self, tracking_id: &str) -> Result<Option<ReplyRecord>>;
}

/// A draft the reconciler should probe the provider about (spec §4.8).
/// Sourced from the external CRM audit log — tracking_id-bearing, never a
/// full recipient address.
#[derive(Debug, Clone)]
pub struct AuditedDraft {
    pub draft_id: String,
    pub tracking_id: String,
    pub company_id: String,
    pub template_id: String,
    pub ab_variant: Option<AbVariant>,
    pub created_at: DateTime<Utc>,
}

/// The external audit log of draft creations (out of scope; §4.8 "Inputs").
pub trait AuditSource: Send + Sync {
    fn audited_drafts(&self) -> Result<Vec<AuditedDraft>>;
}
