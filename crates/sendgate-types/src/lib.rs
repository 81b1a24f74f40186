//! Shared domain types for the sendgate outbound-send control plane.
//!
//! This crate defines the data that crosses crate boundaries: ledger
//! events, send-queue jobs, approval records, experiment configuration,
//! and the error/reason taxonomies the rest of the workspace classifies
//! outcomes into. Nothing here touches a filesystem or a network socket;
//! see `sendgate-events`, `sendgate-queue`, and `sendgate-core` for that.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A/B arm a send or template belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AbVariant {
    A,
    B,
}

/// Stable, machine-comparable error classification for a failed send
/// attempt. Classification is the dispatcher's job (see `sendgate-core`);
/// this enum is the only place provider-specific status codes are
/// supposed to enter the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Gmail429,
    Gmail5xx,
    Gmail400,
    Auth,
    Policy,
    Gate,
    NotFound,
    Unknown,
}

impl ErrorCode {
    /// Errors that are never retried, regardless of attempt count.
    pub fn is_terminal_on_first_occurrence(self) -> bool {
        matches!(
            self,
            ErrorCode::Gmail400 | ErrorCode::Auth | ErrorCode::Policy | ErrorCode::Gate | ErrorCode::NotFound
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Gmail429 => "gmail_429",
            ErrorCode::Gmail5xx => "gmail_5xx",
            ErrorCode::Gmail400 => "gmail_400",
            ErrorCode::Auth => "auth",
            ErrorCode::Policy => "policy",
            ErrorCode::Gate => "gate",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Ledger event kind. Two of these participate in idempotency keying by
/// `(tracking_id, event_type)`: `SentDetected` and `ReplyDetected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DraftCreated,
    AutoSendAttempt,
    AutoSendSuccess,
    AutoSendBlocked,
    SentDetected,
    ReplyDetected,
    OpsStopSend,
    OpsResumeSend,
}

impl EventType {
    /// The two event types the ledger enforces at-most-once-per-tracking-id for.
    pub fn is_idempotency_keyed(self) -> bool {
        matches!(self, EventType::SentDetected | EventType::ReplyDetected)
    }
}

/// Immutable, append-only ledger record (spec §3 "Event").
///
/// `meta` is a serialized bag of event-specific attributes. It is kept as
/// `serde_json::Value` rather than a closed enum so that forward-written
/// events (from a newer build) round-trip through an older reader without
/// losing fields — the "dynamic `meta` bag" design note from the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub tracking_id: String,
    pub company_id: String,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_variant: Option<AbVariant>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_id: impl Into<String>, event_type: EventType, tracking_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: Utc::now(),
            event_type,
            tracking_id: tracking_id.into(),
            company_id: String::new(),
            template_id: String::new(),
            ab_variant: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.meta.insert(key.into(), v);
        }
        self
    }
}

/// Status of a `SendJob`. Transitions are monotone per the FSM in spec §4.2:
/// `queued -> in_progress -> {sent | failed | cancelled}`;
/// `failed -> queued` (retry) or `failed -> dead_letter` (terminal);
/// `in_progress -> queued` (reap) or `in_progress -> dead_letter` (reap + exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Sent,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::DeadLetter | JobStatus::Cancelled)
    }
}

/// A durable unit of outbound-send work (spec §3 "SendJob").
///
/// PII is deliberately thin: `to_domain` carries only the recipient's
/// domain, never a full address, and `approval_fingerprint` is a hash
/// prefix, never the approval token itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendJob {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub draft_id: String,
    pub tracking_id: String,
    pub company_id: String,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_variant: Option<AbVariant>,
    pub to_domain: String,
    pub approval_fingerprint: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message_hash: Option<String>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
}

impl SendJob {
    /// `in_progress_started_at` must be set iff status is `InProgress` —
    /// spec §8 invariant 2.
    pub fn invariant_holds(&self) -> bool {
        (self.status == JobStatus::InProgress) == self.in_progress_started_at.is_some()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.next_attempt_at <= now
    }
}

/// Binds a one-shot approval token to a specific draft (spec §3 "ApprovalRecord").
/// The raw token is never part of this type — only its first-8-hex-of-SHA-256
/// fingerprint, computed by `sendgate-auth`, is ever persisted anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub fingerprint: String,
    pub draft_id: String,
    pub approved_by: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

/// Status of a template-experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Active,
    Paused,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateArm {
    pub template_id: String,
    pub variant: AbVariant,
    pub status: TemplateStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRule {
    pub alpha: f64,
    pub min_lift: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRule {
    pub min_sent_total: u64,
    pub max_days_no_reply: i64,
    pub min_reply_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    pub start_at: DateTime<Utc>,
    pub templates: Vec<TemplateArm>,
    pub decision_rule: DecisionRule,
    pub min_sent_per_variant: u64,
    pub rollback_rule: RollbackRule,
    #[serde(default = "default_true")]
    pub freeze_on_low_n: bool,
}

fn default_true() -> bool {
    true
}

/// Registry file shape for `experiments.json` (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentRegistry {
    #[serde(default)]
    pub experiments: Vec<ExperimentConfig>,
}

/// Persisted shape of `runtime_kill_switch.json` (spec §3 "KillSwitchState").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub enabled: bool,
    pub reason: String,
    pub set_by: String,
    pub set_at: DateTime<Utc>,
}

/// Configuration for the auto-stop controller (spec §3 "AutoStopConfig").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoStopConfig {
    pub window_days: i64,
    pub min_sent_total: u64,
    pub reply_rate_min: f64,
    pub blocked_rate_max: f64,
    pub consecutive_days: u32,
}

impl Default for AutoStopConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            min_sent_total: 30,
            reply_rate_min: 0.02,
            blocked_rate_max: 0.2,
            consecutive_days: 2,
        }
    }
}

/// Reason a send was denied by the policy gate (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDenialReason {
    NotEnabled,
    KillSwitch,
    NotInAllowlist,
    DailyLimitReached,
}

impl std::fmt::Display for GateDenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateDenialReason::NotEnabled => "not_enabled",
            GateDenialReason::KillSwitch => "kill_switch",
            GateDenialReason::NotInAllowlist => "not_in_allowlist",
            GateDenialReason::DailyLimitReached => "daily_limit_reached",
        };
        f.write_str(s)
    }
}

/// Outcome of a `check_send_permission` query (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied { reason: GateDenialReason, details: String },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

/// Recommendation from the experiment safety check (spec §4.10).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    Ok,
    FreezeRecommended,
    RollbackRecommended,
    ReviewRecommended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub action: SafetyAction,
    pub reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_invariant_requires_in_progress_timestamp() {
        let mut job = sample_job();
        job.status = JobStatus::InProgress;
        job.in_progress_started_at = None;
        assert!(!job.invariant_holds());

        job.in_progress_started_at = Some(Utc::now());
        assert!(job.invariant_holds());
    }

    #[test]
    fn terminal_error_codes_never_retry() {
        assert!(ErrorCode::Gmail400.is_terminal_on_first_occurrence());
        assert!(ErrorCode::Auth.is_terminal_on_first_occurrence());
        assert!(ErrorCode::Policy.is_terminal_on_first_occurrence());
        assert!(ErrorCode::Gate.is_terminal_on_first_occurrence());
        assert!(ErrorCode::NotFound.is_terminal_on_first_occurrence());
        assert!(!ErrorCode::Gmail429.is_terminal_on_first_occurrence());
        assert!(!ErrorCode::Gmail5xx.is_terminal_on_first_occurrence());
        assert!(!ErrorCode::Unknown.is_terminal_on_first_occurrence());
    }

    #[test]
    fn event_type_idempotency_keying() {
        assert!(EventType::SentDetected.is_idempotency_keyed());
        assert!(EventType::ReplyDetected.is_idempotency_keyed());
        assert!(!EventType::DraftCreated.is_idempotency_keyed());
        assert!(!EventType::AutoSendAttempt.is_idempotency_keyed());
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::new("evt-1", EventType::AutoSendSuccess, "trk-1").with_meta("message_id", "M1");
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event_id, "evt-1");
        assert_eq!(back.meta.get("message_id").unwrap(), "M1");
    }

    #[test]
    fn job_status_terminal_set() {
        assert!(JobStatus::Sent.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    fn sample_job() -> SendJob {
        SendJob {
            job_id: "job-1".to_string(),
            created_at: Utc::now(),
            status: JobStatus::Queued,
            draft_id: "draft-1".to_string(),
            tracking_id: "trk-1".to_string(),
            company_id: "co-1".to_string(),
            template_id: "tmpl-1".to_string(),
            ab_variant: Some(AbVariant::A),
            to_domain: "example.com".to_string(),
            approval_fingerprint: "deadbeef".to_string(),
            attempts: 0,
            next_attempt_at: Utc::now(),
            in_progress_started_at: None,
            last_error_code: None,
            last_error_message_hash: None,
            last_updated_at: Utc::now(),
            message_id: None,
            thread_id: None,
            sent_at: None,
            cancel_reason: None,
            cancelled_by: None,
        }
    }
}
