//! Gmail-side reconciler (spec §4.8, C9).
//!
//! For each audited draft, probe the provider for a confirmed sent message
//! and a confirmed reply, and fill in the ledger. Idempotency comes from
//! the ledger's `(tracking_id, event_type)` index: re-running over the same
//! provider state appends nothing new.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use sendgate_types::{Event, EventType};

use crate::provider::{AuditSource, MailProvider};
use crate::{Reporter, SendGateContext, call_with_deadline, new_event_id};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub sent_detected: u32,
    pub reply_detected: u32,
    /// Provider calls that exceeded the deadline this tick. Left for the
    /// next `run_once` to retry; never counted as a failure.
    pub timed_out: u32,
}

pub fn run_once(
    ctx: &mut SendGateContext,
    provider: &Arc<dyn MailProvider>,
    audit: &Arc<dyn AuditSource>,
    reporter: &mut dyn Reporter,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for draft in audit.audited_drafts().context("failed to read audited drafts")? {
        if !ctx.ledger.has_event(&draft.tracking_id, EventType::SentDetected) {
            let sent = {
                let provider = Arc::clone(provider);
                let tracking_id = draft.tracking_id.clone();
                match call_with_deadline(ctx.provider_deadline, move || provider.search_sent(&tracking_id))? {
                    Some(result) => result
                        .with_context(|| format!("failed to search sent mail for {}", draft.tracking_id))?,
                    None => {
                        reporter.warn(&format!("search_sent timed out for {}", draft.tracking_id));
                        summary.timed_out += 1;
                        None
                    }
                }
            };
            if let Some(sent) = sent {
                let mut event =
                    Event::new(new_event_id("sent-detected"), EventType::SentDetected, draft.tracking_id.clone());
                event.company_id = draft.company_id.clone();
                event.template_id = draft.template_id.clone();
                event.ab_variant = draft.ab_variant;
                let event = event.with_meta("thread_id", &sent.thread_id).with_meta("sent_at", sent.sent_at);
                ctx.ledger.append(event).context("failed to append SENT_DETECTED event")?;
                summary.sent_detected += 1;
                reporter.info(&format!("SENT_DETECTED recorded for {}", draft.tracking_id));
            }
        }

        if !ctx.ledger.has_event(&draft.tracking_id, EventType::ReplyDetected) {
            let reply = {
                let provider = Arc::clone(provider);
                let tracking_id = draft.tracking_id.clone();
                match call_with_deadline(ctx.provider_deadline, move || provider.search_inbox_replies(&tracking_id))?
                {
                    Some(result) => {
                        result.with_context(|| format!("failed to search replies for {}", draft.tracking_id))?
                    }
                    None => {
                        reporter.warn(&format!("search_inbox_replies timed out for {}", draft.tracking_id));
                        summary.timed_out += 1;
                        None
                    }
                }
            };
            if let Some(reply) = reply {
                let sent_at = ctx
                    .ledger
                    .events_for_tracking_id(&draft.tracking_id)
                    .into_iter()
                    .find(|e| e.event_type == EventType::SentDetected)
                    .and_then(|e| e.meta.get("sent_at"))
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v.clone()).ok())
                    .unwrap_or(draft.created_at);

                let latency_hours = (reply.reply_at - sent_at).num_minutes() as f64 / 60.0;

                let mut event =
                    Event::new(new_event_id("reply-detected"), EventType::ReplyDetected, draft.tracking_id.clone());
                event.company_id = draft.company_id.clone();
                event.template_id = draft.template_id.clone();
                event.ab_variant = draft.ab_variant;
                let event = event
                    .with_meta("thread_id", &reply.thread_id)
                    .with_meta("reply_at", reply.reply_at)
                    .with_meta("latency_hours", latency_hours);
                ctx.ledger.append(event).context("failed to append REPLY_DETECTED event")?;
                summary.reply_detected += 1;
                reporter.info(&format!("REPLY_DETECTED recorded for {}", draft.tracking_id));
            }
        }
    }

    Ok(summary)
}
