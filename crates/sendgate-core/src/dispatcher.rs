//! Send dispatcher (spec §4.6, C7).
//!
//! Single-process loop: find the next ready job, lease it, consult the
//! approval registry and the policy gate, call the provider, classify the
//! outcome, reschedule or terminate. Only one dispatcher is meant to run
//! per state directory at a time — see `sendgate_lock::DispatcherLock`.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use sendgate_types::{ErrorCode, Event, EventType, JobStatus};

use crate::provider::{MailProvider, SendOutcome};
use crate::{Reporter, SendGateContext, call_with_deadline, new_event_id, sent_today_count};

/// Result of a single dispatcher iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sending is disabled (policy gate or kill switch), or no job is ready.
    Idle,
    /// The job's approval token was missing or already consumed.
    ApprovalRejected { job_id: String },
    /// The policy gate denied the send for this recipient.
    GateDenied { job_id: String, reason: String },
    /// The provider accepted the send.
    Sent { job_id: String, message_id: String },
    /// The provider call failed with a retryable error; requeued.
    Retrying { job_id: String, error_code: ErrorCode, backoff: Duration },
    /// The provider call failed terminally, or retries were exhausted.
    DeadLettered { job_id: String, error_code: ErrorCode },
    /// A provider call exceeded its deadline. The job is left exactly as
    /// leased (`in_progress`); the reaper will eventually reclaim it.
    TimedOut { job_id: String },
}

/// Run one dispatcher iteration. Returns `Idle` without touching storage if
/// sending is disabled or no job is ready.
pub fn run_once(
    ctx: &mut SendGateContext,
    provider: &Arc<dyn MailProvider>,
    reporter: &mut dyn Reporter,
) -> Result<DispatchOutcome> {
    if !ctx.is_sending_enabled()? {
        return Ok(DispatchOutcome::Idle);
    }

    let now = Utc::now();
    let Some(mut job) = ctx.queue.find_next_ready_job(now).cloned() else {
        return Ok(DispatchOutcome::Idle);
    };

    reporter.info(&format!("leasing job {}", job.job_id));

    // Step 3: atomically transition queued -> in_progress.
    job.status = JobStatus::InProgress;
    job.in_progress_started_at = Some(now);
    job.last_updated_at = now;
    ctx.queue.save(job.clone()).context("failed to lease job")?;

    // Step 4: consult the approval registry.
    let approval = ctx.approvals.get_by_fingerprint(&job.approval_fingerprint).cloned();
    let approval = match approval {
        Some(record) if !record.consumed => record,
        _ => {
            reporter.warn(&format!("job {} has no usable approval, failing", job.job_id));
            job.status = JobStatus::Failed;
            job.in_progress_started_at = None;
            job.last_error_code = Some(ErrorCode::Policy);
            job.last_updated_at = Utc::now();
            ctx.queue.save(job.clone())?;
            return Ok(DispatchOutcome::ApprovalRejected { job_id: job.job_id });
        }
    };

    // Step 5: evaluate the policy gate against the recipient, resolved
    // out-of-band and never persisted.
    let recipient = {
        let provider = Arc::clone(provider);
        let draft_id = job.draft_id.clone();
        let Some(recipient) =
            call_with_deadline(ctx.provider_deadline, move || provider.recipient_for_draft(&draft_id))?
        else {
            reporter.warn(&format!("job {} timed out resolving its recipient, leaving in_progress", job.job_id));
            return Ok(DispatchOutcome::TimedOut { job_id: job.job_id });
        };
        recipient.context("failed to resolve recipient for draft")?
    };
    let today = Utc::now().date_naive();
    let today_sent = sent_today_count(&ctx.queue, today);
    let decision = ctx.policy.check_send_permission(&recipient, today_sent);

    if let sendgate_types::GateDecision::Denied { reason, details } = decision {
        reporter.warn(&format!("job {} blocked by policy gate: {details}", job.job_id));

        let mut event = Event::new(new_event_id("blocked"), EventType::AutoSendBlocked, job.tracking_id.clone());
        event.company_id = job.company_id.clone();
        event.template_id = job.template_id.clone();
        event.ab_variant = job.ab_variant;
        let event = event.with_meta("reason", reason.to_string()).with_meta("details", details);
        ctx.ledger.append(event).context("failed to append AUTO_SEND_BLOCKED event")?;

        job.status = JobStatus::Failed;
        job.in_progress_started_at = None;
        job.last_error_code = Some(ErrorCode::Gate);
        job.last_updated_at = Utc::now();
        ctx.queue.save(job.clone())?;
        return Ok(DispatchOutcome::GateDenied { job_id: job.job_id, reason: reason.to_string() });
    }

    let mut attempt_event =
        Event::new(new_event_id("attempt"), EventType::AutoSendAttempt, job.tracking_id.clone());
    attempt_event.company_id = job.company_id.clone();
    attempt_event.template_id = job.template_id.clone();
    attempt_event.ab_variant = job.ab_variant;
    ctx.ledger.append(attempt_event).context("failed to append AUTO_SEND_ATTEMPT event")?;

    // Step 6: call the provider and classify the outcome.
    let send_result = {
        let provider = Arc::clone(provider);
        let draft_id = job.draft_id.clone();
        let Some(result) = call_with_deadline(ctx.provider_deadline, move || provider.send(&draft_id))? else {
            reporter.warn(&format!("job {} timed out waiting on the provider, leaving in_progress", job.job_id));
            return Ok(DispatchOutcome::TimedOut { job_id: job.job_id });
        };
        result.context("provider send call failed")?
    };

    match send_result {
        SendOutcome::Success { message_id, thread_id } => {
            job.status = JobStatus::Sent;
            job.message_id = Some(message_id.clone());
            job.thread_id = Some(thread_id);
            job.sent_at = Some(Utc::now());
            job.in_progress_started_at = None;
            job.last_updated_at = Utc::now();
            ctx.queue.save(job.clone())?;

            let mut success_event =
                Event::new(new_event_id("success"), EventType::AutoSendSuccess, job.tracking_id.clone());
            success_event.company_id = job.company_id.clone();
            success_event.template_id = job.template_id.clone();
            success_event.ab_variant = job.ab_variant;
            let success_event = success_event.with_meta("message_id", &message_id);
            ctx.ledger.append(success_event).context("failed to append AUTO_SEND_SUCCESS event")?;

            ctx.approvals
                .consume_by_fingerprint(&approval.fingerprint)
                .context("failed to burn approval token after send")?;

            reporter.info(&format!("job {} sent as {message_id}", job.job_id));
            Ok(DispatchOutcome::Sent { job_id: job.job_id, message_id })
        }
        SendOutcome::Error(code) => {
            let next_attempt_count = job.attempts + 1;
            let retry_decision = sendgate_retry::next_attempt(&ctx.retry_policy, code, next_attempt_count);

            job.attempts = next_attempt_count;
            job.last_error_code = Some(code);
            job.in_progress_started_at = None;
            job.last_updated_at = Utc::now();

            if retry_decision.terminal {
                job.status = JobStatus::DeadLetter;
                ctx.queue.save(job.clone())?;
                reporter.warn(&format!("job {} dead-lettered with {code}", job.job_id));
                Ok(DispatchOutcome::DeadLettered { job_id: job.job_id, error_code: code })
            } else {
                job.status = JobStatus::Queued;
                job.next_attempt_at = Utc::now() + chrono::Duration::from_std(retry_decision.backoff)
                    .unwrap_or(chrono::Duration::zero());
                ctx.queue.save(job.clone())?;
                reporter.warn(&format!("job {} requeued after {code}", job.job_id));
                Ok(DispatchOutcome::Retrying { job_id: job.job_id, error_code: code, backoff: retry_decision.backoff })
            }
        }
    }
}

/// Run the dispatcher continuously, sleeping `tick` between idle
/// iterations, until `should_stop` returns true. Mirrors the teacher's
/// periodic-task idiom of a plain `std::thread::sleep` loop rather than a
/// real async runtime.
pub fn run_loop(
    ctx: &mut SendGateContext,
    provider: &Arc<dyn MailProvider>,
    reporter: &mut dyn Reporter,
    tick: Duration,
    should_stop: &dyn Fn() -> bool,
) -> Result<()> {
    while !should_stop() {
        match run_once(ctx, provider, reporter)? {
            DispatchOutcome::Idle => sleep(tick),
            _ => {}
        }
    }
    Ok(())
}
