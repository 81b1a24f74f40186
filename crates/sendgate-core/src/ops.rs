//! Operator command surface (spec §4.12, C13).
//!
//! Every verb writes an audit trail entry: `stop-send`/`resume-send` append
//! a ledger event directly; `approve-send` records through the approval
//! registry and (on execution) the queue store.

use anyhow::{Context, Result, bail};
use chrono::Utc;

use sendgate_types::{AbVariant, Event, EventType, ExperimentRegistry, ExperimentStatus, JobStatus, KillSwitchState, SendJob};

use crate::{SendGateContext, new_event_id};

/// Placeholder tracking id for ledger events that are not tied to a
/// specific send (ops verbs act on the system, not on one job).
const SYSTEM_TRACKING_ID: &str = "system";

pub fn stop_send(ctx: &mut SendGateContext, reason: &str, set_by: &str) -> Result<()> {
    ctx.kill_switch.set_enabled(reason, set_by).context("failed to engage kill switch")?;
    let event = Event::new(new_event_id("stop-send"), EventType::OpsStopSend, SYSTEM_TRACKING_ID)
        .with_meta("reason", reason)
        .with_meta("set_by", set_by);
    ctx.ledger.append(event).context("failed to append OPS_STOP_SEND event")
}

pub fn resume_send(ctx: &mut SendGateContext, reason: &str, set_by: &str) -> Result<()> {
    ctx.kill_switch.set_disabled(reason, set_by).context("failed to release kill switch")?;
    let event = Event::new(new_event_id("resume-send"), EventType::OpsResumeSend, SYSTEM_TRACKING_ID)
        .with_meta("reason", reason)
        .with_meta("set_by", set_by);
    ctx.ledger.append(event).context("failed to append OPS_RESUME_SEND event")
}

pub fn stop_status(ctx: &SendGateContext) -> Result<Option<KillSwitchState>> {
    ctx.kill_switch.current_state()
}

/// Pause the named experiment and, if `also_stop_send`, engage the runtime
/// kill switch too (`stop_send`'s own event covers that half of the audit
/// trail).
pub fn rollback(
    ctx: &mut SendGateContext,
    registry: &mut ExperimentRegistry,
    experiment_id: &str,
    reason: &str,
    set_by: &str,
    also_stop_send: bool,
) -> Result<()> {
    let experiment = registry
        .experiments
        .iter_mut()
        .find(|e| e.experiment_id == experiment_id)
        .ok_or_else(|| anyhow::anyhow!("no experiment with id {experiment_id}"))?;
    experiment.status = ExperimentStatus::Paused;

    if also_stop_send {
        stop_send(ctx, reason, set_by)?;
    }

    Ok(())
}

/// Outcome of `approve_send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApproveSendOutcome {
    /// Phase 1: a token was minted and handed back to the operator.
    TokenCreated { token: String },
    /// Phase 2: the token was bound to a freshly enqueued job.
    Enqueued { job_id: String },
}

/// New job identifiers are `job-` followed by 12 random hex chars (spec §3
/// "SendJob" — "prefix + random 12-hex").
fn new_job_id() -> String {
    format!("job-{}", &sendgate_auth::generate_token()[..12])
}

#[allow(clippy::too_many_arguments)]
pub fn approve_send(
    ctx: &mut SendGateContext,
    draft_id: &str,
    approved_by: &str,
    reason: &str,
    ticket: Option<String>,
    execute: bool,
    to: Option<&str>,
    tracking_id: &str,
    company_id: &str,
    template_id: &str,
    ab_variant: Option<AbVariant>,
) -> Result<ApproveSendOutcome> {
    let token = ctx
        .approvals
        .create_approval(draft_id, approved_by, reason, ticket)
        .context("failed to create approval")?;

    if !execute {
        return Ok(ApproveSendOutcome::TokenCreated { token });
    }

    let to = to.ok_or_else(|| anyhow::anyhow!("execute requires a recipient address for the new job"))?;
    let to_domain = to.rsplit_once('@').map(|(_, domain)| domain.to_string()).ok_or_else(|| {
        anyhow::anyhow!("recipient {to} is not a valid email address")
    })?;

    if ctx.queue.find_by_draft_id(draft_id).is_some() {
        bail!("draft {draft_id} is already enqueued");
    }

    let now = Utc::now();
    let job = SendJob {
        job_id: new_job_id(),
        created_at: now,
        status: JobStatus::Queued,
        draft_id: draft_id.to_string(),
        tracking_id: tracking_id.to_string(),
        company_id: company_id.to_string(),
        template_id: template_id.to_string(),
        ab_variant,
        to_domain,
        approval_fingerprint: sendgate_auth::fingerprint(&token),
        attempts: 0,
        next_attempt_at: now,
        in_progress_started_at: None,
        last_error_code: None,
        last_error_message_hash: None,
        last_updated_at: now,
        message_id: None,
        thread_id: None,
        sent_at: None,
        cancel_reason: None,
        cancelled_by: None,
    };

    let job_id = job.job_id.clone();
    ctx.queue.save(job).context("failed to enqueue approved job")?;
    Ok(ApproveSendOutcome::Enqueued { job_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendgate_types::{DecisionRule, ExperimentConfig, RollbackRule, TemplateArm, TemplateStatus};

    fn context(td: &tempfile::TempDir) -> SendGateContext {
        SendGateContext::open(td.path(), sendgate_policy::PolicyConfig::default(), sendgate_retry::RetryPolicy::default())
            .expect("open ctx")
    }

    #[test]
    fn stop_then_resume_round_trips_kill_switch_and_emits_events() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(&td);

        stop_send(&mut ctx, "manual stop", "alice").expect("stop");
        assert!(ctx.kill_switch.is_enabled().expect("enabled"));

        resume_send(&mut ctx, "all clear", "alice").expect("resume");
        assert!(!ctx.kill_switch.is_enabled().expect("disabled"));

        let events: Vec<_> = ctx.ledger.all_events().iter().map(|e| e.event_type).collect();
        assert!(events.contains(&EventType::OpsStopSend));
        assert!(events.contains(&EventType::OpsResumeSend));
    }

    #[test]
    fn approve_send_phase_one_only_mints_a_token() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(&td);

        let outcome = approve_send(
            &mut ctx, "draft-1", "alice", "customer asked", None, false, None, "trk-1", "co-1", "tmpl-1", None,
        )
        .expect("approve");
        assert!(matches!(outcome, ApproveSendOutcome::TokenCreated { .. }));
        assert!(ctx.queue.is_empty());
    }

    #[test]
    fn approve_send_execute_enqueues_a_job_bound_to_the_token() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(&td);

        let outcome = approve_send(
            &mut ctx,
            "draft-1",
            "alice",
            "customer asked",
            None,
            true,
            Some("person@example.com"),
            "trk-1",
            "co-1",
            "tmpl-1",
            None,
        )
        .expect("approve");

        let job_id = match outcome {
            ApproveSendOutcome::Enqueued { job_id } => job_id,
            other => panic!("expected Enqueued, got {other:?}"),
        };
        let job = ctx.queue.get(&job_id).expect("job present");
        assert_eq!(job.to_domain, "example.com");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(ctx.approvals.get_by_fingerprint(&job.approval_fingerprint).is_some());
    }

    #[test]
    fn rollback_pauses_experiment_and_optionally_stops_send() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(&td);
        let mut registry = ExperimentRegistry {
            experiments: vec![ExperimentConfig {
                experiment_id: "exp-1".to_string(),
                status: ExperimentStatus::Running,
                start_at: Utc::now(),
                templates: vec![TemplateArm {
                    template_id: "tmpl-a".to_string(),
                    variant: AbVariant::A,
                    status: TemplateStatus::Active,
                }],
                decision_rule: DecisionRule { alpha: 0.05, min_lift: 0.1 },
                min_sent_per_variant: 30,
                rollback_rule: RollbackRule { min_sent_total: 30, max_days_no_reply: 7, min_reply_rate: 0.02 },
                freeze_on_low_n: true,
            }],
        };

        rollback(&mut ctx, &mut registry, "exp-1", "stale replies", "alice", true).expect("rollback");
        assert_eq!(registry.experiments[0].status, ExperimentStatus::Paused);
        assert!(ctx.kill_switch.is_enabled().expect("enabled"));
    }
}
