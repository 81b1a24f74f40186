//! Cooperative driver for the dispatcher, reaper, reconciler, and auto-stop
//! loops (spec §4.6, §5). This is the one place all four periodic tasks are
//! actually ticked from; everything else in this crate only ever runs a
//! single pass, driven by a test or by this loop.
//!
//! Holds `sendgate_lock::DispatcherLock` for its whole lifetime, enforcing
//! spec §4.6's "only one dispatcher runs per process" on top of the
//! single-process assumption: the lock also rejects a second `run` call
//! against the same state directory, in-process or out.

use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use sendgate_config::ReaperConfig;
use sendgate_lock::DispatcherLock;
use sendgate_types::AutoStopConfig;

use crate::provider::{AuditSource, MailProvider};
use crate::{Reporter, SendGateContext, autostop, dispatcher, reaper, reconciler};

/// Tick cadence for the three background sweeps; the dispatcher itself
/// runs every iteration and only sleeps `dispatch_tick` when idle.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub dispatch_tick: Duration,
    pub reap_every: Duration,
    pub reconcile_every: Duration,
    pub autostop_every: Duration,
    pub reaper: ReaperConfig,
    pub autostop: AutoStopConfig,
}

/// Run every periodic task until `should_stop` returns true, acquiring the
/// dispatcher exclusivity lock up front and holding it for the duration.
/// Returns an error immediately, before doing any work, if another process
/// already holds the lock.
pub fn run(
    ctx: &mut SendGateContext,
    provider: &Arc<dyn MailProvider>,
    audit: &Arc<dyn AuditSource>,
    reporter: &mut dyn Reporter,
    config: &ServeConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<()> {
    let _lock = DispatcherLock::acquire(&ctx.state_dir)
        .context("failed to acquire dispatcher lock; is another instance already running?")?;
    reporter.info("dispatcher lock acquired, entering serve loop");

    let mut last_reap = Instant::now() - config.reap_every;
    let mut last_reconcile = Instant::now() - config.reconcile_every;
    let mut last_autostop = Instant::now() - config.autostop_every;

    while !should_stop() {
        let outcome = dispatcher::run_once(ctx, provider, reporter)?;

        if last_reap.elapsed() >= config.reap_every {
            reaper::run_once(ctx, config.reaper.stale_minutes, config.reaper.max_attempts, reporter)?;
            last_reap = Instant::now();
        }
        if last_reconcile.elapsed() >= config.reconcile_every {
            reconciler::run_once(ctx, provider, audit, reporter)?;
            last_reconcile = Instant::now();
        }
        if last_autostop.elapsed() >= config.autostop_every {
            autostop::run_once(ctx, &config.autostop, reporter)?;
            last_autostop = Instant::now();
        }

        if matches!(outcome, dispatcher::DispatchOutcome::Idle) {
            sleep(config.dispatch_tick);
        }
    }

    reporter.info("serve loop stopped, releasing dispatcher lock");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullReporter;
    use crate::provider::{AuditedDraft, ReplyRecord, SendOutcome, SentRecord};
    use sendgate_types::{AbVariant, JobStatus, SendJob};
    use std::cell::Cell;

    struct StubProvider;

    impl MailProvider for StubProvider {
        fn recipient_for_draft(&self, _draft_id: &str) -> Result<String> {
            Ok("person@example.com".to_string())
        }
        fn send(&self, _draft_id: &str) -> Result<SendOutcome> {
            Ok(SendOutcome::Success { message_id: "M1".to_string(), thread_id: "T1".to_string() })
        }
        fn search_sent(&self, _tracking_id: &str) -> Result<Option<SentRecord>> {
            Ok(None)
        }
        fn search_inbox_replies(&self, _tracking_id: &str) -> Result<Option<ReplyRecord>> {
            Ok(None)
        }
    }

    struct StubAudit;

    impl AuditSource for StubAudit {
        fn audited_drafts(&self) -> Result<Vec<AuditedDraft>> {
            Ok(vec![])
        }
    }

    fn enabled_context(td: &tempfile::TempDir) -> SendGateContext {
        let policy = sendgate_policy::PolicyConfig {
            env_kill_switch: false,
            enable_auto_send: true,
            allowlist_domains: vec!["example.com".to_string()],
            allowlist_emails: vec![],
            max_per_day: 100,
        };
        SendGateContext::open(td.path(), policy, sendgate_retry::RetryPolicy::default()).expect("open ctx")
    }

    fn sample_job(job_id: &str, fingerprint: &str) -> SendJob {
        let now = chrono::Utc::now();
        SendJob {
            job_id: job_id.to_string(),
            created_at: now,
            status: JobStatus::Queued,
            draft_id: "draft-1".to_string(),
            tracking_id: "trk-1".to_string(),
            company_id: "co-1".to_string(),
            template_id: "tmpl-1".to_string(),
            ab_variant: Some(AbVariant::A),
            to_domain: "example.com".to_string(),
            approval_fingerprint: fingerprint.to_string(),
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
        }
    }

    fn test_serve_config() -> ServeConfig {
        ServeConfig {
            dispatch_tick: Duration::from_millis(1),
            reap_every: Duration::from_secs(3600),
            reconcile_every: Duration::from_secs(3600),
            autostop_every: Duration::from_secs(3600),
            reaper: ReaperConfig::default(),
            autostop: AutoStopConfig { window_days: 7, min_sent_total: 30, reply_rate_min: 0.02, blocked_rate_max: 0.2, consecutive_days: 2 },
        }
    }

    #[test]
    fn serve_drains_the_queue_and_stops_on_demand() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctx = enabled_context(&td);
        let token = ctx.approvals.create_approval("draft-1", "alice", "reason", None).expect("create approval");
        let fp = sendgate_auth::fingerprint(&token);
        ctx.queue.save(sample_job("job-1", &fp)).expect("save job");

        let provider: Arc<dyn MailProvider> = Arc::new(StubProvider);
        let audit: Arc<dyn AuditSource> = Arc::new(StubAudit);

        let iterations = Cell::new(0u32);
        let should_stop = || {
            let n = iterations.get() + 1;
            iterations.set(n);
            ctx.queue.get("job-1").map(|j| j.status) != Some(JobStatus::Queued) || n > 1000
        };

        run(&mut ctx, &provider, &audit, &mut NullReporter, &test_serve_config(), &should_stop)
            .expect("serve run");

        assert_eq!(ctx.queue.get("job-1").unwrap().status, JobStatus::Sent);
    }

    #[test]
    fn serve_rejects_a_second_concurrent_run_against_the_same_state_dir() {
        let td = tempfile::tempdir().expect("tempdir");
        let _held = DispatcherLock::acquire(td.path()).expect("acquire");

        let mut ctx = enabled_context(&td);
        let provider: Arc<dyn MailProvider> = Arc::new(StubProvider);
        let audit: Arc<dyn AuditSource> = Arc::new(StubAudit);

        let result = run(&mut ctx, &provider, &audit, &mut NullReporter, &test_serve_config(), &|| true);
        assert!(result.is_err(), "serve must refuse to run while the lock is already held");
    }
}
