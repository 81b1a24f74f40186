//! Stale-lease reaper (spec §4.7, C8).
//!
//! Periodic sweep that reclaims jobs whose dispatcher lease has gone
//! stale — the dispatcher crashed or hung mid-attempt. Reaping counts as an
//! attempt, so a job that is reaped enough times still dead-letters instead
//! of looping forever.

use anyhow::{Context, Result};
use chrono::Utc;

use sendgate_types::{ErrorCode, JobStatus};

use crate::{Reporter, SendGateContext};

/// Outcome of reaping a single stale job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapAction {
    Requeued { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// The job's status had already moved on by the time we went to act on
    /// it (the dispatcher finished first); skipped rather than clobbered.
    SkippedNoLongerInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapResult {
    pub job_id: String,
    pub action: ReapAction,
}

/// Sweep once. `max_attempts` and `stale_minutes` come from
/// `sendgate_config::ReaperConfig`.
pub fn run_once(
    ctx: &mut SendGateContext,
    stale_minutes: i64,
    max_attempts: u32,
    reporter: &mut dyn Reporter,
) -> Result<Vec<ReapResult>> {
    let now = Utc::now();
    let stale_ids: Vec<String> =
        ctx.queue.find_stale_jobs(stale_minutes, now).into_iter().map(|job| job.job_id.clone()).collect();

    let mut results = Vec::with_capacity(stale_ids.len());

    for job_id in stale_ids {
        // Re-read the latest snapshot: the dispatcher may have completed
        // the job between the scan above and this iteration.
        let Some(job) = ctx.queue.get(&job_id).cloned() else { continue };
        if job.status != JobStatus::InProgress {
            results.push(ReapResult { job_id, action: ReapAction::SkippedNoLongerInProgress });
            continue;
        }

        let mut job = job;
        let new_attempts = job.attempts + 1;
        job.attempts = new_attempts;
        job.in_progress_started_at = None;
        job.last_updated_at = Utc::now();

        if new_attempts > max_attempts {
            job.status = JobStatus::DeadLetter;
            job.last_error_code = Some(ErrorCode::Unknown);
            ctx.queue.save(job).context("failed to dead-letter reaped job")?;
            reporter.warn(&format!("job {job_id} dead-lettered by reaper after {new_attempts} attempts"));
            results.push(ReapResult { job_id, action: ReapAction::DeadLettered { attempts: new_attempts } });
        } else {
            let backoff =
                sendgate_retry::calculate_backoff(ctx.retry_policy.base_delay, ctx.retry_policy.ceiling, ctx.retry_policy.jitter, new_attempts);
            job.status = JobStatus::Queued;
            job.next_attempt_at =
                Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
            ctx.queue.save(job).context("failed to requeue reaped job")?;
            reporter.info(&format!("job {job_id} requeued by reaper (attempt {new_attempts})"));
            results.push(ReapResult { job_id, action: ReapAction::Requeued { attempts: new_attempts } });
        }
    }

    Ok(results)
}
