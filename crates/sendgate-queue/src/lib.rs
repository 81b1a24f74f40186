//! Durable send-job queue (spec §4.2).
//!
//! Storage is an append-only NDJSON file of full job snapshots. Loading the
//! file replays every line in order and, for each `job_id`, keeps only the
//! last valid snapshot — malformed lines (including a torn tail) are
//! skipped rather than aborting the load. Every mutation appends a fresh
//! snapshot; nothing is ever rewritten in place.
//!
//! This crate only stores and queries jobs. FSM transitions themselves are
//! the dispatcher's and reaper's responsibility (`sendgate-core`); `save`
//! here only refuses a snapshot that violates the status/timestamp
//! invariant from `SendJob::invariant_holds`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use sendgate_types::SendJob;

/// Default queue file name (spec §6).
pub const SEND_QUEUE_FILE: &str = "send_queue.ndjson";

pub fn queue_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SEND_QUEUE_FILE)
}

/// Replay an NDJSON snapshot log, keeping the last valid snapshot per
/// `job_id`. Uses a `BTreeMap` keyed by `job_id` so iteration order is
/// deterministic across loads.
pub fn load_jobs(path: &Path) -> Result<BTreeMap<String, SendJob>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let file = File::open(path).with_context(|| format!("failed to open queue {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut jobs = BTreeMap::new();

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<SendJob>(trimmed) {
            Ok(job) => {
                jobs.insert(job.job_id.clone(), job);
            }
            Err(_) => continue,
        }
    }

    Ok(jobs)
}

/// An open, append-only job queue with an in-memory latest-snapshot map.
pub struct JobQueue {
    path: PathBuf,
    file: File,
    jobs: BTreeMap<String, SendJob>,
}

impl JobQueue {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create queue dir {}", parent.display()))?;
        }

        let jobs = load_jobs(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open queue {}", path.display()))?;

        Ok(Self { path, file, jobs })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a full job snapshot: append a line and update the in-memory
    /// map. Refuses a snapshot whose `status`/`in_progress_started_at`
    /// pairing violates the invariant (spec §8 invariant 2).
    pub fn save(&mut self, job: SendJob) -> Result<()> {
        if !job.invariant_holds() {
            anyhow::bail!(
                "refusing to save job {}: status {:?} inconsistent with in_progress_started_at",
                job.job_id,
                job.status
            );
        }

        let line = serde_json::to_string(&job).context("failed to serialize job snapshot")?;
        writeln!(self.file, "{line}").context("failed to append job snapshot")?;
        self.file.flush().context("failed to flush queue")?;

        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<&SendJob> {
        self.jobs.get(job_id)
    }

    pub fn all_jobs(&self) -> impl Iterator<Item = &SendJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Any job with `status = queued` and `next_attempt_at <= now`. No
    /// cross-job ordering is promised by the FSM, but ties are broken by
    /// `created_at` ascending (oldest first) since that costs nothing and
    /// matches what an operator would expect — see spec open question (a).
    pub fn find_next_ready_job(&self, now: DateTime<Utc>) -> Option<&SendJob> {
        self.jobs
            .values()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| (job.created_at, job.job_id.clone()))
    }

    /// Jobs leased (`status = in_progress`) whose lease has been held for at
    /// least `stale_minutes`, sorted oldest-leased first.
    pub fn find_stale_jobs(&self, stale_minutes: i64, now: DateTime<Utc>) -> Vec<&SendJob> {
        let mut stale: Vec<&SendJob> = self
            .jobs
            .values()
            .filter(|job| {
                job.status == sendgate_types::JobStatus::InProgress
                    && job
                        .in_progress_started_at
                        .is_some_and(|started| now - started >= chrono::Duration::minutes(stale_minutes))
            })
            .collect();

        stale.sort_by_key(|job| job.in_progress_started_at);
        stale
    }

    /// Used to prevent double-enqueueing the same draft.
    pub fn find_by_draft_id(&self, draft_id: &str) -> Option<&SendJob> {
        self.jobs.values().find(|job| job.draft_id == draft_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sendgate_types::JobStatus;

    fn sample_job(job_id: &str, draft_id: &str, created_at: DateTime<Utc>) -> SendJob {
        SendJob {
            job_id: job_id.to_string(),
            created_at,
            status: JobStatus::Queued,
            draft_id: draft_id.to_string(),
            tracking_id: format!("trk-{job_id}"),
            company_id: "co-1".to_string(),
            template_id: "tmpl-1".to_string(),
            ab_variant: None,
            to_domain: "example.com".to_string(),
            approval_fingerprint: "deadbeef".to_string(),
            attempts: 0,
            next_attempt_at: created_at,
            in_progress_started_at: None,
            last_error_code: None,
            last_error_message_hash: None,
            last_updated_at: created_at,
            message_id: None,
            thread_id: None,
            sent_at: None,
            cancel_reason: None,
            cancelled_by: None,
        }
    }

    #[test]
    fn reload_reconstructs_latest_snapshot_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = queue_path(dir.path());
        let now = Utc::now();

        {
            let mut queue = JobQueue::open(&path).expect("open");
            let mut job = sample_job("job-1", "draft-1", now);
            queue.save(job.clone()).expect("save 1");

            job.status = JobStatus::InProgress;
            job.in_progress_started_at = Some(now);
            queue.save(job.clone()).expect("save 2");

            job.status = JobStatus::Sent;
            job.in_progress_started_at = None;
            job.message_id = Some("M1".to_string());
            queue.save(job).expect("save 3");
        }

        let reloaded = JobQueue::open(&path).expect("reopen");
        assert_eq!(reloaded.len(), 1);
        let job = reloaded.get("job-1").expect("job present");
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.message_id.as_deref(), Some("M1"));
    }

    #[test]
    fn save_rejects_invariant_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut queue = JobQueue::open(queue_path(dir.path())).expect("open");
        let mut job = sample_job("job-1", "draft-1", Utc::now());
        job.status = JobStatus::InProgress;
        job.in_progress_started_at = None;

        assert!(queue.save(job).is_err());
    }

    #[test]
    fn find_next_ready_job_picks_oldest_by_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut queue = JobQueue::open(queue_path(dir.path())).expect("open");
        let now = Utc::now();

        queue.save(sample_job("job-2", "draft-2", now)).expect("save");
        queue.save(sample_job("job-1", "draft-1", now - Duration::minutes(5))).expect("save");

        let ready = queue.find_next_ready_job(now).expect("one ready job");
        assert_eq!(ready.job_id, "job-1");
    }

    #[test]
    fn find_next_ready_job_ignores_future_next_attempt_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut queue = JobQueue::open(queue_path(dir.path())).expect("open");
        let now = Utc::now();

        let mut job = sample_job("job-1", "draft-1", now);
        job.next_attempt_at = now + Duration::minutes(10);
        queue.save(job).expect("save");

        assert!(queue.find_next_ready_job(now).is_none());
    }

    #[test]
    fn find_stale_jobs_sorted_oldest_leased_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut queue = JobQueue::open(queue_path(dir.path())).expect("open");
        let now = Utc::now();

        for (id, started_minutes_ago) in [("job-a", 35), ("job-b", 90), ("job-c", 10)] {
            let mut job = sample_job(id, id, now);
            job.status = JobStatus::InProgress;
            job.in_progress_started_at = Some(now - Duration::minutes(started_minutes_ago));
            queue.save(job).expect("save");
        }

        let stale = queue.find_stale_jobs(30, now);
        let ids: Vec<&str> = stale.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["job-b", "job-a"]);
    }

    #[test]
    fn find_by_draft_id_prevents_double_enqueue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut queue = JobQueue::open(queue_path(dir.path())).expect("open");
        queue.save(sample_job("job-1", "draft-1", Utc::now())).expect("save");

        assert!(queue.find_by_draft_id("draft-1").is_some());
        assert!(queue.find_by_draft_id("draft-nonexistent").is_none());
    }

    #[test]
    fn torn_tail_line_is_discarded_on_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = queue_path(dir.path());

        {
            let mut queue = JobQueue::open(&path).expect("open");
            queue.save(sample_job("job-1", "draft-1", Utc::now())).expect("save");
        }

        let mut file = OpenOptions::new().append(true).open(&path).expect("open for corruption");
        write!(file, "{{\"job_id\":\"job-broken\",\"stat").expect("write torn line");

        let reloaded = JobQueue::open(&path).expect("reopen despite torn tail");
        assert_eq!(reloaded.len(), 1);
    }
}
