//! Reliability and control plane for the outbound-send workflow.
//!
//! This crate wires the storage microcrates (`sendgate-queue`,
//! `sendgate-events`, `sendgate-lock`, `sendgate-auth`) together into the
//! engine components: dispatcher, reaper, Gmail reconciler, experiment
//! aggregator, safety check, auto-stop controller, and the ops command
//! surface. Everything here is single-process; coordination across
//! concurrent periodic tasks relies only on the append-only queue/ledger
//! files and the atomic-rename kill switch.

pub mod aggregator;
pub mod autostop;
pub mod dispatcher;
pub mod ops;
pub mod provider;
pub mod reaper;
pub mod reconciler;
pub mod safety;
pub mod serve;

pub use provider::{AuditedDraft, AuditSource, MailProvider, ReplyRecord, SendOutcome, SentRecord};

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};

use sendgate_auth::ApprovalRegistry;
use sendgate_events::EventLedger;
use sendgate_lock::KillSwitch;
use sendgate_policy::PolicyConfig;
use sendgate_queue::JobQueue;
use sendgate_retry::RetryPolicy;

/// Progress reporting seam every engine function takes a `&mut dyn
/// Reporter` through. The CLI's implementation writes to stderr; tests use
/// a recording implementation.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A `Reporter` that does nothing, for call sites (and tests) that don't
/// care about progress output.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Bundles every durable handle the engine needs. Singletons in the
/// original design; re-expressed here as an explicit context so tests can
/// point every handle at a fresh temp directory.
pub struct SendGateContext {
    pub state_dir: PathBuf,
    pub queue: JobQueue,
    pub ledger: EventLedger,
    pub approvals: ApprovalRegistry,
    pub kill_switch: KillSwitch,
    pub policy: PolicyConfig,
    pub retry_policy: RetryPolicy,
    /// Deadline applied to every provider call (spec §5 "Cancellation /
    /// timeouts", default 30s). On expiry the call is treated as unknown
    /// and whatever job it was acting on is left exactly as it was leased.
    pub provider_deadline: Duration,
}

fn default_provider_deadline() -> Duration {
    Duration::from_secs(30)
}

impl SendGateContext {
    pub fn open(state_dir: impl Into<PathBuf>, policy: PolicyConfig, retry_policy: RetryPolicy) -> Result<Self> {
        let state_dir = state_dir.into();
        let queue = JobQueue::open(sendgate_queue::queue_path(&state_dir))
            .context("failed to open job queue")?;
        let ledger = EventLedger::open(sendgate_events::events_path(&state_dir))
            .context("failed to open event ledger")?;
        let approvals = ApprovalRegistry::open(&state_dir).context("failed to open approval registry")?;
        let kill_switch = KillSwitch::new(&state_dir);

        Ok(Self {
            state_dir,
            queue,
            ledger,
            approvals,
            kill_switch,
            policy,
            retry_policy,
            provider_deadline: default_provider_deadline(),
        })
    }

    /// Override the provider-call deadline (defaults to 30s). Used by the
    /// CLI to apply `sendgate_config::EnvConfig`'s configured value, and by
    /// tests that need a short deadline to exercise timeout handling.
    pub fn with_provider_deadline(mut self, deadline: Duration) -> Self {
        self.provider_deadline = deadline;
        self
    }

    /// A send is permitted iff the static policy gate allows it AND the
    /// runtime kill switch is off (spec §4.5).
    pub fn is_sending_enabled(&mut self) -> Result<bool> {
        if self.kill_switch.is_enabled()? {
            return Ok(false);
        }
        Ok(self.policy.is_sending_enabled())
    }
}

/// Run `f` on a blocking-pool thread and abandon it if `deadline` elapses
/// first. `Ok(None)` means the deadline expired; the spawned thread may
/// still be running and its eventual result is discarded — this is the
/// only honest way to bound a synchronous call that offers no cancellation
/// of its own (spec §5 "All provider calls carry a deadline").
pub(crate) fn call_with_deadline<T, F>(deadline: Duration, f: F) -> Result<Option<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to start deadline runtime")?;

    let outcome = runtime.block_on(async move {
        let handle = tokio::task::spawn_blocking(f);
        tokio::time::timeout(deadline, handle).await
    });

    match outcome {
        Ok(joined) => Ok(Some(joined.context("provider call panicked")?)),
        Err(_elapsed) => Ok(None),
    }
}

/// Count of jobs with `status = sent` and `sent_at` on the given UTC day,
/// used as `today_sent_count` for the daily rate limit (spec §4.4).
pub fn sent_today_count(queue: &JobQueue, today: chrono::NaiveDate) -> u32 {
    queue
        .all_jobs()
        .filter(|job| {
            job.status == sendgate_types::JobStatus::Sent
                && job.sent_at.is_some_and(|sent_at| sent_at.date_naive() == today)
        })
        .count() as u32
}

pub fn state_subpath(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(name)
}

/// A fresh opaque event id. Reuses `sendgate_auth`'s random-hex generator —
/// an event id has the same shape as a token (nothing but an opaque
/// correlation handle), so there is no reason to grow a second one.
pub(crate) fn new_event_id(prefix: &str) -> String {
    format!("evt-{prefix}-{}", sendgate_auth::generate_token())
}
