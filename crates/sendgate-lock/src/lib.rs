//! Runtime kill switch and single-dispatcher process lock (spec §4.5 / §5).
//!
//! Both types share one idiom: write to a `.tmp` sibling, `sync_all`, then
//! `rename` over the real path, so a reader never observes a half-written
//! file. The kill switch additionally caches its last read for a short TTL
//! so the dispatcher is not doing a disk read on every send attempt.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sendgate_types::KillSwitchState;

pub const KILL_SWITCH_FILE: &str = "runtime_kill_switch.json";
pub const LOCK_FILE: &str = "dispatcher.lock";

pub fn kill_switch_path(state_dir: &Path) -> PathBuf {
    state_dir.join(KILL_SWITCH_FILE)
}

fn write_atomic(path: &Path, json: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync tmp file")?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("failed to rename to {}", path.display()))?;
    Ok(())
}

/// Operator-toggled runtime kill switch. Absence of the file means
/// disabled. Composes (logical AND) with the static `sendgate-policy` gate:
/// a send is permitted iff the gate allows it AND this is disabled.
pub struct KillSwitch {
    path: PathBuf,
    cache: Option<(KillSwitchState, Instant)>,
    cache_ttl: Duration,
}

impl KillSwitch {
    pub fn new(state_dir: &Path) -> Self {
        Self::with_cache_ttl(state_dir, Duration::from_secs(2))
    }

    pub fn with_cache_ttl(state_dir: &Path, cache_ttl: Duration) -> Self {
        Self { path: kill_switch_path(state_dir), cache: None, cache_ttl }
    }

    fn read_state(&self) -> Result<Option<KillSwitchState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read kill switch {}", self.path.display()))?;
        let state: KillSwitchState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse kill switch JSON from {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Current enabled state, served from a short-TTL cache to avoid a
    /// disk read per send.
    pub fn is_enabled(&mut self) -> Result<bool> {
        if let Some((state, read_at)) = &self.cache {
            if read_at.elapsed() < self.cache_ttl {
                return Ok(state.enabled);
            }
        }

        let state = self.read_state()?;
        let enabled = state.as_ref().is_some_and(|s| s.enabled);
        if let Some(state) = state {
            self.cache = Some((state, Instant::now()));
        } else {
            self.cache = None;
        }
        Ok(enabled)
    }

    /// Current full state (for `status`/`stop-status` reporting), bypassing
    /// the cache.
    pub fn current_state(&self) -> Result<Option<KillSwitchState>> {
        self.read_state()
    }

    pub fn set_enabled(&mut self, reason: impl Into<String>, set_by: impl Into<String>) -> Result<()> {
        self.write_state(true, reason.into(), set_by.into())
    }

    pub fn set_disabled(&mut self, reason: impl Into<String>, set_by: impl Into<String>) -> Result<()> {
        self.write_state(false, reason.into(), set_by.into())
    }

    fn write_state(&mut self, enabled: bool, reason: String, set_by: String) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let state = KillSwitchState { enabled, reason, set_by, set_at: Utc::now() };
        let json = serde_json::to_string_pretty(&state).context("failed to serialize kill switch state")?;
        write_atomic(&self.path, &json)?;
        self.cache = Some((state, Instant::now()));
        Ok(())
    }
}

/// Information stored in the dispatcher exclusivity lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Guarantees at most one dispatcher process runs per state directory at a
/// time (spec §4.6: "only one dispatcher runs per process; multi-process is
/// not supported"). Released automatically on drop.
#[derive(Debug)]
pub struct DispatcherLock {
    path: PathBuf,
}

impl DispatcherLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        if lock_path.exists() {
            let existing = read_lock_info(&lock_path)?;
            bail!(
                "dispatcher lock already held by pid {} on {} since {}",
                existing.pid,
                existing.hostname,
                existing.acquired_at
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;
        write_atomic(&lock_path, &json)?;

        Ok(Self { path: lock_path })
    }

    /// Remove a lock older than `timeout` before acquiring, on the theory
    /// that its owning process crashed without releasing it.
    pub fn acquire_with_timeout(state_dir: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match read_lock_info(&lock_path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        fs::remove_file(&lock_path)
                            .with_context(|| format!("failed to remove stale lock {}", lock_path.display()))?;
                    } else {
                        bail!(
                            "dispatcher lock already held by pid {} on {} since {} (age: {:?})",
                            info.pid,
                            info.hostname,
                            info.acquired_at,
                            age
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&lock_path)
                        .with_context(|| format!("failed to remove corrupt lock {}", lock_path.display()))?;
                }
            }
        }

        Self::acquire(state_dir)
    }

    pub fn is_locked(state_dir: &Path) -> bool {
        state_dir.join(LOCK_FILE).exists()
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for DispatcherLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use tempfile::tempdir;

    #[test]
    fn kill_switch_absent_file_means_disabled() {
        let td = tempdir().expect("tempdir");
        let mut switch = KillSwitch::new(td.path());
        assert!(!switch.is_enabled().expect("is_enabled"));
    }

    #[test]
    fn kill_switch_round_trips_enable_and_disable() {
        let td = tempdir().expect("tempdir");
        let mut switch = KillSwitch::new(td.path());

        switch.set_enabled("manual stop", "operator").expect("set_enabled");
        assert!(switch.is_enabled().expect("is_enabled"));

        switch.set_disabled("resume", "operator").expect("set_disabled");
        assert!(!switch.is_enabled().expect("is_enabled"));
    }

    #[test]
    fn kill_switch_cache_expires_after_ttl() {
        let td = tempdir().expect("tempdir");
        let mut switch = KillSwitch::with_cache_ttl(td.path(), Duration::from_millis(20));

        switch.set_enabled("stop", "operator").expect("set_enabled");
        assert!(switch.is_enabled().expect("cached read"));

        // Rewrite the file directly to simulate another process disabling it,
        // bypassing this handle's cache.
        let state = KillSwitchState {
            enabled: false,
            reason: "resumed elsewhere".to_string(),
            set_by: "other-process".to_string(),
            set_at: Utc::now(),
        };
        write_atomic(&kill_switch_path(td.path()), &serde_json::to_string(&state).unwrap()).expect("write");

        sleep(Duration::from_millis(30));
        assert!(!switch.is_enabled().expect("is_enabled after ttl expiry"));
    }

    #[test]
    fn dispatcher_lock_acquire_creates_and_drop_releases() {
        let td = tempdir().expect("tempdir");
        assert!(!DispatcherLock::is_locked(td.path()));
        {
            let _lock = DispatcherLock::acquire(td.path()).expect("acquire");
            assert!(DispatcherLock::is_locked(td.path()));
        }
        assert!(!DispatcherLock::is_locked(td.path()));
    }

    #[test]
    fn dispatcher_lock_acquire_fails_when_already_held() {
        let td = tempdir().expect("tempdir");
        let _lock1 = DispatcherLock::acquire(td.path()).expect("first acquire");
        let result = DispatcherLock::acquire(td.path());
        assert!(result.is_err());
    }

    #[test]
    fn dispatcher_lock_with_timeout_reclaims_stale_lock() {
        let td = tempdir().expect("tempdir");
        let lock_path = td.path().join(LOCK_FILE);
        let old_info = LockInfo {
            pid: 999_999,
            hostname: "dead-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(&lock_path, serde_json::to_string(&old_info).unwrap()).expect("write stale lock");

        let lock = DispatcherLock::acquire_with_timeout(td.path(), Duration::from_secs(3600)).expect("reclaim");
        assert_eq!(read_lock_info(&lock.path).unwrap().pid, std::process::id());
    }
}
