//! Approval-token registry and fingerprinting (spec §3 "ApprovalRecord", §4.6 step 4).
//!
//! A one-shot approval token binds to exactly one draft. The raw token is
//! generated, handed to the operator once, and then immediately discarded
//! by this process — only its fingerprint (first 8 hex chars of its
//! SHA-256) is ever persisted, matching the PII-minimization rule in §7.
//!
//! # Example
//!
//! ```
//! use sendgate_auth::ApprovalRegistry;
//! use tempfile::tempdir;
//!
//! let dir = tempdir().expect("tempdir");
//! let mut registry = ApprovalRegistry::open(dir.path()).expect("open");
//!
//! let token = registry
//!     .create_approval("draft-1", "alice", "customer requested follow-up", None)
//!     .expect("create");
//!
//! let record = registry.consume(&token).expect("consume");
//! assert_eq!(record.draft_id, "draft-1");
//! assert!(registry.consume(&token).is_err(), "a token is single-use");
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

use sendgate_types::ApprovalRecord;

pub const APPROVALS_FILE: &str = "approvals.json";

/// First 8 hex chars of SHA-256(token) — the only form of the token that is
/// ever written to disk or logged.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// A fresh random approval token: 16 bytes of CSPRNG output, hex-encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Persisted `fingerprint -> ApprovalRecord` map, atomically rewritten on
/// every mutation (the same write-temp-then-rename idiom used everywhere
/// else state is persisted).
pub struct ApprovalRegistry {
    path: PathBuf,
    records: BTreeMap<String, ApprovalRecord>,
}

impl ApprovalRegistry {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(APPROVALS_FILE);
        let records = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read approval registry {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse approval registry {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, records })
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&self.records).context("failed to serialize approval registry")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &json).with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename approval registry to {}", self.path.display()))?;
        Ok(())
    }

    /// Generate and bind a fresh token to `draft_id`. Returns the raw
    /// token — the caller is responsible for handing it to the operator
    /// and never persisting it themselves.
    pub fn create_approval(
        &mut self,
        draft_id: impl Into<String>,
        approved_by: impl Into<String>,
        reason: impl Into<String>,
        ticket: Option<String>,
    ) -> Result<String> {
        let token = generate_token();
        let fp = fingerprint(&token);

        self.records.insert(
            fp.clone(),
            ApprovalRecord {
                fingerprint: fp,
                draft_id: draft_id.into(),
                approved_by: approved_by.into(),
                reason: reason.into(),
                ticket,
                created_at: Utc::now(),
                consumed: false,
            },
        );
        self.save()?;
        Ok(token)
    }

    /// Look up a record by its already-computed fingerprint, without
    /// consuming it. Used by the dispatcher to check approval before
    /// attempting a send.
    pub fn get_by_fingerprint(&self, fp: &str) -> Option<&ApprovalRecord> {
        self.records.get(fp)
    }

    /// Burn the token bound to `fp`: the next lookup sees it as consumed.
    /// Errors if the fingerprint is unknown or already consumed.
    pub fn consume_by_fingerprint(&mut self, fp: &str) -> Result<ApprovalRecord> {
        let record = self
            .records
            .get_mut(fp)
            .ok_or_else(|| anyhow::anyhow!("no approval record for fingerprint {fp}"))?;
        if record.consumed {
            bail!("approval fingerprint {fp} has already been consumed");
        }
        record.consumed = true;
        let result = record.clone();
        self.save()?;
        Ok(result)
    }

    /// Convenience wrapper that fingerprints the raw token before consuming.
    pub fn consume(&mut self, token: &str) -> Result<ApprovalRecord> {
        self.consume_by_fingerprint(&fingerprint(token))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_eight_hex_chars() {
        let fp = fingerprint("some-raw-token-value");
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[test]
    fn generate_token_is_not_trivially_repeated() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn create_and_consume_round_trips() {
        let td = tempdir().expect("tempdir");
        let mut registry = ApprovalRegistry::open(td.path()).expect("open");

        let token = registry
            .create_approval("draft-1", "alice", "follow-up requested", Some("TICKET-9".to_string()))
            .expect("create");

        let record = registry.consume(&token).expect("consume");
        assert_eq!(record.draft_id, "draft-1");
        assert_eq!(record.ticket.as_deref(), Some("TICKET-9"));
        assert!(record.consumed);
    }

    #[test]
    fn token_is_single_use() {
        let td = tempdir().expect("tempdir");
        let mut registry = ApprovalRegistry::open(td.path()).expect("open");
        let token = registry.create_approval("draft-1", "alice", "reason", None).expect("create");

        registry.consume(&token).expect("first consume");
        assert!(registry.consume(&token).is_err());
    }

    #[test]
    fn unknown_fingerprint_is_rejected() {
        let td = tempdir().expect("tempdir");
        let mut registry = ApprovalRegistry::open(td.path()).expect("open");
        assert!(registry.consume("not-a-real-token").is_err());
    }

    #[test]
    fn reload_preserves_consumed_state() {
        let td = tempdir().expect("tempdir");
        let token = {
            let mut registry = ApprovalRegistry::open(td.path()).expect("open");
            let token = registry.create_approval("draft-1", "alice", "reason", None).expect("create");
            registry.consume(&token).expect("consume");
            token
        };

        let mut reloaded = ApprovalRegistry::open(td.path()).expect("reopen");
        assert!(reloaded.consume(&token).is_err(), "consumed state must survive reload");
    }

    #[test]
    fn raw_token_never_appears_in_persisted_file() {
        let td = tempdir().expect("tempdir");
        let mut registry = ApprovalRegistry::open(td.path()).expect("open");
        let token = registry.create_approval("draft-1", "alice", "reason", None).expect("create");

        let content = fs::read_to_string(td.path().join(APPROVALS_FILE)).expect("read");
        assert!(!content.contains(&token));
    }
}
