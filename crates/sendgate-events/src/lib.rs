//! Append-only event ledger for the sendgate control plane (spec §4.1).
//!
//! The ledger is one JSON object per line (`metrics.ndjson`), kept in sync
//! with an in-memory vector for linear scans and a `(tracking_id,
//! event_type)` index for O(1) idempotency checks. A torn tail line — the
//! product of a crash mid-`write!` — is discarded on the next load rather
//! than treated as an error, since the ledger is meant to survive being
//! killed at any point.
//!
//! # Example
//!
//! ```
//! use sendgate_events::EventLedger;
//! use sendgate_types::{Event, EventType};
//! use tempfile::tempdir;
//!
//! let dir = tempdir().expect("tempdir");
//! let mut ledger = EventLedger::open(dir.path().join("metrics.ndjson")).expect("open");
//!
//! ledger.append(Event::new("evt-1", EventType::SentDetected, "trk-1")).expect("append");
//! assert!(ledger.has_event("trk-1", EventType::SentDetected));
//! ```

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use sendgate_types::{Event, EventType};

/// Default ledger file name (spec §6).
pub const METRICS_FILE: &str = "metrics.ndjson";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(METRICS_FILE)
}

/// Read all well-formed events from an NDJSON file. Lines that fail to
/// parse are dropped rather than surfaced as an error — §4.1 specifies
/// that a torn tail line must not block loading the rest of the ledger.
pub fn load_events(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("failed to open ledger {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(trimmed) {
            Ok(event) => events.push(event),
            Err(_) => continue, // torn tail or otherwise malformed line; skip it
        }
    }

    Ok(events)
}

/// An open, append-only event ledger with an in-memory idempotency index.
pub struct EventLedger {
    path: PathBuf,
    file: File,
    events: Vec<Event>,
    idempotency_index: HashSet<(String, EventType)>,
}

impl EventLedger {
    /// Load existing events (if any) and open the file for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger dir {}", parent.display()))?;
        }

        let events = load_events(&path)?;
        let idempotency_index = events
            .iter()
            .filter(|e| e.event_type.is_idempotency_keyed())
            .map(|e| (e.tracking_id.clone(), e.event_type))
            .collect();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open ledger {}", path.display()))?;

        Ok(Self { path, file, events, idempotency_index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new event. Rejects a duplicate `SentDetected`/`ReplyDetected`
    /// for a tracking_id that already has one, so callers that forget to
    /// check `has_event` first cannot violate the at-most-once invariant.
    pub fn append(&mut self, event: Event) -> Result<()> {
        if event.event_type.is_idempotency_keyed()
            && self.idempotency_index.contains(&(event.tracking_id.clone(), event.event_type))
        {
            anyhow::bail!(
                "duplicate {:?} event for tracking_id {} rejected by idempotency index",
                event.event_type,
                event.tracking_id
            );
        }

        let line = serde_json::to_string(&event).context("failed to serialize event")?;
        writeln!(self.file, "{line}").context("failed to append event line")?;
        self.file.flush().context("failed to flush ledger")?;

        if event.event_type.is_idempotency_keyed() {
            self.idempotency_index.insert((event.tracking_id.clone(), event.event_type));
        }
        self.events.push(event);
        Ok(())
    }

    /// O(1) check for the two idempotency-keyed event types.
    pub fn has_event(&self, tracking_id: &str, event_type: EventType) -> bool {
        self.idempotency_index.contains(&(tracking_id.to_string(), event_type))
    }

    pub fn all_events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_since(&self, since: DateTime<Utc>) -> Vec<&Event> {
        self.events.iter().filter(|e| e.timestamp >= since).collect()
    }

    pub fn events_for_tracking_id(&self, tracking_id: &str) -> Vec<&Event> {
        self.events.iter().filter(|e| e.tracking_id == tracking_id).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
