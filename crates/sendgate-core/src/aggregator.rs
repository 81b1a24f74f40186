//! Experiment aggregator (spec §4.9, C10).
//!
//! Windowless reduction of the ledger, scoped to one experiment's
//! templates: totals for the safety check (§4.10), plus per-day rollups for
//! the auto-stop controller's consecutive-bad-day count (§4.11).

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use sendgate_events::EventLedger;
use sendgate_types::{EventType, ExperimentConfig};

/// Attempts/success/blocked/replies for a single UTC calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DayRollup {
    pub attempts: u64,
    pub success: u64,
    pub blocked: u64,
    pub replies: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentMetrics {
    pub total_sent: u64,
    pub total_replies: u64,
    pub reply_rate: Option<f64>,
    pub days_since_last_reply: Option<i64>,
    pub days_since_start: i64,
    pub daily: BTreeMap<NaiveDate, DayRollup>,
}

/// Reduce the ledger down to the metrics the safety check and auto-stop
/// controller need, filtered to events whose `template_id` belongs to
/// `experiment`. `total_sent`/`total_replies` count the reconciler's
/// provider-confirmed `SENT_DETECTED`/`REPLY_DETECTED` events, not the
/// dispatcher's optimistic `AUTO_SEND_SUCCESS` — the aggregator sits
/// downstream of the reconciler in the data flow (spec §2).
pub fn compute_metrics(ledger: &EventLedger, experiment: &ExperimentConfig, now: DateTime<Utc>) -> ExperimentMetrics {
    let template_ids: std::collections::HashSet<&str> =
        experiment.templates.iter().map(|t| t.template_id.as_str()).collect();

    let mut total_sent = 0u64;
    let mut total_replies = 0u64;
    let mut last_reply_at: Option<DateTime<Utc>> = None;
    let mut daily: BTreeMap<NaiveDate, DayRollup> = BTreeMap::new();

    for event in ledger.all_events() {
        if !template_ids.contains(event.template_id.as_str()) {
            continue;
        }

        let day = event.timestamp.date_naive();
        let rollup = daily.entry(day).or_default();

        match event.event_type {
            EventType::SentDetected => total_sent += 1,
            EventType::ReplyDetected => {
                total_replies += 1;
                rollup.replies += 1;
                last_reply_at = Some(last_reply_at.map_or(event.timestamp, |prev| prev.max(event.timestamp)));
            }
            EventType::AutoSendAttempt => rollup.attempts += 1,
            EventType::AutoSendSuccess => rollup.success += 1,
            EventType::AutoSendBlocked => rollup.blocked += 1,
            _ => {}
        }
    }

    let reply_rate = if total_sent > 0 { Some(total_replies as f64 / total_sent as f64) } else { None };
    let days_since_last_reply = last_reply_at.map(|t| (now.date_naive() - t.date_naive()).num_days());
    let days_since_start = (now.date_naive() - experiment.start_at.date_naive()).num_days();

    ExperimentMetrics { total_sent, total_replies, reply_rate, days_since_last_reply, days_since_start, daily }
}
