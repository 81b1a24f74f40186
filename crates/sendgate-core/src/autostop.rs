//! Auto-stop controller (spec §4.11, C12).
//!
//! The one backpressure loop in the system: aggregate recent sends,
//! evaluate a consecutive-bad-day rule, and — if the system has been bad
//! for long enough — engage the runtime kill switch. Resumption is always
//! manual (`ops::resume_send`).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

use sendgate_types::{AutoStopConfig, Event, EventType};

use crate::{Reporter, SendGateContext, new_event_id};

#[derive(Debug, Clone, Copy, Default)]
struct DayCounts {
    success: u64,
    blocked: u64,
    replies: u64,
}

/// Outcome of one auto-stop tick.
#[derive(Debug, Clone, PartialEq)]
pub enum AutoStopOutcome {
    /// Runtime kill switch was already on; this tick did nothing.
    AlreadyStopped,
    /// Fewer than `min_sent_total` successful sends in the window.
    InsufficientData,
    /// Conditions did not warrant a stop.
    Healthy,
    /// The kill switch was engaged this tick.
    Stopped { reason: String, consecutive_bad_days: u32 },
}

/// Aggregate `AUTO_SEND_SUCCESS`/`AUTO_SEND_BLOCKED`/`REPLY_DETECTED`
/// counts per UTC day, across the whole ledger (no per-experiment
/// filtering — auto-stop is a system-wide backstop).
fn daily_counts(ledger: &sendgate_events::EventLedger, since: NaiveDate) -> BTreeMap<NaiveDate, DayCounts> {
    let mut daily: BTreeMap<NaiveDate, DayCounts> = BTreeMap::new();
    for event in ledger.all_events() {
        let day = event.timestamp.date_naive();
        if day < since {
            continue;
        }
        let counts = daily.entry(day).or_default();
        match event.event_type {
            EventType::AutoSendSuccess => counts.success += 1,
            EventType::AutoSendBlocked => counts.blocked += 1,
            EventType::ReplyDetected => counts.replies += 1,
            _ => {}
        }
    }
    daily
}

pub fn run_once(ctx: &mut SendGateContext, config: &AutoStopConfig, reporter: &mut dyn Reporter) -> Result<AutoStopOutcome> {
    if ctx.kill_switch.is_enabled()? {
        return Ok(AutoStopOutcome::AlreadyStopped);
    }

    let now = Utc::now();
    let since = (now - chrono::Duration::days(config.window_days)).date_naive();
    let daily = daily_counts(&ctx.ledger, since);

    let total_success: u64 = daily.values().map(|d| d.success).sum();
    if total_success < config.min_sent_total {
        return Ok(AutoStopOutcome::InsufficientData);
    }

    let total_blocked: u64 = daily.values().map(|d| d.blocked).sum();
    let total_replies: u64 = daily.values().map(|d| d.replies).sum();
    let window_reply_rate = total_replies as f64 / total_success as f64;
    let window_blocked_rate = total_blocked as f64 / total_success as f64;

    let mut consecutive_bad_days = 0u32;
    let mut day = now.date_naive();
    loop {
        let Some(counts) = daily.get(&day) else { break };
        let day_reply_rate = if counts.success > 0 { counts.replies as f64 / counts.success as f64 } else { 0.0 };
        let day_blocked_rate = if counts.success > 0 { counts.blocked as f64 / counts.success as f64 } else { 0.0 };
        let bad = day_reply_rate < config.reply_rate_min || day_blocked_rate > config.blocked_rate_max;
        if !bad {
            break;
        }
        consecutive_bad_days += 1;
        day -= chrono::Duration::days(1);
    }

    let window_is_bad = window_reply_rate < config.reply_rate_min || window_blocked_rate > config.blocked_rate_max;
    if !(window_is_bad && consecutive_bad_days >= config.consecutive_days) {
        return Ok(AutoStopOutcome::Healthy);
    }

    let reason = format!(
        "Auto-stop: reply_rate {window_reply_rate:.4} / blocked_rate {window_blocked_rate:.4} over {} consecutive bad day(s)",
        consecutive_bad_days
    );
    ctx.kill_switch.set_enabled(reason.clone(), "auto_stop").context("failed to engage kill switch")?;

    let event = Event::new(new_event_id("autostop"), EventType::OpsStopSend, "system").with_meta("reason", &reason);
    ctx.ledger.append(event).context("failed to append OPS_STOP_SEND event")?;

    reporter.warn(&reason);
    Ok(AutoStopOutcome::Stopped { reason, consecutive_bad_days })
}
