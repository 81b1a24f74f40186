//! Multi-layer send-policy gate (spec §4.4).
//!
//! Pure query surface, no I/O: given a snapshot of configuration and a
//! recipient plus today's sent count, decide whether a send is allowed.
//! Checks run in a fixed order — env kill-switch, enable flag, allow-list,
//! daily rate limit — so that `GateDecision::Denied::details` is
//! deterministic for a given configuration.

use sendgate_types::{GateDecision, GateDenialReason};

/// Static policy configuration (spec §4.4 table). This is the
/// configuration-gate layer only; the runtime kill switch (`sendgate-lock`)
/// composes with it separately.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// `KILL_SWITCH` environment variable, read once at startup.
    pub env_kill_switch: bool,
    /// `ENABLE_AUTO_SEND` master enable.
    pub enable_auto_send: bool,
    /// Case-insensitive recipient domains.
    pub allowlist_domains: Vec<String>,
    /// Case-insensitive full recipient addresses, OR'd with domains.
    pub allowlist_emails: Vec<String>,
    /// Upper bound on successful sends in a UTC calendar day.
    pub max_per_day: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            env_kill_switch: false,
            enable_auto_send: false,
            allowlist_domains: Vec::new(),
            allowlist_emails: Vec::new(),
            max_per_day: 0,
        }
    }
}

impl PolicyConfig {
    /// Short-circuits on the env kill switch and the master enable flag.
    /// Does not consult the allow-list or rate limit — those only matter
    /// per-recipient, via `check_send_permission`.
    pub fn is_sending_enabled(&self) -> bool {
        !self.env_kill_switch && self.enable_auto_send
    }

    fn domain_of(address: &str) -> Option<&str> {
        address.rsplit_once('@').map(|(_, domain)| domain)
    }

    fn matches_allowlist(&self, to: &str) -> bool {
        if self.allowlist_emails.iter().any(|e| e.eq_ignore_ascii_case(to)) {
            return true;
        }
        match Self::domain_of(to) {
            Some(domain) => self.allowlist_domains.iter().any(|d| d.eq_ignore_ascii_case(domain)),
            None => false,
        }
    }

    /// Evaluate the gate for a specific recipient. Check order is fixed:
    /// env kill-switch, enable flag, allow-list, daily rate limit.
    pub fn check_send_permission(&self, to: &str, today_sent_count: u32) -> GateDecision {
        if self.env_kill_switch {
            return GateDecision::Denied {
                reason: GateDenialReason::KillSwitch,
                details: "KILL_SWITCH environment variable is set".to_string(),
            };
        }

        if !self.enable_auto_send {
            return GateDecision::Denied {
                reason: GateDenialReason::NotEnabled,
                details: "ENABLE_AUTO_SEND is false".to_string(),
            };
        }

        if !self.matches_allowlist(to) {
            return GateDecision::Denied {
                reason: GateDenialReason::NotInAllowlist,
                details: format!("{to} matches neither allowlist_domains nor allowlist_emails"),
            };
        }

        if today_sent_count >= self.max_per_day {
            return GateDecision::Denied {
                reason: GateDenialReason::DailyLimitReached,
                details: format!("today_sent_count {today_sent_count} >= max_per_day {}", self.max_per_day),
            };
        }

        GateDecision::Allowed
    }
}
