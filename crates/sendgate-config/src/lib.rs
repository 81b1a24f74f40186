//! Configuration loading for sendgate (spec §6 "External interfaces").
//!
//! Two distinct sources, kept in separate sections the way the rest of the
//! workspace keeps its concerns separate:
//!
//! - **Environment variables** — read once at process startup, covering CRM
//!   credentials, mail-provider credentials, the send-policy gate, and
//!   peripheral integrations (Slack).
//! - **JSON state-directory files** — `send_queue.json` (reaper tuning) and
//!   `experiments.json` (the experiment registry), loaded with the same
//!   missing-file-means-default semantics as the teacher's TOML loader.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sendgate_policy::PolicyConfig;
use sendgate_types::ExperimentRegistry;

pub const SEND_QUEUE_CONFIG_FILE: &str = "send_queue.json";
pub const EXPERIMENTS_FILE: &str = "experiments.json";

/// CRM session credentials: either a bearer token, or an email/password
/// pair the CRM client exchanges for one. Exactly one variant is expected
/// to be populated; the CRM client (out of scope here) decides which to use.
#[derive(Debug, Clone, Default)]
pub struct CrmCredentials {
    pub session_token: Option<String>,
    pub login_email: Option<String>,
    pub login_password: Option<String>,
}

/// Gmail API credentials for the mail-provider client (out of scope here;
/// this crate only resolves them from the environment).
#[derive(Debug, Clone, Default)]
pub struct MailProviderCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

/// Everything configured through environment variables (spec §6).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub crm_base_url: Option<String>,
    pub crm_credentials: CrmCredentials,
    pub mail_provider_credentials: MailProviderCredentials,
    pub policy: PolicyConfig,
    pub metrics_store_path: PathBuf,
    pub slack_webhook_url: Option<String>,
    /// Deadline applied to every provider call (spec §5, default 30s).
    pub provider_deadline_secs: u64,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> bool {
    match env_string(key) {
        Some(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => false,
    }
}

fn env_csv(key: &str) -> Vec<String> {
    env_string(key)
        .map(|value| value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_string(key).and_then(|value| value.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key).and_then(|value| value.parse().ok()).unwrap_or(default)
}

impl EnvConfig {
    /// Read the full environment configuration. Never fails — a missing
    /// variable just means the corresponding field is absent or defaulted;
    /// validating that required credentials are present is the caller's
    /// job (the CRM/provider clients, which are out of scope here).
    pub fn from_env() -> Self {
        Self {
            crm_base_url: env_string("CRM_BASE_URL"),
            crm_credentials: CrmCredentials {
                session_token: env_string("CRM_SESSION_TOKEN"),
                login_email: env_string("CRM_LOGIN_EMAIL"),
                login_password: env_string("CRM_LOGIN_PASSWORD"),
            },
            mail_provider_credentials: MailProviderCredentials {
                client_id: env_string("GMAIL_CLIENT_ID"),
                client_secret: env_string("GMAIL_CLIENT_SECRET"),
                refresh_token: env_string("GMAIL_REFRESH_TOKEN"),
            },
            policy: PolicyConfig {
                env_kill_switch: env_bool("KILL_SWITCH"),
                enable_auto_send: env_bool("ENABLE_AUTO_SEND"),
                allowlist_domains: env_csv("SEND_ALLOWLIST_DOMAINS"),
                allowlist_emails: env_csv("SEND_ALLOWLIST_EMAILS"),
                max_per_day: env_u32("SEND_MAX_PER_DAY", 0),
            },
            metrics_store_path: env_string("METRICS_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".sendgate")),
            slack_webhook_url: env_string("SLACK_WEBHOOK_URL"),
            provider_deadline_secs: env_u64("PROVIDER_DEADLINE_SECS", 30),
        }
    }
}

/// Reaper tuning (spec §6 `send_queue.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_stale_minutes")]
    pub stale_minutes: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reap_action")]
    pub reap_action: String,
}

fn default_stale_minutes() -> i64 {
    30
}

fn default_max_attempts() -> u32 {
    8
}

fn default_reap_action() -> String {
    "requeue".to_string()
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_minutes: default_stale_minutes(),
            max_attempts: default_max_attempts(),
            reap_action: default_reap_action(),
        }
    }
}

/// Top-level shape of `send_queue.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendQueueConfig {
    #[serde(default)]
    pub reaper: ReaperConfig,
}

pub fn send_queue_config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SEND_QUEUE_CONFIG_FILE)
}

pub fn experiments_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EXPERIMENTS_FILE)
}

/// Load `send_queue.json`; a missing file yields defaults, matching the
/// teacher's `load_config` missing-file behavior.
pub fn load_send_queue_config(state_dir: &Path) -> Result<SendQueueConfig> {
    let path = send_queue_config_path(state_dir);
    if !path.exists() {
        return Ok(SendQueueConfig::default());
    }

    let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Load `experiments.json`; a missing file yields an empty registry.
pub fn load_experiments(state_dir: &Path) -> Result<ExperimentRegistry> {
    let path = experiments_path(state_dir);
    if !path.exists() {
        return Ok(ExperimentRegistry::default());
    }

    let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Persist `experiments.json` atomically (write-temp + rename), used by the
/// `promote`/`propose` ops verbs to update experiment status.
pub fn save_experiments(state_dir: &Path, registry: &ExperimentRegistry) -> Result<()> {
    std::fs::create_dir_all(state_dir).with_context(|| format!("failed to create {}", state_dir.display()))?;

    let path = experiments_path(state_dir);
    let json = serde_json::to_string_pretty(registry).context("failed to serialize experiment registry")?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &json).with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &path).with_context(|| format!("failed to rename to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendgate_types::{AbVariant, DecisionRule, ExperimentConfig, ExperimentStatus, RollbackRule, TemplateArm, TemplateStatus};

    #[test]
    fn env_config_defaults_when_nothing_set() {
        temp_env::with_vars(
            [
                ("ENABLE_AUTO_SEND", None::<&str>),
                ("KILL_SWITCH", None::<&str>),
                ("SEND_ALLOWLIST_DOMAINS", None::<&str>),
                ("SEND_MAX_PER_DAY", None::<&str>),
                ("METRICS_STORE_PATH", None::<&str>),
            ],
            || {
                let config = EnvConfig::from_env();
                assert!(!config.policy.enable_auto_send);
                assert!(!config.policy.env_kill_switch);
                assert!(config.policy.allowlist_domains.is_empty());
                assert_eq!(config.policy.max_per_day, 0);
                assert_eq!(config.metrics_store_path, PathBuf::from(".sendgate"));
            },
        );
    }

    #[test]
    fn env_config_parses_bools_and_lists() {
        temp_env::with_vars(
            [
                ("ENABLE_AUTO_SEND", Some("true")),
                ("KILL_SWITCH", Some("0")),
                ("SEND_ALLOWLIST_DOMAINS", Some("example.com, other.org")),
                ("SEND_MAX_PER_DAY", Some("25")),
            ],
            || {
                let config = EnvConfig::from_env();
                assert!(config.policy.enable_auto_send);
                assert!(!config.policy.env_kill_switch);
                assert_eq!(config.policy.allowlist_domains, vec!["example.com", "other.org"]);
                assert_eq!(config.policy.max_per_day, 25);
            },
        );
    }

    #[test]
    fn load_send_queue_config_missing_file_returns_defaults() {
        let td = tempfile::tempdir().expect("tempdir");
        let config = load_send_queue_config(td.path()).expect("load");
        assert_eq!(config.reaper.stale_minutes, 30);
        assert_eq!(config.reaper.max_attempts, 8);
    }

    #[test]
    fn load_send_queue_config_from_file() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            send_queue_config_path(td.path()),
            r#"{"reaper":{"stale_minutes":45,"max_attempts":5,"reap_action":"dead_letter"}}"#,
        )
        .expect("write");

        let config = load_send_queue_config(td.path()).expect("load");
        assert_eq!(config.reaper.stale_minutes, 45);
        assert_eq!(config.reaper.max_attempts, 5);
        assert_eq!(config.reaper.reap_action, "dead_letter");
    }

    fn sample_experiment() -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "exp-1".to_string(),
            status: ExperimentStatus::Running,
            start_at: chrono::Utc::now(),
            templates: vec![TemplateArm {
                template_id: "tmpl-a".to_string(),
                variant: AbVariant::A,
                status: TemplateStatus::Active,
            }],
            decision_rule: DecisionRule { alpha: 0.05, min_lift: 0.1 },
            min_sent_per_variant: 30,
            rollback_rule: RollbackRule { min_sent_total: 30, max_days_no_reply: 7, min_reply_rate: 0.02 },
            freeze_on_low_n: true,
        }
    }

    #[test]
    fn experiments_round_trip_through_save_and_load() {
        let td = tempfile::tempdir().expect("tempdir");
        let registry = ExperimentRegistry { experiments: vec![sample_experiment()] };

        save_experiments(td.path(), &registry).expect("save");
        let loaded = load_experiments(td.path()).expect("load");

        assert_eq!(loaded.experiments.len(), 1);
        assert_eq!(loaded.experiments[0].experiment_id, "exp-1");
    }

    #[test]
    fn load_experiments_missing_file_returns_empty_registry() {
        let td = tempfile::tempdir().expect("tempdir");
        let registry = load_experiments(td.path()).expect("load");
        assert!(registry.experiments.is_empty());
    }
}
