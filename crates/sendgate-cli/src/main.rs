use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use sendgate_core::ops::{self, ApproveSendOutcome};
use sendgate_core::serve::ServeConfig;
use sendgate_core::{AuditSource, MailProvider, Reporter, SendGateContext, aggregator, safety};
use sendgate_gmail::{HttpAuditSource, HttpMailProvider};
use sendgate_types::AbVariant;

#[derive(Parser, Debug)]
#[command(name = "sendgate", version)]
#[command(about = "Operator control plane for the outbound-send workflow")]
struct Cli {
    /// Directory holding the ledger, queue, approvals, and kill-switch files.
    #[arg(long, default_value = ".sendgate")]
    state_dir: PathBuf,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Engage the runtime kill switch.
    StopSend {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        set_by: String,
    },
    /// Release the runtime kill switch.
    ResumeSend {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        set_by: String,
    },
    /// Print the current kill-switch state.
    Status,
    /// Pause an experiment, optionally also engaging the kill switch.
    Rollback {
        #[arg(long)]
        experiment_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        set_by: String,
        #[arg(long)]
        also_stop_send: bool,
    },
    /// Two-phase approval: mint a token, or (with --execute) bind it to a new send job.
    ApproveSend {
        #[arg(long)]
        draft_id: String,
        #[arg(long)]
        approved_by: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        ticket: Option<String>,
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value = "")]
        tracking_id: String,
        #[arg(long, default_value = "")]
        company_id: String,
        #[arg(long, default_value = "")]
        template_id: String,
        #[arg(long, value_enum)]
        ab_variant: Option<CliAbVariant>,
    },
    /// Evaluate the safety rules for a running experiment.
    Safety {
        #[arg(long)]
        experiment_id: String,
    },
    /// Print aggregated totals and per-day rollups for an experiment.
    Report {
        #[arg(long)]
        experiment_id: String,
    },
    /// Search the CRM for taggable recipients. Requires a CRM client, which
    /// is out of scope for this crate.
    Scan,
    /// Compose and stage a draft from a template. Requires a mail-provider
    /// client and template renderer, both out of scope for this crate.
    Propose,
    /// Promote a winning experiment arm. Requires the CRM/template stack.
    Promote,
    /// Drive the dispatcher, reaper, reconciler, and auto-stop loops until
    /// killed. Only one instance may run against a given state directory.
    Serve {
        #[arg(long, default_value = "2")]
        dispatch_tick_secs: u64,
        #[arg(long, default_value = "60")]
        reap_every_secs: u64,
        #[arg(long, default_value = "300")]
        reconcile_every_secs: u64,
        #[arg(long, default_value = "3600")]
        autostop_every_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliAbVariant {
    A,
    B,
}

impl From<CliAbVariant> for AbVariant {
    fn from(value: CliAbVariant) -> Self {
        match value {
            CliAbVariant::A => AbVariant::A,
            CliAbVariant::B => AbVariant::B,
        }
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    let env_config = sendgate_config::EnvConfig::from_env();
    let retry_policy = sendgate_retry::RetryPolicy::default();
    let mut ctx = SendGateContext::open(&cli.state_dir, env_config.policy.clone(), retry_policy)
        .context("failed to open sendgate state directory")?
        .with_provider_deadline(Duration::from_secs(env_config.provider_deadline_secs));

    match cli.cmd {
        Commands::StopSend { reason, set_by } => {
            ops::stop_send(&mut ctx, &reason, &set_by)?;
            print_output(cli.json, &serde_json::json!({"ok": true}), || println!("kill switch engaged"));
        }
        Commands::ResumeSend { reason, set_by } => {
            ops::resume_send(&mut ctx, &reason, &set_by)?;
            print_output(cli.json, &serde_json::json!({"ok": true}), || println!("kill switch released"));
        }
        Commands::Status => {
            let state = ops::stop_status(&ctx)?;
            print_output(cli.json, &state, || match &state {
                Some(s) => println!("enabled={} reason={:?} set_by={} set_at={}", s.enabled, s.reason, s.set_by, s.set_at),
                None => println!("enabled=false (no kill switch file)"),
            });
        }
        Commands::Rollback { experiment_id, reason, set_by, also_stop_send } => {
            let mut registry = sendgate_config::load_experiments(&cli.state_dir)?;
            ops::rollback(&mut ctx, &mut registry, &experiment_id, &reason, &set_by, also_stop_send)?;
            sendgate_config::save_experiments(&cli.state_dir, &registry)?;
            print_output(cli.json, &serde_json::json!({"experiment_id": experiment_id, "status": "paused"}), || {
                println!("experiment {experiment_id} paused")
            });
        }
        Commands::ApproveSend {
            draft_id,
            approved_by,
            reason,
            ticket,
            execute,
            to,
            tracking_id,
            company_id,
            template_id,
            ab_variant,
        } => {
            if execute && to.is_none() {
                bail!("--execute requires --to");
            }
            let outcome = ops::approve_send(
                &mut ctx,
                &draft_id,
                &approved_by,
                &reason,
                ticket,
                execute,
                to.as_deref(),
                &tracking_id,
                &company_id,
                &template_id,
                ab_variant.map(Into::into),
            )?;
            print_output(cli.json, &ApproveSendOutput::from(&outcome), || match &outcome {
                ApproveSendOutcome::TokenCreated { token } => println!("approval token: {token}"),
                ApproveSendOutcome::Enqueued { job_id } => println!("enqueued job {job_id}"),
            });
        }
        Commands::Safety { experiment_id } => {
            let registry = sendgate_config::load_experiments(&cli.state_dir)?;
            let Some(experiment) = registry.experiments.iter().find(|e| e.experiment_id == experiment_id) else {
                print_output(
                    cli.json,
                    &serde_json::json!({"action": "review_recommended", "reasons": ["no such experiment"]}),
                    || println!("no experiment with id {experiment_id}: review_recommended"),
                );
                return Ok(());
            };
            let metrics = aggregator::compute_metrics(&ctx.ledger, experiment, chrono::Utc::now());
            let verdict = safety::evaluate(experiment, &metrics);
            print_output(cli.json, &verdict, || {
                println!("action: {:?}", verdict.action);
                for reason in &verdict.reasons {
                    println!("  - {reason}");
                }
            });
        }
        Commands::Report { experiment_id } => {
            let registry = sendgate_config::load_experiments(&cli.state_dir)?;
            let experiment = registry
                .experiments
                .iter()
                .find(|e| e.experiment_id == experiment_id)
                .ok_or_else(|| anyhow::anyhow!("no experiment with id {experiment_id}"))?;
            let metrics = aggregator::compute_metrics(&ctx.ledger, experiment, chrono::Utc::now());
            print_output(cli.json, &metrics, || {
                println!("total_sent:    {}", metrics.total_sent);
                println!("total_replies: {}", metrics.total_replies);
                match metrics.reply_rate {
                    Some(rate) => println!("reply_rate:    {:.4}", rate),
                    None => println!("reply_rate:    n/a"),
                }
                match metrics.days_since_last_reply {
                    Some(days) => println!("days_since_last_reply: {days}"),
                    None => println!("days_since_last_reply: never"),
                }
                for (day, rollup) in &metrics.daily {
                    println!(
                        "  {day}: attempts={} success={} blocked={} replies={}",
                        rollup.attempts, rollup.success, rollup.blocked, rollup.replies
                    );
                }
            });
        }
        Commands::Scan | Commands::Propose | Commands::Promote => {
            reporter.error("this verb requires the external CRM/template integration, which is out of scope for this crate");
            bail!("not implemented: requires external CRM/mail-provider/template integration");
        }
        Commands::Serve { dispatch_tick_secs, reap_every_secs, reconcile_every_secs, autostop_every_secs } => {
            let crm_base_url =
                env_config.crm_base_url.clone().context("CRM_BASE_URL is required to serve")?;

            let provider: Arc<dyn MailProvider> =
                Arc::new(HttpMailProvider::new(env_config.mail_provider_credentials.clone())
                    .with_timeout_secs(env_config.provider_deadline_secs));
            let audit: Arc<dyn AuditSource> = Arc::new(
                HttpAuditSource::new(crm_base_url, env_config.crm_credentials.clone())
                    .with_timeout_secs(env_config.provider_deadline_secs),
            );

            let queue_config = sendgate_config::load_send_queue_config(&cli.state_dir)?;
            let config = ServeConfig {
                dispatch_tick: Duration::from_secs(dispatch_tick_secs),
                reap_every: Duration::from_secs(reap_every_secs),
                reconcile_every: Duration::from_secs(reconcile_every_secs),
                autostop_every: Duration::from_secs(autostop_every_secs),
                reaper: queue_config.reaper,
                autostop: sendgate_types::AutoStopConfig::default(),
            };

            sendgate_core::serve::run(&mut ctx, &provider, &audit, &mut reporter, &config, &|| false)?;
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome")]
enum ApproveSendOutput {
    TokenCreated { token: String },
    Enqueued { job_id: String },
}

impl From<&ApproveSendOutcome> for ApproveSendOutput {
    fn from(outcome: &ApproveSendOutcome) -> Self {
        match outcome {
            ApproveSendOutcome::TokenCreated { token } => ApproveSendOutput::TokenCreated { token: token.clone() },
            ApproveSendOutcome::Enqueued { job_id } => ApproveSendOutput::Enqueued { job_id: job_id.clone() },
        }
    }
}

fn print_output(json: bool, value: &impl Serialize, human: impl FnOnce()) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("[error] failed to serialize output: {e}"),
        }
    } else {
        human();
    }
}
