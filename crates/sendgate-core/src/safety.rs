//! Experiment safety check (spec §4.10, C11).
//!
//! Pure function of an `ExperimentConfig` and its aggregated metrics.
//! Rules are evaluated in order and accumulate reasons; a later rule's
//! action (rollback) outranks an earlier one's (freeze) when both fire.

use sendgate_types::{ExperimentConfig, SafetyAction, SafetyVerdict};

use crate::aggregator::ExperimentMetrics;

pub fn evaluate(experiment: &ExperimentConfig, metrics: &ExperimentMetrics) -> SafetyVerdict {
    let rule = &experiment.rollback_rule;
    let mut reasons = Vec::new();
    let mut action = SafetyAction::Ok;

    if experiment.freeze_on_low_n && metrics.days_since_start >= 7 && metrics.total_sent < rule.min_sent_total {
        reasons.push(format!(
            "total_sent {} is below min_sent_total {} after {} days",
            metrics.total_sent, rule.min_sent_total, metrics.days_since_start
        ));
        action = SafetyAction::FreezeRecommended;
    }

    if metrics.total_sent >= rule.min_sent_total {
        let days_stale = metrics.days_since_last_reply.unwrap_or(i64::MAX);
        if days_stale >= rule.max_days_no_reply {
            reasons.push(format!(
                "no reply detected in {days_stale} days (threshold {})",
                rule.max_days_no_reply
            ));
            action = SafetyAction::RollbackRecommended;
        }

        if let Some(reply_rate) = metrics.reply_rate {
            if reply_rate < rule.min_reply_rate {
                reasons.push(format!(
                    "reply_rate {:.4} is below min_reply_rate {:.4}",
                    reply_rate, rule.min_reply_rate
                ));
                action = SafetyAction::RollbackRecommended;
            }
        }
    }

    if reasons.is_empty() {
        reasons.push("No issues detected".to_string());
    }

    SafetyVerdict { action, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendgate_types::{AbVariant, DecisionRule, ExperimentStatus, RollbackRule, TemplateArm, TemplateStatus};
    use std::collections::BTreeMap;

    fn sample_experiment() -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "exp-1".to_string(),
            status: ExperimentStatus::Running,
            start_at: chrono::Utc::now() - chrono::Duration::days(10),
            templates: vec![TemplateArm {
                template_id: "tmpl-a".to_string(),
                variant: AbVariant::A,
                status: TemplateStatus::Active,
            }],
            decision_rule: DecisionRule { alpha: 0.05, min_lift: 0.1 },
            min_sent_per_variant: 30,
            rollback_rule: RollbackRule { min_sent_total: 30, max_days_no_reply: 7, min_reply_rate: 0.05 },
            freeze_on_low_n: true,
        }
    }

    fn metrics(total_sent: u64, total_replies: u64, days_since_last_reply: Option<i64>, days_since_start: i64) -> ExperimentMetrics {
        let reply_rate = if total_sent > 0 { Some(total_replies as f64 / total_sent as f64) } else { None };
        ExperimentMetrics { total_sent, total_replies, reply_rate, days_since_last_reply, days_since_start, daily: BTreeMap::new() }
    }

    #[test]
    fn low_sample_size_recommends_freeze() {
        let experiment = sample_experiment();
        let m = metrics(5, 0, None, 8);
        let verdict = evaluate(&experiment, &m);
        assert_eq!(verdict.action, SafetyAction::FreezeRecommended);
    }

    #[test]
    fn freeze_not_recommended_before_seven_days() {
        let experiment = sample_experiment();
        let m = metrics(5, 0, None, 3);
        let verdict = evaluate(&experiment, &m);
        assert_eq!(verdict.action, SafetyAction::Ok);
    }

    #[test]
    fn stale_replies_and_low_rate_both_recommend_rollback_with_both_reasons() {
        let experiment = sample_experiment();
        // 100 sent, 1 reply (1% < 5% threshold), last reply 8 days ago (>= 7).
        let m = metrics(100, 1, Some(8), 10);
        let verdict = evaluate(&experiment, &m);
        assert_eq!(verdict.action, SafetyAction::RollbackRecommended);
        assert_eq!(verdict.reasons.len(), 2);
    }

    #[test]
    fn healthy_experiment_reports_no_issues() {
        let experiment = sample_experiment();
        let m = metrics(100, 10, Some(1), 10);
        let verdict = evaluate(&experiment, &m);
        assert_eq!(verdict.action, SafetyAction::Ok);
        assert_eq!(verdict.reasons, vec!["No issues detected".to_string()]);
    }

    #[test]
    fn never_replied_experiment_is_treated_as_stale() {
        let experiment = sample_experiment();
        let m = metrics(100, 0, None, 10);
        let verdict = evaluate(&experiment, &m);
        assert_eq!(verdict.action, SafetyAction::RollbackRecommended);
    }
}
