//! Risk scoring and resurrection decisions.
//!
//! The engine fuses the kill report, SIEM enrichment and outcome-store
//! history into a weighted risk score, classifies it into an outcome under
//! the operating mode's rules, and periodically re-calibrates its
//! auto-approval confidence bar from historical accuracy.
//!
//! Scoring and classification are total: missing inputs default, store
//! failures degrade to empty history, and no path can fail a decision.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{Config, Mode, RiskWeights};
use crate::models::{
    Decision, DecisionOutcome, KillReason, KillReport, RiskLevel, SiemResult,
};
use crate::store::OutcomeStore;

/// Calibration floor and ceiling for the auto-approval confidence bar.
const CALIBRATION_FLOOR: f64 = 0.70;
const CALIBRATION_CEILING: f64 = 0.99;
const CALIBRATION_MIN_SAMPLES: i64 = 50;

/// Killer confidence above which a threat-detected kill is denied outright.
const IMMEDIATE_DENY_CONFIDENCE: f64 = 0.95;

/// Criticality factor for modules outside the critical set.
const NON_CRITICAL_FACTOR: f64 = 0.3;

/// Evidence contribution to decision confidence: 0.05 per item, capped.
const EVIDENCE_BOOST_PER_ITEM: f64 = 0.05;
const EVIDENCE_BOOST_CAP: f64 = 0.2;

#[derive(Debug, Clone, Serialize)]
pub struct DecisionCounters {
    pub total: u64,
    pub approve_auto: u64,
    pub approve_manual: u64,
    pub pending_review: u64,
    pub deny: u64,
    pub defer: u64,
}

struct EngineState {
    auto_min_confidence: f64,
    decision_count: u64,
    outcome_counts: HashMap<DecisionOutcome, u64>,
    /// (auto_approved, auto_approved_success) as of the last calibration
    /// that inspected them; calibration with identical counts is a no-op.
    last_calibration_sample: Option<(i64, i64)>,
}

pub struct DecisionEngine {
    mode: Mode,
    auto_approve_enabled: bool,
    auto_max_risk: f64,
    weights: RiskWeights,
    critical_modules: HashSet<String>,
    always_deny_modules: HashSet<String>,
    pending_timeout_minutes: i64,
    history_window_days: i64,
    store: OutcomeStore,
    state: Mutex<EngineState>,
}

impl DecisionEngine {
    /// The store reference is a read-only view: the engine never writes,
    /// only the orchestrator does.
    pub fn new(config: &Config, store: OutcomeStore) -> Self {
        Self {
            mode: config.mode,
            auto_approve_enabled: config.decision.auto_approve.enabled,
            auto_max_risk: config.decision.auto_approve.max_risk,
            weights: config.risk.weights.clone(),
            critical_modules: config.critical_modules.iter().cloned().collect(),
            always_deny_modules: config.always_deny_modules.iter().cloned().collect(),
            pending_timeout_minutes: config.decision.pending_timeout_minutes,
            history_window_days: config.calibration.window_days,
            store,
            state: Mutex::new(EngineState {
                auto_min_confidence: config.decision.auto_approve.min_confidence,
                decision_count: 0,
                outcome_counts: HashMap::new(),
                last_calibration_sample: None,
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current auto-approval confidence bar (calibration target).
    pub fn auto_min_confidence(&self) -> f64 {
        self.state.lock().auto_min_confidence
    }

    pub fn counters(&self) -> DecisionCounters {
        let state = self.state.lock();
        let count = |o: DecisionOutcome| state.outcome_counts.get(&o).copied().unwrap_or(0);
        DecisionCounters {
            total: state.decision_count,
            approve_auto: count(DecisionOutcome::ApproveAuto),
            approve_manual: count(DecisionOutcome::ApproveManual),
            pending_review: count(DecisionOutcome::PendingReview),
            deny: count(DecisionOutcome::Deny),
            defer: count(DecisionOutcome::Defer),
        }
    }

    /// Evaluate a kill report and produce a decision.
    pub async fn decide(&self, report: &KillReport, siem: &SiemResult) -> Decision {
        if let Some(decision) = self.immediate_deny(report) {
            self.count(decision.outcome);
            return decision;
        }

        let module_history = match self
            .store
            .module_history(&report.target_module, self.history_window_days)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    kill_id = %report.kill_id,
                    error = %e,
                    "module history unavailable, scoring without it"
                );
                0
            }
        };

        let risk_score = self.risk_score(report, siem, module_history);
        let risk_level = RiskLevel::from_score(risk_score);
        let confidence = decision_confidence(risk_score, report.evidence.len());

        let mut reasoning = self
            .build_reasoning(report, siem, module_history, risk_level)
            .await;

        let is_critical = self.critical_modules.contains(&report.target_module);
        let auto_min_confidence = self.state.lock().auto_min_confidence;
        let outcome = self.classify(
            risk_score,
            confidence,
            is_critical,
            auto_min_confidence,
            &mut reasoning,
        );

        let decision = Decision {
            decision_id: Uuid::new_v4(),
            kill_id: report.kill_id.clone(),
            timestamp: Utc::now(),
            outcome,
            risk_level,
            risk_score,
            confidence,
            reasoning,
            recommended_action: recommended_action(outcome, risk_level).to_string(),
            requires_human_review: outcome == DecisionOutcome::PendingReview,
            timeout_minutes: self.pending_timeout_minutes,
        };

        self.count(outcome);

        tracing::info!(
            kill_id = %report.kill_id,
            decision_id = %decision.decision_id,
            outcome = outcome.as_str(),
            risk_level = risk_level.as_str(),
            risk_score,
            confidence,
            "decision made"
        );

        decision
    }

    fn immediate_deny(&self, report: &KillReport) -> Option<Decision> {
        let mut reasoning = Vec::new();

        if self.always_deny_modules.contains(&report.target_module) {
            reasoning.push(format!(
                "Module '{}' is on the deny list",
                report.target_module
            ));
        }
        if report.kill_reason == KillReason::ThreatDetected
            && report.confidence_score > IMMEDIATE_DENY_CONFIDENCE
        {
            reasoning.push(format!(
                "Kill reason is confirmed threat with {:.0}% confidence",
                report.confidence_score * 100.0
            ));
        }

        if reasoning.is_empty() {
            return None;
        }
        reasoning.insert(0, "Immediate denial triggered".to_string());

        Some(Decision {
            decision_id: Uuid::new_v4(),
            kill_id: report.kill_id.clone(),
            timestamp: Utc::now(),
            outcome: DecisionOutcome::Deny,
            risk_level: RiskLevel::Critical,
            risk_score: 0.95,
            confidence: 0.95,
            reasoning,
            recommended_action: "Do not resurrect - threat confirmed".to_string(),
            requires_human_review: false,
            timeout_minutes: self.pending_timeout_minutes,
        })
    }

    /// Weighted sum of the normalized risk factors, clamped to [0, 1].
    fn risk_score(&self, report: &KillReport, siem: &SiemResult, module_history: i64) -> f64 {
        let w = &self.weights;

        let smith = w.smith_confidence * report.confidence_score;
        let siem_risk = w.siem_risk * siem.risk_score;

        // Prior false positives make a resurrection safer: the factor value
        // saturates at fp = 10 and enters the sum inverted.
        let fp = siem.false_positive_history as f64 + module_history as f64;
        let fp_value = (fp / 10.0).min(1.0);
        let fp_history = w.false_positive_history * (1.0 - fp_value);

        let criticality = w.module_criticality
            * if self.critical_modules.contains(&report.target_module) {
                1.0
            } else {
                NON_CRITICAL_FACTOR
            };

        let severity = w.severity * report.severity.factor_score();
        let kill_reason = w.kill_reason * report.kill_reason.factor_score();

        (smith + siem_risk + fp_history + criticality + severity + kill_reason).clamp(0.0, 1.0)
    }

    async fn build_reasoning(
        &self,
        report: &KillReport,
        siem: &SiemResult,
        module_history: i64,
        risk_level: RiskLevel,
    ) -> Vec<String> {
        let mut reasoning = vec![
            format!(
                "Module '{}' killed by Smith ({}) with {:.0}% confidence",
                report.target_module,
                report.kill_reason.as_str(),
                report.confidence_score * 100.0
            ),
            format!(
                "SIEM risk assessment: {:.0}% ({})",
                siem.risk_score * 100.0,
                siem.recommendation
            ),
        ];

        if siem.false_positive_history > 0 {
            reasoning.push(format!(
                "Module has {} prior false positives",
                siem.false_positive_history
            ));
        }
        if module_history > 0 {
            reasoning.push(format!(
                "Module has {} failed resurrections in the last {} days",
                module_history, self.history_window_days
            ));
        }

        if let Ok(stats) = self.store.module_stats(&report.target_module).await {
            if stats.total > 0 {
                reasoning.push(format!(
                    "Module resurrection history: {} attempts, {:.0}% success",
                    stats.total,
                    stats.success_rate * 100.0
                ));
            }
        }

        reasoning.push(format!("Overall risk assessment: {}", risk_level.as_str()));
        reasoning
    }

    fn classify(
        &self,
        risk_score: f64,
        confidence: f64,
        is_critical: bool,
        auto_min_confidence: f64,
        reasoning: &mut Vec<String>,
    ) -> DecisionOutcome {
        let auto_eligible = risk_score < self.auto_max_risk && confidence >= auto_min_confidence;

        if auto_eligible {
            match self.mode {
                Mode::Observer => {
                    reasoning.push("Observer mode: decision is advisory only".to_string());
                    return DecisionOutcome::ApproveAuto;
                }
                Mode::Live if self.auto_approve_enabled => {
                    return DecisionOutcome::ApproveAuto;
                }
                Mode::Live => {
                    reasoning.push("Auto-approve disabled: queued for review".to_string());
                    return DecisionOutcome::PendingReview;
                }
            }
        }

        if risk_score >= 0.9 {
            DecisionOutcome::Deny
        } else if risk_score >= 0.6 && is_critical {
            reasoning.push("Critical module at elevated risk".to_string());
            DecisionOutcome::Deny
        } else {
            DecisionOutcome::PendingReview
        }
    }

    fn count(&self, outcome: DecisionOutcome) {
        let mut state = self.state.lock();
        state.decision_count += 1;
        *state.outcome_counts.entry(outcome).or_insert(0) += 1;
    }

    /// Adjust the auto-approval confidence bar from historical accuracy.
    /// Invoked at startup and then on the calibration ticker.
    pub async fn calibrate(&self) {
        let stats = match self.store.statistics(self.history_window_days).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "calibration skipped: statistics unavailable");
                return;
            }
        };

        if stats.auto_approved < CALIBRATION_MIN_SAMPLES {
            tracing::info!(
                auto_approved = stats.auto_approved,
                required = CALIBRATION_MIN_SAMPLES,
                "calibration skipped: insufficient data"
            );
            return;
        }

        let sample = (stats.auto_approved, stats.auto_approved_success);
        let accuracy = stats.auto_approve_accuracy;

        let mut state = self.state.lock();
        if state.last_calibration_sample == Some(sample) {
            tracing::info!("calibration skipped: no new outcomes since last run");
            return;
        }
        state.last_calibration_sample = Some(sample);

        let old = state.auto_min_confidence;
        let new = if accuracy > 0.95 {
            (old - 0.02).max(CALIBRATION_FLOOR)
        } else if accuracy < 0.80 {
            (old + 0.05).min(CALIBRATION_CEILING)
        } else {
            old
        };

        if (new - old).abs() > f64::EPSILON {
            state.auto_min_confidence = new;
            tracing::info!(
                accuracy,
                old_threshold = old,
                new_threshold = new,
                sample_size = stats.auto_approved,
                "calibration adjusted auto-approve confidence threshold"
            );
        } else {
            tracing::info!(
                accuracy,
                threshold = old,
                sample_size = stats.auto_approved,
                "calibration: threshold unchanged"
            );
        }
    }
}

/// Decision confidence: unambiguous (very low or very high) risk with strong
/// evidence yields the highest confidence; scores near the middle are the
/// least certain.
fn decision_confidence(risk_score: f64, evidence_len: usize) -> f64 {
    let boost = (EVIDENCE_BOOST_PER_ITEM * evidence_len as f64).min(EVIDENCE_BOOST_CAP);
    let ambiguity = (1.0 - 2.0 * (risk_score - 0.5).abs()).clamp(0.0, 1.0);
    (1.0 - ambiguity * (1.0 - boost)).clamp(0.0, 1.0)
}

fn recommended_action(outcome: DecisionOutcome, risk_level: RiskLevel) -> &'static str {
    match outcome {
        DecisionOutcome::Deny => "Do not resurrect - risk too high",
        DecisionOutcome::ApproveAuto => "Auto-resurrect - low risk with high confidence",
        DecisionOutcome::PendingReview => match risk_level {
            RiskLevel::Minimal | RiskLevel::Low => {
                "Manual review recommended - likely safe to resurrect"
            }
            _ => "Manual review required - moderate risk assessment",
        },
        DecisionOutcome::Defer => "Gather additional information before deciding",
        DecisionOutcome::ApproveManual => "Approve resurrection after human verification",
    }
}
