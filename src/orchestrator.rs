//! The single-writer pipeline coordinator.
//!
//! One event at a time: receive → enrich → decide → act → record → ack.
//! Acknowledgement never precedes outcome persistence; a failed step leaves
//! the message un-acked so the stream redelivers it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Mode;
use crate::decision::DecisionEngine;
use crate::error::MedicError;
use crate::listener::{Delivery, KillStream};
use crate::models::{DecisionOutcome, KillReport, OutcomeRecord, OutcomeType};
use crate::pending::{ClaimError, PendingQueue};
use crate::resurrector::{Resurrector, RestartOutcome};
use crate::siem::SiemClient;
use crate::store::OutcomeStore;

/// Kills already recorded within this window are acked without reprocessing.
const DEDUPE_WINDOW_HOURS: i64 = 24;
/// How long to keep retrying a failed outcome write before the store is
/// declared unrecoverable (exit code 3).
const STORE_FATAL_AFTER: Duration = Duration::from_secs(30);
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum ApproveError {
    NotPending,
    InFlight,
    Store(MedicError),
}

pub struct Orchestrator {
    store: OutcomeStore,
    engine: Arc<DecisionEngine>,
    siem: SiemClient,
    resurrector: Arc<Resurrector>,
    pending: Arc<PendingQueue>,
}

impl Orchestrator {
    pub fn new(
        store: OutcomeStore,
        engine: Arc<DecisionEngine>,
        siem: SiemClient,
        resurrector: Arc<Resurrector>,
        pending: Arc<PendingQueue>,
    ) -> Self {
        Self {
            store,
            engine,
            siem,
            resurrector,
            pending,
        }
    }

    /// Main loop. Returns only on shutdown or an unrecoverable store error.
    pub async fn run(
        &self,
        mut stream: KillStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MedicError> {
        let mut processed: u64 = 0;
        tracing::info!(mode = self.engine.mode().as_str(), "orchestrator started");

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = stream.next() => next,
            };

            let Some((message_id, delivery)) = next else {
                continue;
            };

            match delivery {
                Delivery::Report(report) => {
                    match self.store.recent_kill_exists(&report.kill_id, DEDUPE_WINDOW_HOURS).await
                    {
                        Ok(true) => {
                            tracing::info!(
                                kill_id = %report.kill_id,
                                "duplicate kill within dedupe window, acking without reprocessing"
                            );
                            stream.ack(&message_id).await;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            // Proceed; if the store is really down the
                            // record write below will catch it.
                            tracing::warn!(error = %e, "dedupe check failed");
                        }
                    }

                    match self.process_report(&report).await {
                        Ok(record) => {
                            stream.ack(&message_id).await;
                            processed += 1;
                            tracing::info!(
                                kill_id = %report.kill_id,
                                outcome_id = %record.outcome_id,
                                decision = record.original_decision.as_str(),
                                outcome = record.outcome_type.as_str(),
                                processed,
                                "kill report processed"
                            );
                        }
                        Err(e @ MedicError::Store(_)) => {
                            tracing::error!(kill_id = %report.kill_id, error = %e, "outcome store unrecoverable");
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::error!(
                                kill_id = %report.kill_id,
                                error = %e,
                                "failed to process kill report, leaving un-acked"
                            );
                        }
                    }
                }
                Delivery::Invalid { kill_id, reason } => {
                    tracing::warn!(
                        kill_id = kill_id.as_deref().unwrap_or("unknown"),
                        reason = %reason,
                        "invalid kill report"
                    );
                    match self.record_invalid(kill_id.as_deref(), &reason).await {
                        Ok(()) => stream.ack(&message_id).await,
                        Err(e) => {
                            tracing::error!(error = %e, "cannot record invalid input");
                            return Err(e);
                        }
                    }
                }
            }
        }

        tracing::info!(processed, "orchestrator stopped");
        Ok(())
    }

    /// Run one kill report through enrich → decide → act → record.
    /// The returned record has already been durably stored.
    pub async fn process_report(&self, report: &KillReport) -> Result<OutcomeRecord, MedicError> {
        let siem = self.siem.enrich(report).await;
        let mut decision = self.engine.decide(report, &siem).await;

        if decision.outcome == DecisionOutcome::PendingReview
            && self.pending.insert(report.clone(), decision.clone()).is_err()
        {
            tracing::warn!(
                kill_id = %report.kill_id,
                queue_len = self.pending.len(),
                "pending queue full, downgrading to deny (backpressure)"
            );
            decision.outcome = DecisionOutcome::Deny;
            decision.requires_human_review = false;
            decision
                .reasoning
                .push("Pending queue at capacity: denied under backpressure".to_string());
        }

        let mut record = OutcomeRecord::from_decision(&decision, &report.target_module);
        record.metadata = serde_json::json!({
            "kill_reason": report.kill_reason.as_str(),
            "severity": report.severity.as_str(),
            "risk_level": decision.risk_level.as_str(),
            "siem": {
                "risk_score": siem.risk_score,
                "false_positives": siem.false_positive_history,
                "recommendation": siem.recommendation,
            },
        });

        if decision.outcome == DecisionOutcome::ApproveAuto {
            if self.engine.mode() == Mode::Live {
                let result = self.resurrector.restart(&report.target_module).await;
                apply_restart_result(&mut record, &result);
            } else {
                record.metadata["resurrection"] = serde_json::json!({"observer": true});
            }
        }

        self.persist(&record).await?;
        Ok(record)
    }

    /// Record a validation failure as an undetermined outcome so the
    /// message can be acknowledged and never retried.
    pub async fn record_invalid(
        &self,
        kill_id: Option<&str>,
        detail: &str,
    ) -> Result<(), MedicError> {
        let record = OutcomeRecord {
            outcome_id: Uuid::new_v4(),
            decision_id: Uuid::nil(),
            kill_id: kill_id.unwrap_or("unknown").to_string(),
            target_module: "unknown".to_string(),
            recorded_at: Utc::now(),
            outcome_type: OutcomeType::Undetermined,
            original_risk_score: 0.0,
            original_confidence: 0.0,
            original_decision: DecisionOutcome::Defer,
            was_auto_approved: false,
            time_to_healthy_seconds: None,
            health_score_after: None,
            metadata: serde_json::json!({
                "reason": "invalid_input",
                "detail": detail,
            }),
        };
        self.persist(&record).await
    }

    /// Manually approve a pending resurrection. Called from the HTTP
    /// surface; drives the same act-and-record path as the main loop.
    pub async fn approve_pending(
        &self,
        kill_id: &str,
    ) -> Result<(OutcomeRecord, RestartOutcome), ApproveError> {
        let entry = self.pending.claim(kill_id).map_err(|e| match e {
            ClaimError::NotPending => ApproveError::NotPending,
            ClaimError::InFlight => ApproveError::InFlight,
        })?;

        tracing::info!(
            kill_id,
            target_module = %entry.report.target_module,
            "manual approval received"
        );

        let result = self.resurrector.restart(&entry.report.target_module).await;

        let mut record = OutcomeRecord::from_decision(&entry.decision, &entry.report.target_module);
        record.original_decision = DecisionOutcome::ApproveManual;
        record.was_auto_approved = false;
        record.metadata = serde_json::json!({
            "kill_reason": entry.report.kill_reason.as_str(),
            "severity": entry.report.severity.as_str(),
            "risk_level": entry.decision.risk_level.as_str(),
            "approved_via": "api",
        });
        apply_restart_result(&mut record, &result);

        let persisted = self.persist(&record).await;
        self.pending.complete(kill_id);
        persisted.map_err(ApproveError::Store)?;

        Ok((record, result))
    }

    /// Write an expired pending entry as an undetermined outcome.
    async fn record_expired(&self, record_base: OutcomeRecord) -> Result<(), MedicError> {
        let mut record = record_base;
        record.metadata["reason"] = serde_json::Value::String("pending_expired".to_string());
        self.persist(&record).await
    }

    /// Durably store a record, retrying a failing store for up to 30 s
    /// before declaring it unrecoverable.
    async fn persist(&self, record: &OutcomeRecord) -> Result<(), MedicError> {
        let deadline = tokio::time::Instant::now() + STORE_FATAL_AFTER;
        loop {
            match self.store.put(record).await {
                Ok(()) => return Ok(()),
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::warn!(
                        outcome_id = %record.outcome_id,
                        error = %e,
                        "outcome write failed, retrying"
                    );
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn apply_restart_result(record: &mut OutcomeRecord, result: &RestartOutcome) {
    record.outcome_type = result.outcome_type();
    record.time_to_healthy_seconds = result.time_to_healthy();
    record.health_score_after = result.health_score();
    record.metadata["resurrection"] = serde_json::json!({"result": result.as_str()});
}

/// 1 Hz sweep that expires pending entries past their review deadline.
pub async fn run_expiry_ticker(
    orchestrator: Arc<Orchestrator>,
    pending: Arc<PendingQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        for entry in pending.take_expired(Utc::now()) {
            tracing::info!(
                kill_id = %entry.report.kill_id,
                target_module = %entry.report.target_module,
                "pending review expired"
            );
            let base = OutcomeRecord::from_decision(&entry.decision, &entry.report.target_module);
            if let Err(e) = orchestrator.record_expired(base).await {
                tracing::error!(kill_id = %entry.report.kill_id, error = %e, "cannot record expiry");
            }
        }
    }
}

/// Periodic re-calibration of the engine's auto-approval threshold.
pub async fn run_calibration_ticker(
    engine: Arc<DecisionEngine>,
    interval_hours: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(interval_hours.max(1) * 3600);
    let mut tick = tokio::time::interval(period);
    // The startup calibration already ran; skip the immediate first tick.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => engine.calibrate().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StreamKind};
    use crate::models::{KillReason, Severity};

    fn live_config(auto: bool) -> Config {
        let mut config = Config::default();
        config.mode = Mode::Live;
        config.stream.kind = StreamKind::Mock;
        config.decision.auto_approve.enabled = auto;
        config.critical_modules = vec!["billing".to_string()];
        config
    }

    async fn orchestrator_with(config: &Config, siem: SiemClient, queue_capacity: usize) -> Orchestrator {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let engine = Arc::new(DecisionEngine::new(config, store.clone()));
        Orchestrator::new(
            store,
            engine,
            siem,
            Arc::new(Resurrector::dry_run()),
            Arc::new(PendingQueue::new(queue_capacity)),
        )
    }

    /// SIEM enrichment that marks the kill as a likely false positive.
    fn benign_siem() -> SiemClient {
        SiemClient::Fixed(crate::models::SiemResult {
            risk_score: 0.1,
            false_positive_history: 10,
            recommendation: "safe_to_resurrect".to_string(),
        })
    }

    fn report(kill_id: &str, module: &str, severity: Severity, confidence: f64) -> KillReport {
        KillReport {
            kill_id: kill_id.to_string(),
            timestamp: Utc::now(),
            target_module: module.to_string(),
            target_instance_id: "instance-001".to_string(),
            kill_reason: KillReason::AnomalyBehavior,
            severity,
            confidence_score: confidence,
            evidence: vec!["e".to_string(); 4],
            dependencies: vec![],
            source_agent: "smith-1".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    fn low_risk(kill_id: &str) -> KillReport {
        let mut r = report(kill_id, "cache-warm", Severity::Info, 0.05);
        r.kill_reason = KillReason::ResourceExhaustion;
        r
    }

    #[tokio::test]
    async fn test_auto_approved_restart_records_success() {
        let orchestrator = orchestrator_with(&live_config(true), benign_siem(), 10).await;
        let record = orchestrator.process_report(&low_risk("k1")).await.unwrap();

        assert_eq!(record.original_decision, DecisionOutcome::ApproveAuto);
        assert!(record.was_auto_approved);
        assert_eq!(record.outcome_type, OutcomeType::Success);
        assert_eq!(record.time_to_healthy_seconds, Some(0.0));
        assert_eq!(record.health_score_after, Some(1.0));

        // Durable before ack: the record is already queryable.
        let recent = orchestrator.store.list_recent(1).await.unwrap();
        assert_eq!(recent[0].kill_id, "k1");
    }

    #[tokio::test]
    async fn test_denied_kill_records_undetermined_without_restart() {
        let orchestrator = orchestrator_with(&live_config(true), SiemClient::Noop, 10).await;
        let denied = report("k2", "billing", Severity::Critical, 0.9);
        let record = orchestrator.process_report(&denied).await.unwrap();

        assert_eq!(record.original_decision, DecisionOutcome::Deny);
        assert_eq!(record.outcome_type, OutcomeType::Undetermined);
        assert!(!record.was_auto_approved);
        match orchestrator.resurrector.as_ref() {
            Resurrector::DryRun(dry) => assert!(dry.restarted_modules().is_empty()),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_pending_review_queues_entry() {
        let orchestrator = orchestrator_with(&live_config(false), SiemClient::Noop, 10).await;
        let record = orchestrator.process_report(&low_risk("k3")).await.unwrap();

        assert_eq!(record.original_decision, DecisionOutcome::PendingReview);
        assert_eq!(record.outcome_type, OutcomeType::Undetermined);
        assert_eq!(orchestrator.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_downgrades_to_deny() {
        let orchestrator = orchestrator_with(&live_config(false), SiemClient::Noop, 1).await;
        orchestrator.process_report(&low_risk("k4")).await.unwrap();
        let record = orchestrator.process_report(&low_risk("k5")).await.unwrap();

        assert_eq!(record.original_decision, DecisionOutcome::Deny);
        assert_eq!(orchestrator.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_observer_mode_never_restarts() {
        let mut config = live_config(true);
        config.mode = Mode::Observer;
        let orchestrator = orchestrator_with(&config, benign_siem(), 10).await;

        let record = orchestrator.process_report(&low_risk("k6")).await.unwrap();
        assert_eq!(record.original_decision, DecisionOutcome::ApproveAuto);
        assert_eq!(record.outcome_type, OutcomeType::Undetermined);
        match orchestrator.resurrector.as_ref() {
            Resurrector::DryRun(dry) => assert!(dry.restarted_modules().is_empty()),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_invalid_input_recorded_as_undetermined() {
        let orchestrator = orchestrator_with(&live_config(true), SiemClient::Noop, 10).await;
        orchestrator
            .record_invalid(Some("bad-kill"), "target_module: path traversal detected")
            .await
            .unwrap();

        let recent = orchestrator.store.list_recent(1).await.unwrap();
        assert_eq!(recent[0].kill_id, "bad-kill");
        assert_eq!(recent[0].outcome_type, OutcomeType::Undetermined);
        assert_eq!(recent[0].metadata["reason"], "invalid_input");
    }

    #[tokio::test]
    async fn test_manual_approval_flow() {
        let orchestrator = orchestrator_with(&live_config(false), SiemClient::Noop, 10).await;
        orchestrator.process_report(&low_risk("k7")).await.unwrap();

        let (record, result) = orchestrator.approve_pending("k7").await.unwrap();
        assert_eq!(record.original_decision, DecisionOutcome::ApproveManual);
        assert_eq!(record.outcome_type, OutcomeType::Success);
        assert!(matches!(result, RestartOutcome::Success { .. }));
        assert!(!record.was_auto_approved);

        // Entry consumed: a second approval is a 404.
        assert!(matches!(
            orchestrator.approve_pending("k7").await,
            Err(ApproveError::NotPending)
        ));
    }

    #[tokio::test]
    async fn test_expired_pending_recorded() {
        let mut config = live_config(false);
        config.decision.pending_timeout_minutes = 0;
        let orchestrator = orchestrator_with(&config, SiemClient::Noop, 10).await;
        orchestrator.process_report(&low_risk("k8")).await.unwrap();

        let expired = orchestrator
            .pending
            .take_expired(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(expired.len(), 1);
        let base =
            OutcomeRecord::from_decision(&expired[0].decision, &expired[0].report.target_module);
        orchestrator.record_expired(base).await.unwrap();

        let recent = orchestrator.store.list_recent(1).await.unwrap();
        assert_eq!(recent[0].kill_id, "k8");
        assert_eq!(recent[0].outcome_type, OutcomeType::Undetermined);
        assert_eq!(recent[0].metadata["reason"], "pending_expired");

        // Nothing pending any more.
        assert!(matches!(
            orchestrator.approve_pending("k8").await,
            Err(ApproveError::NotPending)
        ));
    }
}
