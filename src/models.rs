//! Core data structures for kill reports and resurrection decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Categorized reasons for a kill event from Smith.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    ThreatDetected,
    AnomalyBehavior,
    PolicyViolation,
    ResourceExhaustion,
    DependencyCascade,
    ManualOverride,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreatDetected => "threat_detected",
            Self::AnomalyBehavior => "anomaly_behavior",
            Self::PolicyViolation => "policy_violation",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::DependencyCascade => "dependency_cascade",
            Self::ManualOverride => "manual_override",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "threat_detected" => Some(Self::ThreatDetected),
            "anomaly_behavior" => Some(Self::AnomalyBehavior),
            "policy_violation" => Some(Self::PolicyViolation),
            "resource_exhaustion" => Some(Self::ResourceExhaustion),
            "dependency_cascade" => Some(Self::DependencyCascade),
            "manual_override" => Some(Self::ManualOverride),
            _ => None,
        }
    }

    /// Baseline risk contribution of the kill reason, normalized to [0,1].
    pub fn factor_score(&self) -> f64 {
        match self {
            Self::ThreatDetected => 0.9,
            Self::AnomalyBehavior => 0.6,
            Self::PolicyViolation => 0.5,
            Self::ResourceExhaustion => 0.2,
            Self::DependencyCascade => 0.3,
            Self::ManualOverride => 0.4,
        }
    }
}

/// Threat severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    /// Risk contribution of the severity level, normalized to [0,1].
    pub fn factor_score(&self) -> f64 {
        match self {
            Self::Info => 0.0,
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

/// Inbound kill notification from Smith. Immutable once validated.
#[derive(Debug, Clone, Serialize)]
pub struct KillReport {
    pub kill_id: String,
    pub timestamp: DateTime<Utc>,
    pub target_module: String,
    pub target_instance_id: String,
    pub kill_reason: KillReason,
    pub severity: Severity,
    pub confidence_score: f64,
    pub evidence: Vec<String>,
    pub dependencies: Vec<String>,
    pub source_agent: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// SIEM enrichment payload. The `Default` value is the no-op sentinel used
/// when enrichment is disabled or the SIEM is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiemResult {
    pub risk_score: f64,
    pub false_positive_history: u32,
    pub recommendation: String,
}

impl Default for SiemResult {
    fn default() -> Self {
        Self {
            risk_score: 0.5,
            false_positive_history: 0,
            recommendation: "unknown".to_string(),
        }
    }
}

/// Possible outcomes of a resurrection decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    ApproveAuto,
    ApproveManual,
    PendingReview,
    Deny,
    Defer,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveAuto => "approve_auto",
            Self::ApproveManual => "approve_manual",
            Self::PendingReview => "pending_review",
            Self::Deny => "deny",
            Self::Defer => "defer",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "approve_auto" => Some(Self::ApproveAuto),
            "approve_manual" => Some(Self::ApproveManual),
            "pending_review" => Some(Self::PendingReview),
            "deny" => Some(Self::Deny),
            "defer" => Some(Self::Defer),
            _ => None,
        }
    }
}

/// Risk level categories with associated score ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a risk score: Minimal [0,0.2), Low [0.2,0.4), Medium
    /// [0.4,0.6), High [0.6,0.8), Critical [0.8,1.0].
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            Self::Minimal
        } else if score < 0.4 {
            Self::Low
        } else if score < 0.6 {
            Self::Medium
        } else if score < 0.8 {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Engine output for a single kill report. Created atomically, never mutated
/// after the orchestrator records it.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub kill_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: DecisionOutcome,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub confidence: f64,
    pub reasoning: Vec<String>,
    pub recommended_action: String,
    pub requires_human_review: bool,
    pub timeout_minutes: i64,
}

/// Final outcome of processing a kill report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Success,
    #[serde(rename = "partial")]
    PartialSuccess,
    Failure,
    ReKilled,
    Rollback,
    Undetermined,
}

impl OutcomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial",
            Self::Failure => "failure",
            Self::ReKilled => "re_killed",
            Self::Rollback => "rollback",
            Self::Undetermined => "undetermined",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::PartialSuccess),
            "failure" => Some(Self::Failure),
            "re_killed" => Some(Self::ReKilled),
            "rollback" => Some(Self::Rollback),
            "undetermined" => Some(Self::Undetermined),
            _ => None,
        }
    }
}

/// Durable record of a decision and its result.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub outcome_id: Uuid,
    pub decision_id: Uuid,
    pub kill_id: String,
    pub target_module: String,
    pub recorded_at: DateTime<Utc>,
    pub outcome_type: OutcomeType,
    pub original_risk_score: f64,
    pub original_confidence: f64,
    pub original_decision: DecisionOutcome,
    pub was_auto_approved: bool,
    pub time_to_healthy_seconds: Option<f64>,
    pub health_score_after: Option<f64>,
    pub metadata: serde_json::Value,
}

impl OutcomeRecord {
    /// Base record for a decision before any resurrection has run.
    pub fn from_decision(decision: &Decision, target_module: &str) -> Self {
        Self {
            outcome_id: Uuid::new_v4(),
            decision_id: decision.decision_id,
            kill_id: decision.kill_id.clone(),
            target_module: target_module.to_string(),
            recorded_at: Utc::now(),
            outcome_type: OutcomeType::Undetermined,
            original_risk_score: decision.risk_score,
            original_confidence: decision.confidence,
            original_decision: decision.outcome,
            was_auto_approved: decision.outcome == DecisionOutcome::ApproveAuto,
            time_to_healthy_seconds: None,
            health_score_after: None,
            metadata: serde_json::json!({
                "risk_level": decision.risk_level.as_str(),
            }),
        }
    }
}
