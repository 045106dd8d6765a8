//! Intake validation for kill-report fields.
//!
//! Every wire field passes through a validator that either returns a
//! normalized value or a typed failure. Validation failures never block the
//! pipeline: the orchestrator records them as undetermined outcomes and
//! acknowledges the message.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::models::{KillReason, KillReport, Severity};

pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_EVIDENCE_ITEMS: usize = 100;
pub const MAX_EVIDENCE_ITEM_BYTES: usize = 10 * 1024;
pub const MAX_DEPENDENCY_COUNT: usize = 100;
pub const MAX_METADATA_BYTES: usize = 100 * 1024;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,254}$").expect("static pattern"));

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub field: String,
    pub reason: String,
}

impl ValidationFailure {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationFailure {}

/// Kill report as deserialized from the wire, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKillReport {
    pub kill_id: String,
    pub timestamp: String,
    pub target_module: String,
    pub target_instance_id: String,
    pub kill_reason: String,
    pub severity: String,
    pub confidence_score: f64,
    pub evidence: Vec<String>,
    pub dependencies: Vec<String>,
    pub source_agent: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Validate a module or instance identifier.
///
/// Rejects path traversal, path separators, null bytes and anything outside
/// the `[A-Za-z0-9][A-Za-z0-9_.-]{0,254}` name pattern.
pub fn validate_name(value: &str, field: &str) -> Result<String, ValidationFailure> {
    if value.is_empty() {
        return Err(ValidationFailure::new(field, "cannot be empty"));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(ValidationFailure::new(
            field,
            format!("too long: {} characters (max {})", value.len(), MAX_NAME_LENGTH),
        ));
    }
    if value.contains('\0') {
        return Err(ValidationFailure::new(field, "contains null bytes"));
    }
    if value.contains("..") || value.contains('/') || value.contains('\\') {
        return Err(ValidationFailure::new(field, "path traversal detected"));
    }
    if !NAME_PATTERN.is_match(value) {
        return Err(ValidationFailure::new(
            field,
            "must start with alphanumeric and contain only alphanumeric, underscore, hyphen or dot",
        ));
    }
    Ok(value.to_string())
}

/// Validate a unit-interval score. Exact bounds are accepted; anything
/// outside is an error, including NaN.
pub fn validate_unit_score(value: f64, field: &str) -> Result<f64, ValidationFailure> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationFailure::new(
            field,
            format!("must be between 0.0 and 1.0, got {value}"),
        ));
    }
    Ok(value)
}

/// Validate the evidence list: at most 100 items of at most 10 KiB each.
pub fn validate_evidence(evidence: &[String], field: &str) -> Result<Vec<String>, ValidationFailure> {
    if evidence.len() > MAX_EVIDENCE_ITEMS {
        return Err(ValidationFailure::new(
            field,
            format!("too many items: {} (max {})", evidence.len(), MAX_EVIDENCE_ITEMS),
        ));
    }
    for (i, item) in evidence.iter().enumerate() {
        if item.len() > MAX_EVIDENCE_ITEM_BYTES {
            return Err(ValidationFailure::new(
                &format!("{field}[{i}]"),
                format!("too long: {} bytes (max {})", item.len(), MAX_EVIDENCE_ITEM_BYTES),
            ));
        }
    }
    Ok(evidence.to_vec())
}

/// Validate the dependency list: bounded count, each entry a valid name.
pub fn validate_dependencies(
    deps: &[String],
    field: &str,
) -> Result<Vec<String>, ValidationFailure> {
    if deps.len() > MAX_DEPENDENCY_COUNT {
        return Err(ValidationFailure::new(
            field,
            format!("too many items: {} (max {})", deps.len(), MAX_DEPENDENCY_COUNT),
        ));
    }
    deps.iter()
        .enumerate()
        .map(|(i, dep)| validate_name(dep, &format!("{field}[{i}]")))
        .collect()
}

/// Validate the metadata map: its canonical JSON serialization must fit in
/// 100 KiB.
pub fn validate_metadata(
    metadata: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ValidationFailure> {
    let serialized = serde_json::to_string(metadata)
        .map_err(|e| ValidationFailure::new(field, format!("not serializable: {e}")))?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(ValidationFailure::new(
            field,
            format!("too large: {} bytes (max {})", serialized.len(), MAX_METADATA_BYTES),
        ));
    }
    Ok(metadata.clone())
}

/// Validate and normalize a raw wire report into a `KillReport`.
pub fn validate_report(raw: RawKillReport) -> Result<KillReport, ValidationFailure> {
    if raw.kill_id.is_empty() {
        return Err(ValidationFailure::new("kill_id", "cannot be empty"));
    }

    let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ValidationFailure::new("timestamp", format!("not RFC3339: {e}")))?;

    let target_module = validate_name(&raw.target_module, "target_module")?;
    let target_instance_id = validate_name(&raw.target_instance_id, "target_instance_id")?;

    let kill_reason = KillReason::from_wire(&raw.kill_reason)
        .ok_or_else(|| ValidationFailure::new("kill_reason", format!("unknown value '{}'", raw.kill_reason)))?;

    // Unknown severities degrade to medium rather than rejecting; scoring
    // must stay total even when the killer ships a new level.
    let severity = Severity::from_wire(&raw.severity).unwrap_or_else(|| {
        tracing::warn!(severity = %raw.severity, "unknown severity, defaulting to medium");
        Severity::Medium
    });

    let confidence_score = validate_unit_score(raw.confidence_score, "confidence_score")?;
    let evidence = validate_evidence(&raw.evidence, "evidence")?;
    let dependencies = validate_dependencies(&raw.dependencies, "dependencies")?;
    let metadata = validate_metadata(&raw.metadata, "metadata")?;

    Ok(KillReport {
        kill_id: raw.kill_id,
        timestamp,
        target_module,
        target_instance_id,
        kill_reason,
        severity,
        confidence_score,
        evidence,
        dependencies,
        source_agent: raw.source_agent,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawKillReport {
        RawKillReport {
            kill_id: "k-123".to_string(),
            timestamp: "2026-08-01T12:00:00Z".to_string(),
            target_module: "nginx-test".to_string(),
            target_instance_id: "instance-001".to_string(),
            kill_reason: "anomaly_behavior".to_string(),
            severity: "low".to_string(),
            confidence_score: 0.4,
            evidence: vec!["unusual_traffic".to_string()],
            dependencies: vec![],
            source_agent: "smith-1".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_valid_report_passes() {
        let report = validate_report(raw()).unwrap();
        assert_eq!(report.target_module, "nginx-test");
        assert_eq!(report.severity, Severity::Low);
    }

    #[test]
    fn test_name_rejects_traversal_and_separators() {
        assert!(validate_name("../etc/passwd", "m").is_err());
        assert!(validate_name("a/b", "m").is_err());
        assert!(validate_name("a\\b", "m").is_err());
        assert!(validate_name("a\0b", "m").is_err());
        assert!(validate_name("", "m").is_err());
        assert!(validate_name("-leading-dash", "m").is_err());
    }

    #[test]
    fn test_name_length_boundary() {
        let max = "a".repeat(MAX_NAME_LENGTH);
        assert!(validate_name(&max, "m").is_ok());
        let over = "a".repeat(MAX_NAME_LENGTH + 1);
        assert!(validate_name(&over, "m").is_err());
    }

    #[test]
    fn test_score_bounds_inclusive() {
        assert_eq!(validate_unit_score(0.0, "s").unwrap(), 0.0);
        assert_eq!(validate_unit_score(1.0, "s").unwrap(), 1.0);
        assert!(validate_unit_score(-0.001, "s").is_err());
        assert!(validate_unit_score(1.001, "s").is_err());
        assert!(validate_unit_score(f64::NAN, "s").is_err());
    }

    #[test]
    fn test_evidence_boundaries() {
        let at_cap: Vec<String> = (0..MAX_EVIDENCE_ITEMS)
            .map(|_| "x".repeat(MAX_EVIDENCE_ITEM_BYTES))
            .collect();
        assert!(validate_evidence(&at_cap, "evidence").is_ok());

        let over_count: Vec<String> = (0..MAX_EVIDENCE_ITEMS + 1).map(|_| "x".to_string()).collect();
        assert!(validate_evidence(&over_count, "evidence").is_err());

        let over_size = vec!["x".repeat(MAX_EVIDENCE_ITEM_BYTES + 1)];
        assert!(validate_evidence(&over_size, "evidence").is_err());
    }

    #[test]
    fn test_metadata_size_limit() {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "blob".to_string(),
            serde_json::Value::String("x".repeat(MAX_METADATA_BYTES)),
        );
        assert!(validate_metadata(&metadata, "metadata").is_err());

        let mut small = serde_json::Map::new();
        small.insert("k".to_string(), serde_json::Value::String("v".to_string()));
        assert!(validate_metadata(&small, "metadata").is_ok());
    }

    #[test]
    fn test_unknown_reason_rejected_unknown_severity_defaults() {
        let mut bad_reason = raw();
        bad_reason.kill_reason = "cosmic_ray".to_string();
        assert!(validate_report(bad_reason).is_err());

        let mut odd_severity = raw();
        odd_severity.severity = "apocalyptic".to_string();
        let report = validate_report(odd_severity).unwrap();
        assert_eq!(report.severity, Severity::Medium);
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        let mut bad = raw();
        bad.timestamp = "yesterday".to_string();
        let err = validate_report(bad).unwrap_err();
        assert_eq!(err.field, "timestamp");
    }
}
