//! Configuration loading and startup validation.

use std::path::Path;

use serde::Deserialize;

use crate::error::MedicError;

/// Operating mode: observer classifies but never acts, live executes
/// approved resurrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Observer,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub stream: StreamConfig,
    pub siem: SiemConfig,
    pub decision: DecisionConfig,
    pub risk: RiskConfig,
    pub resurrection: ResurrectionConfig,
    pub critical_modules: Vec<String>,
    pub always_deny_modules: Vec<String>,
    pub calibration: CalibrationConfig,
    pub http: HttpConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Observer,
            stream: StreamConfig::default(),
            siem: SiemConfig::default(),
            decision: DecisionConfig::default(),
            risk: RiskConfig::default(),
            resurrection: ResurrectionConfig::default(),
            critical_modules: Vec::new(),
            always_deny_modules: Vec::new(),
            calibration: CalibrationConfig::default(),
            http: HttpConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub kind: StreamKind,
    pub endpoint: String,
    pub topic: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Idle time after which another consumer's pending messages are
    /// reclaimed on startup.
    pub reclaim_idle_secs: u64,
    /// Interval between synthetic reports from the mock listener.
    pub mock_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::Durable,
            endpoint: "redis://127.0.0.1:6379".to_string(),
            topic: "smith.events.kill_notifications".to_string(),
            consumer_group: "medic-agent".to_string(),
            consumer_name: "medic-1".to_string(),
            reclaim_idle_secs: 300,
            mock_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Durable,
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiemConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for SiemConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub auto_approve: AutoApproveConfig,
    pub pending_timeout_minutes: i64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            auto_approve: AutoApproveConfig::default(),
            pending_timeout_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoApproveConfig {
    pub enabled: bool,
    pub min_confidence: f64,
    pub max_risk: f64,
}

impl Default for AutoApproveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: 0.85,
            max_risk: 0.30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
        }
    }
}

/// Risk-factor weights. Must sum to 1.0 within 1e-6; the process refuses to
/// start otherwise. `kill_reason` ships at 0.0 so it can be activated from
/// config by rebalancing the others.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub smith_confidence: f64,
    pub siem_risk: f64,
    pub false_positive_history: f64,
    pub module_criticality: f64,
    pub severity: f64,
    pub kill_reason: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            smith_confidence: 0.30,
            siem_risk: 0.25,
            false_positive_history: 0.20,
            module_criticality: 0.15,
            severity: 0.10,
            kill_reason: 0.0,
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.smith_confidence
            + self.siem_risk
            + self.false_positive_history
            + self.module_criticality
            + self.severity
            + self.kill_reason
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResurrectionConfig {
    pub executor: ExecutorKind,
    pub health_check_interval_s: u64,
    pub health_check_timeout_s: u64,
    pub max_retry_attempts: u32,
    /// Total budget for a single resurrection, lookup to rollback.
    pub total_timeout_s: u64,
}

impl Default for ResurrectionConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Container,
            health_check_interval_s: 1,
            health_check_timeout_s: 60,
            max_retry_attempts: 2,
            total_timeout_s: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Container,
    DryRun,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub interval_hours: u64,
    pub window_days: i64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "data/outcomes.db".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, MedicError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MedicError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| MedicError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), MedicError> {
        if let Ok(mode) = std::env::var("MEDIC_MODE") {
            self.mode = match mode.as_str() {
                "observer" => Mode::Observer,
                "live" => Mode::Live,
                other => {
                    return Err(MedicError::Config(format!(
                        "MEDIC_MODE must be 'observer' or 'live', got '{other}'"
                    )))
                }
            };
        }
        Ok(())
    }

    /// Enforce startup invariants. Called before any component is built.
    pub fn validate(&self) -> Result<(), MedicError> {
        let sum = self.risk.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(MedicError::Config(format!(
                "risk weights must sum to 1.0 (got {sum:.6})"
            )));
        }

        let auto = &self.decision.auto_approve;
        if !(0.0..=1.0).contains(&auto.min_confidence) || !(0.0..=1.0).contains(&auto.max_risk) {
            return Err(MedicError::Config(
                "auto_approve thresholds must be in [0, 1]".to_string(),
            ));
        }

        if self.siem.enabled && self.siem.base_url.is_empty() {
            return Err(MedicError::Config(
                "siem.enabled requires siem.base_url".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!((config.risk.weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_skewed_weights_rejected() {
        let mut config = Config::default();
        config.risk.weights.severity = 0.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, MedicError::Config(_)));
    }

    #[test]
    fn test_weight_sum_tolerance() {
        let mut config = Config::default();
        config.risk.weights.severity = 0.10 + 5e-7;
        assert!(config.validate().is_ok());
        config.risk.weights.severity = 0.10 + 5e-6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
mode: live
stream:
  kind: mock
decision:
  auto_approve:
    enabled: true
critical_modules: ["billing", "auth-core"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, Mode::Live);
        assert_eq!(config.stream.kind, StreamKind::Mock);
        assert!(config.decision.auto_approve.enabled);
        assert_eq!(config.critical_modules, vec!["billing", "auth-core"]);
        // Untouched sections keep their defaults.
        assert_eq!(config.resurrection.health_check_timeout_s, 60);
        assert_eq!(config.http.listen, "0.0.0.0:8000");
    }

    #[test]
    fn test_siem_enabled_requires_url() {
        let mut config = Config::default();
        config.siem.enabled = true;
        assert!(config.validate().is_err());
        config.siem.base_url = "http://siem.local:8081".to_string();
        assert!(config.validate().is_ok());
    }
}
