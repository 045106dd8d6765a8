//! Container resurrection executor.
//!
//! Restarts a named container and verifies it became healthy within a
//! bounded time. A container that fails its post-restart health check is
//! rolled back (stopped) so a possibly-compromised module never lingers
//! half-alive.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{InspectContainerOptions, RestartContainerOptions, StopContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::models::HealthStatusEnum;
use bollard::Docker;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::ResurrectionConfig;
use crate::error::MedicError;
use crate::models::OutcomeType;

/// Stop-timeout passed to the runtime when restarting.
const RESTART_STOP_TIMEOUT_S: isize = 30;
/// Stop-timeout used for rollback.
const ROLLBACK_STOP_TIMEOUT_S: i64 = 10;
/// Delay between restart attempts on transient runtime errors.
const RETRY_DELAY_MS: u64 = 500;
/// A container without a health spec counts as healthy after running this
/// long without exiting.
const NO_HEALTHCHECK_GRACE_S: f64 = 2.0;

/// Result of a resurrection attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartOutcome {
    Success { time_to_healthy: f64 },
    NotFound,
    Unhealthy,
    Timeout,
}

impl RestartOutcome {
    pub fn outcome_type(&self) -> OutcomeType {
        match self {
            Self::Success { .. } => OutcomeType::Success,
            Self::NotFound => OutcomeType::Failure,
            Self::Unhealthy | Self::Timeout => OutcomeType::Rollback,
        }
    }

    pub fn time_to_healthy(&self) -> Option<f64> {
        match self {
            Self::Success { time_to_healthy } => Some(*time_to_healthy),
            _ => None,
        }
    }

    pub fn health_score(&self) -> Option<f64> {
        match self {
            Self::Success { .. } => Some(1.0),
            Self::Unhealthy | Self::Timeout => Some(0.0),
            Self::NotFound => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NotFound => "not_found",
            Self::Unhealthy => "unhealthy",
            Self::Timeout => "timeout",
        }
    }
}

pub enum Resurrector {
    Docker(DockerResurrector),
    DryRun(DryRunResurrector),
}

impl Resurrector {
    pub fn docker(config: ResurrectionConfig) -> Result<Self, MedicError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| MedicError::Runtime(format!("cannot connect to container runtime: {e}")))?;
        Ok(Self::Docker(DockerResurrector { docker, config }))
    }

    pub fn dry_run() -> Self {
        Self::dry_run_with_outcomes(HashMap::new())
    }

    /// Dry-run executor with scripted per-module results. Modules not in
    /// the table restart successfully.
    pub fn dry_run_with_outcomes(outcomes: HashMap<String, RestartOutcome>) -> Self {
        Self::DryRun(DryRunResurrector {
            history: Mutex::new(Vec::new()),
            outcomes,
        })
    }

    /// Restart the container backing `target_module`. Infallible by
    /// contract: runtime failures map onto the outcome variants.
    pub async fn restart(&self, target_module: &str) -> RestartOutcome {
        match self {
            Self::Docker(inner) => inner.restart(target_module).await,
            Self::DryRun(inner) => inner.restart(target_module),
        }
    }
}

pub struct DockerResurrector {
    docker: Docker,
    config: ResurrectionConfig,
}

impl DockerResurrector {
    async fn restart(&self, target_module: &str) -> RestartOutcome {
        let budget = Duration::from_secs(self.config.total_timeout_s);
        match tokio::time::timeout(budget, self.restart_inner(target_module)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    target_module,
                    budget_s = self.config.total_timeout_s,
                    "resurrection exceeded total budget, rolling back"
                );
                self.rollback(target_module).await;
                RestartOutcome::Timeout
            }
        }
    }

    async fn restart_inner(&self, target_module: &str) -> RestartOutcome {
        match self.lookup(target_module).await {
            Lookup::Found => {}
            Lookup::Missing => {
                tracing::error!(target_module, "container not found for resurrection");
                return RestartOutcome::NotFound;
            }
            Lookup::Error => return RestartOutcome::Unhealthy,
        }

        if !self.restart_with_retries(target_module).await {
            return RestartOutcome::Unhealthy;
        }

        let started = Instant::now();
        let outcome = self.poll_health(target_module, started).await;
        match outcome {
            RestartOutcome::Unhealthy | RestartOutcome::Timeout => {
                self.rollback(target_module).await;
            }
            _ => {}
        }
        outcome
    }

    async fn lookup(&self, name: &str) -> Lookup {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Lookup::Found,
            Err(e) if is_not_found(&e) => Lookup::Missing,
            Err(e) => {
                tracing::error!(target_module = name, error = %e, "container lookup failed");
                Lookup::Error
            }
        }
    }

    /// Restart, retrying transient runtime errors. NotFound is never
    /// retried; the lookup already passed, so a 404 here means the
    /// container vanished mid-flight.
    async fn restart_with_retries(&self, name: &str) -> bool {
        let attempts = 1 + self.config.max_retry_attempts;
        for attempt in 1..=attempts {
            let options = RestartContainerOptions {
                t: RESTART_STOP_TIMEOUT_S,
            };
            match self.docker.restart_container(name, Some(options)).await {
                Ok(()) => {
                    tracing::info!(target_module = name, attempt, "container restarted");
                    return true;
                }
                Err(e) if is_not_found(&e) => {
                    tracing::error!(target_module = name, "container disappeared before restart");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        target_module = name,
                        attempt,
                        error = %e,
                        "container restart failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        false
    }

    /// Poll runtime health at the configured interval until healthy,
    /// unhealthy, exited, or the health deadline passes.
    async fn poll_health(&self, name: &str, started: Instant) -> RestartOutcome {
        let deadline = started + Duration::from_secs(self.config.health_check_timeout_s);
        let interval = Duration::from_secs(self.config.health_check_interval_s.max(1));

        loop {
            if Instant::now() >= deadline {
                tracing::warn!(
                    target_module = name,
                    timeout_s = self.config.health_check_timeout_s,
                    "health check timed out"
                );
                return RestartOutcome::Timeout;
            }

            match self
                .docker
                .inspect_container(name, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => {
                    let state = inspect.state.unwrap_or_default();
                    let running = state.running.unwrap_or(false);
                    let health = state.health.and_then(|h| h.status);
                    let elapsed = started.elapsed().as_secs_f64();

                    match health {
                        Some(HealthStatusEnum::HEALTHY) => {
                            tracing::info!(
                                target_module = name,
                                time_to_healthy_s = elapsed,
                                "container healthy"
                            );
                            return RestartOutcome::Success {
                                time_to_healthy: elapsed,
                            };
                        }
                        Some(HealthStatusEnum::UNHEALTHY) => {
                            tracing::warn!(target_module = name, "container reported unhealthy");
                            return RestartOutcome::Unhealthy;
                        }
                        Some(HealthStatusEnum::STARTING) => {}
                        // No health spec: running long enough counts.
                        _ => {
                            if running && elapsed >= NO_HEALTHCHECK_GRACE_S {
                                return RestartOutcome::Success {
                                    time_to_healthy: elapsed,
                                };
                            }
                            if !running && elapsed >= NO_HEALTHCHECK_GRACE_S {
                                tracing::warn!(
                                    target_module = name,
                                    "container exited before becoming healthy"
                                );
                                return RestartOutcome::Unhealthy;
                            }
                        }
                    }
                }
                Err(e) => {
                    // Keep polling; the deadline bounds how long this lasts
                    // and rollback still runs afterwards.
                    tracing::warn!(target_module = name, error = %e, "health poll failed");
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Stop the container after a failed resurrection. Never retried.
    async fn rollback(&self, name: &str) {
        tracing::warn!(target_module = name, "rolling back resurrection");
        let options = StopContainerOptions {
            t: ROLLBACK_STOP_TIMEOUT_S,
        };
        if let Err(e) = self.docker.stop_container(name, Some(options)).await {
            tracing::error!(target_module = name, error = %e, "rollback stop failed");
        }
    }
}

enum Lookup {
    Found,
    Missing,
    Error,
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Logs what it would do without touching the runtime. Used in observer
/// mode, with `--mock`, and throughout the tests.
pub struct DryRunResurrector {
    history: Mutex<Vec<String>>,
    outcomes: HashMap<String, RestartOutcome>,
}

impl DryRunResurrector {
    fn restart(&self, target_module: &str) -> RestartOutcome {
        let outcome = self
            .outcomes
            .get(target_module)
            .copied()
            .unwrap_or(RestartOutcome::Success {
                time_to_healthy: 0.0,
            });
        tracing::info!(
            target_module,
            result = outcome.as_str(),
            "DRY RUN: would restart container"
        );
        self.history.lock().push(target_module.to_string());
        outcome
    }

    pub fn restarted_modules(&self) -> Vec<String> {
        self.history.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_records_and_succeeds() {
        let resurrector = Resurrector::dry_run();
        let outcome = resurrector.restart("nginx-test").await;

        assert_eq!(
            outcome,
            RestartOutcome::Success {
                time_to_healthy: 0.0
            }
        );
        match &resurrector {
            Resurrector::DryRun(inner) => {
                assert_eq!(inner.restarted_modules(), vec!["nginx-test"]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_dry_run_scripted_outcomes() {
        let mut outcomes = HashMap::new();
        outcomes.insert("ghost".to_string(), RestartOutcome::NotFound);
        outcomes.insert("flappy".to_string(), RestartOutcome::Unhealthy);
        let resurrector = Resurrector::dry_run_with_outcomes(outcomes);

        assert_eq!(resurrector.restart("ghost").await, RestartOutcome::NotFound);
        assert_eq!(resurrector.restart("flappy").await, RestartOutcome::Unhealthy);
        // Unscripted modules still restart successfully.
        assert_eq!(
            resurrector.restart("steady").await,
            RestartOutcome::Success {
                time_to_healthy: 0.0
            }
        );
    }

    #[test]
    fn test_outcome_mapping() {
        let success = RestartOutcome::Success {
            time_to_healthy: 3.5,
        };
        assert_eq!(success.outcome_type(), OutcomeType::Success);
        assert_eq!(success.time_to_healthy(), Some(3.5));
        assert_eq!(success.health_score(), Some(1.0));

        assert_eq!(RestartOutcome::NotFound.outcome_type(), OutcomeType::Failure);
        assert_eq!(RestartOutcome::NotFound.health_score(), None);

        assert_eq!(RestartOutcome::Unhealthy.outcome_type(), OutcomeType::Rollback);
        assert_eq!(RestartOutcome::Timeout.outcome_type(), OutcomeType::Rollback);
        assert_eq!(RestartOutcome::Timeout.health_score(), Some(0.0));
    }
}
