//! Kill-report intake from the killer's event stream.
//!
//! Two variants share one capability set: `next()` yields deliveries,
//! `ack(id)` confirms end-to-end processing. The real variant reads a Redis
//! Stream through a named consumer group so un-acked messages redeliver;
//! the mock variant fabricates reports for development.

use std::time::Duration;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::error::MedicError;
use crate::models::{KillReason, KillReport, Severity};
use crate::validation::{validate_report, RawKillReport};

/// Blocking read window per poll.
const READ_BLOCK_MS: usize = 5000;
/// Reconnect backoff bounds.
const RECONNECT_BASE_MS: u64 = 500;
const RECONNECT_CAP_MS: u64 = 30_000;
/// How many pending entries to examine per reclaim pass.
const RECLAIM_BATCH: usize = 100;

/// One message off the stream. Invalid payloads are surfaced (not dropped)
/// so the orchestrator can record them and acknowledge.
#[derive(Debug, Clone)]
pub enum Delivery {
    Report(KillReport),
    Invalid {
        kill_id: Option<String>,
        reason: String,
    },
}

pub enum KillStream {
    Redis(RedisListener),
    Mock(MockListener),
}

impl KillStream {
    pub fn redis(config: &StreamConfig) -> Result<Self, MedicError> {
        let client = redis::Client::open(config.endpoint.as_str())
            .map_err(|e| MedicError::Stream(format!("invalid stream endpoint: {e}")))?;
        Ok(Self::Redis(RedisListener {
            client,
            conn: None,
            topic: config.topic.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            reclaim_idle_ms: config.reclaim_idle_secs * 1000,
            backoff_ms: RECONNECT_BASE_MS,
            reading_backlog: false,
        }))
    }

    pub fn mock(config: &StreamConfig) -> Self {
        Self::Mock(MockListener {
            interval: Duration::from_secs(config.mock_interval_secs.max(1)),
            modules: vec![
                "auth-service".to_string(),
                "api-gateway".to_string(),
                "data-processor".to_string(),
            ],
            step: 0,
        })
    }

    /// Read the next delivery. `None` means nothing arrived within the
    /// blocking window; the caller just polls again.
    pub async fn next(&mut self) -> Option<(String, Delivery)> {
        match self {
            Self::Redis(inner) => inner.next().await,
            Self::Mock(inner) => inner.next().await,
        }
    }

    /// Confirm end-to-end processing. Only called after the outcome record
    /// is durably stored.
    pub async fn ack(&mut self, message_id: &str) {
        match self {
            Self::Redis(inner) => inner.ack(message_id).await,
            Self::Mock(_) => {}
        }
    }
}

pub struct RedisListener {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
    topic: String,
    group: String,
    consumer: String,
    reclaim_idle_ms: u64,
    backoff_ms: u64,
    reading_backlog: bool,
}

impl RedisListener {
    /// Get a live connection, reconnecting forever with capped exponential
    /// backoff. After each (re)connect the consumer group is ensured, stale
    /// pending messages are reclaimed, and our own backlog is drained first
    /// so redeliveries come before new messages.
    async fn ensure_conn(&mut self) -> MultiplexedConnection {
        if let Some(conn) = &self.conn {
            return conn.clone();
        }

        loop {
            match self.client.get_multiplexed_async_connection().await {
                Ok(mut conn) => match self.prepare(&mut conn).await {
                    Ok(()) => {
                        tracing::info!(
                            topic = %self.topic,
                            group = %self.group,
                            consumer = %self.consumer,
                            "connected to kill-report stream"
                        );
                        self.backoff_ms = RECONNECT_BASE_MS;
                        self.reading_backlog = true;
                        self.conn = Some(conn.clone());
                        return conn;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "stream setup failed");
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "stream connection failed");
                }
            }

            tracing::warn!(backoff_ms = self.backoff_ms, "retrying stream connection");
            tokio::time::sleep(Duration::from_millis(self.backoff_ms)).await;
            self.backoff_ms = (self.backoff_ms * 2).min(RECONNECT_CAP_MS);
        }
    }

    async fn prepare(&self, conn: &mut MultiplexedConnection) -> Result<(), MedicError> {
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.topic, &self.group, "0")
            .await;
        match created {
            Ok(_) => {
                tracing::info!(group = %self.group, "created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => return Err(MedicError::Stream(format!("group create failed: {e}"))),
        }

        self.reclaim_stale(conn).await;
        Ok(())
    }

    /// Claim pending messages that have sat idle past the configured
    /// timeout. Recovers kills that were mid-processing when a previous
    /// instance crashed; the backlog read then redelivers them to us.
    async fn reclaim_stale(&self, conn: &mut MultiplexedConnection) {
        let pending: Result<StreamPendingCountReply, redis::RedisError> = conn
            .xpending_count(&self.topic, &self.group, "-", "+", RECLAIM_BATCH)
            .await;

        let pending = match pending {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "pending inspection failed, skipping reclaim");
                return;
            }
        };

        let stale: Vec<String> = pending
            .ids
            .iter()
            .filter(|entry| entry.last_delivered_ms as u64 >= self.reclaim_idle_ms)
            .map(|entry| entry.id.clone())
            .collect();

        if stale.is_empty() {
            return;
        }

        let claimed: Result<StreamClaimReply, redis::RedisError> = conn
            .xclaim(
                &self.topic,
                &self.group,
                &self.consumer,
                self.reclaim_idle_ms,
                &stale,
            )
            .await;

        match claimed {
            Ok(reply) => {
                tracing::info!(count = reply.ids.len(), "reclaimed stale pending messages");
            }
            Err(e) => {
                tracing::warn!(error = %e, "reclaim failed");
            }
        }
    }

    async fn next(&mut self) -> Option<(String, Delivery)> {
        let mut conn = self.ensure_conn().await;

        // "0" reads our pending-entries backlog (reclaimed + un-acked
        // redeliveries); ">" reads messages never delivered to this group.
        let cursor = if self.reading_backlog { "0" } else { ">" };
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if !self.reading_backlog {
            options = options.block(READ_BLOCK_MS);
        }

        let reply: Result<StreamReadReply, redis::RedisError> = conn
            .xread_options(&[self.topic.as_str()], &[cursor], &options)
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "stream read failed, reconnecting");
                self.conn = None;
                return None;
            }
        };

        for key in reply.keys {
            for message in key.ids {
                let payload = message
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok());
                let delivery = match payload {
                    Some(json) => parse_payload(&json),
                    None => Delivery::Invalid {
                        kill_id: None,
                        reason: "missing payload field".to_string(),
                    },
                };
                return Some((message.id, delivery));
            }
        }

        // An empty backlog read means the PEL is drained; switch to new
        // messages from here on.
        if self.reading_backlog {
            self.reading_backlog = false;
        }
        None
    }

    async fn ack(&mut self, message_id: &str) {
        let Some(conn) = &mut self.conn else {
            tracing::warn!(message_id, "ack with no connection, message will redeliver");
            return;
        };
        let result: Result<i64, redis::RedisError> =
            conn.xack(&self.topic, &self.group, &[message_id]).await;
        if let Err(e) = result {
            tracing::error!(message_id, error = %e, "ack failed, message will redeliver");
            self.conn = None;
        }
    }
}

/// Parse a stream payload into a validated kill report. The kill_id is
/// pulled out first so even invalid payloads can be recorded against it.
pub fn parse_payload(payload: &str) -> Delivery {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return Delivery::Invalid {
                kill_id: None,
                reason: format!("payload is not JSON: {e}"),
            }
        }
    };

    let kill_id = value
        .get("kill_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    let raw: RawKillReport = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            return Delivery::Invalid {
                kill_id,
                reason: format!("malformed kill report: {e}"),
            }
        }
    };

    match validate_report(raw) {
        Ok(report) => Delivery::Report(report),
        Err(failure) => Delivery::Invalid {
            kill_id,
            reason: failure.to_string(),
        },
    }
}

/// Generates synthetic kill reports at a fixed interval.
pub struct MockListener {
    interval: Duration,
    modules: Vec<String>,
    step: usize,
}

impl MockListener {
    async fn next(&mut self) -> Option<(String, Delivery)> {
        tokio::time::sleep(self.interval).await;

        let reasons = [
            KillReason::AnomalyBehavior,
            KillReason::ResourceExhaustion,
            KillReason::PolicyViolation,
            KillReason::DependencyCascade,
        ];
        let severities = [Severity::Low, Severity::Medium, Severity::High, Severity::Info];

        let step = self.step;
        self.step += 1;

        let report = KillReport {
            kill_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            target_module: self.modules[step % self.modules.len()].clone(),
            target_instance_id: format!("instance-{:03}", step % 100),
            kill_reason: reasons[step % reasons.len()],
            severity: severities[step % severities.len()],
            confidence_score: 0.4 + 0.05 * (step % 11) as f64,
            evidence: vec![format!("synthetic-evidence-{step}")],
            dependencies: vec![],
            source_agent: "smith-mock".to_string(),
            metadata: serde_json::Map::new(),
        };

        tracing::info!(
            kill_id = %report.kill_id,
            target_module = %report.target_module,
            "generated mock kill report"
        );

        Some((format!("mock-{step}"), Delivery::Report(report)))
    }
}
