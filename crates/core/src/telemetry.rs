use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::message::{PlatformId, UserId};

/// Returns the last 4 characters of the identifier; identifiers shorter than
/// 4 characters pass through whole. The full identifier must never reach the
/// telemetry sink.
pub fn anonymize_user_id(user_id: &str) -> String {
    let characters: Vec<char> = user_id.chars().collect();
    if characters.len() <= 4 {
        user_id.to_owned()
    } else {
        characters[characters.len() - 4..].iter().collect()
    }
}

/// One record per processed message, emitted after delivery.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub platform: PlatformId,
    pub response_time_ms: u64,
    pub token_count: u32,
    pub user_suffix: String,
    pub user_message: String,
    pub bot_response: String,
}

impl TelemetryRecord {
    pub fn new(
        platform: PlatformId,
        user_id: &UserId,
        user_message: impl Into<String>,
        bot_response: impl Into<String>,
        response_time_ms: u64,
        token_count: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            platform,
            response_time_ms,
            token_count,
            user_suffix: anonymize_user_id(user_id.as_str()),
            user_message: user_message.into(),
            bot_response: bot_response.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry write failed: {0}")]
    Write(String),
}

/// Observation sink. Write failures are contained by the orchestrator and
/// never invalidate a processed message.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, record: &TelemetryRecord) -> Result<(), TelemetryError>;
}

/// Emits records as structured log events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetrySink;

#[async_trait]
impl TelemetrySink for TracingTelemetrySink {
    async fn record(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        info!(
            event_name = "telemetry.message_processed",
            record_id = %record.id,
            platform = record.platform.as_str(),
            response_time_ms = record.response_time_ms,
            token_count = record.token_count,
            user_suffix = %record.user_suffix,
            "message processed"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTelemetrySink;

#[async_trait]
impl TelemetrySink for NoopTelemetrySink {
    async fn record(&self, _record: &TelemetryRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
}
