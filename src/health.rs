// =============================================================================
// Liveness evaluation
// =============================================================================
//
// `last_activity` is the *event time* of the newest tick, while `now` is the
// wall clock. A feed that replays old data therefore reads as stale; that is
// accepted since the service only ingests live streams.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    /// Event time of the last tick as ms epoch; 0 if none has arrived.
    pub last_data_ms: i64,
}

/// Healthy iff a tick has been seen and it is no older than `threshold`.
pub fn evaluate(
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: std::time::Duration,
) -> HealthReport {
    let Some(last) = last_activity else {
        return HealthReport {
            status: HealthStatus::Unhealthy,
            message: "No data received yet".to_string(),
            last_data_ms: 0,
        };
    };

    let threshold =
        chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let stale = now.signed_duration_since(last) > threshold;

    let (status, message) = if stale {
        (
            HealthStatus::Unhealthy,
            format!("No data received in last {}s", threshold.num_seconds()),
        )
    } else {
        (HealthStatus::Healthy, "Service operational".to_string())
    };

    HealthReport {
        status,
        message,
        last_data_ms: last.timestamp_millis(),
    }
}
