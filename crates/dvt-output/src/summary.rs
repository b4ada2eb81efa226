use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dvt_error::WarningRecord;
use dvt_pool::PoolStatistics;
use serde::{Deserialize, Serialize};

fn duration_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((d.as_secs_f64() * 1000.0).round() / 1000.0)
}

fn duration_from_secs<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(d)?;
    Ok(Duration::from_secs_f64(secs.max(0.0)))
}

/// Version and invocation metadata baked into every summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub tool_version: String,
    pub runtime_version: String,
    pub platform: String,
    pub import_mode: String,
    pub flags: Vec<String>,
}

impl ExecutionContext {
    pub fn current(import_mode: impl Into<String>, flags: Vec<String>) -> Self {
        ExecutionContext {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version: format!("rust-{}", option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("stable")),
            platform: std::env::consts::OS.to_string(),
            import_mode: import_mode.into(),
            flags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub entity: String,
    pub tier: usize,
    pub record_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_count: Option<usize>,
    #[serde(serialize_with = "duration_secs", deserialize_with = "duration_from_secs")]
    pub duration: Duration,
    pub records_per_second: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTiming {
    #[serde(serialize_with = "duration_secs", deserialize_with = "duration_from_secs")]
    pub entity_import: Duration,
    #[serde(serialize_with = "duration_secs", deserialize_with = "duration_from_secs")]
    pub deferred_fields: Duration,
    #[serde(serialize_with = "duration_secs", deserialize_with = "duration_from_secs")]
    pub relationships: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatisticsSummary {
    pub requests_served: u64,
    pub throttle_events: u64,
    #[serde(serialize_with = "duration_secs", deserialize_with = "duration_from_secs")]
    pub total_backoff_time: Duration,
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
}

impl From<&PoolStatistics> for PoolStatisticsSummary {
    fn from(stats: &PoolStatistics) -> Self {
        PoolStatisticsSummary {
            requests_served: stats.requests_served,
            throttle_events: stats.throttle_events,
            total_backoff_time: stats.total_backoff,
            retries_attempted: stats.retries_attempted,
            retries_succeeded: stats.retries_succeeded,
        }
    }
}

/// `*.summary.json`: the one artifact always written, last, even when the
/// run is cancelled mid-phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub source_file: String,
    pub target_environment: String,
    pub execution_context: ExecutionContext,
    pub success: bool,
    #[serde(serialize_with = "duration_secs", deserialize_with = "duration_from_secs")]
    pub duration: Duration,
    pub tiers_processed: usize,
    pub records_imported: usize,
    pub records_updated: usize,
    pub records_failed: usize,
    pub records_per_second: f64,
    /// Histogram over the classified error patterns, for triage.
    pub error_patterns: BTreeMap<String, u64>,
    pub entities: Vec<EntitySummary>,
    pub phase_timing: PhaseTiming,
    pub pool_statistics: PoolStatisticsSummary,
    pub warnings: Vec<WarningRecord>,
}

impl RunSummary {
    pub fn new(
        source_file: impl Into<String>,
        target_environment: impl Into<String>,
        execution_context: ExecutionContext,
    ) -> Self {
        RunSummary {
            generated_at: Utc::now(),
            source_file: source_file.into(),
            target_environment: target_environment.into(),
            execution_context,
            success: false,
            duration: Duration::ZERO,
            tiers_processed: 0,
            records_imported: 0,
            records_updated: 0,
            records_failed: 0,
            records_per_second: 0.0,
            error_patterns: BTreeMap::new(),
            entities: Vec::new(),
            phase_timing: PhaseTiming::default(),
            pool_statistics: PoolStatisticsSummary::default(),
            warnings: Vec::new(),
        }
    }
}
