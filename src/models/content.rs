use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Live-looking network figures for the dashboard widgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub block_height: u64,
    pub transactions_per_second: u32,
    pub active_nodes: u32,
    pub average_block_time_ms: u32,
    pub total_transactions: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorStats {
    pub total_validators: u32,
    pub active_validators: u32,
    pub total_bonded: u64,
    /// Annual percentage yield, two decimals.
    pub average_apy: f64,
    pub uptime_percentage: f64,
    pub timestamp: DateTime<Utc>,
}

/// Validator-bonds page: static copy plus current validator figures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorBondsPage {
    pub content: Value,
    pub stats: ValidatorStats,
}
