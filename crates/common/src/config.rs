use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub provider: Provider,
    pub oracle: Oracle,
    pub discovery: Discovery,
    pub tracking: Tracking,
    pub scoring: Scoring,
    pub tiers: Tiers,
    pub threshold: Threshold,
    pub consensus: Consensus,
    pub migration: Migration,
    pub notification: Notification,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub base_url: String,
    pub api_keys: Vec<String>,
    pub request_timeout_secs: u64,
    pub requests_per_sec: f64,
    pub burst: f64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub worker_concurrency: usize,
    pub unit_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Oracle {
    pub primary_url: String,
    pub secondary_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    pub windows: Vec<String>,
    pub candidates_per_window: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tracking {
    pub hours_lookback: i64,
    pub min_token_value_usd: f64,
    pub rel_change_threshold: f64,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scoring {
    pub min_score: f64,
    pub min_weighted_roi: f64,
    pub min_trades: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tiers {
    pub grid_min_usd: f64,
    pub grid_max_usd: f64,
    pub grid_step_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Threshold {
    pub min_trades: u32,
    /// Percent (20 means 20%).
    pub min_winrate: f64,
    /// Percent cap for ROI normalization in the J metric.
    pub roi_cap: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Consensus {
    pub min_whales: u32,
    pub window_hours: i64,
    pub mcap_min: f64,
    pub mcap_max: f64,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Migration {
    /// Fraction of portfolio value that must reach a single recipient.
    pub portfolio_fraction: f64,
    pub window_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    /// Empty string disables the webhook sink (signals are still logged).
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    /// Load from `CONFIG_PATH` if set, else `config/default.toml`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
        Self::from_str(&content).with_context(|| format!("parsing config {path}"))
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Tier grid in USD: grid_min..=grid_max stepping by grid_step.
    pub fn tier_grid(&self) -> Vec<f64> {
        let mut grid = Vec::new();
        let mut t = self.tiers.grid_min_usd;
        while t <= self.tiers.grid_max_usd + f64::EPSILON {
            grid.push(t);
            t += self.tiers.grid_step_usd;
        }
        grid
    }
}
