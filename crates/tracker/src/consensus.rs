use anyhow::{Context, Result};
use common::prices::{is_stablecoin, TokenMarket};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// One qualifying buy by a smart wallet inside the rolling window.
#[derive(Debug, Clone)]
pub struct RecentBuy {
    pub wallet: String,
    pub symbol: Option<String>,
    pub contract_address: String,
    pub chain: Option<String>,
    pub value_usd: f64,
    pub timestamp: i64,
}

/// Aggregated buys for one token, before market filters.
#[derive(Debug, Clone)]
pub struct ConsensusCandidate {
    pub symbol: Option<String>,
    pub contract_address: String,
    pub chain: Option<String>,
    pub whale_count: u32,
    pub total_investment: f64,
    pub first_buy: i64,
    pub last_buy: i64,
    pub wallets: Vec<String>,
}

/// Group buys by contract; whales are distinct wallets.
pub fn group_recent_buys(buys: &[RecentBuy]) -> Vec<ConsensusCandidate> {
    let mut by_contract: HashMap<&str, Vec<&RecentBuy>> = HashMap::new();
    for b in buys {
        by_contract.entry(b.contract_address.as_str()).or_default().push(b);
    }

    let mut out: Vec<ConsensusCandidate> = by_contract
        .into_iter()
        .map(|(contract, group)| {
            let mut wallets: Vec<String> = group.iter().map(|b| b.wallet.clone()).collect();
            wallets.sort();
            wallets.dedup();
            ConsensusCandidate {
                symbol: group.iter().find_map(|b| b.symbol.clone()),
                contract_address: contract.to_string(),
                chain: group.iter().find_map(|b| b.chain.clone()),
                whale_count: wallets.len() as u32,
                total_investment: group.iter().map(|b| b.value_usd).sum(),
                first_buy: group.iter().map(|b| b.timestamp).min().unwrap_or(0),
                last_buy: group.iter().map(|b| b.timestamp).max().unwrap_or(0),
                wallets,
            }
        })
        .collect();
    out.sort_by(|a, b| b.total_investment.total_cmp(&a.total_investment));
    out
}

#[derive(Debug, Clone, Copy)]
pub struct ConsensusFilters {
    pub min_whales: u32,
    pub mcap_min: f64,
    pub mcap_max: f64,
}

/// Market filters: enough distinct whales, not a stablecoin, market cap
/// known and inside the band. An unknown market cap cannot be verified and
/// is discarded.
pub fn passes_filters(
    candidate: &ConsensusCandidate,
    market: Option<&TokenMarket>,
    filters: &ConsensusFilters,
) -> bool {
    if candidate.whale_count < filters.min_whales {
        return false;
    }
    if candidate.symbol.as_deref().is_some_and(is_stablecoin) {
        return false;
    }
    let Some(mcap) = market.and_then(|m| m.market_cap) else {
        return false;
    };
    mcap >= filters.mcap_min && mcap <= filters.mcap_max
}

/// Anchor the consensus period to the hour of the first qualifying buy so
/// repeated detections inside one window hit the same upsert key.
pub fn period_anchor(first_buy: i64) -> i64 {
    first_buy - first_buy.rem_euclid(3600)
}

fn iso8601(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Payload handed to notification sinks. Sinks must be idempotent keyed on
/// (contract, period_start); delivery is at-least-once.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusSignal {
    pub symbol: Option<String>,
    pub contract: String,
    pub chain: Option<String>,
    pub whale_count: u32,
    pub total_investment_usd: f64,
    pub first_buy_iso8601: String,
    pub last_buy_iso8601: String,
    pub mcap: Option<f64>,
    pub liquidity: Option<f64>,
    pub wallet_addresses: Vec<String>,
    pub period_start: i64,
}

impl ConsensusSignal {
    pub fn from_candidate(candidate: &ConsensusCandidate, market: Option<&TokenMarket>) -> Self {
        Self {
            symbol: candidate.symbol.clone(),
            contract: candidate.contract_address.clone(),
            chain: candidate.chain.clone(),
            whale_count: candidate.whale_count,
            total_investment_usd: candidate.total_investment,
            first_buy_iso8601: iso8601(candidate.first_buy),
            last_buy_iso8601: iso8601(candidate.last_buy),
            mcap: market.and_then(|m| m.market_cap),
            liquidity: market.and_then(|m| m.liquidity_usd),
            wallet_addresses: candidate.wallets.clone(),
            period_start: period_anchor(candidate.first_buy),
        }
    }
}

pub trait NotificationSink {
    fn emit(
        &self,
        signal: &ConsensusSignal,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Structured-log sink; always available.
pub struct LogSink;

impl NotificationSink for LogSink {
    async fn emit(&self, signal: &ConsensusSignal) -> Result<()> {
        tracing::info!(
            symbol = signal.symbol.as_deref().unwrap_or("?"),
            contract = %signal.contract,
            whale_count = signal.whale_count,
            total_investment_usd = signal.total_investment_usd,
            first_buy = %signal.first_buy_iso8601,
            last_buy = %signal.last_buy_iso8601,
            "consensus signal"
        );
        Ok(())
    }
}

/// JSON webhook sink.
pub struct WebhookSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: &str, request_timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .context("building webhook HTTP client")?,
        })
    }
}

impl NotificationSink for WebhookSink {
    async fn emit(&self, signal: &ConsensusSignal) -> Result<()> {
        self.http
            .post(&self.url)
            .json(signal)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?
            .error_for_status()
            .with_context(|| format!("POST {}", self.url))?;
        Ok(())
    }
}

/// Runtime-selected sink: webhook when configured, structured log otherwise.
pub enum AnySink {
    Log(LogSink),
    Webhook(WebhookSink),
}

impl AnySink {
    pub fn from_config(webhook_url: &str, request_timeout: std::time::Duration) -> Result<Self> {
        if webhook_url.is_empty() {
            Ok(Self::Log(LogSink))
        } else {
            Ok(Self::Webhook(WebhookSink::new(webhook_url, request_timeout)?))
        }
    }
}

impl NotificationSink for AnySink {
    async fn emit(&self, signal: &ConsensusSignal) -> Result<()> {
        match self {
            Self::Log(s) => s.emit(signal).await,
            Self::Webhook(s) => s.emit(signal).await,
        }
    }
}

/// Upsert the signal row by (contract_address, period_start): a re-detection
/// in the same window updates counts and timestamps instead of duplicating.
/// Returns true when a new row was created.
pub fn upsert_signal(
    conn: &Connection,
    candidate: &ConsensusCandidate,
    window_hours: i64,
) -> Result<bool> {
    let period_start = period_anchor(candidate.first_buy);
    let period_end = period_start + window_hours * 3600;
    let existed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM consensus_signals WHERE contract_address = ?1 AND period_start = ?2",
        rusqlite::params![candidate.contract_address, period_start],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO consensus_signals
            (symbol, contract_address, whale_count, total_investment,
             first_buy, last_buy, is_active, period_start, period_end)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)
         ON CONFLICT(contract_address, period_start) DO UPDATE SET
            whale_count = excluded.whale_count,
            total_investment = excluded.total_investment,
            last_buy = excluded.last_buy,
            is_active = 1,
            detection_date = datetime('now')",
        rusqlite::params![
            candidate.symbol,
            candidate.contract_address,
            candidate.whale_count,
            candidate.total_investment,
            candidate.first_buy,
            candidate.last_buy,
            period_start,
            period_end,
        ],
    )?;
    Ok(existed == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    fn buy(wallet: &str, contract: &str, symbol: &str, value: f64, ts: i64) -> RecentBuy {
        RecentBuy {
            wallet: wallet.to_string(),
            symbol: Some(symbol.to_string()),
            contract_address: contract.to_string(),
            chain: Some("ethereum".to_string()),
            value_usd: value,
            timestamp: ts,
        }
    }

    fn filters() -> ConsensusFilters {
        ConsensusFilters {
            min_whales: 2,
            mcap_min: 100_000.0,
            mcap_max: 100_000_000.0,
        }
    }

    #[test]
    fn test_three_whales_on_one_token() {
        let buys = vec![
            buy("0xw1", "0xtokx", "X", 1000.0, 100),
            buy("0xw2", "0xtokx", "X", 2000.0, 200),
            buy("0xw3", "0xtokx", "X", 500.0, 300),
            buy("0xw1", "0xtokx", "X", 100.0, 400), // repeat buyer, still one whale
            buy("0xw4", "0xtoky", "USDT", 9000.0, 150),
        ];
        let grouped = group_recent_buys(&buys);
        assert_eq!(grouped.len(), 2);

        let x = grouped.iter().find(|c| c.contract_address == "0xtokx").unwrap();
        assert_eq!(x.whale_count, 3);
        assert!((x.total_investment - 3600.0).abs() < 1e-9);
        assert_eq!(x.first_buy, 100);
        assert_eq!(x.last_buy, 400);

        // X passes ($5M mcap); Y is a stablecoin.
        let market = TokenMarket {
            market_cap: Some(5_000_000.0),
            liquidity_usd: Some(250_000.0),
        };
        assert!(passes_filters(x, Some(&market), &filters()));

        let y = grouped.iter().find(|c| c.contract_address == "0xtoky").unwrap();
        let y_market = TokenMarket {
            market_cap: Some(80_000_000.0),
            liquidity_usd: Some(1_000_000.0),
        };
        assert!(!passes_filters(y, Some(&y_market), &filters()));
    }

    #[test]
    fn test_filters_reject_mcap_out_of_band() {
        let buys = vec![
            buy("0xw1", "0xtok", "T", 100.0, 1),
            buy("0xw2", "0xtok", "T", 100.0, 2),
        ];
        let c = &group_recent_buys(&buys)[0];
        let small = TokenMarket {
            market_cap: Some(50_000.0),
            liquidity_usd: None,
        };
        let big = TokenMarket {
            market_cap: Some(500_000_000.0),
            liquidity_usd: None,
        };
        assert!(!passes_filters(c, Some(&small), &filters()));
        assert!(!passes_filters(c, Some(&big), &filters()));
        assert!(!passes_filters(c, None, &filters()));
    }

    #[test]
    fn test_single_whale_is_no_consensus() {
        let buys = vec![buy("0xw1", "0xtok", "T", 100.0, 1)];
        let c = &group_recent_buys(&buys)[0];
        let market = TokenMarket {
            market_cap: Some(5_000_000.0),
            liquidity_usd: None,
        };
        assert!(!passes_filters(c, Some(&market), &filters()));
    }

    #[test]
    fn test_period_anchor_truncates_to_hour() {
        assert_eq!(period_anchor(7200), 7200);
        assert_eq!(period_anchor(7261), 7200);
        assert_eq!(period_anchor(10799), 7200);
    }

    #[test]
    fn test_signal_payload_shape() {
        let buys = vec![
            buy("0xw1", "0xtok", "T", 100.0, 1_700_000_000),
            buy("0xw2", "0xtok", "T", 300.0, 1_700_003_600),
        ];
        let c = &group_recent_buys(&buys)[0];
        let market = TokenMarket {
            market_cap: Some(5_000_000.0),
            liquidity_usd: Some(120_000.0),
        };
        let signal = ConsensusSignal::from_candidate(c, Some(&market));
        assert_eq!(signal.whale_count, 2);
        assert_eq!(signal.wallet_addresses.len(), 2);
        assert!(signal.first_buy_iso8601.starts_with("2023-11-14T"));

        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["contract"], "0xtok");
        assert_eq!(json["mcap"], 5_000_000.0);
    }

    #[test]
    fn test_upsert_updates_same_period_instead_of_duplicating() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let buys = vec![
            buy("0xw1", "0xtok", "T", 100.0, 7300),
            buy("0xw2", "0xtok", "T", 100.0, 7400),
        ];
        let c1 = group_recent_buys(&buys);
        assert!(upsert_signal(&db.conn, &c1[0], 48).unwrap());

        // Same window, one more whale later: update in place.
        let mut more = buys.clone();
        more.push(buy("0xw3", "0xtok", "T", 500.0, 9000));
        let c2 = group_recent_buys(&more);
        assert!(!upsert_signal(&db.conn, &c2[0], 48).unwrap());

        let (count, whales, total): (i64, i64, f64) = db
            .conn
            .query_row(
                "SELECT COUNT(*), MAX(whale_count), MAX(total_investment) FROM consensus_signals",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(whales, 3);
        assert!((total - 700.0).abs() < 1e-9);
    }
}
