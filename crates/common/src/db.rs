use crate::retry::RetryPolicy;
use anyhow::Result;
use rusqlite::Connection;
use std::time::{Duration, Instant};

const PRAGMAS: &str = "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;";
const RUNTIME_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pacing while schema setup waits out a lock held by another connection.
const SCHEMA_RETRY: RetryPolicy =
    RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
/// Total wall-clock budget for that wait before giving up.
const SCHEMA_LOCK_BUDGET: Duration = Duration::from_secs(600);

/// Synchronous connection for CLI one-shots and tests.
pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(RUNTIME_BUSY_TIMEOUT)?;
        conn.execute_batch(PRAGMAS)?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        apply_schema(&self.conn)?;
        Ok(())
    }
}

/// Async handle running all SQL on the dedicated `tokio_rusqlite` worker
/// thread. Clone shares the same worker (and therefore the same
/// connection), so clones are cheap and safe to hand to every job.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open `path`, configure pragmas, and bring the schema up to date.
    ///
    /// A second tracker command, or an operator poking at the file with
    /// sqlite3, can hold the write lock exactly while we need it for schema
    /// setup. Failing hard on that turns into a systemd crash loop, so
    /// setup waits the lock out with capped backoff instead, up to a fixed
    /// wall-clock budget.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        let started = Instant::now();
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let res = conn
                .call(|conn| -> rusqlite::Result<()> {
                    // Keep the per-attempt lock wait short: pacing between
                    // attempts happens out here, where it can be logged.
                    conn.busy_timeout(Duration::from_secs(1))?;
                    conn.execute_batch(PRAGMAS)?;
                    apply_schema(conn)?;
                    conn.busy_timeout(RUNTIME_BUSY_TIMEOUT)?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => return Ok(Self { conn }),
                Err(tokio_rusqlite::Error::Error(e)) if is_locked(&e) => {
                    if started.elapsed() >= SCHEMA_LOCK_BUDGET {
                        return Err(anyhow::Error::from(e).context(
                            "database stayed locked through the entire schema-setup budget",
                        ));
                    }
                    let wait = SCHEMA_RETRY.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        wait_for = ?wait,
                        "schema setup blocked by a database lock; waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(tokio_rusqlite::Error::Error(e)) => {
                    return Err(anyhow::Error::from(e).context("applying schema"));
                }
                Err(other) => return Err(anyhow::anyhow!("opening database: {other}")),
            }
        }
    }

    /// Run a closure against the connection on the worker thread.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| function(conn))
            .await
            .map_err(flatten_driver_error)
    }

    /// [`Self::call`] plus latency and error metrics under an operation
    /// label. The clock covers queueing behind other operations on the
    /// worker thread too — that queue wait is what callers experience.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let started = Instant::now();
        let res = self.call(function).await;

        let status = if res.is_ok() { "ok" } else { "err" };
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("tracker_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("tracker_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked)
    )
}

fn flatten_driver_error(e: tokio_rusqlite::Error<anyhow::Error>) -> anyhow::Error {
    match e {
        tokio_rusqlite::Error::Error(inner) => inner,
        tokio_rusqlite::Error::ConnectionClosed => {
            anyhow::anyhow!("SQLite worker thread is gone")
        }
        tokio_rusqlite::Error::Close((_, err)) => {
            anyhow::anyhow!("closing SQLite connection: {err}")
        }
        other => anyhow::anyhow!("SQLite driver error: {other}"),
    }
}

/// Create missing tables and indexes, then apply column migrations for
/// tables that predate them. Idempotent; both the sync and async open paths
/// go through here.
fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    // The airdrop carve-out split realized P&L after first release.
    add_column_if_missing(
        conn,
        "token_analytics",
        "gains_airdrops",
        "REAL NOT NULL DEFAULT 0.0",
    )?;
    Ok(())
}

/// pragma_table_info-guarded ALTER TABLE for columns added to live
/// deployments after their tables already existed.
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    if present == 0 {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
            [],
        )?;
    }
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    address TEXT PRIMARY KEY,
    discovery_period TEXT NOT NULL,            -- 14d|30d|200d|360d|manual|migration
    total_portfolio_value_usd REAL NOT NULL DEFAULT 0.0,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_scored INTEGER NOT NULL DEFAULT 0,
    transactions_extracted INTEGER NOT NULL DEFAULT 0,
    last_sync TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS token_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    fungible_id TEXT NOT NULL,
    symbol TEXT,
    contract_address TEXT,
    chain TEXT,
    current_amount REAL NOT NULL DEFAULT 0.0,
    current_usd_value REAL,
    current_price_per_token REAL,
    in_portfolio INTEGER NOT NULL DEFAULT 1,
    last_updated TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet, fungible_id)
);

-- Append-only event log. price_per_token is written once at insert and never
-- rewritten; inherited_price_per_token is written only by the migration
-- handler, under an IS NULL guard.
CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    transaction_hash TEXT NOT NULL,
    symbol TEXT,
    contract_address TEXT,
    fungible_id TEXT NOT NULL,
    direction TEXT NOT NULL,                   -- in|out
    action_type TEXT NOT NULL,                 -- buy|sell|airdrop|transfer_in|transfer_out
    quantity REAL NOT NULL,                    -- always positive
    price_per_token REAL,
    inherited_price_per_token REAL,
    is_inherited_from_wallet TEXT,
    counterparty_address TEXT,
    timestamp INTEGER NOT NULL,                -- unix epoch
    block_number INTEGER,
    ingested_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet, transaction_hash, fungible_id)
);

-- Derived, recomputed idempotently from transfers. Upsert-by-key, not append.
CREATE TABLE IF NOT EXISTS token_analytics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    fungible_id TEXT NOT NULL,
    symbol TEXT,
    total_invested_usd REAL NOT NULL DEFAULT 0.0,
    total_realized_usd REAL NOT NULL DEFAULT 0.0,
    gains_airdrops REAL NOT NULL DEFAULT 0.0,
    current_value_usd REAL NOT NULL DEFAULT 0.0,
    profit_loss_usd REAL NOT NULL DEFAULT 0.0,
    roi_percentage REAL NOT NULL DEFAULT 0.0,
    remaining_quantity REAL NOT NULL DEFAULT 0.0,
    remaining_cost_basis REAL NOT NULL DEFAULT 0.0,
    weighted_avg_buy_price REAL,
    weighted_avg_sell_price REAL,
    status TEXT NOT NULL,                      -- GAGNANT|PERDANT|NEUTRE|AIRDROP_GAGNANT
    first_transaction_date INTEGER,
    last_transaction_date INTEGER,
    computed_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet, fungible_id)
);

CREATE TABLE IF NOT EXISTS qualified_wallets (
    wallet TEXT PRIMARY KEY,
    score REAL NOT NULL,
    weighted_roi REAL NOT NULL,
    win_rate REAL NOT NULL,                    -- fraction 0..1
    trade_count INTEGER NOT NULL,
    classification TEXT NOT NULL,              -- ELITE|EXCELLENT|BON|MOYEN|FAIBLE
    scored_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tier_performance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    tier_usd REAL NOT NULL,
    roi_percentage REAL NOT NULL DEFAULT 0.0,
    win_rate REAL NOT NULL DEFAULT 0.0,        -- fraction 0..1
    n_trades INTEGER NOT NULL DEFAULT 0,
    n_winners INTEGER NOT NULL DEFAULT 0,
    n_losers INTEGER NOT NULL DEFAULT 0,
    n_neutral INTEGER NOT NULL DEFAULT 0,
    total_invested REAL NOT NULL DEFAULT 0.0,
    is_optimal_tier INTEGER NOT NULL DEFAULT 0,
    computed_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet, tier_usd)
);

CREATE TABLE IF NOT EXISTS smart_wallets (
    wallet TEXT PRIMARY KEY,
    optimal_threshold_tier REAL,
    quality_score REAL NOT NULL,               -- 0..1
    threshold_status TEXT NOT NULL,
    tier_roi REAL,
    tier_win_rate REAL,
    tier_trades INTEGER,
    global_roi REAL,
    global_win_rate REAL,
    global_trades INTEGER,
    elected_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Append-only diff log from the live tracker.
CREATE TABLE IF NOT EXISTS position_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    fungible_id TEXT NOT NULL,
    symbol TEXT,
    change_type TEXT NOT NULL,                 -- NEW|ACCUMULATION|REDUCTION|EXIT
    old_amount REAL NOT NULL DEFAULT 0.0,
    new_amount REAL NOT NULL DEFAULT 0.0,
    old_usd_value REAL,
    new_usd_value REAL,
    detected_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_wallet TEXT NOT NULL,
    new_wallet TEXT NOT NULL,
    migration_date TEXT NOT NULL,
    tokens_transferred TEXT,                   -- JSON [{symbol, fungible_id, quantity, value_usd}]
    total_value_transferred REAL NOT NULL DEFAULT 0.0,
    transfer_percentage REAL NOT NULL DEFAULT 0.0,
    is_validated INTEGER NOT NULL DEFAULT 0,
    UNIQUE(old_wallet, new_wallet, migration_date)
);

CREATE TABLE IF NOT EXISTS consensus_signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT,
    contract_address TEXT NOT NULL,
    detection_date TEXT NOT NULL DEFAULT (datetime('now')),
    whale_count INTEGER NOT NULL,
    total_investment REAL NOT NULL DEFAULT 0.0,
    first_buy INTEGER NOT NULL,                -- unix epoch
    last_buy INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    UNIQUE(contract_address, period_start)
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,                      -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                             -- JSON with progress info
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_transfers_wallet_symbol ON transfers(wallet, symbol);
CREATE INDEX IF NOT EXISTS idx_transfers_wallet_token ON transfers(wallet, fungible_id);
CREATE INDEX IF NOT EXISTS idx_transfers_timestamp ON transfers(timestamp);
CREATE INDEX IF NOT EXISTS idx_transfers_action_time ON transfers(action_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_token_analytics_wallet ON token_analytics(wallet);
CREATE INDEX IF NOT EXISTS idx_position_changes_wallet ON position_changes(wallet);
CREATE INDEX IF NOT EXISTS idx_position_changes_detected_at ON position_changes(detected_at);
CREATE INDEX IF NOT EXISTS idx_consensus_signals_detection ON consensus_signals(detection_date);
CREATE INDEX IF NOT EXISTS idx_wallets_period ON wallets(discovery_period);
"#;
