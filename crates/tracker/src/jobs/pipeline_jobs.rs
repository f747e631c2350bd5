use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;
use common::error::IngestError;
use common::types::{ActionType, ChangeType, DiscoveryPeriod, ThresholdStatus};
use rusqlite::{Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

use super::ingestion_jobs::PAGE_LIMIT;
use super::provider_traits::{AddressChecker, BalancesFetcher, TokenMarketData};
use super::tracker::JobTracker;
use super::{run_units_bounded, PipelineSummary};
use crate::consensus::{
    self, group_recent_buys, passes_filters, ConsensusFilters, ConsensusSignal, NotificationSink,
    RecentBuy,
};
use crate::fifo::{self, FifoEvent, TokenLedger, TokenValuation};
use crate::ingestion::{self, SendsFetcher, SpotPrices, TransfersPager};
use crate::live_tracker::{diff_positions, BalanceSnapshot, KnownPosition};
use crate::migration;
use crate::threshold_selection::{select_threshold, ThresholdParams};
use crate::tier_analysis::{analyze_grid, TierStats};
use crate::wallet_scoring::{
    score_wallet, trade_count, weighted_roi, win_rate, QualificationGates, TokenStat,
};

fn load_fifo_events(conn: &Connection, wallet: &str, fungible_id: &str) -> Result<Vec<FifoEvent>> {
    let mut stmt = conn.prepare(
        "SELECT action_type, quantity, price_per_token, inherited_price_per_token,
                timestamp, block_number, transaction_hash
         FROM transfers
         WHERE wallet = ?1 AND fungible_id = ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![wallet, fungible_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<f64>>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Option<i64>>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (action, quantity, price, inherited, timestamp, block, hash) = row?;
        let Some(action) = ActionType::parse(&action) else {
            tracing::warn!(wallet, fungible_id, action = %action, "unknown action_type in transfer log; skipping row");
            continue;
        };
        events.push(FifoEvent {
            action,
            quantity,
            price_per_token: price,
            inherited_price_per_token: inherited,
            timestamp,
            block_number: block,
            transaction_hash: hash,
        });
    }
    Ok(events)
}

struct AnalyticsRow {
    wallet: String,
    fungible_id: String,
    symbol: Option<String>,
    ledger: TokenLedger,
    val: TokenValuation,
}

fn upsert_token_analytics(conn: &Connection, row: &AnalyticsRow) -> Result<()> {
    conn.execute(
        "INSERT INTO token_analytics
            (wallet, fungible_id, symbol, total_invested_usd, total_realized_usd,
             gains_airdrops, current_value_usd, profit_loss_usd, roi_percentage,
             remaining_quantity, remaining_cost_basis, weighted_avg_buy_price,
             weighted_avg_sell_price, status, first_transaction_date,
             last_transaction_date, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, datetime('now'))
         ON CONFLICT(wallet, fungible_id) DO UPDATE SET
            symbol = excluded.symbol,
            total_invested_usd = excluded.total_invested_usd,
            total_realized_usd = excluded.total_realized_usd,
            gains_airdrops = excluded.gains_airdrops,
            current_value_usd = excluded.current_value_usd,
            profit_loss_usd = excluded.profit_loss_usd,
            roi_percentage = excluded.roi_percentage,
            remaining_quantity = excluded.remaining_quantity,
            remaining_cost_basis = excluded.remaining_cost_basis,
            weighted_avg_buy_price = excluded.weighted_avg_buy_price,
            weighted_avg_sell_price = excluded.weighted_avg_sell_price,
            status = excluded.status,
            first_transaction_date = excluded.first_transaction_date,
            last_transaction_date = excluded.last_transaction_date,
            computed_at = datetime('now')",
        rusqlite::params![
            row.wallet,
            row.fungible_id,
            row.symbol,
            row.ledger.total_invested,
            row.ledger.total_realized,
            row.ledger.gains_airdrops,
            row.val.current_value,
            row.val.profit_loss,
            row.val.roi_percentage,
            row.ledger.remaining_quantity,
            row.ledger.remaining_cost_basis,
            row.val.weighted_avg_buy_price,
            row.val.weighted_avg_sell_price,
            row.val.status.as_str(),
            row.ledger.first_timestamp,
            row.ledger.last_timestamp,
        ],
    )?;
    Ok(())
}

/// Recompute analytics for one (wallet, token) from its transfer rows. Fully
/// idempotent: identical rows produce an identical analytics row.
pub async fn rebuild_token_analytics<S: SpotPrices + Sync>(
    db: &AsyncDb,
    prices: &S,
    wallet: &str,
    fungible_id: &str,
) -> Result<()> {
    let w = wallet.to_string();
    let f = fungible_id.to_string();
    let (events, meta) = db
        .call_named("analytics.load_events", move |conn| {
            let events = load_fifo_events(conn, &w, &f)?;
            let meta: Option<(Option<String>, Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT symbol, contract_address, chain FROM transfers
                     WHERE wallet = ?1 AND fungible_id = ?2 LIMIT 1",
                    rusqlite::params![w, f],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            Ok((events, meta))
        })
        .await?;

    if events.is_empty() {
        // History vanished (e.g. replaced with an empty set): drop the row.
        let w = wallet.to_string();
        let f = fungible_id.to_string();
        db.call_named("analytics.delete_stale", move |conn| {
            conn.execute(
                "DELETE FROM token_analytics WHERE wallet = ?1 AND fungible_id = ?2",
                rusqlite::params![w, f],
            )?;
            Ok(())
        })
        .await?;
        return Ok(());
    }

    let (symbol, contract, chain) = meta.unwrap_or((None, None, None));
    let ledger = fifo::replay(events);
    if ledger.oversold_quantity > 0.0 {
        metrics::counter!("tracker_fifo_oversold_total").increment(1);
    }
    let spot = prices
        .resolve_price(symbol.as_deref(), contract.as_deref(), chain.as_deref(), None)
        .await;
    let val = fifo::valuation(&ledger, spot.usd);

    let row = AnalyticsRow {
        wallet: wallet.to_string(),
        fungible_id: fungible_id.to_string(),
        symbol,
        ledger,
        val,
    };
    db.call_named("analytics.upsert", move |conn| upsert_token_analytics(conn, &row))
        .await
}

fn load_token_stats(conn: &Connection, wallet: &str) -> Result<Vec<TokenStat>> {
    let mut stmt = conn.prepare(
        "SELECT roi_percentage, total_invested_usd FROM token_analytics WHERE wallet = ?1",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![wallet], |row| {
            Ok(TokenStat {
                roi_percentage: row.get(0)?,
                total_invested: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

async fn score_wallet_unit<S: SpotPrices + Sync>(
    db: AsyncDb,
    prices: S,
    wallet: String,
    gates: QualificationGates,
) -> Result<()> {
    let w = wallet.clone();
    let tokens: Vec<String> = db
        .call_named("scoring.select_tokens", move |conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT fungible_id FROM transfers WHERE wallet = ?1")?;
            let rows = stmt
                .query_map(rusqlite::params![w], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

    for token in &tokens {
        rebuild_token_analytics(&db, &prices, &wallet, token).await?;
    }

    let w = wallet.clone();
    let stats = db
        .call_named("scoring.load_stats", move |conn| load_token_stats(conn, &w))
        .await?;
    let outcome = score_wallet(&stats, &gates);

    db.call_named("scoring.persist", move |conn| {
        let tx = conn.transaction()?;
        if outcome.qualified {
            tx.execute(
                "INSERT INTO qualified_wallets
                    (wallet, score, weighted_roi, win_rate, trade_count, classification, scored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
                 ON CONFLICT(wallet) DO UPDATE SET
                    score = excluded.score,
                    weighted_roi = excluded.weighted_roi,
                    win_rate = excluded.win_rate,
                    trade_count = excluded.trade_count,
                    classification = excluded.classification,
                    scored_at = datetime('now')",
                rusqlite::params![
                    wallet,
                    outcome.score,
                    outcome.weighted_roi,
                    outcome.win_rate,
                    outcome.trade_count,
                    outcome.classification.as_str(),
                ],
            )?;
        } else {
            // Losing qualification also forfeits smart-wallet status.
            tx.execute(
                "DELETE FROM qualified_wallets WHERE wallet = ?1",
                rusqlite::params![wallet],
            )?;
            tx.execute(
                "DELETE FROM smart_wallets WHERE wallet = ?1",
                rusqlite::params![wallet],
            )?;
        }
        tx.execute(
            "UPDATE wallets SET is_scored = 1 WHERE address = ?1",
            rusqlite::params![wallet],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await
}

/// Scoring pass: rebuild analytics for every extracted wallet, compute the
/// composite score, qualify or disqualify.
pub async fn run_scoring_once<S>(db: &AsyncDb, prices: &S, cfg: &Config) -> Result<PipelineSummary>
where
    S: SpotPrices + Clone + Send + Sync + 'static,
{
    JobTracker::observe(db, "scoring", async {
        let wallets: Vec<String> = db
            .call_named("scoring.select_wallets", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT address FROM wallets
                     WHERE is_active = 1 AND transactions_extracted = 1
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let gates = QualificationGates {
            min_score: cfg.scoring.min_score,
            min_weighted_roi: cfg.scoring.min_weighted_roi,
            min_trades: cfg.scoring.min_trades,
        };
        let summary = run_units_bounded(
            "scoring",
            wallets,
            cfg.provider.worker_concurrency,
            Duration::from_secs(cfg.provider.unit_deadline_secs),
            |wallet| {
                let db = db.clone();
                let prices = prices.clone();
                async move { score_wallet_unit(db, prices, wallet, gates).await }
            },
        )
        .await;

        super::run_funnel_metrics_once(db).await?;
        let metadata = serde_json::json!({
            "succeeded": summary.succeeded,
            "failed": summary.failed,
        });
        Ok((summary, metadata))
    })
    .await
}

async fn elect_wallet_unit(
    db: AsyncDb,
    wallet: String,
    grid: Arc<Vec<f64>>,
    params: ThresholdParams,
) -> Result<()> {
    let w = wallet.clone();
    let (stats, period): (Vec<TokenStat>, Option<String>) = db
        .call_named("smartwallets.load", move |conn| {
            let stats = load_token_stats(conn, &w)?;
            let period = conn
                .query_row(
                    "SELECT discovery_period FROM wallets WHERE address = ?1",
                    rusqlite::params![w],
                    |r| r.get(0),
                )
                .optional()?;
            Ok((stats, period))
        })
        .await?;

    let tiers: Vec<TierStats> = analyze_grid(&stats, &grid);
    let selection = select_threshold(&tiers, &params);

    // Elections of manually added or migration-created wallets keep their
    // origin visible in the status column.
    let status = if selection.status.is_smart() {
        match period.as_deref().and_then(DiscoveryPeriod::parse) {
            Some(DiscoveryPeriod::Manual) => ThresholdStatus::Manual,
            Some(DiscoveryPeriod::Migration) => ThresholdStatus::Migration,
            _ => selection.status,
        }
    } else {
        selection.status
    };

    let global_roi = weighted_roi(&stats);
    let global_wr = win_rate(&stats);
    let global_n = trade_count(&stats);

    tracing::debug!(
        wallet = %wallet,
        status = status.as_str(),
        optimal_tier = ?selection.optimal_tier,
        plateau = ?selection.plateau_tiers,
        quality = selection.quality_score,
        "threshold selection"
    );

    db.call_named("smartwallets.persist", move |conn| {
        let tx = conn.transaction()?;
        for t in &tiers {
            let is_optimal = selection.optimal_tier == Some(t.tier_usd);
            tx.execute(
                "INSERT INTO tier_performance
                    (wallet, tier_usd, roi_percentage, win_rate, n_trades, n_winners,
                     n_losers, n_neutral, total_invested, is_optimal_tier, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
                 ON CONFLICT(wallet, tier_usd) DO UPDATE SET
                    roi_percentage = excluded.roi_percentage,
                    win_rate = excluded.win_rate,
                    n_trades = excluded.n_trades,
                    n_winners = excluded.n_winners,
                    n_losers = excluded.n_losers,
                    n_neutral = excluded.n_neutral,
                    total_invested = excluded.total_invested,
                    is_optimal_tier = excluded.is_optimal_tier,
                    computed_at = datetime('now')",
                rusqlite::params![
                    wallet,
                    t.tier_usd,
                    t.roi_percentage,
                    t.win_rate,
                    t.n_trades,
                    t.n_winners,
                    t.n_losers,
                    t.n_neutral,
                    t.total_invested,
                    is_optimal,
                ],
            )?;
        }

        if status.is_smart() {
            let optimal = tiers
                .iter()
                .find(|t| selection.optimal_tier == Some(t.tier_usd));
            tx.execute(
                "INSERT INTO smart_wallets
                    (wallet, optimal_threshold_tier, quality_score, threshold_status,
                     tier_roi, tier_win_rate, tier_trades,
                     global_roi, global_win_rate, global_trades, elected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
                 ON CONFLICT(wallet) DO UPDATE SET
                    optimal_threshold_tier = excluded.optimal_threshold_tier,
                    quality_score = excluded.quality_score,
                    threshold_status = excluded.threshold_status,
                    tier_roi = excluded.tier_roi,
                    tier_win_rate = excluded.tier_win_rate,
                    tier_trades = excluded.tier_trades,
                    global_roi = excluded.global_roi,
                    global_win_rate = excluded.global_win_rate,
                    global_trades = excluded.global_trades,
                    elected_at = datetime('now')",
                rusqlite::params![
                    wallet,
                    selection.optimal_tier,
                    selection.quality_score,
                    status.as_str(),
                    optimal.map(|t| t.roi_percentage),
                    optimal.map(|t| t.win_rate),
                    optimal.map(|t| t.n_trades),
                    global_roi,
                    global_wr,
                    global_n,
                ],
            )?;
        } else {
            tx.execute(
                "DELETE FROM smart_wallets WHERE wallet = ?1",
                rusqlite::params![wallet],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
    .await
}

/// Tier analysis + threshold selection over the qualified set; elects smart
/// wallets and snapshots their metrics.
pub async fn run_smartwallets_once(db: &AsyncDb, cfg: &Config) -> Result<PipelineSummary> {
    JobTracker::observe(db, "smartwallets", async {
        let wallets: Vec<String> = db
            .call_named("smartwallets.select_wallets", |conn| {
                let mut stmt =
                    conn.prepare("SELECT wallet FROM qualified_wallets ORDER BY wallet")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let grid = Arc::new(cfg.tier_grid());
        let params = ThresholdParams {
            min_trades: cfg.threshold.min_trades,
            min_win_rate: cfg.threshold.min_winrate / 100.0,
            roi_cap_pct: cfg.threshold.roi_cap,
        };
        let summary = run_units_bounded(
            "smartwallets",
            wallets,
            cfg.provider.worker_concurrency,
            Duration::from_secs(cfg.provider.unit_deadline_secs),
            |wallet| {
                let db = db.clone();
                let grid = grid.clone();
                async move { elect_wallet_unit(db, wallet, grid, params).await }
            },
        )
        .await;

        super::run_funnel_metrics_once(db).await?;
        let metadata = serde_json::json!({
            "succeeded": summary.succeeded,
            "failed": summary.failed,
        });
        Ok((summary, metadata))
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    Full,
    /// Steps 1–4 only: diff and persist balances, skip rebuild + migration.
    BalanceOnly,
    /// Steps 5–6 only: balances are assumed already up to date.
    TransactionsOnly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingOptions {
    pub mode: TrackingMode,
    pub min_usd: Option<f64>,
    pub hours_lookback: Option<i64>,
}

#[derive(Clone, Copy)]
struct TrackingParams {
    mode: TrackingMode,
    min_usd: f64,
    hours_lookback: i64,
    rel_threshold: f64,
    migration_fraction: f64,
    migration_window_hours: i64,
}

async fn track_wallet_unit<P, S>(
    db: AsyncDb,
    provider: P,
    prices: S,
    wallet: String,
    params: TrackingParams,
) -> Result<()>
where
    P: BalancesFetcher + TransfersPager + SendsFetcher + AddressChecker + Sync,
    S: SpotPrices + Sync,
{
    if params.mode != TrackingMode::TransactionsOnly {
        let balances = provider.fetch_balances(&wallet).await?;
        let fresh: Vec<BalanceSnapshot> =
            balances.iter().filter_map(BalanceSnapshot::from_api).collect();

        let w = wallet.clone();
        let known: Vec<KnownPosition> = db
            .call_named("tracking.load_positions", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT fungible_id, symbol, current_amount, current_usd_value, in_portfolio
                     FROM token_positions WHERE wallet = ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![w], |row| {
                        Ok(KnownPosition {
                            fungible_id: row.get(0)?,
                            symbol: row.get(1)?,
                            amount: row.get(2)?,
                            usd_value: row.get(3)?,
                            in_portfolio: row.get::<_, i64>(4)? != 0,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let diffs = diff_positions(&known, &fresh, params.rel_threshold);
        for d in &diffs {
            metrics::counter!(
                "tracker_position_changes_total",
                "change_type" => d.change.as_str()
            )
            .increment(1);
        }

        // Steps 2–4 are one transactional unit per wallet.
        let total_value: f64 = fresh.iter().filter_map(|s| s.usd_value).sum();
        let w = wallet.clone();
        let fresh_rows = fresh;
        let diff_rows = diffs;
        db.call_named("tracking.apply_diffs", move |conn| {
            let tx = conn.transaction()?;
            for d in &diff_rows {
                tx.execute(
                    "INSERT INTO position_changes
                        (wallet, fungible_id, symbol, change_type, old_amount,
                         new_amount, old_usd_value, new_usd_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        w,
                        d.fungible_id,
                        d.symbol,
                        d.change.as_str(),
                        d.old_amount,
                        d.new_amount,
                        d.old_usd_value,
                        d.new_usd_value,
                    ],
                )?;
            }
            for s in &fresh_rows {
                super::upsert_position(&tx, &w, s)?;
            }
            for d in diff_rows.iter().filter(|d| d.change == ChangeType::Exit) {
                tx.execute(
                    "UPDATE token_positions
                     SET in_portfolio = 0, current_amount = 0.0, current_usd_value = 0.0,
                         last_updated = datetime('now')
                     WHERE wallet = ?1 AND fungible_id = ?2",
                    rusqlite::params![w, d.fungible_id],
                )?;
            }
            tx.execute(
                "UPDATE wallets
                 SET total_portfolio_value_usd = ?2, last_sync = datetime('now')
                 WHERE address = ?1",
                rusqlite::params![w, total_value],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
    }

    if params.mode != TrackingMode::BalanceOnly {
        // Step 5: selective history rebuild for tokens recently changed and
        // now worth tracking. Deferred work: a failure here leaves the
        // committed balance state intact.
        let w = wallet.clone();
        let min_usd = params.min_usd;
        let lookback = params.hours_lookback;
        let targets: Vec<String> = db
            .call_named("tracking.select_rebuild_targets", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT fungible_id FROM position_changes
                     WHERE wallet = ?1 AND new_usd_value >= ?2
                       AND detected_at >= datetime('now', '-' || ?3 || ' hours')",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![w, min_usd, lookback], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        for token in &targets {
            let rows =
                ingestion::fetch_full_history(&provider, &prices, &wallet, token, PAGE_LIMIT)
                    .await
                    .map_err(|e| IngestError::new(&wallet, token, format!("{e:#}")))?;
            ingestion::replace_history(&db, &wallet, token, rows).await?;
            rebuild_token_analytics(&db, &prices, &wallet, token).await?;
        }

        // Step 6: migration detection for this wallet.
        run_migration_check_for_wallet(
            &db,
            &provider,
            &prices,
            &wallet,
            params.migration_fraction,
            params.migration_window_hours,
        )
        .await?;
    }

    Ok(())
}

/// Live tracking pass over the smart-wallet set.
pub async fn run_tracking_live_once<P, S>(
    db: &AsyncDb,
    provider: &P,
    prices: &S,
    cfg: &Config,
    opts: &TrackingOptions,
) -> Result<PipelineSummary>
where
    P: BalancesFetcher + TransfersPager + SendsFetcher + AddressChecker + Clone + Send + Sync + 'static,
    S: SpotPrices + Clone + Send + Sync + 'static,
{
    JobTracker::observe(db, "tracking_live", async {
        let wallets: Vec<String> = db
            .call_named("tracking.select_smart_wallets", |conn| {
                let mut stmt = conn.prepare("SELECT wallet FROM smart_wallets ORDER BY wallet")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let params = TrackingParams {
            mode: opts.mode,
            min_usd: opts.min_usd.unwrap_or(cfg.tracking.min_token_value_usd),
            hours_lookback: opts.hours_lookback.unwrap_or(cfg.tracking.hours_lookback),
            rel_threshold: cfg.tracking.rel_change_threshold,
            migration_fraction: cfg.migration.portfolio_fraction,
            migration_window_hours: cfg.migration.window_hours,
        };
        let summary = run_units_bounded(
            "tracking_live",
            wallets,
            cfg.provider.worker_concurrency,
            Duration::from_secs(cfg.provider.unit_deadline_secs),
            |wallet| {
                let db = db.clone();
                let provider = provider.clone();
                let prices = prices.clone();
                async move { track_wallet_unit(db, provider, prices, wallet, params).await }
            },
        )
        .await;

        let metadata = serde_json::json!({
            "succeeded": summary.succeeded,
            "failed": summary.failed,
        });
        Ok((summary, metadata))
    })
    .await
}

/// Migration detection for one wallet inside its fixed send window
/// (independent of the tracker lookback).
pub async fn run_migration_check_for_wallet<P, S>(
    db: &AsyncDb,
    provider: &P,
    prices: &S,
    wallet: &str,
    portfolio_fraction: f64,
    window_hours: i64,
) -> Result<()>
where
    P: SendsFetcher + AddressChecker + TransfersPager + Sync,
    S: SpotPrices + Sync,
{
    let now = chrono::Utc::now().timestamp();
    let since = now - window_hours * 3600;
    let sends = ingestion::fetch_recent_sends(provider, prices, wallet, since, PAGE_LIMIT).await?;
    if sends.is_empty() {
        return Ok(());
    }

    let w = wallet.to_string();
    let portfolio_value: f64 = db
        .call_named("migration.portfolio_value", move |conn| {
            let v = conn
                .query_row(
                    "SELECT total_portfolio_value_usd FROM wallets WHERE address = ?1",
                    rusqlite::params![w],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(v.unwrap_or(0.0))
        })
        .await?;

    for candidate in migration::detect_candidates(&sends, portfolio_value, portfolio_fraction) {
        let info = provider.check_address(&candidate.recipient).await?;
        // A contract or an unclassifiable address is not a wallet migration.
        if info.is_contract != Some(false) {
            tracing::info!(
                wallet,
                recipient = %candidate.recipient,
                is_contract = ?info.is_contract,
                "migration candidate rejected by contract check"
            );
            continue;
        }

        let recipient = candidate.recipient.clone();
        db.call_named("migration.upsert_recipient", move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO wallets (address, discovery_period, is_scored)
                 VALUES (?1, 'migration', 0)",
                rusqlite::params![recipient],
            )?;
            Ok(())
        })
        .await?;

        for token in &candidate.tokens {
            let rows = ingestion::fetch_full_history(
                provider,
                prices,
                &candidate.recipient,
                &token.fungible_id,
                PAGE_LIMIT,
            )
            .await?;
            ingestion::insert_history(db, &candidate.recipient, rows).await?;
        }

        let parent = wallet.to_string();
        let migration_date = chrono::DateTime::from_timestamp(candidate.last_send_ts, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let cand = candidate.clone();
        db.call_named("migration.inherit", move |conn| {
            let tx = conn.transaction()?;
            for symbol in cand.tokens.iter().filter_map(|t| t.symbol.as_deref()) {
                if let Some(avg) = migration::parent_weighted_avg_buy_price(&tx, &parent, symbol)? {
                    migration::apply_inheritance(&tx, &cand.recipient, symbol, &parent, avg)?;
                }
            }
            migration::record_migration(&tx, &parent, &cand.recipient, &migration_date, &cand)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        metrics::counter!("tracker_migrations_detected_total").increment(1);
        tracing::info!(
            wallet,
            recipient = %candidate.recipient,
            fraction = candidate.transfer_fraction,
            value_usd = candidate.total_value_usd,
            "wallet migration recorded"
        );
    }

    Ok(())
}

/// Consensus pass: group recent smart-wallet buys, enrich with market data,
/// persist and notify.
pub async fn run_consensus_once<M, N>(
    db: &AsyncDb,
    market: &M,
    sink: &N,
    cfg: &Config,
) -> Result<u64>
where
    M: TokenMarketData + Sync,
    N: NotificationSink + Sync,
{
    JobTracker::observe(db, "consensus", async {
        let now = chrono::Utc::now().timestamp();
        let since = now - cfg.consensus.window_hours * 3600;

        let buys: Vec<RecentBuy> = db
            .call_named("consensus.select_recent_buys", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT t.wallet, t.symbol, t.contract_address, t.chain,
                            t.quantity * t.price_per_token, t.timestamp
                     FROM transfers t
                     JOIN smart_wallets sw ON sw.wallet = t.wallet
                     WHERE t.action_type = 'buy'
                       AND t.timestamp >= ?1 AND t.timestamp <= ?2
                       AND t.contract_address IS NOT NULL
                       AND t.price_per_token IS NOT NULL",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![since, now], |row| {
                        Ok(RecentBuy {
                            wallet: row.get(0)?,
                            symbol: row.get(1)?,
                            contract_address: row.get(2)?,
                            chain: row.get(3)?,
                            value_usd: row.get(4)?,
                            timestamp: row.get(5)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let filters = ConsensusFilters {
            min_whales: cfg.consensus.min_whales,
            mcap_min: cfg.consensus.mcap_min,
            mcap_max: cfg.consensus.mcap_max,
        };

        let mut emitted = 0_u64;
        for candidate in group_recent_buys(&buys) {
            // Cheap gate before the market-data call.
            if candidate.whale_count < filters.min_whales {
                continue;
            }
            let market_info = match market.token_market(&candidate.contract_address).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(contract = %candidate.contract_address, error = %e, "market enrichment failed");
                    None
                }
            };
            if !passes_filters(&candidate, market_info.as_ref(), &filters) {
                continue;
            }

            let cand = candidate.clone();
            let window_hours = cfg.consensus.window_hours;
            db.call_named("consensus.upsert_signal", move |conn| {
                consensus::upsert_signal(conn, &cand, window_hours).map(|_| ())
            })
            .await?;

            // At-least-once: the sink dedups on (contract, period_start).
            let signal = ConsensusSignal::from_candidate(&candidate, market_info.as_ref());
            if let Err(e) = sink.emit(&signal).await {
                tracing::warn!(contract = %signal.contract, error = %e, "notification sink failed; signal persisted");
            }
            emitted += 1;
            metrics::counter!("tracker_consensus_signals_total").increment(1);
        }

        Ok((emitted, serde_json::json!({ "signals": emitted })))
    })
    .await
}

/// Per-wallet result of the offline replay.
#[derive(Debug, Clone)]
pub struct BacktestRow {
    pub wallet: String,
    pub tokens: u32,
    pub total_invested: f64,
    pub total_profit_loss: f64,
}

/// Offline FIFO replay of the whole transfer log with cost-held valuation.
/// No provider calls; exercises engine determinism at scale.
pub async fn run_backtest_once(db: &AsyncDb) -> Result<Vec<BacktestRow>> {
    db.call_named("backtest.replay", |conn| {
        let mut stmt =
            conn.prepare("SELECT DISTINCT wallet, fungible_id FROM transfers ORDER BY wallet, fungible_id")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut rows: Vec<BacktestRow> = Vec::new();
        for (wallet, fungible_id) in pairs {
            let events = load_fifo_events(conn, &wallet, &fungible_id)?;
            let ledger = fifo::replay(events);
            let val = fifo::valuation(&ledger, None);
            match rows.last_mut() {
                Some(last) if last.wallet == wallet => {
                    last.tokens += 1;
                    last.total_invested += ledger.total_invested;
                    last.total_profit_loss += val.profit_loss;
                }
                _ => rows.push(BacktestRow {
                    wallet,
                    tokens: 1,
                    total_invested: ledger.total_invested,
                    total_profit_loss: val.profit_loss,
                }),
            }
        }
        rows.sort_by(|a, b| b.total_profit_loss.total_cmp(&a.total_profit_loss));
        Ok(rows)
    })
    .await
}
