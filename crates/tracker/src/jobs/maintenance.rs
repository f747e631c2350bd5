use anyhow::Result;
use common::db::AsyncDb;
use rusqlite::Connection;

/// Pipeline funnel: wallets discovered → extracted → scored → qualified →
/// smart. Recomputed after pipeline passes for the Grafana funnel panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunnelCounts {
    pub wallets_total: i64,
    pub wallets_extracted: i64,
    pub wallets_scored: i64,
    pub wallets_qualified: i64,
    pub wallets_smart: i64,
}

pub fn compute_funnel_counts(conn: &Connection) -> Result<FunnelCounts> {
    let one = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
    Ok(FunnelCounts {
        wallets_total: one("SELECT COUNT(*) FROM wallets WHERE is_active = 1")?,
        wallets_extracted: one(
            "SELECT COUNT(*) FROM wallets WHERE is_active = 1 AND transactions_extracted = 1",
        )?,
        wallets_scored: one("SELECT COUNT(*) FROM wallets WHERE is_active = 1 AND is_scored = 1")?,
        wallets_qualified: one("SELECT COUNT(*) FROM qualified_wallets")?,
        wallets_smart: one("SELECT COUNT(*) FROM smart_wallets")?,
    })
}

pub fn record_funnel_counts(counts: &FunnelCounts) {
    metrics::gauge!("tracker_funnel_wallets_total").set(counts.wallets_total as f64);
    metrics::gauge!("tracker_funnel_wallets_extracted").set(counts.wallets_extracted as f64);
    metrics::gauge!("tracker_funnel_wallets_scored").set(counts.wallets_scored as f64);
    metrics::gauge!("tracker_funnel_wallets_qualified").set(counts.wallets_qualified as f64);
    metrics::gauge!("tracker_funnel_wallets_smart").set(counts.wallets_smart as f64);
}

pub async fn run_funnel_metrics_once(db: &AsyncDb) -> Result<()> {
    let counts = db
        .call_named("funnel.compute", |conn| compute_funnel_counts(conn))
        .await?;
    record_funnel_counts(&counts);
    Ok(())
}

/// Run a WAL checkpoint to fold the WAL file back into the main database.
///
/// Without periodic checkpointing the WAL grows unbounded under the
/// tracker's write load. TRUNCATE mode resets it to zero bytes after
/// checkpointing all pages.
pub async fn run_wal_checkpoint_once(db: &AsyncDb) -> Result<(i64, i64)> {
    db.call_named("wal_checkpoint.run", |conn| {
        let mut stmt = conn.prepare("PRAGMA wal_checkpoint(TRUNCATE)")?;
        let (busy, log, checkpointed) = stmt.query_row([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        if busy != 0 {
            tracing::warn!(
                busy,
                log,
                checkpointed,
                "WAL checkpoint: database was busy, partial checkpoint"
            );
            metrics::counter!("tracker_wal_checkpoint_total", "status" => "busy").increment(1);
        } else {
            tracing::info!(log, checkpointed, "WAL checkpoint complete");
            metrics::counter!("tracker_wal_checkpoint_total", "status" => "ok").increment(1);
        }
        Ok((log, checkpointed))
    })
    .await
}
