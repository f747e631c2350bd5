mod ingestion_jobs;
mod maintenance;
mod pipeline_jobs;
mod provider_impls;
pub(crate) mod provider_traits;
mod tracker;

pub use ingestion_jobs::*;
pub use maintenance::*;
pub use pipeline_jobs::*;

use anyhow::Result;
use common::error::UnitError;
use std::sync::Arc;
use std::time::Duration;

/// Per-stage result over per-wallet units. Any failed unit maps to process
/// exit code 1; the next scheduled pass is the retry mechanism.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSummary {
    pub succeeded: u64,
    pub failed: u64,
}

/// Run one future per wallet through a bounded worker pool with a per-unit
/// deadline. A failing or timed-out wallet is logged and counted; it never
/// aborts the stage, and its state stays whatever the unit last committed.
pub(crate) async fn run_units_bounded<F, Fut>(
    stage: &'static str,
    wallets: Vec<String>,
    concurrency: usize,
    deadline: Duration,
    make_unit: F,
) -> PipelineSummary
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let sem = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
    let mut set = tokio::task::JoinSet::new();

    for wallet in wallets {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let fut = make_unit(wallet.clone());
        set.spawn(async move {
            let _permit = permit;
            let res = match tokio::time::timeout(deadline, fut).await {
                Ok(res) => res,
                Err(_) => Err(anyhow::Error::new(UnitError::DeadlineExceeded(deadline))),
            };
            (wallet, res)
        });
    }

    let mut summary = PipelineSummary::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => summary.succeeded += 1,
            Ok((wallet, Err(e))) => {
                summary.failed += 1;
                metrics::counter!("tracker_unit_failures_total", "stage" => stage).increment(1);
                tracing::warn!(stage, wallet = %wallet, error = %e, "wallet unit failed; continuing");
            }
            Err(join_err) => {
                summary.failed += 1;
                metrics::counter!("tracker_unit_failures_total", "stage" => stage).increment(1);
                tracing::error!(stage, error = %join_err, "wallet unit task aborted");
            }
        }
    }
    summary
}

/// Upsert one token position from a fresh balance snapshot; re-entering
/// tokens flip back to in_portfolio.
pub(crate) fn upsert_position(
    tx: &rusqlite::Transaction<'_>,
    wallet: &str,
    snap: &crate::live_tracker::BalanceSnapshot,
) -> Result<()> {
    tx.execute(
        "INSERT INTO token_positions
            (wallet, fungible_id, symbol, contract_address, chain,
             current_amount, current_usd_value, current_price_per_token,
             in_portfolio, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, datetime('now'))
         ON CONFLICT(wallet, fungible_id) DO UPDATE SET
            symbol = excluded.symbol,
            contract_address = excluded.contract_address,
            chain = excluded.chain,
            current_amount = excluded.current_amount,
            current_usd_value = excluded.current_usd_value,
            current_price_per_token = excluded.current_price_per_token,
            in_portfolio = 1,
            last_updated = datetime('now')",
        rusqlite::params![
            wallet,
            snap.fungible_id,
            snap.symbol,
            snap.contract_address,
            snap.chain,
            snap.quantity,
            snap.usd_value,
            snap.price_usd,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_bounded_units_collect_failures_without_aborting() {
        let wallets: Vec<String> = (0..6).map(|i| format!("0xw{i}")).collect();
        let summary = run_units_bounded(
            "test",
            wallets,
            2,
            Duration::from_secs(5),
            |wallet| async move {
                if wallet.ends_with('3') {
                    anyhow::bail!("boom");
                }
                Ok(())
            },
        )
        .await;
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_bounded_units_respect_concurrency_cap() {
        let peak = Arc::new(AtomicU32::new(0));
        let current = Arc::new(AtomicU32::new(0));
        let wallets: Vec<String> = (0..10).map(|i| format!("0xw{i}")).collect();

        let summary = run_units_bounded("test", wallets, 3, Duration::from_secs(5), |_| {
            let peak = peak.clone();
            let current = current.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(summary.succeeded, 10);
        assert!(peak.load(Ordering::SeqCst) <= 3, "pool width exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_deadline_counts_as_failure() {
        let summary = run_units_bounded(
            "test",
            vec!["0xslow".to_string()],
            1,
            Duration::from_secs(1),
            |_| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;
        assert_eq!(summary.failed, 1);
    }
}
