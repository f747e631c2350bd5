use anyhow::Result;
use common::chaindata::ChainDataClient;
use common::config::Config;
use common::db::AsyncDb;
use common::prices::PriceOracleClient;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

mod cli;
mod consensus;
mod fifo;
mod ingestion;
mod jobs;
mod live_tracker;
mod metrics;
mod migration;
mod scheduler;
mod threshold_selection;
mod tier_analysis;
mod wallet_scoring;

use consensus::AnySink;
use jobs::PipelineSummary;

#[tokio::main]
async fn main() -> ExitCode {
    // Usage and configuration problems are exit code 2; nothing else is.
    let cmd = match cli::parse_args(std::env::args()) {
        Ok(cmd) => cmd,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("wallet_intel_tracker", &config.general.log_level);
    let _ = tracing::dispatcher::set_global_default(dispatch);

    match run(cmd, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "fatal error");
            ExitCode::from(1)
        }
    }
}

fn exit_for(summary: PipelineSummary) -> ExitCode {
    if summary.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(cmd: cli::Command, config: Config) -> Result<ExitCode> {
    tracing::info!(command = ?cmd, "wallet_intel tracker starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = AsyncDb::open(&config.database.path).await?;

    let provider = ChainDataClient::new_with_settings(
        &config.provider.base_url,
        config.provider.api_keys.clone(),
        Duration::from_secs(config.provider.request_timeout_secs),
        config.provider.requests_per_sec,
        config.provider.burst,
        config.provider.max_retries,
        Duration::from_millis(config.provider.backoff_base_ms),
    )?;
    let oracle = PriceOracleClient::new(
        &config.oracle.primary_url,
        &config.oracle.secondary_url,
        Duration::from_secs(config.oracle.request_timeout_secs),
    )?;
    let sink = AnySink::from_config(
        &config.notification.webhook_url,
        Duration::from_secs(config.oracle.request_timeout_secs),
    )?;

    match cmd {
        cli::Command::Discovery => {
            let inserted = jobs::run_discovery_once(&db, &provider, &config).await?;
            let summary =
                jobs::run_history_extraction_once(&db, &provider, &oracle, &config).await?;
            tracing::info!(
                inserted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "discovery done"
            );
            Ok(exit_for(summary))
        }
        cli::Command::Scoring => {
            let summary = jobs::run_scoring_once(&db, &oracle, &config).await?;
            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                "scoring done"
            );
            Ok(exit_for(summary))
        }
        cli::Command::SmartWallets => {
            let summary = jobs::run_smartwallets_once(&db, &config).await?;
            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                "smartwallets done"
            );
            Ok(exit_for(summary))
        }
        cli::Command::Consensus => {
            let signals = jobs::run_consensus_once(&db, &oracle, &sink, &config).await?;
            tracing::info!(signals, "consensus done");
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::TrackingLive(opts) => {
            let summary =
                jobs::run_tracking_live_once(&db, &provider, &oracle, &config, &opts).await?;
            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                "tracking-live done"
            );
            Ok(exit_for(summary))
        }
        cli::Command::Backtest => {
            let rows = jobs::run_backtest_once(&db).await?;
            println!(
                "{:<44} {:>6} {:>14} {:>14}",
                "wallet", "tokens", "invested_usd", "pnl_usd"
            );
            for r in &rows {
                println!(
                    "{:<44} {:>6} {:>14.2} {:>14.2}",
                    r.wallet, r.tokens, r.total_invested, r.total_profit_loss
                );
            }
            tracing::info!(wallets = rows.len(), "backtest done");
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::Scheduler => run_scheduler(db, provider, oracle, sink, config).await,
    }
}

async fn run_scheduler(
    db: AsyncDb,
    provider: ChainDataClient,
    oracle: PriceOracleClient,
    sink: AnySink,
    config: Config,
) -> Result<ExitCode> {
    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let cfg = Arc::new(config);

    let (discovery_tx, mut discovery_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (scoring_tx, mut scoring_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (tracking_tx, mut tracking_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (consensus_tx, mut consensus_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (maintenance_tx, mut maintenance_rx) = tokio::sync::mpsc::channel::<()>(8);

    let _scheduler_handles = scheduler::start(vec![
        scheduler::JobSpec {
            name: "discovery".to_string(),
            interval: Duration::from_secs(cfg.discovery.interval_secs),
            tick: discovery_tx,
            run_immediately: true,
        },
        scheduler::JobSpec {
            name: "scoring".to_string(),
            interval: Duration::from_secs(cfg.scoring.interval_secs),
            tick: scoring_tx,
            run_immediately: false,
        },
        scheduler::JobSpec {
            name: "tracking_live".to_string(),
            interval: Duration::from_secs(cfg.tracking.interval_secs),
            tick: tracking_tx,
            run_immediately: false,
        },
        scheduler::JobSpec {
            name: "consensus".to_string(),
            interval: Duration::from_secs(cfg.consensus.interval_secs),
            tick: consensus_tx,
            run_immediately: false,
        },
        scheduler::JobSpec {
            name: "maintenance".to_string(),
            interval: Duration::from_secs(3600),
            tick: maintenance_tx,
            run_immediately: false,
        },
    ]);

    tokio::spawn({
        let db = db.clone();
        let provider = provider.clone();
        let oracle = oracle.clone();
        let cfg = cfg.clone();
        async move {
            while discovery_rx.recv().await.is_some() {
                match jobs::run_discovery_once(&db, &provider, &cfg).await {
                    Ok(inserted) => tracing::info!(inserted, "discovery done"),
                    Err(e) => tracing::error!(error = %e, "discovery failed"),
                }
                match jobs::run_history_extraction_once(&db, &provider, &oracle, &cfg).await {
                    Ok(s) => {
                        tracing::info!(succeeded = s.succeeded, failed = s.failed, "extraction done");
                    }
                    Err(e) => tracing::error!(error = %e, "extraction failed"),
                }
            }
        }
    });

    // Scoring and election run back to back: the threshold selector consumes
    // what the scorer just qualified.
    tokio::spawn({
        let db = db.clone();
        let oracle = oracle.clone();
        let cfg = cfg.clone();
        async move {
            while scoring_rx.recv().await.is_some() {
                match jobs::run_scoring_once(&db, &oracle, &cfg).await {
                    Ok(s) => {
                        tracing::info!(succeeded = s.succeeded, failed = s.failed, "scoring done");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "scoring failed");
                        continue;
                    }
                }
                match jobs::run_smartwallets_once(&db, &cfg).await {
                    Ok(s) => tracing::info!(
                        succeeded = s.succeeded,
                        failed = s.failed,
                        "smartwallets done"
                    ),
                    Err(e) => tracing::error!(error = %e, "smartwallets failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let provider = provider.clone();
        let oracle = oracle.clone();
        let cfg = cfg.clone();
        async move {
            let opts = jobs::TrackingOptions {
                mode: jobs::TrackingMode::Full,
                min_usd: None,
                hours_lookback: None,
            };
            while tracking_rx.recv().await.is_some() {
                match jobs::run_tracking_live_once(&db, &provider, &oracle, &cfg, &opts).await {
                    Ok(s) => tracing::info!(
                        succeeded = s.succeeded,
                        failed = s.failed,
                        "tracking-live done"
                    ),
                    Err(e) => tracing::error!(error = %e, "tracking-live failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let oracle = oracle.clone();
        let cfg = cfg.clone();
        async move {
            while consensus_rx.recv().await.is_some() {
                match jobs::run_consensus_once(&db, &oracle, &sink, &cfg).await {
                    Ok(signals) => tracing::info!(signals, "consensus done"),
                    Err(e) => tracing::error!(error = %e, "consensus failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        async move {
            while maintenance_rx.recv().await.is_some() {
                if let Err(e) = jobs::run_wal_checkpoint_once(&db).await {
                    tracing::error!(error = %e, "WAL checkpoint failed");
                }
                if let Err(e) = jobs::run_funnel_metrics_once(&db).await {
                    tracing::error!(error = %e, "funnel metrics failed");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(ExitCode::SUCCESS)
}
