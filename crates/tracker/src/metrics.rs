use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub fn describe() {
    describe_counter!(
        "tracing_error_events",
        "Cumulative count of all ERROR-level tracing events."
    );
    describe_histogram!(
        "tracker_db_query_latency_ms",
        "SQLite DB operation total latency in milliseconds (queue wait + execution)."
    );
    describe_counter!(
        "tracker_db_query_errors_total",
        "SQLite DB operation errors."
    );
    describe_counter!(
        "tracker_api_requests_total",
        "Provider/oracle API requests, labeled by endpoint and status."
    );
    describe_counter!(
        "tracker_api_errors_total",
        "Provider/oracle API failures classified by kind."
    );
    describe_histogram!(
        "tracker_api_latency_ms",
        "Provider/oracle API request latency in milliseconds."
    );
    describe_counter!(
        "tracker_price_lookups_total",
        "Price resolutions, labeled by source (stable/primary/secondary/none)."
    );
    describe_counter!(
        "tracker_wallets_discovered_total",
        "Wallets inserted by seed discovery."
    );
    describe_counter!(
        "tracker_transfers_ingested_total",
        "Transfer rows inserted into the event log."
    );
    describe_counter!(
        "tracker_unit_failures_total",
        "Per-wallet pipeline units that failed, labeled by stage."
    );
    describe_counter!(
        "tracker_job_runs_total",
        "Completed job passes, labeled by job and status (idle/failed)."
    );
    describe_histogram!(
        "tracker_job_duration_ms",
        "Wall-clock duration of one job pass in milliseconds."
    );
    describe_counter!(
        "tracker_position_changes_total",
        "Detected position changes, labeled by change_type."
    );
    describe_counter!(
        "tracker_fifo_oversold_total",
        "Token replays whose sells exceeded open lots."
    );
    describe_counter!(
        "tracker_migrations_detected_total",
        "Validated wallet migrations recorded."
    );
    describe_counter!(
        "tracker_consensus_signals_total",
        "Consensus signals persisted/emitted."
    );
    describe_counter!(
        "tracker_wal_checkpoint_total",
        "WAL checkpoints, labeled by status."
    );
    // Funnel gauges for the Grafana panel.
    describe_gauge!("tracker_funnel_wallets_total", "Funnel: active wallets.");
    describe_gauge!(
        "tracker_funnel_wallets_extracted",
        "Funnel: wallets with extracted history."
    );
    describe_gauge!("tracker_funnel_wallets_scored", "Funnel: scored wallets.");
    describe_gauge!(
        "tracker_funnel_wallets_qualified",
        "Funnel: wallets passing qualification gates."
    );
    describe_gauge!(
        "tracker_funnel_wallets_smart",
        "Funnel: elected smart wallets."
    );
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // Bind to localhost: the scrape agent runs on the same host and the
    // endpoint must not be exposed publicly.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("tracker_".to_string()),
            HISTOGRAM_BUCKETS_MS,
        )
        .map_err(anyhow::Error::from)?
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;

    Ok(())
}
