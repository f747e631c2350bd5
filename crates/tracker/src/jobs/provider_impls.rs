use anyhow::Result;
use common::chaindata::ChainDataClient;
use common::error::classify_api_error;
use common::prices::{PriceOracleClient, ResolvedPrice, TokenMarket};
use common::types::{ApiAddressInfo, ApiBalance, ApiSeedWallet, ApiTransfer};
use std::time::Instant;

use super::provider_traits::*;
use crate::ingestion::{SendsFetcher, SpotPrices, TransfersPager};

/// Per-endpoint request/error/latency metrics around an API call.
fn record_api<T>(endpoint: &'static str, start: Instant, res: &Result<T>) {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("tracker_api_latency_ms", "endpoint" => endpoint).record(ms);
    match res {
        Ok(_) => {
            metrics::counter!("tracker_api_requests_total", "endpoint" => endpoint, "status" => "ok")
                .increment(1);
        }
        Err(e) => {
            metrics::counter!("tracker_api_requests_total", "endpoint" => endpoint, "status" => "error")
                .increment(1);
            metrics::counter!(
                "tracker_api_errors_total",
                "endpoint" => endpoint,
                "kind" => classify_api_error(e).as_str()
            )
            .increment(1);
        }
    }
}

impl TransfersPager for ChainDataClient {
    fn transfers_url(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        limit: u32,
        cursor: Option<&str>,
    ) -> String {
        ChainDataClient::transfers_url(self, wallet, fungible_id, limit, cursor)
    }

    async fn fetch_transfers_page(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<ApiTransfer>, Option<String>)> {
        let start = Instant::now();
        let res = ChainDataClient::fetch_transfers_page(self, wallet, fungible_id, limit, cursor).await;
        record_api("transfers", start, &res);
        res
    }
}

impl SendsFetcher for ChainDataClient {
    async fn fetch_sends_page(
        &self,
        wallet: &str,
        since_ts: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<ApiTransfer>, Option<String>)> {
        let start = Instant::now();
        let res = ChainDataClient::fetch_sends_page(self, wallet, since_ts, limit, cursor).await;
        record_api("sends", start, &res);
        res
    }
}

impl BalancesFetcher for ChainDataClient {
    async fn fetch_balances(&self, wallet: &str) -> Result<Vec<ApiBalance>> {
        let start = Instant::now();
        let res = ChainDataClient::fetch_balances(self, wallet).await;
        record_api("balances", start, &res);
        res
    }
}

impl AddressChecker for ChainDataClient {
    async fn check_address(&self, address: &str) -> Result<ApiAddressInfo> {
        let start = Instant::now();
        let res = ChainDataClient::check_address(self, address).await;
        record_api("address_check", start, &res);
        res
    }
}

impl SeedWalletSource for ChainDataClient {
    async fn fetch_seed_wallets(&self, window: &str, limit: u32) -> Result<Vec<ApiSeedWallet>> {
        let start = Instant::now();
        let res = ChainDataClient::fetch_seed_wallets(self, window, limit).await;
        record_api("seed_wallets", start, &res);
        res
    }
}

impl SpotPrices for PriceOracleClient {
    async fn resolve_price(
        &self,
        symbol: Option<&str>,
        contract: Option<&str>,
        chain: Option<&str>,
        at: Option<i64>,
    ) -> ResolvedPrice {
        let start = Instant::now();
        let resolved = PriceOracleClient::resolve(self, symbol, contract, chain, at).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("tracker_api_latency_ms", "endpoint" => "price").record(ms);
        metrics::counter!(
            "tracker_price_lookups_total",
            "source" => resolved.source.as_str()
        )
        .increment(1);
        resolved
    }
}

impl TokenMarketData for PriceOracleClient {
    async fn token_market(&self, contract: &str) -> Result<Option<TokenMarket>> {
        let start = Instant::now();
        let res = PriceOracleClient::token_market(self, contract).await;
        record_api("token_market", start, &res);
        res
    }
}
