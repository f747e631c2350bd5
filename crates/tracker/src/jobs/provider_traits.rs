use anyhow::Result;
use common::prices::TokenMarket;
use common::types::{ApiAddressInfo, ApiBalance, ApiSeedWallet};

/// Current balances for one wallet.
pub trait BalancesFetcher {
    fn fetch_balances(
        &self,
        wallet: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ApiBalance>>> + Send;
}

/// Contract-type check (EOA vs contract) for migration validation.
pub trait AddressChecker {
    fn check_address(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = Result<ApiAddressInfo>> + Send;
}

/// Candidate wallet addresses per discovery window.
pub trait SeedWalletSource {
    fn fetch_seed_wallets(
        &self,
        window: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ApiSeedWallet>>> + Send;
}

/// Market cap / liquidity enrichment for consensus filtering.
pub trait TokenMarketData {
    fn token_market(
        &self,
        contract: &str,
    ) -> impl std::future::Future<Output = Result<Option<TokenMarket>>> + Send;
}
