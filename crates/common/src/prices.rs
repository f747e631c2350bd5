use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Pinned to exactly $1.00; also excluded from consensus signals.
pub const STABLECOINS: &[&str] = &[
    "USDT", "USDC", "DAI", "BUSD", "FDUSD", "TUSD", "USDP", "USDD", "GUSD",
];

pub fn is_stablecoin(symbol: &str) -> bool {
    let upper = symbol.to_uppercase();
    STABLECOINS.contains(&upper.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceTag {
    Stable,
    Primary,
    Secondary,
    None,
}

impl PriceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::None => "none",
        }
    }
}

/// A resolved USD price. `usd = None` means the token cannot be valued;
/// analytics must fall back to cost-held valuation, never error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrice {
    pub usd: Option<f64>,
    pub source: PriceTag,
}

impl ResolvedPrice {
    pub fn none() -> Self {
        Self {
            usd: None,
            source: PriceTag::None,
        }
    }

    pub fn stable() -> Self {
        Self {
            usd: Some(1.0),
            source: PriceTag::Stable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TokenMarket {
    pub market_cap: Option<f64>,
    pub liquidity_usd: Option<f64>,
}

/// Stablecoin pinning happens before any oracle call.
pub fn pin_stablecoin(symbol: Option<&str>) -> Option<ResolvedPrice> {
    match symbol {
        Some(s) if is_stablecoin(s) => Some(ResolvedPrice::stable()),
        _ => None,
    }
}

// Primary oracle payload (token endpoint).
#[derive(Debug, Deserialize)]
struct PrimaryTokenResponse {
    data: Option<PrimaryTokenData>,
}

#[derive(Debug, Deserialize)]
struct PrimaryTokenData {
    attributes: PrimaryTokenAttributes,
}

#[derive(Debug, Deserialize)]
struct PrimaryTokenAttributes {
    price_usd: Option<String>,
}

// Secondary oracle payload (pairs endpoint).
#[derive(Debug, Deserialize)]
struct SecondaryTokenResponse {
    pairs: Option<Vec<SecondaryPair>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SecondaryPair {
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
    #[serde(rename = "marketCap")]
    market_cap: Option<f64>,
    liquidity: Option<SecondaryLiquidity>,
}

#[derive(Debug, Clone, Deserialize)]
struct SecondaryLiquidity {
    usd: Option<f64>,
}

/// Deepest pool wins; thin pools quote stale or manipulated prices.
fn best_pair(pairs: &[SecondaryPair]) -> Option<&SecondaryPair> {
    pairs.iter().max_by(|a, b| {
        let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
        let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
        la.total_cmp(&lb)
    })
}

struct OracleInner {
    primary_url: String,
    secondary_url: String,
    http: reqwest::Client,
}

/// Spot-price oracle with primary → secondary fallback. All requests are
/// idempotent, side-effect-free GETs. Clone is cheap.
#[derive(Clone)]
pub struct PriceOracleClient {
    inner: Arc<OracleInner>,
}

impl PriceOracleClient {
    pub fn new(primary_url: &str, secondary_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building oracle HTTP client")?;
        Ok(Self {
            inner: Arc::new(OracleInner {
                primary_url: primary_url.trim_end_matches('/').to_string(),
                secondary_url: secondary_url.trim_end_matches('/').to_string(),
                http,
            }),
        })
    }

    pub fn primary_token_url(&self, contract: &str, chain: &str, at: Option<i64>) -> String {
        let base = format!(
            "{}/networks/{chain}/tokens/{contract}",
            self.inner.primary_url
        );
        match at {
            Some(ts) => format!("{base}?at={ts}"),
            None => base,
        }
    }

    pub fn secondary_token_url(&self, contract: &str) -> String {
        format!("{}/latest/dex/tokens/{contract}", self.inner.secondary_url)
    }

    async fn primary_price(&self, contract: &str, chain: &str, at: Option<i64>) -> Result<Option<f64>> {
        let url = self.primary_token_url(contract, chain, at);
        let resp: PrimaryTokenResponse = self
            .inner
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("decoding {url}"))?;
        Ok(resp
            .data
            .and_then(|d| d.attributes.price_usd)
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| *p > 0.0))
    }

    async fn secondary_price(&self, contract: &str) -> Result<Option<f64>> {
        let url = self.secondary_token_url(contract);
        let resp: SecondaryTokenResponse = self
            .inner
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("decoding {url}"))?;
        Ok(resp
            .pairs
            .as_deref()
            .and_then(best_pair)
            .and_then(|p| p.price_usd.as_deref())
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| *p > 0.0))
    }

    /// Resolve a USD price. Stablecoins pin to $1.00 without an oracle call;
    /// otherwise primary, then secondary on failure or zero-result (spot
    /// only — the secondary has no historical endpoint). A fully unknown
    /// price resolves to `None`/`none`, never an error.
    pub async fn resolve(
        &self,
        symbol: Option<&str>,
        contract: Option<&str>,
        chain: Option<&str>,
        at: Option<i64>,
    ) -> ResolvedPrice {
        if let Some(pinned) = pin_stablecoin(symbol) {
            return pinned;
        }
        let (Some(contract), Some(chain)) = (contract, chain) else {
            return ResolvedPrice::none();
        };

        match self.primary_price(contract, chain, at).await {
            Ok(Some(usd)) => {
                return ResolvedPrice {
                    usd: Some(usd),
                    source: PriceTag::Primary,
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(contract, chain, error = %e, "primary oracle failed; trying secondary");
            }
        }

        if at.is_none() {
            match self.secondary_price(contract).await {
                Ok(Some(usd)) => {
                    return ResolvedPrice {
                        usd: Some(usd),
                        source: PriceTag::Secondary,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(contract, error = %e, "secondary oracle failed");
                }
            }
        }

        ResolvedPrice::none()
    }

    /// Market cap and liquidity for consensus filtering, from the secondary
    /// oracle's deepest pair.
    pub async fn token_market(&self, contract: &str) -> Result<Option<TokenMarket>> {
        let url = self.secondary_token_url(contract);
        let resp: SecondaryTokenResponse = self
            .inner
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("decoding {url}"))?;
        Ok(resp.pairs.as_deref().and_then(best_pair).map(|p| TokenMarket {
            market_cap: p.market_cap,
            liquidity_usd: p.liquidity.as_ref().and_then(|l| l.usd),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stablecoins_pin_to_one_dollar() {
        for s in ["USDT", "usdc", "Dai", "FDUSD"] {
            let p = pin_stablecoin(Some(s)).unwrap();
            assert_eq!(p.usd, Some(1.0));
            assert_eq!(p.source, PriceTag::Stable);
        }
        assert!(pin_stablecoin(Some("PEPE")).is_none());
        assert!(pin_stablecoin(None).is_none());
    }

    #[test]
    fn test_parse_primary_payload() {
        let json = r#"{"data":{"attributes":{"price_usd":"0.0000123"}}}"#;
        let resp: PrimaryTokenResponse = serde_json::from_str(json).unwrap();
        let price = resp.data.unwrap().attributes.price_usd.unwrap();
        assert!((price.parse::<f64>().unwrap() - 0.0000123).abs() < 1e-12);
    }

    #[test]
    fn test_parse_secondary_payload_and_best_pair() {
        let json = r#"{"pairs":[
            {"priceUsd":"1.10","marketCap":5000000.0,"liquidity":{"usd":1000.0}},
            {"priceUsd":"1.00","marketCap":5100000.0,"liquidity":{"usd":250000.0}}
        ]}"#;
        let resp: SecondaryTokenResponse = serde_json::from_str(json).unwrap();
        let pairs = resp.pairs.unwrap();
        let best = best_pair(&pairs).unwrap();
        assert_eq!(best.price_usd.as_deref(), Some("1.00"));
        assert_eq!(best.market_cap, Some(5_100_000.0));
    }

    #[test]
    fn test_primary_url_with_historical_timestamp() {
        let client = PriceOracleClient::new(
            "https://primary.test/api/v2",
            "https://secondary.test",
            Duration::from_secs(30),
        )
        .unwrap();
        let url = client.primary_token_url("0xdef", "ethereum", Some(1700000000));
        assert_eq!(
            url,
            "https://primary.test/api/v2/networks/ethereum/tokens/0xdef?at=1700000000"
        );
    }

    #[test]
    fn test_none_price_has_none_source() {
        let p = ResolvedPrice::none();
        assert!(p.usd.is_none());
        assert_eq!(p.source.as_str(), "none");
    }
}
