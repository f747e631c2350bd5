use crate::error::{classify_api_error, UnitError};
use crate::retry::RetryPolicy;
use crate::types::{ApiAddressInfo, ApiBalance, ApiSeedWallet, ApiTransfer};
use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Cursor-paginated response envelope from the chain-data provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

struct KeyBucket {
    key: String,
    tokens: f64,
    burst: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl KeyBucket {
    fn new(key: String, refill_per_sec: f64, burst: f64, now: Instant) -> Self {
        Self {
            key,
            tokens: burst,
            burst,
            refill_per_sec,
            last_refill: now,
            cooldown_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.burst);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct PoolState {
    keys: Vec<KeyBucket>,
    cursor: usize,
}

impl PoolState {
    /// Round-robin over keys; returns the first key with a token, or a hint
    /// for how long to wait before the next token appears anywhere.
    fn try_acquire(&mut self, now: Instant) -> std::result::Result<String, Duration> {
        let n = self.keys.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            if self.keys[idx].try_take(now) {
                self.cursor = (idx + 1) % n;
                return Ok(self.keys[idx].key.clone());
            }
        }
        let mut wait = Duration::from_millis(250);
        for b in &self.keys {
            let refill_wait = if b.refill_per_sec > 0.0 {
                Duration::from_secs_f64(((1.0 - b.tokens).max(0.0)) / b.refill_per_sec)
            } else {
                Duration::from_secs(1)
            };
            let candidate = match b.cooldown_until {
                Some(until) => refill_wait.max(until.saturating_duration_since(now)),
                None => refill_wait,
            };
            wait = wait.min(candidate.max(Duration::from_millis(10)));
        }
        Err(wait)
    }
}

/// Pool of provider credentials with a token bucket per key.
///
/// Keys are used round-robin; a key that hits a rate-limit response is put
/// on cooldown so the next acquire rotates past it.
pub struct KeyPool {
    state: Mutex<PoolState>,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, refill_per_sec: f64, burst: f64) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(PoolState {
                keys: keys
                    .into_iter()
                    .map(|k| KeyBucket::new(k, refill_per_sec, burst, now))
                    .collect(),
                cursor: 0,
            }),
        }
    }

    pub async fn acquire(&self) -> String {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                match state.try_acquire(Instant::now()) {
                    Ok(key) => return key,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn penalize(&self, key: &str, cooldown: Duration) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(b) = state.keys.iter_mut().find(|b| b.key == key) {
            b.cooldown_until = Some(now + cooldown);
        }
    }
}

struct ClientInner {
    base_url: String,
    http: reqwest::Client,
    keys: KeyPool,
    max_retries: u32,
    retry: RetryPolicy,
}

/// HTTP client for the chain-data provider (balances, transfer history,
/// contract checks, seed wallets). Clone is cheap.
#[derive(Clone)]
pub struct ChainDataClient {
    inner: Arc<ClientInner>,
}

const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

impl ChainDataClient {
    pub fn new_with_settings(
        base_url: &str,
        api_keys: Vec<String>,
        request_timeout: Duration,
        requests_per_sec: f64,
        burst: f64,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_keys.is_empty(), "provider requires at least one API key");
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building provider HTTP client")?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url: base_url.trim_end_matches('/').to_string(),
                http,
                keys: KeyPool::new(api_keys, requests_per_sec, burst),
                max_retries,
                retry: RetryPolicy::new(backoff_base, MAX_RETRY_DELAY),
            }),
        })
    }

    pub fn balances_url(&self, wallet: &str) -> String {
        format!("{}/wallets/{wallet}/positions", self.inner.base_url)
    }

    pub async fn fetch_balances(&self, wallet: &str) -> Result<Vec<ApiBalance>> {
        let page: Page<ApiBalance> = self.get_json(&self.balances_url(wallet)).await?;
        Ok(page.data)
    }

    pub fn transfers_url(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        limit: u32,
        cursor: Option<&str>,
    ) -> String {
        let mut url = Url::parse(&format!("{}/wallets/{wallet}/transfers", self.inner.base_url))
            .expect("provider base_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            if let Some(f) = fungible_id {
                qp.append_pair("fungible_id", f);
            }
            qp.append_pair("limit", &limit.to_string());
            if let Some(c) = cursor {
                qp.append_pair("cursor", c);
            }
        }
        url.to_string()
    }

    /// One page of transfer history, oldest cursor first is not guaranteed;
    /// callers drain the cursor to completion before processing.
    pub async fn fetch_transfers_page(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<ApiTransfer>, Option<String>)> {
        let url = self.transfers_url(wallet, fungible_id, limit, cursor);
        let page: Page<ApiTransfer> = self.get_json(&url).await?;
        Ok((page.data, page.next))
    }

    pub fn sends_url(&self, wallet: &str, since_ts: i64, limit: u32, cursor: Option<&str>) -> String {
        let mut url = Url::parse(&format!("{}/wallets/{wallet}/transfers", self.inner.base_url))
            .expect("provider base_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("direction", "out");
            qp.append_pair("since", &since_ts.to_string());
            qp.append_pair("limit", &limit.to_string());
            if let Some(c) = cursor {
                qp.append_pair("cursor", c);
            }
        }
        url.to_string()
    }

    /// Outgoing transfers since `since_ts`, for migration detection.
    pub async fn fetch_sends_page(
        &self,
        wallet: &str,
        since_ts: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<ApiTransfer>, Option<String>)> {
        let url = self.sends_url(wallet, since_ts, limit, cursor);
        let page: Page<ApiTransfer> = self.get_json(&url).await?;
        Ok((page.data, page.next))
    }

    /// Contract-type check (EOA vs contract). `is_contract: None` means the
    /// provider could not classify the address.
    pub async fn check_address(&self, address: &str) -> Result<ApiAddressInfo> {
        let url = format!("{}/addresses/{address}", self.inner.base_url);
        self.get_json(&url).await
    }

    pub async fn fetch_seed_wallets(&self, window: &str, limit: u32) -> Result<Vec<ApiSeedWallet>> {
        let mut url = Url::parse(&format!("{}/leaderboard", self.inner.base_url))
            .expect("provider base_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("window", window);
            qp.append_pair("limit", &limit.to_string());
        }
        let page: Page<ApiSeedWallet> = self.get_json(url.as_str()).await?;
        Ok(page.data)
    }

    /// GET with key rotation and exponential-backoff retries for transient
    /// failures. 4xx (except 429) and decode errors fail immediately.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut attempt = 0_u32;
        loop {
            let key = self.inner.keys.acquire().await;
            let err = match self
                .inner
                .http
                .get(url)
                .header("X-Api-Key", &key)
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await.context("reading response body")?;
                        match serde_json::from_slice::<T>(&bytes) {
                            Ok(v) => return Ok(v),
                            Err(e) => anyhow!("decode error: {e}"),
                        }
                    } else if status.as_u16() == 429 {
                        self.inner.keys.penalize(&key, RATE_LIMIT_COOLDOWN).await;
                        anyhow!("HTTP 429 Too Many Requests")
                    } else {
                        anyhow!("HTTP {status}")
                    }
                }
                Err(e) if e.is_timeout() => anyhow!("request timed out: {e}"),
                Err(e) => anyhow!("network error: {e}"),
            };

            let kind = classify_api_error(&err);
            attempt += 1;
            if !kind.is_transient() || attempt > self.inner.max_retries {
                let unit_err = if kind.is_transient() {
                    UnitError::ProviderTransient(err.to_string())
                } else {
                    UnitError::ProviderFatal(err.to_string())
                };
                return Err(anyhow::Error::new(unit_err).context(format!("GET {url}")));
            }

            let backoff = self.inner.retry.delay_for(attempt);
            tracing::warn!(
                url,
                attempt,
                kind = kind.as_str(),
                wait_for = ?backoff,
                "provider request failed; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
