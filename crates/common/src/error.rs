use std::time::Duration;

/// Failure of one per-wallet (or per-token) unit of pipeline work.
///
/// Nothing above the unit boundary distinguishes these kinds for retry
/// purposes; the next scheduled pass is the retry mechanism. The kinds exist
/// so the unit itself can decide whether to keep going (PriceUnknown,
/// IntegrityConflict) or stop (the rest).
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("transient provider error: {0}")]
    ProviderTransient(String),
    #[error("provider rejected request: {0}")]
    ProviderFatal(String),
    #[error("no price available for contract {contract}")]
    PriceUnknown { contract: String },
    #[error("unit deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

/// Persistent ingestion failure for one (wallet, token); existing rows are
/// left intact when this is raised.
#[derive(Debug, thiserror::Error)]
#[error("ingestion failed for wallet {wallet} token {fungible_id}: {reason}")]
pub struct IngestError {
    pub wallet: String,
    pub fungible_id: String,
    pub reason: String,
}

impl IngestError {
    pub fn new(wallet: &str, fungible_id: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            wallet: wallet.to_string(),
            fungible_id: fungible_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Coarse classification of provider/oracle errors, used for metrics labels
/// and to decide retryability inside the HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Timeout,
    RateLimited,
    Http4xx,
    Http5xx,
    Network,
    Decode,
    Other,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::Network => "network",
            Self::Decode => "decode",
            Self::Other => "other",
        }
    }

    /// Transient kinds are retried in-component with backoff; the rest fail
    /// the unit immediately (ProviderFatal semantics).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Http5xx | Self::Network
        )
    }
}

/// Best-effort classification from an error chain's display text. HTTP
/// status codes are embedded by the clients as `HTTP <code>`.
pub fn classify_api_error(err: &anyhow::Error) -> ApiErrorKind {
    let text = format!("{err:#}").to_lowercase();
    if text.contains("http 429") || text.contains("rate limit") {
        ApiErrorKind::RateLimited
    } else if text.contains("timed out") || text.contains("timeout") {
        ApiErrorKind::Timeout
    } else if text.contains("http 5") {
        ApiErrorKind::Http5xx
    } else if text.contains("http 4") {
        ApiErrorKind::Http4xx
    } else if text.contains("decode") || text.contains("expected") || text.contains("json") {
        ApiErrorKind::Decode
    } else if text.contains("connect") || text.contains("dns") || text.contains("connection") {
        ApiErrorKind::Network
    } else {
        ApiErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limited() {
        let err = anyhow::anyhow!("HTTP 429 Too Many Requests");
        assert_eq!(classify_api_error(&err), ApiErrorKind::RateLimited);
        assert!(classify_api_error(&err).is_transient());
    }

    #[test]
    fn test_classify_4xx_is_fatal() {
        let err = anyhow::anyhow!("HTTP 400 Bad Request");
        assert_eq!(classify_api_error(&err), ApiErrorKind::Http4xx);
        assert!(!classify_api_error(&err).is_transient());
    }

    #[test]
    fn test_classify_5xx_and_timeout_are_transient() {
        assert!(classify_api_error(&anyhow::anyhow!("HTTP 503 Service Unavailable")).is_transient());
        assert!(classify_api_error(&anyhow::anyhow!("operation timed out")).is_transient());
    }

    #[test]
    fn test_ingest_error_display() {
        let e = IngestError::new("0xw", "eth-0xtok", "HTTP 400");
        let s = e.to_string();
        assert!(s.contains("0xw"));
        assert!(s.contains("eth-0xtok"));
        assert!(s.contains("HTTP 400"));
    }
}
