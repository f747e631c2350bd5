use serde::Deserialize;

/// How a wallet entered the system. The `migration` tag must stay
/// distinguishable at query time (migration destinations skip discovery
/// scoring gates until re-scored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPeriod {
    D14,
    D30,
    D200,
    D360,
    Manual,
    Migration,
}

impl DiscoveryPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::D14 => "14d",
            Self::D30 => "30d",
            Self::D200 => "200d",
            Self::D360 => "360d",
            Self::Manual => "manual",
            Self::Migration => "migration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "14d" => Some(Self::D14),
            "30d" => Some(Self::D30),
            "200d" => Some(Self::D200),
            "360d" => Some(Self::D360),
            "manual" => Some(Self::Manual),
            "migration" => Some(Self::Migration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Self::In),
            "out" => Some(Self::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Buy,
    Sell,
    Airdrop,
    TransferIn,
    TransferOut,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Airdrop => "airdrop",
            Self::TransferIn => "transfer_in",
            Self::TransferOut => "transfer_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "airdrop" => Some(Self::Airdrop),
            "transfer_in" => Some(Self::TransferIn),
            "transfer_out" => Some(Self::TransferOut),
            _ => None,
        }
    }

    /// Events that append a lot to the FIFO queue.
    pub fn is_acquisition(&self) -> bool {
        matches!(self, Self::Buy | Self::Airdrop | Self::TransferIn)
    }
}

/// Per-token trading outcome. French labels are the wire/DB format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    Gagnant,
    Perdant,
    Neutre,
    AirdropGagnant,
}

impl TokenOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gagnant => "GAGNANT",
            Self::Perdant => "PERDANT",
            Self::Neutre => "NEUTRE",
            Self::AirdropGagnant => "AIRDROP_GAGNANT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Elite,
    Excellent,
    Bon,
    Moyen,
    Faible,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elite => "ELITE",
            Self::Excellent => "EXCELLENT",
            Self::Bon => "BON",
            Self::Moyen => "MOYEN",
            Self::Faible => "FAIBLE",
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Elite
        } else if score >= 60.0 {
            Self::Excellent
        } else if score >= 40.0 {
            Self::Bon
        } else if score >= 20.0 {
            Self::Moyen
        } else {
            Self::Faible
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdStatus {
    Exceptional,
    Excellent,
    Good,
    Average,
    Poor,
    Neutral,
    NoReliableTiers,
    Manual,
    Migration,
}

impl ThresholdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exceptional => "EXCEPTIONAL",
            Self::Excellent => "EXCELLENT",
            Self::Good => "GOOD",
            Self::Average => "AVERAGE",
            Self::Poor => "POOR",
            Self::Neutral => "NEUTRAL",
            Self::NoReliableTiers => "NO_RELIABLE_TIERS",
            Self::Manual => "MANUAL",
            Self::Migration => "MIGRATION",
        }
    }

    /// Only statuses above NEUTRAL elect a smart wallet.
    pub fn is_smart(&self) -> bool {
        matches!(
            self,
            Self::Exceptional
                | Self::Excellent
                | Self::Good
                | Self::Average
                | Self::Poor
                | Self::Manual
                | Self::Migration
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    New,
    Accumulation,
    Reduction,
    Exit,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Accumulation => "ACCUMULATION",
            Self::Reduction => "REDUCTION",
            Self::Exit => "EXIT",
        }
    }
}

/// Transfer event from the chain-data provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiTransfer {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(rename = "fungibleId")]
    pub fungible_id: Option<String>,
    pub symbol: Option<String>,
    #[serde(rename = "contractAddress")]
    pub contract_address: Option<String>,
    pub chain: Option<String>,
    pub direction: Option<String>,
    #[serde(rename = "operationType")]
    pub operation_type: Option<String>,
    pub quantity: Option<String>,
    #[serde(rename = "quoteUsd")]
    pub quote_usd: Option<f64>,
    pub counterparty: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<i64>,
}

/// Balance line from the provider's positions endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiBalance {
    #[serde(rename = "fungibleId")]
    pub fungible_id: Option<String>,
    pub symbol: Option<String>,
    #[serde(rename = "contractAddress")]
    pub contract_address: Option<String>,
    pub chain: Option<String>,
    pub quantity: Option<String>,
    #[serde(rename = "usdValue")]
    pub usd_value: Option<f64>,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<f64>,
}

/// Contract-type check. `is_contract = None` means the provider could not
/// classify the address; callers must treat that as ambiguous, not as EOA.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiAddressInfo {
    #[serde(rename = "isContract")]
    pub is_contract: Option<bool>,
}

/// Candidate wallet from the seed-discovery source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiSeedWallet {
    pub address: Option<String>,
    pub pnl: Option<f64>,
    pub window: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_period_round_trip() {
        for p in [
            DiscoveryPeriod::D14,
            DiscoveryPeriod::D30,
            DiscoveryPeriod::D200,
            DiscoveryPeriod::D360,
            DiscoveryPeriod::Manual,
            DiscoveryPeriod::Migration,
        ] {
            assert_eq!(DiscoveryPeriod::parse(p.as_str()), Some(p));
        }
        assert_eq!(DiscoveryPeriod::parse("7d"), None);
    }

    #[test]
    fn test_action_type_round_trip() {
        for a in [
            ActionType::Buy,
            ActionType::Sell,
            ActionType::Airdrop,
            ActionType::TransferIn,
            ActionType::TransferOut,
        ] {
            assert_eq!(ActionType::parse(a.as_str()), Some(a));
        }
    }

    #[test]
    fn test_classification_bands() {
        assert_eq!(Classification::from_score(85.0), Classification::Elite);
        assert_eq!(Classification::from_score(80.0), Classification::Elite);
        assert_eq!(Classification::from_score(79.9), Classification::Excellent);
        assert_eq!(Classification::from_score(45.0), Classification::Bon);
        assert_eq!(Classification::from_score(20.0), Classification::Moyen);
        assert_eq!(Classification::from_score(19.9), Classification::Faible);
    }

    #[test]
    fn test_threshold_status_smart_set() {
        assert!(ThresholdStatus::Poor.is_smart());
        assert!(ThresholdStatus::Exceptional.is_smart());
        assert!(ThresholdStatus::Migration.is_smart());
        assert!(!ThresholdStatus::Neutral.is_smart());
        assert!(!ThresholdStatus::NoReliableTiers.is_smart());
    }

    #[test]
    fn test_parse_provider_transfer() {
        let json = r#"{
            "transactionHash": "0xabc",
            "fungibleId": "eth-0xdef",
            "symbol": "PEPE",
            "contractAddress": "0xdef",
            "chain": "ethereum",
            "direction": "in",
            "operationType": "trade",
            "quantity": "1500.5",
            "quoteUsd": 300.1,
            "timestamp": 1700000000,
            "blockNumber": 18500000
        }"#;
        let t: ApiTransfer = serde_json::from_str(json).unwrap();
        assert_eq!(t.transaction_hash.as_deref(), Some("0xabc"));
        assert_eq!(t.quote_usd, Some(300.1));
        assert_eq!(t.block_number, Some(18_500_000));
    }

    #[test]
    fn test_parse_address_info_ambiguous() {
        let info: ApiAddressInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(info.is_contract, None);
    }
}
