use common::types::{ApiBalance, ChangeType};

/// Balances at or below this count as fully exited.
pub const DUST_QUANTITY: f64 = 1e-9;

/// A token position as currently stored.
#[derive(Debug, Clone)]
pub struct KnownPosition {
    pub fungible_id: String,
    pub symbol: Option<String>,
    pub amount: f64,
    pub usd_value: Option<f64>,
    pub in_portfolio: bool,
}

/// A balance line freshly reported by the provider.
#[derive(Debug, Clone)]
pub struct BalanceSnapshot {
    pub fungible_id: String,
    pub symbol: Option<String>,
    pub contract_address: Option<String>,
    pub chain: Option<String>,
    pub quantity: f64,
    pub usd_value: Option<f64>,
    pub price_usd: Option<f64>,
}

impl BalanceSnapshot {
    /// Balance lines without a fungible id cannot be tracked and are
    /// dropped; an unparsable quantity counts as zero (dust → exit).
    pub fn from_api(b: &ApiBalance) -> Option<Self> {
        let fungible_id = b.fungible_id.as_deref().filter(|s| !s.is_empty())?.to_string();
        let quantity = b
            .quantity
            .as_deref()
            .and_then(|q| q.parse::<f64>().ok())
            .unwrap_or(0.0);
        Some(Self {
            fungible_id,
            symbol: b.symbol.clone(),
            contract_address: b.contract_address.clone(),
            chain: b.chain.clone(),
            quantity,
            usd_value: b.usd_value,
            price_usd: b.price_usd,
        })
    }
}

/// One detected position change, ready to persist.
#[derive(Debug, Clone)]
pub struct PositionDiff {
    pub fungible_id: String,
    pub symbol: Option<String>,
    pub change: ChangeType,
    pub old_amount: f64,
    pub new_amount: f64,
    pub old_usd_value: Option<f64>,
    pub new_usd_value: Option<f64>,
}

/// Diff stored positions against fresh balances.
///
/// - absent → present: NEW
/// - grew by more than `rel_threshold`: ACCUMULATION
/// - shrank by more than `rel_threshold`, remainder above dust: REDUCTION
/// - present → absent or dust: EXIT
///
/// Small wiggles inside the threshold produce no diff. Positions already
/// marked out of portfolio only re-enter through NEW.
pub fn diff_positions(
    known: &[KnownPosition],
    fresh: &[BalanceSnapshot],
    rel_threshold: f64,
) -> Vec<PositionDiff> {
    let mut diffs = Vec::new();
    let fresh_by_id: std::collections::HashMap<&str, &BalanceSnapshot> = fresh
        .iter()
        .map(|b| (b.fungible_id.as_str(), b))
        .collect();

    for pos in known {
        match fresh_by_id.get(pos.fungible_id.as_str()) {
            Some(b) if b.quantity > DUST_QUANTITY => {
                if !pos.in_portfolio || pos.amount <= DUST_QUANTITY {
                    // Re-entry after a recorded exit.
                    diffs.push(PositionDiff {
                        fungible_id: pos.fungible_id.clone(),
                        symbol: b.symbol.clone().or_else(|| pos.symbol.clone()),
                        change: ChangeType::New,
                        old_amount: 0.0,
                        new_amount: b.quantity,
                        old_usd_value: None,
                        new_usd_value: b.usd_value,
                    });
                    continue;
                }
                let rel = (b.quantity - pos.amount) / pos.amount;
                let change = if rel > rel_threshold {
                    Some(ChangeType::Accumulation)
                } else if rel < -rel_threshold {
                    Some(ChangeType::Reduction)
                } else {
                    None
                };
                if let Some(change) = change {
                    diffs.push(PositionDiff {
                        fungible_id: pos.fungible_id.clone(),
                        symbol: b.symbol.clone().or_else(|| pos.symbol.clone()),
                        change,
                        old_amount: pos.amount,
                        new_amount: b.quantity,
                        old_usd_value: pos.usd_value,
                        new_usd_value: b.usd_value,
                    });
                }
            }
            _ => {
                // Now absent (or dust). Only an exit if we thought it was held.
                if pos.in_portfolio && pos.amount > DUST_QUANTITY {
                    diffs.push(PositionDiff {
                        fungible_id: pos.fungible_id.clone(),
                        symbol: pos.symbol.clone(),
                        change: ChangeType::Exit,
                        old_amount: pos.amount,
                        new_amount: 0.0,
                        old_usd_value: pos.usd_value,
                        new_usd_value: None,
                    });
                }
            }
        }
    }

    let known_ids: std::collections::HashSet<&str> =
        known.iter().map(|p| p.fungible_id.as_str()).collect();
    for b in fresh {
        if b.quantity > DUST_QUANTITY && !known_ids.contains(b.fungible_id.as_str()) {
            diffs.push(PositionDiff {
                fungible_id: b.fungible_id.clone(),
                symbol: b.symbol.clone(),
                change: ChangeType::New,
                old_amount: 0.0,
                new_amount: b.quantity,
                old_usd_value: None,
                new_usd_value: b.usd_value,
            });
        }
    }

    diffs
}
