use common::types::{ActionType, TokenOutcome};

/// Winners are positions with ROI at or above this percent; the same cut is
/// used for per-token status and for win-rate counting everywhere.
pub const ROI_WIN_THRESHOLD_PCT: f64 = 80.0;
/// Below this, invested capital is treated as zero (airdrop-only position).
pub const INVESTED_EPSILON: f64 = 1e-9;
/// Displayed ROI for profitable zero-cost positions (division undefined).
pub const ROI_DISPLAY_CAP_PCT: f64 = 99_999.0;

const QTY_EPSILON: f64 = 1e-12;

/// One transfer event as the FIFO engine sees it.
#[derive(Debug, Clone)]
pub struct FifoEvent {
    pub action: ActionType,
    pub quantity: f64,
    pub price_per_token: Option<f64>,
    pub inherited_price_per_token: Option<f64>,
    pub timestamp: i64,
    pub block_number: Option<i64>,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lot {
    pub quantity: f64,
    pub unit_cost: f64,
}

/// Raw replay output for one (wallet, token), before valuation.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    /// Capital placed into costed lots (buys and costed transfer-ins).
    pub total_invested: f64,
    /// FIFO profit realized against nonzero-cost lots.
    pub total_realized: f64,
    /// Proceeds attributable to zero-cost lots (the airdrop carve-out).
    pub gains_airdrops: f64,
    pub remaining_quantity: f64,
    pub remaining_cost_basis: f64,
    pub open_lots: Vec<Lot>,
    pub costed_buy_quantity: f64,
    pub sell_quantity: f64,
    pub sell_proceeds: f64,
    /// Quantity sold beyond open lots, consumed from an implicit
    /// zero-cost lot.
    pub oversold_quantity: f64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

/// Valuation of a ledger at a spot price (or cost-held when unknown).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenValuation {
    pub current_value: f64,
    pub profit_loss: f64,
    pub roi_percentage: f64,
    pub status: TokenOutcome,
    pub weighted_avg_buy_price: Option<f64>,
    pub weighted_avg_sell_price: Option<f64>,
}

/// Deterministic event order: (timestamp, block_number, transaction_hash)
/// ascending; a missing block sorts as 0. Insertion order never matters.
pub fn sort_events(events: &mut [FifoEvent]) {
    events.sort_by(|a, b| {
        (a.timestamp, a.block_number.unwrap_or(0), a.transaction_hash.as_str()).cmp(&(
            b.timestamp,
            b.block_number.unwrap_or(0),
            b.transaction_hash.as_str(),
        ))
    });
}

/// Replay a transfer stream through the FIFO lot queue.
///
/// Acquisitions append a lot; the inherited price, when present, overrides
/// the observed price as the lot's unit cost (the only place inheritance is
/// honored). Disposals consume from the head of the queue; volume beyond the
/// open lots is treated as sold from an implicit zero-cost airdrop lot.
pub fn replay(mut events: Vec<FifoEvent>) -> TokenLedger {
    sort_events(&mut events);

    let mut ledger = TokenLedger::default();
    let mut lots: std::collections::VecDeque<Lot> = std::collections::VecDeque::new();

    for ev in &events {
        if ev.quantity <= 0.0 {
            continue;
        }
        ledger.first_timestamp = Some(ledger.first_timestamp.map_or(ev.timestamp, |t: i64| t.min(ev.timestamp)));
        ledger.last_timestamp = Some(ledger.last_timestamp.map_or(ev.timestamp, |t: i64| t.max(ev.timestamp)));

        match ev.action {
            ActionType::Buy | ActionType::TransferIn => {
                let unit_cost = ev
                    .inherited_price_per_token
                    .or(ev.price_per_token)
                    .unwrap_or(0.0);
                if unit_cost > 0.0 {
                    ledger.total_invested += ev.quantity * unit_cost;
                    ledger.costed_buy_quantity += ev.quantity;
                }
                lots.push_back(Lot {
                    quantity: ev.quantity,
                    unit_cost,
                });
            }
            ActionType::Airdrop => {
                lots.push_back(Lot {
                    quantity: ev.quantity,
                    unit_cost: 0.0,
                });
            }
            ActionType::Sell | ActionType::TransferOut => {
                let sale_price = ev.price_per_token.unwrap_or(0.0);
                if ev.action == ActionType::Sell {
                    ledger.sell_quantity += ev.quantity;
                    ledger.sell_proceeds += ev.quantity * sale_price;
                }

                let mut remaining = ev.quantity;
                while remaining > QTY_EPSILON {
                    let Some(front) = lots.front_mut() else {
                        // Oversell: implicit zero-cost lot.
                        ledger.oversold_quantity += remaining;
                        ledger.gains_airdrops += remaining * sale_price;
                        tracing::warn!(
                            tx = %ev.transaction_hash,
                            oversold = remaining,
                            "sell exceeds open lots; treating overflow as zero-cost inventory"
                        );
                        remaining = 0.0;
                        break;
                    };
                    let taken = front.quantity.min(remaining);
                    if front.unit_cost > 0.0 {
                        ledger.total_realized += taken * (sale_price - front.unit_cost);
                    } else {
                        ledger.gains_airdrops += taken * sale_price;
                    }
                    front.quantity -= taken;
                    remaining -= taken;
                    if front.quantity <= QTY_EPSILON {
                        lots.pop_front();
                    }
                }
                debug_assert!(remaining.abs() <= QTY_EPSILON);
            }
        }
    }

    for lot in &lots {
        ledger.remaining_quantity += lot.quantity;
        ledger.remaining_cost_basis += lot.quantity * lot.unit_cost;
    }
    ledger.open_lots = lots.into_iter().collect();
    ledger
}

/// Value a ledger at `spot`. An unknown price holds the position at cost so
/// analytics keep flowing (the PriceUnknown path).
pub fn valuation(ledger: &TokenLedger, spot: Option<f64>) -> TokenValuation {
    let current_value = match spot {
        Some(p) => ledger.remaining_quantity * p,
        None => ledger.remaining_cost_basis,
    };
    let profit_loss =
        ledger.total_realized + ledger.gains_airdrops + current_value - ledger.total_invested;

    let airdrop_only = ledger.total_invested <= INVESTED_EPSILON;
    let roi_percentage = if airdrop_only {
        if profit_loss > 0.0 {
            ROI_DISPLAY_CAP_PCT
        } else {
            0.0
        }
    } else {
        profit_loss / ledger.total_invested * 100.0
    };

    let status = if airdrop_only && profit_loss > 0.0 {
        TokenOutcome::AirdropGagnant
    } else if roi_percentage >= ROI_WIN_THRESHOLD_PCT {
        TokenOutcome::Gagnant
    } else if roi_percentage < 0.0 {
        TokenOutcome::Perdant
    } else {
        TokenOutcome::Neutre
    };

    TokenValuation {
        current_value,
        profit_loss,
        roi_percentage,
        status,
        weighted_avg_buy_price: (ledger.costed_buy_quantity > 0.0)
            .then(|| ledger.total_invested / ledger.costed_buy_quantity),
        weighted_avg_sell_price: (ledger.sell_quantity > 0.0)
            .then(|| ledger.sell_proceeds / ledger.sell_quantity),
    }
}
