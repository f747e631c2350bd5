use anyhow::Result;
use common::db::AsyncDb;
use common::prices::ResolvedPrice;
use common::types::{ActionType, ApiTransfer, Direction};

/// Cursor-paginated transfer history for one wallet (optionally one token).
pub trait TransfersPager {
    #[allow(dead_code)]
    fn transfers_url(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        limit: u32,
        cursor: Option<&str>,
    ) -> String;

    fn fetch_transfers_page(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        limit: u32,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(Vec<ApiTransfer>, Option<String>)>> + Send;
}

/// Outgoing transfers inside a time window, for migration detection.
pub trait SendsFetcher {
    fn fetch_sends_page(
        &self,
        wallet: &str,
        since_ts: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(Vec<ApiTransfer>, Option<String>)>> + Send;
}

/// Spot/historical USD prices; resolution never fails, unknown prices come
/// back as `None` with source `none`.
pub trait SpotPrices {
    fn resolve_price(
        &self,
        symbol: Option<&str>,
        contract: Option<&str>,
        chain: Option<&str>,
        at: Option<i64>,
    ) -> impl std::future::Future<Output = ResolvedPrice> + Send;
}

/// A provider transfer normalized to the persistent schema.
#[derive(Debug, Clone)]
pub struct NormalizedTransfer {
    pub transaction_hash: String,
    pub fungible_id: String,
    pub symbol: Option<String>,
    pub contract_address: Option<String>,
    pub chain: Option<String>,
    pub direction: Direction,
    pub action: ActionType,
    pub quantity: f64,
    pub price_per_token: Option<f64>,
    pub counterparty: Option<String>,
    pub timestamp: i64,
    pub block_number: Option<i64>,
}

/// Classify a raw transfer.
///
/// - incoming with a nonzero quote paid → buy
/// - outgoing with a nonzero quote received → sell
/// - incoming with no quote and no counterparty (or an airdrop/mint op tag) → airdrop
/// - remaining quoteless peer transfers → transfer_in / transfer_out
///
/// Rows missing wallet-level required keys (hash, fungible id, positive
/// quantity, direction) are dropped.
pub fn normalize_transfer(t: &ApiTransfer) -> Option<NormalizedTransfer> {
    let transaction_hash = t.transaction_hash.as_deref().filter(|s| !s.is_empty())?;
    let fungible_id = t.fungible_id.as_deref().filter(|s| !s.is_empty())?;
    let quantity = t.quantity.as_deref().and_then(|q| q.parse::<f64>().ok())?;
    if quantity <= 0.0 {
        return None;
    }
    let direction = Direction::parse(t.direction.as_deref()?)?;

    let quote = t.quote_usd.filter(|q| *q > 0.0);
    let op = t.operation_type.as_deref();
    let (action, price_per_token) = match direction {
        Direction::In => match quote {
            Some(q) => (ActionType::Buy, Some(q / quantity)),
            None => {
                if matches!(op, Some("airdrop" | "mint")) || t.counterparty.is_none() {
                    (ActionType::Airdrop, None)
                } else {
                    (ActionType::TransferIn, None)
                }
            }
        },
        Direction::Out => match quote {
            Some(q) => (ActionType::Sell, Some(q / quantity)),
            None => (ActionType::TransferOut, None),
        },
    };

    Some(NormalizedTransfer {
        transaction_hash: transaction_hash.to_string(),
        fungible_id: fungible_id.to_string(),
        symbol: t.symbol.clone(),
        contract_address: t.contract_address.clone(),
        chain: t.chain.clone(),
        direction,
        action,
        quantity,
        price_per_token,
        counterparty: t.counterparty.clone(),
        timestamp: t.timestamp.unwrap_or(0),
        block_number: t.block_number,
    })
}

/// Pagination hard stop; a cursor loop would otherwise spin forever.
const MAX_PAGES: u32 = 10_000;

/// Drain the full transfer history for one (wallet, token), normalizing and
/// backfilling missing trade prices from the oracle at the transfer
/// timestamp.
pub async fn fetch_full_history<P, S>(
    pager: &P,
    prices: &S,
    wallet: &str,
    fungible_id: &str,
    limit: u32,
) -> Result<Vec<NormalizedTransfer>>
where
    P: TransfersPager + Sync,
    S: SpotPrices + Sync,
{
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0_u32;

    loop {
        let (batch, next) = pager
            .fetch_transfers_page(wallet, Some(fungible_id), limit, cursor.as_deref())
            .await?;
        let batch_len = batch.len();
        out.extend(batch.iter().filter_map(normalize_transfer));
        pages += 1;

        match next {
            Some(n) if Some(&n) != cursor.as_ref() && batch_len > 0 && pages < MAX_PAGES => {
                cursor = Some(n);
            }
            _ => break,
        }
    }

    backfill_prices(prices, &mut out).await;
    Ok(out)
}

/// Outgoing transfers within the window, prices backfilled so callers can
/// value them.
pub async fn fetch_recent_sends<P, S>(
    pager: &P,
    prices: &S,
    wallet: &str,
    since_ts: i64,
    limit: u32,
) -> Result<Vec<NormalizedTransfer>>
where
    P: SendsFetcher + Sync,
    S: SpotPrices + Sync,
{
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0_u32;

    loop {
        let (batch, next) = pager
            .fetch_sends_page(wallet, since_ts, limit, cursor.as_deref())
            .await?;
        let batch_len = batch.len();
        out.extend(
            batch
                .iter()
                .filter_map(normalize_transfer)
                .filter(|n| n.direction == Direction::Out && n.timestamp >= since_ts),
        );
        pages += 1;

        match next {
            Some(n) if Some(&n) != cursor.as_ref() && batch_len > 0 && pages < MAX_PAGES => {
                cursor = Some(n);
            }
            _ => break,
        }
    }

    backfill_prices(prices, &mut out).await;
    Ok(out)
}

/// Oracle lookup at the transfer timestamp for rows whose quote did not
/// yield a price. Inbound transfers stay unpriced on purpose: their cost
/// basis arrives via inheritance or counts as zero. Outbound ones get a
/// price so disposals and sends can be valued.
async fn backfill_prices<S: SpotPrices + Sync>(prices: &S, rows: &mut [NormalizedTransfer]) {
    for row in rows.iter_mut() {
        let needs_price = row.price_per_token.is_none()
            && matches!(
                row.action,
                ActionType::Buy | ActionType::Sell | ActionType::TransferOut
            );
        if !needs_price {
            continue;
        }
        let resolved = prices
            .resolve_price(
                row.symbol.as_deref(),
                row.contract_address.as_deref(),
                row.chain.as_deref(),
                Some(row.timestamp),
            )
            .await;
        row.price_per_token = resolved.usd;
    }
}

fn insert_rows(
    tx: &rusqlite::Transaction<'_>,
    wallet: &str,
    rows: &[NormalizedTransfer],
) -> Result<u64> {
    let mut inserted = 0_u64;
    for r in rows {
        // Rely on the UNIQUE(wallet, transaction_hash, fungible_id) key to
        // deduplicate; price_per_token is never rewritten for existing rows.
        let changed = tx.execute(
            "
            INSERT OR IGNORE INTO transfers
                (wallet, transaction_hash, symbol, contract_address, fungible_id,
                 direction, action_type, quantity, price_per_token,
                 counterparty_address, timestamp, block_number)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
            rusqlite::params![
                wallet,
                r.transaction_hash,
                r.symbol,
                r.contract_address,
                r.fungible_id,
                r.direction.as_str(),
                r.action.as_str(),
                r.quantity,
                r.price_per_token,
                r.counterparty,
                r.timestamp,
                r.block_number,
            ],
        )?;
        inserted += changed as u64;
    }
    Ok(inserted)
}

/// Append path used by initial extraction: upsert-ignore on the dedup key.
pub async fn insert_history(
    db: &AsyncDb,
    wallet: &str,
    rows: Vec<NormalizedTransfer>,
) -> Result<u64> {
    let wallet = wallet.to_string();
    db.call_named("ingestion.insert_history", move |conn| {
        let tx = conn.transaction()?;
        let inserted = insert_rows(&tx, &wallet, &rows)?;
        tx.commit()?;
        Ok(inserted)
    })
    .await
}

/// Rebuild path used by the live tracker: delete the (wallet, token) rows,
/// then insert the fresh set in the same transaction. Sidesteps dedup edge
/// cases when pagination boundaries shift; cost is bounded by per-token
/// volume.
pub async fn replace_history(
    db: &AsyncDb,
    wallet: &str,
    fungible_id: &str,
    rows: Vec<NormalizedTransfer>,
) -> Result<u64> {
    let wallet = wallet.to_string();
    let fungible_id = fungible_id.to_string();
    db.call_named("ingestion.replace_history", move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM transfers WHERE wallet = ?1 AND fungible_id = ?2",
            rusqlite::params![wallet, fungible_id],
        )?;
        let inserted = insert_rows(&tx, &wallet, &rows)?;
        tx.commit()?;
        Ok(inserted)
    })
    .await
}
