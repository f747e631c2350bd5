use crate::ingestion::NormalizedTransfer;
use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct TransferredToken {
    pub symbol: Option<String>,
    pub fungible_id: String,
    pub quantity: f64,
    pub value_usd: f64,
}

/// A recipient that received more than the portfolio-fraction threshold.
#[derive(Debug, Clone)]
pub struct MigrationCandidate {
    pub recipient: String,
    pub total_value_usd: f64,
    pub transfer_fraction: f64,
    pub tokens: Vec<TransferredToken>,
    pub last_send_ts: i64,
}

/// Aggregate recent sends per recipient and flag recipients that received
/// more than `fraction_threshold` of the wallet's portfolio value. Sends
/// without a counterparty or a resolvable value contribute nothing.
pub fn detect_candidates(
    sends: &[NormalizedTransfer],
    portfolio_value_usd: f64,
    fraction_threshold: f64,
) -> Vec<MigrationCandidate> {
    if portfolio_value_usd <= 0.0 {
        return Vec::new();
    }

    struct Agg {
        total: f64,
        tokens: HashMap<String, TransferredToken>,
        last_ts: i64,
    }
    let mut by_recipient: HashMap<String, Agg> = HashMap::new();

    for s in sends {
        let Some(recipient) = s.counterparty.as_deref() else {
            continue;
        };
        let value = s.quantity * s.price_per_token.unwrap_or(0.0);
        let agg = by_recipient.entry(recipient.to_string()).or_insert(Agg {
            total: 0.0,
            tokens: HashMap::new(),
            last_ts: 0,
        });
        agg.total += value;
        agg.last_ts = agg.last_ts.max(s.timestamp);
        let entry = agg
            .tokens
            .entry(s.fungible_id.clone())
            .or_insert(TransferredToken {
                symbol: s.symbol.clone(),
                fungible_id: s.fungible_id.clone(),
                quantity: 0.0,
                value_usd: 0.0,
            });
        entry.quantity += s.quantity;
        entry.value_usd += value;
    }

    let mut candidates: Vec<MigrationCandidate> = by_recipient
        .into_iter()
        .filter_map(|(recipient, agg)| {
            let fraction = agg.total / portfolio_value_usd;
            if fraction > fraction_threshold {
                let mut tokens: Vec<TransferredToken> = agg.tokens.into_values().collect();
                tokens.sort_by(|a, b| b.value_usd.total_cmp(&a.value_usd));
                Some(MigrationCandidate {
                    recipient,
                    total_value_usd: agg.total,
                    transfer_fraction: fraction,
                    tokens,
                    last_send_ts: agg.last_ts,
                })
            } else {
                None
            }
        })
        .collect();
    candidates.sort_by(|a, b| b.total_value_usd.total_cmp(&a.total_value_usd));
    candidates
}

/// Parent's weighted average buy price for a symbol: buys only, nonzero
/// observed prices only.
pub fn parent_weighted_avg_buy_price(
    conn: &Connection,
    wallet: &str,
    symbol: &str,
) -> Result<Option<f64>> {
    let (qty, cost): (Option<f64>, Option<f64>) = conn.query_row(
        "SELECT SUM(quantity), SUM(quantity * price_per_token)
         FROM transfers
         WHERE wallet = ?1 AND symbol = ?2 AND action_type = 'buy'
           AND price_per_token IS NOT NULL AND price_per_token > 0",
        rusqlite::params![wallet, symbol],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(match (qty, cost) {
        (Some(q), Some(c)) if q > 0.0 => Some(c / q),
        _ => None,
    })
}

/// Inject the inherited cost basis into the recipient's inbound rows for one
/// symbol. The IS NULL guard makes repeated runs no-ops; the observed
/// price_per_token column is never touched.
pub fn apply_inheritance(
    conn: &Connection,
    recipient: &str,
    symbol: &str,
    parent: &str,
    inherited_price: f64,
) -> Result<u64> {
    let changed = conn.execute(
        "UPDATE transfers
         SET inherited_price_per_token = ?3, is_inherited_from_wallet = ?4
         WHERE wallet = ?1 AND symbol = ?2 AND direction = 'in'
           AND inherited_price_per_token IS NULL",
        rusqlite::params![recipient, symbol, inherited_price, parent],
    )?;
    Ok(changed as u64)
}

/// Insert-ignore on (old, new, date); a re-detected migration is a no-op.
pub fn record_migration(
    conn: &Connection,
    old_wallet: &str,
    new_wallet: &str,
    migration_date: &str,
    candidate: &MigrationCandidate,
) -> Result<u64> {
    let tokens_json = serde_json::to_string(&candidate.tokens)?;
    let changed = conn.execute(
        "INSERT OR IGNORE INTO wallet_migrations
            (old_wallet, new_wallet, migration_date, tokens_transferred,
             total_value_transferred, transfer_percentage, is_validated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        rusqlite::params![
            old_wallet,
            new_wallet,
            migration_date,
            tokens_json,
            candidate.total_value_usd,
            candidate.transfer_fraction * 100.0,
        ],
    )?;
    Ok(changed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;
    use common::types::{ActionType, Direction};

    fn send(recipient: &str, fungible_id: &str, qty: f64, price: Option<f64>, ts: i64) -> NormalizedTransfer {
        NormalizedTransfer {
            transaction_hash: format!("0x{recipient}-{fungible_id}-{ts}"),
            fungible_id: fungible_id.to_string(),
            symbol: Some(fungible_id.to_uppercase()),
            contract_address: Some(format!("0xc-{fungible_id}")),
            chain: Some("ethereum".to_string()),
            direction: Direction::Out,
            action: ActionType::TransferOut,
            quantity: qty,
            price_per_token: price,
            counterparty: Some(recipient.to_string()),
            timestamp: ts,
            block_number: Some(ts),
        }
    }

    #[test]
    fn test_detects_recipient_over_70_percent() {
        // Portfolio $10k; 0xnew receives $7.5k, 0xsmall receives $1k.
        let sends = vec![
            send("0xnew", "tok-a", 500.0, Some(10.0), 100),
            send("0xnew", "tok-b", 2500.0, Some(1.0), 110),
            send("0xsmall", "tok-a", 100.0, Some(10.0), 120),
        ];
        let candidates = detect_candidates(&sends, 10_000.0, 0.70);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.recipient, "0xnew");
        assert!((c.total_value_usd - 7500.0).abs() < 1e-9);
        assert!((c.transfer_fraction - 0.75).abs() < 1e-9);
        assert_eq!(c.tokens.len(), 2);
        assert_eq!(c.last_send_ts, 110);
        // Largest transferred token first.
        assert_eq!(c.tokens[0].fungible_id, "tok-a");
    }

    #[test]
    fn test_no_candidate_at_or_below_threshold() {
        let sends = vec![send("0xnew", "tok-a", 700.0, Some(10.0), 100)];
        // Exactly 70% is not "more than 70%".
        assert!(detect_candidates(&sends, 10_000.0, 0.70).is_empty());
    }

    #[test]
    fn test_zero_portfolio_yields_no_candidates() {
        let sends = vec![send("0xnew", "tok-a", 700.0, Some(10.0), 100)];
        assert!(detect_candidates(&sends, 0.0, 0.70).is_empty());
    }

    #[test]
    fn test_unpriced_sends_contribute_nothing() {
        let sends = vec![
            send("0xnew", "tok-a", 1e9, None, 100),
            send("0xnew", "tok-b", 710.0, Some(10.0), 101),
        ];
        let candidates = detect_candidates(&sends, 10_000.0, 0.70);
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].total_value_usd - 7100.0).abs() < 1e-9);
    }

    fn seed_parent_and_child(db: &Database) {
        db.conn
            .execute_batch(
                "
            -- Parent bought TOK at $0.10 and $0.30 (avg weighted to $0.20).
            INSERT INTO transfers (wallet, transaction_hash, symbol, fungible_id, direction, action_type, quantity, price_per_token, timestamp)
            VALUES ('0xparent', '0xp1', 'TOK', 'eth-tok', 'in', 'buy', 100.0, 0.10, 1);
            INSERT INTO transfers (wallet, transaction_hash, symbol, fungible_id, direction, action_type, quantity, price_per_token, timestamp)
            VALUES ('0xparent', '0xp2', 'TOK', 'eth-tok', 'in', 'buy', 100.0, 0.30, 2);
            -- A priceless buy must not skew the average.
            INSERT INTO transfers (wallet, transaction_hash, symbol, fungible_id, direction, action_type, quantity, price_per_token, timestamp)
            VALUES ('0xparent', '0xp3', 'TOK', 'eth-tok', 'in', 'buy', 500.0, NULL, 3);
            -- Child received the tokens as transfers.
            INSERT INTO transfers (wallet, transaction_hash, symbol, fungible_id, direction, action_type, quantity, price_per_token, timestamp)
            VALUES ('0xchild', '0xc1', 'TOK', 'eth-tok', 'in', 'transfer_in', 150.0, NULL, 10);
            INSERT INTO transfers (wallet, transaction_hash, symbol, fungible_id, direction, action_type, quantity, price_per_token, timestamp)
            VALUES ('0xchild', '0xc2', 'TOK', 'eth-tok', 'in', 'transfer_in', 50.0, 5.0, 11);
            INSERT INTO transfers (wallet, transaction_hash, symbol, fungible_id, direction, action_type, quantity, price_per_token, timestamp)
            VALUES ('0xchild', '0xc3', 'TOK', 'eth-tok', 'out', 'transfer_out', 10.0, NULL, 12);
            ",
            )
            .unwrap();
    }

    #[test]
    fn test_parent_weighted_avg_buy_price() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        seed_parent_and_child(&db);

        let avg = parent_weighted_avg_buy_price(&db.conn, "0xparent", "TOK")
            .unwrap()
            .unwrap();
        assert!((avg - 0.20).abs() < 1e-9);

        assert!(parent_weighted_avg_buy_price(&db.conn, "0xparent", "NOPE")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_inheritance_is_idempotent_and_preserves_observed_price() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        seed_parent_and_child(&db);

        let first = apply_inheritance(&db.conn, "0xchild", "TOK", "0xparent", 0.20).unwrap();
        assert_eq!(first, 2, "both inbound rows inherit");

        // Second invocation changes zero rows.
        let second = apply_inheritance(&db.conn, "0xchild", "TOK", "0xparent", 0.20).unwrap();
        assert_eq!(second, 0);

        // Observed price untouched; outbound row untouched.
        let (observed, inherited, from): (Option<f64>, Option<f64>, Option<String>) = db
            .conn
            .query_row(
                "SELECT price_per_token, inherited_price_per_token, is_inherited_from_wallet
                 FROM transfers WHERE transaction_hash = '0xc2'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(observed, Some(5.0));
        assert_eq!(inherited, Some(0.20));
        assert_eq!(from.as_deref(), Some("0xparent"));

        let out_inherited: Option<f64> = db
            .conn
            .query_row(
                "SELECT inherited_price_per_token FROM transfers WHERE transaction_hash = '0xc3'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(out_inherited, None);
    }

    #[test]
    fn test_record_migration_insert_ignore() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let candidate = MigrationCandidate {
            recipient: "0xchild".to_string(),
            total_value_usd: 7500.0,
            transfer_fraction: 0.75,
            tokens: vec![TransferredToken {
                symbol: Some("TOK".to_string()),
                fungible_id: "eth-tok".to_string(),
                quantity: 200.0,
                value_usd: 7500.0,
            }],
            last_send_ts: 110,
        };

        let first =
            record_migration(&db.conn, "0xparent", "0xchild", "2026-08-01", &candidate).unwrap();
        assert_eq!(first, 1);
        let second =
            record_migration(&db.conn, "0xparent", "0xchild", "2026-08-01", &candidate).unwrap();
        assert_eq!(second, 0);

        let pct: f64 = db
            .conn
            .query_row(
                "SELECT transfer_percentage FROM wallet_migrations WHERE old_wallet='0xparent'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!((pct - 75.0).abs() < 1e-9);
    }
}
