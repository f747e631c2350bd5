use crate::fifo::{INVESTED_EPSILON, ROI_WIN_THRESHOLD_PCT};
use common::types::Classification;

/// ROI normalization cap for the composite score: +500% maps to the full
/// 0..100 range of the ROI component.
pub const ROI_NORM_CAP_PCT: f64 = 500.0;
/// Scale of the log-activity component so a 20-trade wallet earns ~4.5 pts.
pub const ACTIVITY_LOG_SCALE: f64 = 15.0;

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub roi_weight: f64,
    pub win_rate_weight: f64,
    pub activity_weight: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            roi_weight: 0.6,
            win_rate_weight: 0.3,
            activity_weight: 0.1,
        }
    }
}

/// One analytics row, reduced to what the scorer needs.
#[derive(Debug, Clone, Copy)]
pub struct TokenStat {
    pub roi_percentage: f64,
    pub total_invested: f64,
}

impl TokenStat {
    /// Airdrop-only rows carry no invested capital and are excluded from
    /// trade counts and the weighted ROI.
    pub fn is_investment(&self) -> bool {
        self.total_invested > INVESTED_EPSILON
    }
}

/// Invested-weighted ROI over investment rows, percent.
pub fn weighted_roi(stats: &[TokenStat]) -> f64 {
    let mut num = 0.0;
    let mut denom = 0.0;
    for s in stats.iter().filter(|s| s.is_investment()) {
        num += s.roi_percentage * s.total_invested;
        denom += s.total_invested;
    }
    if denom > 0.0 {
        num / denom
    } else {
        0.0
    }
}

/// Fraction of investment rows with ROI at or above the win threshold.
pub fn win_rate(stats: &[TokenStat]) -> f64 {
    let investments: Vec<_> = stats.iter().filter(|s| s.is_investment()).collect();
    if investments.is_empty() {
        return 0.0;
    }
    let winners = investments
        .iter()
        .filter(|s| s.roi_percentage >= ROI_WIN_THRESHOLD_PCT)
        .count();
    winners as f64 / investments.len() as f64
}

pub fn trade_count(stats: &[TokenStat]) -> u32 {
    stats.iter().filter(|s| s.is_investment()).count() as u32
}

fn normalize_roi(weighted_roi_pct: f64) -> f64 {
    weighted_roi_pct.clamp(0.0, ROI_NORM_CAP_PCT) / ROI_NORM_CAP_PCT * 100.0
}

/// Composite wallet score on a 0..~100 scale:
/// `0.6·norm(roi) + 0.3·win_rate·100 + 0.1·ln(1+n)·scale`.
pub fn composite_score(
    weighted_roi_pct: f64,
    win_rate_frac: f64,
    n_trades: u32,
    w: &ScoreWeights,
) -> f64 {
    w.roi_weight * normalize_roi(weighted_roi_pct)
        + w.win_rate_weight * win_rate_frac * 100.0
        + w.activity_weight * (1.0 + f64::from(n_trades)).ln() * ACTIVITY_LOG_SCALE
}

#[derive(Debug, Clone, Copy)]
pub struct QualificationGates {
    pub min_score: f64,
    pub min_weighted_roi: f64,
    pub min_trades: u32,
}

/// All gates must pass for a wallet to qualify.
pub fn qualifies(score: f64, weighted_roi_pct: f64, n_trades: u32, gates: &QualificationGates) -> bool {
    score >= gates.min_score
        && weighted_roi_pct >= gates.min_weighted_roi
        && n_trades >= gates.min_trades
}

/// Full scorer output for one wallet.
#[derive(Debug, Clone)]
pub struct WalletScore {
    pub score: f64,
    pub weighted_roi: f64,
    pub win_rate: f64,
    pub trade_count: u32,
    pub classification: Classification,
    pub qualified: bool,
}

pub fn score_wallet(stats: &[TokenStat], gates: &QualificationGates) -> WalletScore {
    let weights = ScoreWeights::default();
    let roi = weighted_roi(stats);
    let wr = win_rate(stats);
    let n = trade_count(stats);
    let score = composite_score(roi, wr, n, &weights);
    WalletScore {
        score,
        weighted_roi: roi,
        win_rate: wr,
        trade_count: n,
        classification: Classification::from_score(score),
        qualified: qualifies(score, roi, n, gates),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates() -> QualificationGates {
        QualificationGates {
            min_score: 20.0,
            min_weighted_roi: 50.0,
            min_trades: 3,
        }
    }

    fn stat(roi: f64, invested: f64) -> TokenStat {
        TokenStat {
            roi_percentage: roi,
            total_invested: invested,
        }
    }

    #[test]
    fn test_weighted_roi_is_invested_weighted() {
        // 100% on $1000 and 0% on $3000 → 25%.
        let stats = [stat(100.0, 1000.0), stat(0.0, 3000.0)];
        assert!((weighted_roi(&stats) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_airdrop_rows_excluded_everywhere() {
        let stats = [stat(99999.0, 0.0), stat(100.0, 1000.0)];
        assert!((weighted_roi(&stats) - 100.0).abs() < 1e-9);
        assert_eq!(trade_count(&stats), 1);
        assert!((win_rate(&stats) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_win_rate_counts_at_80_percent() {
        let stats = [
            stat(80.0, 100.0),
            stat(79.9, 100.0),
            stat(-50.0, 100.0),
            stat(200.0, 100.0),
        ];
        assert!((win_rate(&stats) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_composite_score_components() {
        let w = ScoreWeights::default();
        // ROI at the cap contributes the full 60 points.
        let s = composite_score(500.0, 0.0, 0, &w);
        assert!((s - 60.0).abs() < 1e-9);
        // Perfect win rate contributes 30 points.
        let s = composite_score(0.0, 1.0, 0, &w);
        assert!((s - 30.0).abs() < 1e-9);
        // Activity grows with log of trade count.
        assert!(composite_score(0.0, 0.0, 50, &w) > composite_score(0.0, 0.0, 5, &w));
    }

    #[test]
    fn test_qualification_requires_all_gates() {
        let g = gates();
        assert!(qualifies(25.0, 60.0, 5, &g));
        assert!(!qualifies(19.9, 60.0, 5, &g));
        assert!(!qualifies(25.0, 49.9, 5, &g));
        assert!(!qualifies(25.0, 60.0, 2, &g));
    }

    #[test]
    fn test_score_wallet_qualified_case() {
        // Three strong positions: high ROI, all winners.
        let stats = [
            stat(150.0, 4000.0),
            stat(90.0, 2000.0),
            stat(300.0, 1000.0),
        ];
        let out = score_wallet(&stats, &gates());
        assert!(out.qualified, "score={} roi={}", out.score, out.weighted_roi);
        assert_eq!(out.trade_count, 3);
        assert!((out.win_rate - 1.0).abs() < 1e-9);
        assert!(out.weighted_roi > 50.0);
    }

    #[test]
    fn test_score_wallet_rejects_thin_history() {
        let stats = [stat(400.0, 5000.0)];
        let out = score_wallet(&stats, &gates());
        assert!(!out.qualified);
        assert_eq!(out.trade_count, 1);
    }

    #[test]
    fn test_classification_follows_score_bands() {
        let stats = [
            stat(500.0, 5000.0),
            stat(500.0, 5000.0),
            stat(500.0, 5000.0),
        ];
        let out = score_wallet(&stats, &gates());
        // 60 (roi) + 30 (win rate) + activity > 80 → ELITE.
        assert_eq!(out.classification, Classification::Elite);
    }
}
