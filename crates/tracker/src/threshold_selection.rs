use crate::tier_analysis::TierStats;
use common::types::ThresholdStatus;

/// Weight of the ROI component of the tier attractiveness metric J.
const J_ROI_WEIGHT: f64 = 0.6;
const J_WIN_RATE_WEIGHT: f64 = 0.4;
const J_ACTIVITY_WEIGHT: f64 = 0.1;
/// Keeps the log-activity term small relative to ROI and win rate.
const J_ACTIVITY_SCALE: f64 = 0.25;

/// A tier is on the plateau when its J is at least P60 of all reliable
/// tiers and within 10% of the maximum.
const PLATEAU_PERCENTILE: f64 = 0.60;
const PLATEAU_MAX_FRACTION: f64 = 0.90;

/// Quality sigmoid: q ≈ 0.5 at the reliability floor (roi → 0⁺, 20% win
/// rate, 5 trades → J ≈ 0.125).
const QUALITY_STEEPNESS: f64 = 3.0;
const QUALITY_MIDPOINT: f64 = 0.125;

#[derive(Debug, Clone, Copy)]
pub struct ThresholdParams {
    pub min_trades: u32,
    /// Fraction 0..1.
    pub min_win_rate: f64,
    /// Percent cap for ROI normalization.
    pub roi_cap_pct: f64,
}

#[derive(Debug, Clone)]
pub struct ThresholdSelection {
    pub status: ThresholdStatus,
    pub optimal_tier: Option<f64>,
    pub quality_score: f64,
    /// Ascending tier values on the selected plateau.
    pub plateau_tiers: Vec<f64>,
}

/// Tier attractiveness: `0.6·roi_norm + 0.4·win_rate + 0.1·ln(1+n)·k`.
pub fn tier_j(t: &TierStats, params: &ThresholdParams) -> f64 {
    let roi_norm = (t.roi_percentage / params.roi_cap_pct).clamp(0.0, 1.0);
    J_ROI_WEIGHT * roi_norm
        + J_WIN_RATE_WEIGHT * t.win_rate
        + J_ACTIVITY_WEIGHT * (1.0 + f64::from(t.n_trades)).ln() * J_ACTIVITY_SCALE
}

/// Nearest-rank percentile: ascending sort, rank = max(1, ⌊p·n⌋).
pub fn percentile(values: &[f64], p: f64) -> f64 {
    debug_assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = ((p * sorted.len() as f64).floor() as usize).max(1);
    sorted[rank - 1]
}

pub fn reliable_tiers(tiers: &[TierStats], params: &ThresholdParams) -> Vec<TierStats> {
    tiers
        .iter()
        .filter(|t| {
            t.n_trades >= params.min_trades
                && t.win_rate >= params.min_win_rate
                && t.roi_percentage > 0.0
        })
        .copied()
        .collect()
}

/// Walk the (tier, J) pairs from the largest tier down: the plateau is the
/// maximal contiguous stable run starting at the largest stable tier.
/// Input must be ascending by tier; the result is ascending too.
pub fn find_plateau(scored: &[(f64, f64)]) -> Vec<(f64, f64)> {
    if scored.is_empty() {
        return Vec::new();
    }
    let js: Vec<f64> = scored.iter().map(|(_, j)| *j).collect();
    let p60 = percentile(&js, PLATEAU_PERCENTILE);
    let j_max = js.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let stable = |j: f64| j >= p60 && j >= PLATEAU_MAX_FRACTION * j_max;

    let mut plateau: Vec<(f64, f64)> = Vec::new();
    let mut started = false;
    for &(tier, j) in scored.iter().rev() {
        if !started {
            if stable(j) {
                started = true;
                plateau.push((tier, j));
            }
        } else if stable(j) {
            plateau.push((tier, j));
        } else {
            break;
        }
    }
    plateau.reverse();
    plateau
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn quality_score(mean_j: f64) -> f64 {
    sigmoid(QUALITY_STEEPNESS * (mean_j - QUALITY_MIDPOINT)).clamp(0.0, 1.0)
}

pub fn status_from_quality(q: f64) -> ThresholdStatus {
    if q < 0.1 {
        ThresholdStatus::Neutral
    } else if q < 0.3 {
        ThresholdStatus::Poor
    } else if q < 0.5 {
        ThresholdStatus::Average
    } else if q < 0.7 {
        ThresholdStatus::Good
    } else if q < 0.9 {
        ThresholdStatus::Excellent
    } else {
        ThresholdStatus::Exceptional
    }
}

/// Select the wallet's optimal threshold: the smallest tier on the stable J
/// plateau (the largest sustainable bet). NEUTRAL and NO_RELIABLE_TIERS do
/// not elect a smart wallet.
pub fn select_threshold(tiers: &[TierStats], params: &ThresholdParams) -> ThresholdSelection {
    let mut reliable = reliable_tiers(tiers, params);
    reliable.sort_by(|a, b| a.tier_usd.total_cmp(&b.tier_usd));

    if reliable.is_empty() {
        return ThresholdSelection {
            status: ThresholdStatus::NoReliableTiers,
            optimal_tier: None,
            quality_score: 0.0,
            plateau_tiers: Vec::new(),
        };
    }

    let scored: Vec<(f64, f64)> = reliable
        .iter()
        .map(|t| (t.tier_usd, tier_j(t, params)))
        .collect();
    let plateau = find_plateau(&scored);
    if plateau.is_empty() {
        // All reliable tiers failed stability; no defensible threshold.
        return ThresholdSelection {
            status: ThresholdStatus::NoReliableTiers,
            optimal_tier: None,
            quality_score: 0.0,
            plateau_tiers: Vec::new(),
        };
    }

    let mean_j = plateau.iter().map(|(_, j)| *j).sum::<f64>() / plateau.len() as f64;
    let q = quality_score(mean_j);

    ThresholdSelection {
        status: status_from_quality(q),
        optimal_tier: Some(plateau[0].0),
        quality_score: q,
        plateau_tiers: plateau.iter().map(|(t, _)| *t).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ThresholdParams {
        ThresholdParams {
            min_trades: 5,
            min_win_rate: 0.20,
            roi_cap_pct: 500.0,
        }
    }

    fn tier(tier_usd: f64, roi: f64, wr: f64, n: u32) -> TierStats {
        TierStats {
            tier_usd,
            roi_percentage: roi,
            win_rate: wr,
            n_trades: n,
            n_winners: 0,
            n_losers: 0,
            n_neutral: 0,
            total_invested: tier_usd * f64::from(n),
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let js = [0.4, 0.55, 0.58, 0.60, 0.58, 0.32];
        // rank = floor(0.6 * 6) = 3 → third smallest.
        assert!((percentile(&js, 0.60) - 0.55).abs() < 1e-9);
        assert!((percentile(&[0.7], 0.60) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_plateau_walk_from_largest_stable_tier() {
        // J profile rises to 6k then collapses at 8k.
        let scored = [
            (3000.0, 0.40),
            (4000.0, 0.55),
            (5000.0, 0.58),
            (6000.0, 0.60),
            (7000.0, 0.58),
            (8000.0, 0.32),
        ];
        let plateau = find_plateau(&scored);
        let tiers: Vec<f64> = plateau.iter().map(|(t, _)| *t).collect();
        assert_eq!(tiers, vec![4000.0, 5000.0, 6000.0, 7000.0]);
    }

    #[test]
    fn test_plateau_scenario_selects_4000_with_excellent_or_good_status() {
        // Engineer the J profile via win rate alone: J = 0.4·wr + small
        // activity term. Targets from the walk test above.
        let activity = |n: u32| 0.1 * (1.0 + f64::from(n)).ln() * 0.25;
        let wr_for = |j: f64, n: u32| (j - activity(n)) / 0.4;
        let n = 10;
        let tiers = [
            tier(3000.0, 0.0, wr_for(0.40, n), n),
            tier(4000.0, 0.0, wr_for(0.55, n), n),
            tier(5000.0, 0.0, wr_for(0.58, n), n),
            tier(6000.0, 0.0, wr_for(0.60, n), n),
            tier(7000.0, 0.0, wr_for(0.58, n), n),
            tier(8000.0, 0.0, wr_for(0.32, n), n),
        ];
        // roi must be > 0 for reliability; keep it tiny so J is unaffected.
        let tiers: Vec<TierStats> = tiers
            .iter()
            .map(|t| TierStats {
                roi_percentage: 1e-6,
                ..*t
            })
            .collect();

        let sel = select_threshold(&tiers, &params());
        assert_eq!(sel.optimal_tier, Some(4000.0));
        assert_eq!(sel.plateau_tiers, vec![4000.0, 5000.0, 6000.0, 7000.0]);
        assert!(
            matches!(
                sel.status,
                ThresholdStatus::Excellent | ThresholdStatus::Good
            ),
            "got {:?} (q={})",
            sel.status,
            sel.quality_score
        );
    }

    #[test]
    fn test_no_reliable_tiers() {
        // Fails each reliability gate in turn.
        let tiers = [
            tier(3000.0, 50.0, 0.5, 4),   // too few trades
            tier(4000.0, 50.0, 0.1, 10),  // win rate under 20%
            tier(5000.0, -10.0, 0.5, 10), // negative roi
        ];
        let sel = select_threshold(&tiers, &params());
        assert_eq!(sel.status, ThresholdStatus::NoReliableTiers);
        assert_eq!(sel.optimal_tier, None);
        assert!(sel.quality_score.abs() < 1e-9);
    }

    #[test]
    fn test_single_reliable_tier_is_its_own_plateau() {
        let tiers = [tier(5000.0, 200.0, 0.6, 8)];
        let sel = select_threshold(&tiers, &params());
        assert_eq!(sel.optimal_tier, Some(5000.0));
        assert!(sel.status.is_smart());
    }

    #[test]
    fn test_quality_is_half_at_reliability_floor() {
        // roi → 0, win rate 20%, 5 trades.
        let floor = tier(3000.0, 1e-9, 0.20, 5);
        let j = tier_j(&floor, &params());
        let q = quality_score(j);
        assert!((q - 0.5).abs() < 0.05, "q at floor was {q}");
    }

    #[test]
    fn test_status_bands() {
        assert_eq!(status_from_quality(0.05), ThresholdStatus::Neutral);
        assert_eq!(status_from_quality(0.15), ThresholdStatus::Poor);
        assert_eq!(status_from_quality(0.40), ThresholdStatus::Average);
        assert_eq!(status_from_quality(0.60), ThresholdStatus::Good);
        assert_eq!(status_from_quality(0.80), ThresholdStatus::Excellent);
        assert_eq!(status_from_quality(0.95), ThresholdStatus::Exceptional);
    }

    #[test]
    fn test_status_monotonicity_under_tier_loss() {
        // A wallet with a stable plateau cannot drop to NEUTRAL while any
        // reliable tier survives with the same J profile: quality depends
        // only on plateau mean J, and a shrinking plateau keeps mean J at or
        // above the old minimum.
        let strong = [
            tier(3000.0, 300.0, 0.6, 12),
            tier(4000.0, 320.0, 0.6, 10),
            tier(5000.0, 310.0, 0.55, 8),
        ];
        let full = select_threshold(&strong, &params());
        assert!(full.status.is_smart());

        let shrunk = select_threshold(&strong[..1], &params());
        assert_ne!(shrunk.status, ThresholdStatus::Neutral);
    }
}
