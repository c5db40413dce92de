//! Points scoring and rank assignment for per-arena leaderboards.
//!
//! Points are a weighted composite of normalized volume, PnL and trade
//! count. Agents with no activity all land on the same neutral points value
//! (0.35 · 0.5 = 0.175) so rank ordering stays stable on quiet days; that
//! constant must not drift.

use serde::{Deserialize, Serialize};

pub const WEIGHT_VOLUME: f64 = 0.50;
pub const WEIGHT_PNL: f64 = 0.35;
pub const WEIGHT_TRADES: f64 = 0.15;

/// Scoring input per agent, observable within the scoring epoch.
#[derive(Debug, Clone)]
pub struct AgentStanding {
    pub agent_id: i64,
    pub equity: f64,
    pub initial_capital: f64,
    pub cash_mon: f64,
    pub token_units: f64,
    pub molti_locked: f64,
    pub volume_mon: f64,
    pub trades: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    #[serde(rename = "agentId")]
    pub agent_id: i64,
    pub equity: f64,
    #[serde(rename = "pnlPct")]
    pub pnl_pct: f64,
    #[serde(rename = "cashMon")]
    pub cash_mon: f64,
    #[serde(rename = "tokenUnits")]
    pub token_units: f64,
    #[serde(rename = "moltiLocked")]
    pub molti_locked: f64,
    #[serde(rename = "volumeMon")]
    pub volume_mon: f64,
    pub trades: u64,
    pub points: f64,
    pub rank: u32,
}

/// Rank all standings: points descending, ties broken by ascending agent
/// id, ranks from 1.
pub fn compute_rankings(standings: &[AgentStanding]) -> Vec<RankedEntry> {
    let max_volume = standings
        .iter()
        .map(|s| s.volume_mon)
        .fold(0.0_f64, f64::max);
    let max_trades = standings.iter().map(|s| s.trades).max().unwrap_or(0);

    let mut entries: Vec<RankedEntry> = standings
        .iter()
        .map(|s| {
            let norm_vol = if max_volume > 0.0 {
                s.volume_mon / max_volume
            } else {
                0.0
            };
            let norm_trades = if max_trades > 0 {
                s.trades as f64 / max_trades as f64
            } else {
                0.0
            };
            let pnl_pct = if s.initial_capital > 0.0 {
                (s.equity - s.initial_capital) / s.initial_capital * 100.0
            } else {
                0.0
            };
            let norm_pnl = if s.volume_mon == 0.0 && s.trades == 0 {
                // Inactive agents tie at the neutral midpoint.
                0.5
            } else {
                ((pnl_pct + 50.0) / 100.0).clamp(0.0, 1.0)
            };
            let points =
                WEIGHT_VOLUME * norm_vol + WEIGHT_PNL * norm_pnl + WEIGHT_TRADES * norm_trades;

            RankedEntry {
                agent_id: s.agent_id,
                equity: s.equity,
                pnl_pct,
                cash_mon: s.cash_mon,
                token_units: s.token_units,
                molti_locked: s.molti_locked,
                volume_mon: s.volume_mon,
                trades: s.trades,
                points,
                rank: 0,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.points
            .partial_cmp(&a.points)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.agent_id.cmp(&b.agent_id))
    });
    for (i, e) in entries.iter_mut().enumerate() {
        e.rank = (i + 1) as u32;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standing(agent_id: i64, equity: f64, volume: f64, trades: u64) -> AgentStanding {
        AgentStanding {
            agent_id,
            equity,
            initial_capital: 100.0,
            cash_mon: equity,
            token_units: 0.0,
            molti_locked: 0.0,
            volume_mon: volume,
            trades,
        }
    }

    #[test]
    fn inactive_agents_all_score_neutral() {
        let entries = compute_rankings(&[
            standing(2, 100.0, 0.0, 0),
            standing(1, 80.0, 0.0, 0),
            standing(3, 120.0, 0.0, 0),
        ]);
        for e in &entries {
            assert!((e.points - 0.175).abs() < 1e-12);
        }
        // Ties break by ascending agent id.
        let order: Vec<i64> = entries.iter().map(|e| e.agent_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn ranks_are_a_permutation_from_one() {
        let entries = compute_rankings(&[
            standing(1, 110.0, 50.0, 2),
            standing(2, 90.0, 100.0, 5),
            standing(3, 100.0, 0.0, 0),
            standing(4, 140.0, 25.0, 1),
        ]);
        let mut ranks: Vec<u32> = entries.iter().map(|e| e.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn volume_dominates_weighting() {
        let entries = compute_rankings(&[
            // Max volume, flat pnl.
            standing(1, 100.0, 1_000.0, 1),
            // No volume, strong pnl.
            standing(2, 140.0, 0.0, 1),
        ]);
        assert_eq!(entries[0].agent_id, 1);
    }

    #[test]
    fn pnl_normalization_clamps() {
        let entries = compute_rankings(&[standing(1, 300.0, 10.0, 1)]);
        // +200% pnl clamps norm_pnl at 1.0; sole agent also has max volume
        // and trades.
        let expected = WEIGHT_VOLUME + WEIGHT_PNL + WEIGHT_TRADES;
        assert!((entries[0].points - expected).abs() < 1e-12);
    }

    #[test]
    fn rankings_serialize_for_snapshots() {
        let entries = compute_rankings(&[standing(1, 100.0, 0.0, 0)]);
        let json = serde_json::to_string(&entries).unwrap();
        let back: Vec<RankedEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entries);
        assert!(json.contains("\"pnlPct\""));
    }
}
