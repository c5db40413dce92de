//! Epoch reward distribution and sweep.
//!
//! The top 30% (rounded up) of the final leaderboard split the on-chain
//! pool with linear weights k..1; integer division leaves a remainder that
//! goes to rank 1 so the amounts sum to the pool exactly. Distribution and
//! sweep are idempotent via the epoch row timestamps.

use crate::chain::{ChainReader, OperatorGateway};
use crate::engine::leaderboard::RankedEntry;
use crate::models::EpochRow;
use crate::store::ArenaDb;
use alloy::primitives::U256;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub const WINNER_SHARE: f64 = 0.30;
pub const CLAIM_WINDOW_DAYS: i64 = 30;

/// ⌈0.30 · n⌉, zero only for an empty field.
pub fn winner_count(n: usize) -> usize {
    (n as f64 * WINNER_SHARE).ceil() as usize
}

/// Linear-weighted split: weights k, k−1, …, 1 over `winners` entries, the
/// rounding remainder added to rank 1. Sums to `pool` exactly.
pub fn linear_split(pool: U256, winners: usize) -> Vec<U256> {
    if winners == 0 || pool.is_zero() {
        return vec![U256::ZERO; winners];
    }
    let k = winners as u64;
    let weight_sum = U256::from(k * (k + 1) / 2);

    let mut amounts: Vec<U256> = (0..winners)
        .map(|i| pool * U256::from(k - i as u64) / weight_sum)
        .collect();
    let assigned: U256 = amounts.iter().copied().fold(U256::ZERO, |a, b| a + b);
    amounts[0] += pool - assigned;
    amounts
}

/// Distribute the epoch's reward pool to the final leaderboard's winners.
/// Safe to call repeatedly: a stamped epoch is a no-op, and a failed batch
/// leaves the stamp unset for the next trigger.
pub async fn distribute_rewards_for_epoch(
    db: &Arc<ArenaDb>,
    chain: &Arc<dyn ChainReader>,
    operator: &Arc<dyn OperatorGateway>,
    arena_onchain_id: u64,
    epoch: &EpochRow,
) -> Result<()> {
    if epoch.rewards_distributed_at.is_some() {
        return Ok(());
    }

    let info = chain
        .epoch_info(arena_onchain_id, epoch.onchain_epoch_id)
        .await
        .context("read reward pool")?;

    let Some(rankings_json) = db.latest_leaderboard(epoch.arena_id, epoch.id)? else {
        return Err(anyhow!(
            "no leaderboard snapshot for arena {} epoch {}",
            epoch.arena_id,
            epoch.onchain_epoch_id
        ));
    };
    let mut rankings: Vec<RankedEntry> =
        serde_json::from_str(&rankings_json).context("leaderboard decode")?;
    rankings.sort_by_key(|e| e.rank);
    if rankings.is_empty() {
        return Err(anyhow!("empty leaderboard for epoch {}", epoch.onchain_epoch_id));
    }

    let take = winner_count(rankings.len());
    let winners: Vec<RankedEntry> = rankings.into_iter().take(take).collect();
    let amounts = linear_split(info.reward_pool, winners.len());

    let mut onchain_ids = Vec::with_capacity(winners.len());
    for w in &winners {
        let agent = db
            .agent(w.agent_id)?
            .and_then(|a| a.onchain_id)
            .ok_or_else(|| anyhow!("winner {} has no on-chain id", w.agent_id))?;
        onchain_ids.push(agent);
    }

    let tx_hash = operator
        .set_pending_rewards_batch(
            arena_onchain_id,
            epoch.onchain_epoch_id,
            onchain_ids,
            amounts.clone(),
        )
        .await?;

    for (w, amount) in winners.iter().zip(&amounts) {
        db.set_pending_reward(epoch.id, w.agent_id, &amount.to_string())?;
    }
    db.mark_rewards_distributed(epoch.id, Utc::now().timestamp(), &format!("{tx_hash:#x}"))?;

    info!(
        arena = epoch.arena_id,
        epoch = epoch.onchain_epoch_id,
        winners = winners.len(),
        pool = %info.reward_pool,
        "💰 Rewards distributed"
    );
    Ok(())
}

/// Sweep unclaimed winner rewards once the claim window has passed. The
/// on-chain pending amount is the truth for "still open": a zero pending
/// reward means the agent claimed and the DB row is backfilled instead.
pub async fn sweep_epoch(
    db: &Arc<ArenaDb>,
    chain: &Arc<dyn ChainReader>,
    operator: &Arc<dyn OperatorGateway>,
    arena_onchain_id: u64,
    epoch: &EpochRow,
) -> Result<()> {
    if epoch.rewards_swept_at.is_some() {
        return Ok(());
    }

    let open = db.unclaimed_winners(epoch.id)?;
    if open.is_empty() {
        db.mark_rewards_swept(epoch.id, Utc::now().timestamp(), "")?;
        return Ok(());
    }

    let mut onchain_ids = Vec::with_capacity(open.len());
    for w in &open {
        let Some(id) = w.agent_onchain_id else {
            warn!(agent = w.agent_id, "sweep: winner without on-chain id");
            continue;
        };
        let pending = chain
            .pending_reward(arena_onchain_id, epoch.onchain_epoch_id, id)
            .await
            .context("getPendingReward")?;
        if pending.is_zero() {
            db.mark_reward_claimed(epoch.id, w.agent_id, &w.pending_reward_wei)?;
        } else {
            onchain_ids.push(id);
        }
    }
    if onchain_ids.is_empty() {
        db.mark_rewards_swept(epoch.id, Utc::now().timestamp(), "")?;
        return Ok(());
    }

    let swept = onchain_ids.len();
    let tx_hash = operator
        .sweep_unclaimed(arena_onchain_id, epoch.onchain_epoch_id, onchain_ids)
        .await?;
    db.mark_rewards_swept(epoch.id, Utc::now().timestamp(), &format!("{tx_hash:#x}"))?;

    info!(
        arena = epoch.arena_id,
        epoch = epoch.onchain_epoch_id,
        swept,
        "🧹 Unclaimed rewards swept"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s5_linear_split_remainder_to_rank_one() {
        let amounts = linear_split(U256::from(1_000u64), 3);
        assert_eq!(
            amounts,
            vec![U256::from(501u64), U256::from(333u64), U256::from(166u64)]
        );
        let sum: U256 = amounts.iter().copied().fold(U256::ZERO, |a, b| a + b);
        assert_eq!(sum, U256::from(1_000u64));
    }

    #[test]
    fn split_always_sums_to_pool() {
        for winners in 1..=12usize {
            for pool in [1u64, 7, 999, 1_000_000_000_000_000_000] {
                let amounts = linear_split(U256::from(pool), winners);
                let sum: U256 = amounts.iter().copied().fold(U256::ZERO, |a, b| a + b);
                assert_eq!(sum, U256::from(pool), "pool={pool} winners={winners}");
            }
        }
    }

    #[test]
    fn winner_count_rounds_up() {
        assert_eq!(winner_count(10), 3);
        assert_eq!(winner_count(1), 1);
        assert_eq!(winner_count(3), 1);
        assert_eq!(winner_count(4), 2);
        assert_eq!(winner_count(0), 0);
    }

    #[test]
    fn zero_pool_distributes_zeroes() {
        let amounts = linear_split(U256::ZERO, 3);
        assert!(amounts.iter().all(|a| a.is_zero()));
    }
}
