//! Live per-token market state and snapshot derivation.
//!
//! Ingest is O(1), never blocks and never fails; the tick loop folds the
//! event-store window over the in-memory counters and emits one snapshot per
//! configured token. Store failures fall back to the local counters so a
//! snapshot is at worst one tick stale.

use crate::models::{
    MarketSnapshot, MomentumLabel, VolatilityLabel, VolumeTrendLabel,
};
use crate::store::EventStore;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const PRICE_TAIL_LEN: usize = 10;
pub const RECENT_EVENTS_LEN: usize = 5;
pub const WHALE_THRESHOLD_MON: f64 = 50.0;
const DEFAULT_PRICE: f64 = 1.0;

/// Mutable aggregator state per token.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub last_price: f64,
    pub price_tail: VecDeque<f64>,
    pub events_this_tick: u64,
    pub volume_this_tick: f64,
    pub unique_traders_this_tick: HashSet<String>,
    pub tick: u64,
    pub prev_tick_volume: f64,
}

impl Default for TokenState {
    fn default() -> Self {
        Self {
            last_price: DEFAULT_PRICE,
            price_tail: VecDeque::with_capacity(PRICE_TAIL_LEN),
            events_this_tick: 0,
            volume_this_tick: 0.0,
            unique_traders_this_tick: HashSet::new(),
            tick: 0,
            prev_tick_volume: 0.0,
        }
    }
}

pub struct MarketAggregator {
    store: Arc<EventStore>,
    tokens: Vec<String>,
    states: RwLock<HashMap<String, TokenState>>,
    latest: RwLock<HashMap<String, MarketSnapshot>>,
}

impl MarketAggregator {
    pub fn new(store: Arc<EventStore>, tokens: Vec<String>) -> Self {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        Self {
            store,
            tokens,
            states: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one streamed event into the per-token counters. O(1), total.
    pub fn apply_event(
        &self,
        token: &str,
        price: Option<f64>,
        volume_mon: Option<f64>,
        trader: Option<&str>,
    ) {
        let token = token.to_ascii_lowercase();
        let mut states = self.states.write();
        let state = states.entry(token).or_default();

        if let Some(p) = price.filter(|p| p.is_finite() && *p > 0.0) {
            state.last_price = p;
            state.price_tail.push_back(p);
            while state.price_tail.len() > PRICE_TAIL_LEN {
                state.price_tail.pop_front();
            }
        }
        if let Some(v) = volume_mon.filter(|v| v.is_finite() && *v >= 0.0) {
            state.volume_this_tick += v;
        }
        if let Some(t) = trader {
            state
                .unique_traders_this_tick
                .insert(t.trim().to_ascii_lowercase());
        }
        state.events_this_tick += 1;
    }

    /// Latest emitted snapshot for a token, if any tick has run.
    pub fn latest_snapshot(&self, token: &str) -> Option<MarketSnapshot> {
        self.latest.read().get(&token.to_ascii_lowercase()).cloned()
    }

    /// Compute and publish snapshots for every configured token, then reset
    /// the per-tick counters. Returns the emitted snapshots.
    pub fn run_tick(&self, now_ts: i64) -> Vec<MarketSnapshot> {
        let mut out = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            let snapshot = self.snapshot_token(token, now_ts);
            debug!(
                token = %snapshot.token,
                tick = snapshot.tick,
                price = snapshot.price,
                events_1h = snapshot.events_1h,
                "snapshot"
            );
            out.push(snapshot);
        }

        let mut latest = self.latest.write();
        for s in &out {
            latest.insert(s.token.clone(), s.clone());
        }
        out
    }

    fn snapshot_token(&self, token: &str, now_ts: i64) -> MarketSnapshot {
        let hour_ago = now_ts - 3_600;
        let stats = self.store.aggregated_stats(token, hour_ago, now_ts);
        let store_available = stats.total > 0;

        let mut states = self.states.write();
        let state = states.entry(token.to_string()).or_default();

        let mut price = state.last_price;
        if price == DEFAULT_PRICE {
            // Still at the placeholder default: prefer the freshest stored
            // price over pretending the market sits at 1.
            if let Some(p) = self.store.latest_price(token) {
                if p.is_finite() && p > 0.0 {
                    price = p;
                    state.last_price = p;
                }
            }
        }

        let tail: Vec<f64> = state.price_tail.iter().copied().collect();
        let ret_1m_pct = tail_return(&tail, price, 2);
        let ret_5m_pct = tail_return(&tail, price, 5);
        let vol_5m_pct = tail_volatility(&tail);

        let (events_1h, volume_1h) = if store_available {
            (stats.total, stats.volume_mon)
        } else {
            (state.events_this_tick, state.volume_this_tick)
        };

        let buy_sell_ratio = if stats.sells > 0 {
            stats.buys as f64 / stats.sells as f64
        } else {
            stats.buys.max(1) as f64
        };
        let momentum = if buy_sell_ratio > 1.5 {
            MomentumLabel::Buying
        } else if buy_sell_ratio < 0.67 {
            MomentumLabel::Selling
        } else {
            MomentumLabel::Neutral
        };

        let volume_trend = volume_trend(state.volume_this_tick, state.prev_tick_volume);

        let price_volatility = if vol_5m_pct > 5.0 {
            VolatilityLabel::High
        } else if vol_5m_pct > 2.0 {
            VolatilityLabel::Medium
        } else {
            VolatilityLabel::Low
        };

        let metrics = if store_available {
            self.store
                .trader_metrics(token, hour_ago, now_ts, WHALE_THRESHOLD_MON)
        } else {
            // Conservative local fallback: the whole tick volume counts as
            // the largest observed trade.
            let unique = state.unique_traders_this_tick.len() as u64;
            crate::store::TraderMetrics {
                unique_traders: unique,
                avg_volume_per_trader: if unique > 0 {
                    state.volume_this_tick / unique as f64
                } else {
                    0.0
                },
                largest_trade: state.volume_this_tick,
                whale_activity: state.volume_this_tick >= WHALE_THRESHOLD_MON,
            }
        };

        let recent_events = self.store.recent_events(token, RECENT_EVENTS_LEN);

        let snapshot = MarketSnapshot {
            token: token.to_string(),
            tick: state.tick,
            price,
            ret_1m_pct,
            ret_5m_pct,
            vol_5m_pct,
            events_1h,
            volume_1h,
            price_tail: tail,
            buys_1h: stats.buys,
            sells_1h: stats.sells,
            swaps_1h: stats.swaps,
            buy_sell_ratio,
            recent_events,
            unique_traders: metrics.unique_traders,
            avg_volume_per_trader: metrics.avg_volume_per_trader,
            largest_trade: metrics.largest_trade,
            whale_activity: metrics.whale_activity,
            momentum,
            volume_trend,
            price_volatility,
        };

        // Counters reset each tick; the price tail is retained.
        state.prev_tick_volume = state.volume_this_tick;
        state.events_this_tick = 0;
        state.volume_this_tick = 0.0;
        state.unique_traders_this_tick.clear();
        state.tick += 1;

        snapshot
    }

    /// Self-rescheduling market tick loop. A long tick delays the next one;
    /// ticks never overlap.
    pub fn spawn(
        self: Arc<Self>,
        tick_seconds: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                tokens = self.tokens.len(),
                tick_seconds, "📈 Market aggregator started"
            );
            loop {
                let now = chrono::Utc::now().timestamp();
                let snapshots = self.run_tick(now);
                if snapshots.is_empty() {
                    warn!("market tick produced no snapshots (no tokens configured)");
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(tick_seconds)) => {}
                    _ = shutdown.changed() => {
                        info!("market aggregator stopping");
                        return;
                    }
                }
            }
        })
    }
}

/// % return of `price` against the tail entry `back` steps from the end.
fn tail_return(tail: &[f64], price: f64, back: usize) -> f64 {
    if tail.len() < back {
        return 0.0;
    }
    let base = tail[tail.len() - back];
    if base > 0.0 {
        (price - base) / base * 100.0
    } else {
        0.0
    }
}

/// Population std-dev of per-step % returns over the tail, in percent.
fn tail_volatility(tail: &[f64]) -> f64 {
    if tail.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    var.sqrt() * 100.0
}

fn volume_trend(current: f64, prev: f64) -> VolumeTrendLabel {
    if prev > 0.0 {
        let delta = (current - prev) / prev;
        if delta > 0.10 {
            VolumeTrendLabel::Increasing
        } else if delta < -0.10 {
            VolumeTrendLabel::Decreasing
        } else {
            VolumeTrendLabel::Stable
        }
    } else if current > 0.0 {
        VolumeTrendLabel::Increasing
    } else {
        VolumeTrendLabel::Stable
    }
}
