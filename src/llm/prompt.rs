//! Prompt assembly: compact, numeric-rounded market + portfolio JSON with a
//! fixed per-arena ordering, plus the schema-bearing system prompt.

use crate::models::{AgentProfile, MarketSnapshot, MAX_CUSTOM_RULES_CHARS, MAX_MEMORY_CHARS};
use serde_json::json;

/// Portfolio fields as the planner sees them, already reconciled against
/// the chain.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioView {
    pub cash_mon: f64,
    pub token_units: f64,
    pub initial_capital: f64,
    pub avg_entry_price: Option<f64>,
    pub trades_this_window: u32,
    pub last_trade_tick: Option<u64>,
}

impl PortfolioView {
    pub fn equity(&self, price: f64) -> f64 {
        self.cash_mon + self.token_units * price
    }

    pub fn position_pct(&self, price: f64) -> f64 {
        let eq = self.equity(price);
        if eq > 0.0 {
            self.token_units * price / eq
        } else {
            0.0
        }
    }
}

/// One arena block in prompt order.
#[derive(Debug, Clone)]
pub struct ArenaPromptBlock {
    pub label: String,
    pub snapshot: MarketSnapshot,
    pub portfolio: PortfolioView,
    /// False when both activity filters are zero (filters disabled).
    pub filters_effective: bool,
}

const SYSTEM_PROMPT_CORE: &str = "\
You are a trading agent competing in on-chain token arenas.\n\
Units: prices and volumes are in MON. sizePct is a fraction of spendable \
balance (BUY: wallet MOLTI, SELL: held tokens).\n\
Hard constraints you must never exceed: constraints.maxTradePct caps \
sizePct, constraints.maxPositionPct caps token exposure, \
constraints.cooldownTicks ticks must pass between trades, and at most \
constraints.maxTradesPerWindow trades per window. A BUY or SELL must carry \
sizePct > 0; otherwise answer HOLD.\n\
Vocabulary: recent events are [type, price, volume] with type B=Buy \
S=Sell W=Swap. mom (momentum): B=buying S=selling N=neutral. vt (volume \
trend): I=increasing D=decreasing S=stable. pv (price volatility): H=high \
M=medium L=low.\n";

pub fn system_prompt_single() -> String {
    format!(
        "{SYSTEM_PROMPT_CORE}\
Respond with exactly one JSON object, no prose:\n\
{{\"action\":\"BUY\"|\"SELL\"|\"HOLD\",\"sizePct\":0..1,\"confidence\":0..1,\"reason\":\"short text\"}}"
    )
}

pub fn system_prompt_multi(n: usize) -> String {
    format!(
        "{SYSTEM_PROMPT_CORE}\
You are given {n} arenas. Respond with a JSON array of exactly {n} decision \
objects in the same order as the input blocks, no prose:\n\
[{{\"action\":\"BUY\"|\"SELL\"|\"HOLD\",\"sizePct\":0..1,\"confidence\":0..1,\"reason\":\"short text\"}}, ...]"
    )
}

/// Strip text that could break prompt structure and clamp its length.
pub fn sanitize_text(s: &str, max_chars: usize) -> String {
    s.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .filter(|c| *c != '`')
        .take(max_chars)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn round4(x: f64) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    (x * 10_000.0).round() / 10_000.0
}

fn round6(x: f64) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    (x * 1_000_000.0).round() / 1_000_000.0
}

fn market_json(s: &MarketSnapshot, filters_effective: bool) -> serde_json::Value {
    let recent: Vec<serde_json::Value> = s
        .recent_events
        .iter()
        .map(|e| {
            let code = match e.kind {
                crate::models::EventKind::Buy => "B",
                crate::models::EventKind::Sell => "S",
                _ => "W",
            };
            json!([code, round6(e.price), round4(e.volume_mon)])
        })
        .collect();

    json!({
        "tick": s.tick,
        "px": round6(s.price),
        "r1m": round4(s.ret_1m_pct),
        "r5m": round4(s.ret_5m_pct),
        "v5m": round4(s.vol_5m_pct),
        "ev1h": s.events_1h,
        "vol1h": round4(s.volume_1h),
        "tail": s.price_tail.iter().map(|p| round6(*p)).collect::<Vec<_>>(),
        "bsr": round4(s.buy_sell_ratio),
        "mix": [s.buys_1h, s.sells_1h, s.swaps_1h],
        "re": recent,
        "traders": s.unique_traders,
        "avgVol": round4(s.avg_volume_per_trader),
        "maxTrade": round4(s.largest_trade),
        "whale": s.whale_activity,
        "mom": s.momentum.code().to_string(),
        "vt": s.volume_trend.code().to_string(),
        "pv": s.price_volatility.code().to_string(),
        "filtersActive": filters_effective,
    })
}

fn portfolio_json(p: &PortfolioView, price: f64, tick: u64) -> serde_json::Value {
    json!({
        "c": round4(p.cash_mon),
        "t": round6(p.token_units),
        "eq": round4(p.equity(price)),
        "posPct": round4(p.position_pct(price)),
        "init": round4(p.initial_capital),
        "aep": p.avg_entry_price.map(round6),
        "tw": p.trades_this_window,
        "ltt": p.last_trade_tick,
        "tsl": p.last_trade_tick.map(|ltt| tick.saturating_sub(ltt)),
    })
}

fn profile_json(profile: &AgentProfile) -> serde_json::Value {
    json!({
        "goal": profile.goal.as_str(),
        "style": profile.style.as_str(),
        "constraints": {
            "maxTradePct": round4(profile.constraints.max_trade_pct),
            "maxPositionPct": round4(profile.constraints.max_position_pct),
            "cooldownTicks": profile.constraints.cooldown_ticks,
            "maxTradesPerWindow": profile.constraints.max_trades_per_window,
        },
        "filters": {
            "minEvents1h": profile.filters.min_events_1h,
            "minVolumeMon1h": round4(profile.filters.min_volume_mon_1h),
        },
    })
}

/// Compact user message; for multi-arena one labeled block per arena in a
/// fixed order.
pub fn build_user_message(
    profile: &AgentProfile,
    memory: Option<&str>,
    blocks: &[ArenaPromptBlock],
) -> String {
    let mut out = String::with_capacity(1024);

    out.push_str("PROFILE ");
    out.push_str(&profile_json(profile).to_string());
    out.push('\n');

    if let Some(rules) = profile
        .custom_rules
        .as_deref()
        .map(|r| sanitize_text(r, MAX_CUSTOM_RULES_CHARS))
        .filter(|r| !r.is_empty())
    {
        out.push_str("RULES ");
        out.push_str(&rules);
        out.push('\n');
    }

    if let Some(mem) = memory
        .map(|m| sanitize_text(m, MAX_MEMORY_CHARS))
        .filter(|m| !m.is_empty())
    {
        out.push_str("MEMORY ");
        out.push_str(&mem);
        out.push('\n');
    }

    let n = blocks.len();
    for (i, block) in blocks.iter().enumerate() {
        let pjson = portfolio_json(&block.portfolio, block.snapshot.price, block.snapshot.tick);

        out.push_str(&format!("ARENA {}/{} {}\n", i + 1, n, block.label));
        out.push_str("MARKET ");
        out.push_str(&market_json(&block.snapshot, block.filters_effective).to_string());
        out.push('\n');
        out.push_str("PORTFOLIO ");
        out.push_str(&pjson.to_string());
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CompactEvent, EventKind, MomentumLabel, VolatilityLabel, VolumeTrendLabel,
    };

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            token: "0x00000000000000000000000000000000000000aa".to_string(),
            tick: 96,
            price: 1.5,
            ret_1m_pct: 0.123456789,
            ret_5m_pct: -1.2,
            vol_5m_pct: 2.4,
            events_1h: 500,
            volume_1h: 50_000.0,
            price_tail: vec![1.4, 1.45, 1.5],
            buys_1h: 300,
            sells_1h: 150,
            swaps_1h: 50,
            buy_sell_ratio: 2.0,
            recent_events: vec![CompactEvent {
                kind: EventKind::Buy,
                price: 1.49,
                volume_mon: 12.0,
            }],
            unique_traders: 40,
            avg_volume_per_trader: 1_250.0,
            largest_trade: 900.0,
            whale_activity: true,
            momentum: MomentumLabel::Buying,
            volume_trend: VolumeTrendLabel::Increasing,
            price_volatility: VolatilityLabel::Medium,
        }
    }

    fn profile() -> AgentProfile {
        serde_json::from_value(serde_json::json!({
            "goal": "maximize_pnl",
            "style": "aggressive",
            "constraints": {
                "max_trade_pct": 0.2,
                "max_position_pct": 0.5,
                "cooldown_ticks": 5,
                "max_trades_per_window": 10
            },
            "filters": { "min_events_1h": 100, "min_volume_mon_1h": 10000.0 },
            "custom_rules": "prefer `low` volatility\nentries"
        }))
        .unwrap()
    }

    fn block() -> ArenaPromptBlock {
        ArenaPromptBlock {
            label: "0x00000000000000000000000000000000000000aa".to_string(),
            snapshot: snapshot(),
            portfolio: PortfolioView {
                cash_mon: 100.0,
                token_units: 0.0,
                initial_capital: 100.0,
                avg_entry_price: None,
                trades_this_window: 2,
                last_trade_tick: Some(90),
            },
            filters_effective: true,
        }
    }

    #[test]
    fn user_message_orders_blocks_and_rounds() {
        let msg = build_user_message(&profile(), Some("lost on spike"), &[block(), block()]);
        assert!(msg.contains("ARENA 1/2"));
        assert!(msg.contains("ARENA 2/2"));
        assert!(msg.contains("\"r1m\":0.1235"));
        assert!(msg.contains("\"tsl\":6"));
        assert!(msg.contains("MEMORY lost on spike"));
        // Sanitizer stripped backticks and the newline.
        assert!(msg.contains("RULES prefer low volatility entries"));
    }

    #[test]
    fn sanitize_clamps_and_cleans() {
        let long = "a".repeat(2 * MAX_MEMORY_CHARS);
        assert_eq!(sanitize_text(&long, MAX_MEMORY_CHARS).len(), MAX_MEMORY_CHARS);
        assert_eq!(sanitize_text("x\u{0000}y `z`", 100), "x y z");
    }

    #[test]
    fn system_prompts_state_schema() {
        assert!(system_prompt_single().contains("\"action\""));
        let multi = system_prompt_multi(3);
        assert!(multi.contains("exactly 3"));
    }
}
