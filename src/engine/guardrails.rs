//! Deterministic override layer between the planner and execution.
//!
//! Pure: same input, same output, no external calls. Rules are evaluated in
//! order; the first match downgrades the proposal to HOLD with a reason.

use crate::models::{AgentProfile, MarketSnapshot, PortfolioRow, TradeAction, TradeDecision};

pub fn apply_guardrails(
    snapshot: &MarketSnapshot,
    portfolio: &PortfolioRow,
    profile: &AgentProfile,
    proposal: &TradeDecision,
) -> TradeDecision {
    if proposal.action == TradeAction::Hold {
        return proposal.clone();
    }

    let filters = &profile.filters;
    if snapshot.events_1h < filters.min_events_1h as u64 {
        return TradeDecision::hold(format!(
            "events_1h {} below minimum {}",
            snapshot.events_1h, filters.min_events_1h
        ));
    }
    if snapshot.volume_1h < filters.min_volume_mon_1h {
        return TradeDecision::hold(format!(
            "volume_1h {:.2} below minimum {:.2}",
            snapshot.volume_1h, filters.min_volume_mon_1h
        ));
    }

    let c = &profile.constraints;
    if let Some(last) = portfolio.last_trade_tick {
        let elapsed = snapshot.tick.saturating_sub(last);
        if elapsed < c.cooldown_ticks as u64 {
            return TradeDecision::hold(format!(
                "cooldown: {elapsed} of {} ticks elapsed",
                c.cooldown_ticks
            ));
        }
    }
    if portfolio.trades_this_window >= c.max_trades_per_window {
        return TradeDecision::hold(format!(
            "max trades per window reached ({})",
            c.max_trades_per_window
        ));
    }

    if proposal.action == TradeAction::Buy {
        let equity = portfolio.cash_mon + portfolio.token_units * snapshot.price;
        let exposure = if equity > 0.0 {
            portfolio.token_units * snapshot.price / equity
        } else {
            0.0
        };
        if exposure >= c.max_position_pct {
            return TradeDecision::hold(format!(
                "position cap: exposure {:.3} at or above {:.3}",
                exposure, c.max_position_pct
            ));
        }
    }

    if proposal.size_pct <= 0.0 {
        return TradeDecision::hold("invalid size for non-hold action");
    }

    TradeDecision {
        action: proposal.action,
        size_pct: proposal.size_pct.min(c.max_trade_pct),
        confidence: proposal.confidence,
        reason: proposal.reason.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MomentumLabel, VolatilityLabel, VolumeTrendLabel};

    fn profile() -> AgentProfile {
        serde_json::from_value(serde_json::json!({
            "goal": "maximize_pnl",
            "style": "moderate",
            "constraints": {
                "max_trade_pct": 0.2,
                "max_position_pct": 0.5,
                "cooldown_ticks": 5,
                "max_trades_per_window": 10
            },
            "filters": { "min_events_1h": 100, "min_volume_mon_1h": 10000.0 }
        }))
        .unwrap()
    }

    fn snapshot(tick: u64, price: f64, events_1h: u64, volume_1h: f64) -> MarketSnapshot {
        MarketSnapshot {
            token: "0x00000000000000000000000000000000000000aa".to_string(),
            tick,
            price,
            ret_1m_pct: 0.0,
            ret_5m_pct: 0.0,
            vol_5m_pct: 0.0,
            events_1h,
            volume_1h,
            price_tail: vec![price],
            buys_1h: 0,
            sells_1h: 0,
            swaps_1h: 0,
            buy_sell_ratio: 1.0,
            recent_events: vec![],
            unique_traders: 0,
            avg_volume_per_trader: 0.0,
            largest_trade: 0.0,
            whale_activity: false,
            momentum: MomentumLabel::Neutral,
            volume_trend: VolumeTrendLabel::Stable,
            price_volatility: VolatilityLabel::Low,
        }
    }

    fn portfolio(cash: f64, tokens: f64, trades: u32, last_tick: Option<u64>) -> PortfolioRow {
        PortfolioRow {
            agent_id: 1,
            arena_id: 1,
            cash_mon: cash,
            token_units: tokens,
            molti_locked: 0.0,
            avg_entry_price: None,
            initial_capital: cash,
            trades_this_window: trades,
            last_trade_tick: last_tick,
        }
    }

    fn buy(size: f64) -> TradeDecision {
        TradeDecision {
            action: TradeAction::Buy,
            size_pct: size,
            confidence: 0.8,
            reason: "signal".to_string(),
        }
    }

    #[test]
    fn s1_pass_through_buy() {
        let out = apply_guardrails(
            &snapshot(96, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Buy);
        assert_eq!(out.size_pct, 0.15);
        assert_eq!(out.reason, "signal");
    }

    #[test]
    fn s2_size_capped_to_max_trade_pct() {
        let out = apply_guardrails(
            &snapshot(96, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.5),
        );
        assert_eq!(out.action, TradeAction::Buy);
        assert_eq!(out.size_pct, 0.2);
    }

    #[test]
    fn s3_cooldown_holds() {
        let out = apply_guardrails(
            &snapshot(92, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Hold);
        assert!(out.reason.contains("cooldown"));
    }

    #[test]
    fn cooldown_boundary_is_strict_less_than() {
        // Exactly cooldown_ticks elapsed passes through.
        let out = apply_guardrails(
            &snapshot(95, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Buy);
    }

    #[test]
    fn s4_position_cap_on_buy_only() {
        let snap = snapshot(96, 1.0, 500, 50_000.0);
        let port = portfolio(50.0, 100.0, 2, Some(90));
        let out = apply_guardrails(&snap, &port, &profile(), &buy(0.1));
        assert_eq!(out.action, TradeAction::Hold);
        assert!(out.reason.contains("position"));

        // SELL reduces exposure and is never position-capped.
        let sell = TradeDecision {
            action: TradeAction::Sell,
            ..buy(0.1)
        };
        let out = apply_guardrails(&snap, &port, &profile(), &sell);
        assert_eq!(out.action, TradeAction::Sell);
    }

    #[test]
    fn events_filter_boundary() {
        let out = apply_guardrails(
            &snapshot(96, 1.5, 99, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Hold);
        assert!(out.reason.contains("events_1h"));

        let out = apply_guardrails(
            &snapshot(96, 1.5, 100, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Buy);
    }

    #[test]
    fn volume_filter_holds() {
        let out = apply_guardrails(
            &snapshot(96, 1.5, 500, 9_999.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Hold);
        assert!(out.reason.contains("volume_1h"));
    }

    #[test]
    fn max_trades_per_window_holds() {
        let out = apply_guardrails(
            &snapshot(96, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 10, Some(80)),
            &profile(),
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Hold);
        assert!(out.reason.contains("max trades"));
    }

    #[test]
    fn zero_size_non_hold_holds() {
        let out = apply_guardrails(
            &snapshot(96, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &buy(0.0),
        );
        assert_eq!(out.action, TradeAction::Hold);
        assert!(out.reason.contains("invalid size"));
    }

    #[test]
    fn hold_passes_unchanged() {
        let hold = TradeDecision {
            action: TradeAction::Hold,
            size_pct: 0.0,
            confidence: 0.3,
            reason: "quiet market".to_string(),
        };
        // Even under an active cooldown the HOLD keeps its own reason.
        let out = apply_guardrails(
            &snapshot(92, 1.5, 500, 50_000.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &profile(),
            &hold,
        );
        assert_eq!(out, hold);
    }

    #[test]
    fn disabled_filters_never_fire() {
        let mut p = profile();
        p.filters.min_events_1h = 0;
        p.filters.min_volume_mon_1h = 0.0;
        let out = apply_guardrails(
            &snapshot(96, 1.5, 0, 0.0),
            &portfolio(100.0, 0.0, 2, Some(90)),
            &p,
            &buy(0.15),
        );
        assert_eq!(out.action, TradeAction::Buy);
    }

    #[test]
    fn deterministic() {
        let snap = snapshot(96, 1.5, 500, 50_000.0);
        let port = portfolio(100.0, 0.0, 2, Some(90));
        let prof = profile();
        let d = buy(0.15);
        assert_eq!(
            apply_guardrails(&snap, &port, &prof, &d),
            apply_guardrails(&snap, &port, &prof, &d)
        );
    }
}
