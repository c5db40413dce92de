//! Off-chain trade projection.
//!
//! Pure bookkeeping: the next portfolio snapshot and the trade record
//! implied by a decision at a price. The on-chain read afterwards overwrites
//! cash/token/locked with authoritative values; this projection supplies
//! `trade_value_mon` and the avg-entry-price lineage the contract does not
//! expose.

use crate::models::{PortfolioRow, TradeAction, TradeDecision};

/// The projected fill for a non-HOLD decision.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFill {
    pub action: TradeAction,
    pub size_pct: f64,
    pub price: f64,
    pub trade_value_mon: f64,
    pub avg_entry_price_before: Option<f64>,
    pub cash_after: f64,
    pub token_after: f64,
}

#[derive(Debug, Clone)]
pub struct PaperTradeOutcome {
    pub next: PortfolioRow,
    pub fill: Option<TradeFill>,
}

pub fn execute_paper_trade(
    market_tick: u64,
    state: &PortfolioRow,
    price: f64,
    decision: &TradeDecision,
) -> PaperTradeOutcome {
    let mut next = state.clone();

    if decision.action == TradeAction::Hold || !(price > 0.0) || !price.is_finite() {
        return PaperTradeOutcome { next, fill: None };
    }

    let avg_entry_price_before = state.avg_entry_price;
    let size_pct = decision.size_pct.clamp(0.0, 1.0);

    let fill = match decision.action {
        TradeAction::Buy => {
            let spent = state.cash_mon * size_pct;
            let delivered = spent / price;
            next.cash_mon = state.cash_mon - spent;
            next.token_units = state.token_units + delivered;
            next.avg_entry_price = if next.token_units > 0.0 {
                let prior_cost = state.token_units * state.avg_entry_price.unwrap_or(0.0);
                Some((prior_cost + spent) / next.token_units)
            } else {
                state.avg_entry_price
            };
            TradeFill {
                action: TradeAction::Buy,
                size_pct,
                price,
                trade_value_mon: spent,
                avg_entry_price_before,
                cash_after: next.cash_mon,
                token_after: next.token_units,
            }
        }
        TradeAction::Sell => {
            let delivered = state.token_units * size_pct;
            let received = delivered * price;
            next.cash_mon = state.cash_mon + received;
            next.token_units = state.token_units - delivered;
            if next.token_units <= 0.0 {
                next.token_units = 0.0;
                next.avg_entry_price = None;
            }
            TradeFill {
                action: TradeAction::Sell,
                size_pct,
                price,
                trade_value_mon: received,
                avg_entry_price_before,
                cash_after: next.cash_mon,
                token_after: next.token_units,
            }
        }
        TradeAction::Hold => unreachable!(),
    };

    next.trades_this_window = state.trades_this_window + 1;
    next.last_trade_tick = Some(market_tick);

    PaperTradeOutcome {
        next,
        fill: Some(fill),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(cash: f64, tokens: f64, aep: Option<f64>) -> PortfolioRow {
        PortfolioRow {
            agent_id: 1,
            arena_id: 1,
            cash_mon: cash,
            token_units: tokens,
            molti_locked: 0.0,
            avg_entry_price: aep,
            initial_capital: cash,
            trades_this_window: 3,
            last_trade_tick: Some(10),
        }
    }

    fn decision(action: TradeAction, size: f64) -> TradeDecision {
        TradeDecision {
            action,
            size_pct: size,
            confidence: 0.7,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn buy_spends_and_averages_entry() {
        let out = execute_paper_trade(42, &state(10.0, 0.0, None), 2.0, &decision(TradeAction::Buy, 0.1));
        let fill = out.fill.unwrap();
        assert_eq!(fill.trade_value_mon, 1.0);
        assert_eq!(fill.cash_after, 9.0);
        assert_eq!(fill.token_after, 0.5);
        assert_eq!(fill.avg_entry_price_before, None);
        assert_eq!(out.next.avg_entry_price, Some(2.0));
        assert_eq!(out.next.trades_this_window, 4);
        assert_eq!(out.next.last_trade_tick, Some(42));
    }

    #[test]
    fn buy_value_weights_existing_position() {
        // 1 token at 1.0, buying 3.0 cash worth at 3.0 => +1 token.
        let out = execute_paper_trade(
            42,
            &state(6.0, 1.0, Some(1.0)),
            3.0,
            &decision(TradeAction::Buy, 0.5),
        );
        let next = out.next;
        assert_eq!(next.token_units, 2.0);
        // (1*1.0 + 3.0) / 2 = 2.0
        assert_eq!(next.avg_entry_price, Some(2.0));
    }

    #[test]
    fn sell_partial_keeps_entry_price() {
        let out = execute_paper_trade(
            42,
            &state(0.0, 4.0, Some(1.5)),
            2.0,
            &decision(TradeAction::Sell, 0.25),
        );
        let fill = out.fill.unwrap();
        assert_eq!(fill.trade_value_mon, 2.0);
        assert_eq!(out.next.token_units, 3.0);
        assert_eq!(out.next.cash_mon, 2.0);
        assert_eq!(out.next.avg_entry_price, Some(1.5));
    }

    #[test]
    fn sell_full_clears_entry_price() {
        let out = execute_paper_trade(
            42,
            &state(0.0, 4.0, Some(1.5)),
            2.0,
            &decision(TradeAction::Sell, 1.0),
        );
        assert_eq!(out.next.token_units, 0.0);
        assert_eq!(out.next.avg_entry_price, None);
        assert_eq!(out.next.cash_mon, 8.0);
    }

    #[test]
    fn hold_is_a_no_op() {
        let before = state(10.0, 1.0, Some(1.0));
        let out = execute_paper_trade(42, &before, 2.0, &decision(TradeAction::Hold, 0.0));
        assert!(out.fill.is_none());
        assert_eq!(out.next.trades_this_window, before.trades_this_window);
        assert_eq!(out.next.last_trade_tick, before.last_trade_tick);
        assert_eq!(out.next.cash_mon, before.cash_mon);
    }

    #[test]
    fn nonpositive_price_produces_no_fill() {
        let before = state(10.0, 1.0, Some(1.0));
        let out = execute_paper_trade(42, &before, 0.0, &decision(TradeAction::Buy, 0.5));
        assert!(out.fill.is_none());
        assert_eq!(out.next.cash_mon, before.cash_mon);
    }
}
