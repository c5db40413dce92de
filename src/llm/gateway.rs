//! Decision planning: one batched model call per agent per tick.
//!
//! Any timeout, empty content, refusal, schema mismatch or length mismatch
//! collapses into the canonical HOLD fallback; the gateway never propagates
//! an error to the tick.

use crate::llm::client::{ChatBackend, ChatRequest};
use crate::llm::parse::{decision_from_value, decisions_from_value, extract_json};
use crate::llm::prompt::{
    build_user_message, system_prompt_multi, system_prompt_single, ArenaPromptBlock,
};
use crate::models::{AgentProfile, TradeDecision};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const MODEL_TIMEOUT: Duration = Duration::from_secs(30);
const SINGLE_MAX_TOKENS: u32 = 512;
const TEMPERATURE: f64 = 0.2;

/// Everything one planner call needs for one agent.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub agent_name: String,
    pub profile: AgentProfile,
    pub memory: Option<String>,
    /// Ordered arena blocks; decisions come back in this order.
    pub arenas: Vec<ArenaPromptBlock>,
}

pub struct ModelGateway {
    backend: Arc<dyn ChatBackend>,
}

impl ModelGateway {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Completion budget for a multi-arena call.
    pub fn multi_token_budget(n: usize) -> u32 {
        (512 + 256 * n as u32).min(4_096)
    }

    /// Single-arena entry point.
    pub async fn decide_trade(&self, req: &DecisionRequest) -> TradeDecision {
        debug_assert_eq!(req.arenas.len(), 1);
        let chat = ChatRequest {
            system: system_prompt_single(),
            user: build_user_message(&req.profile, req.memory.as_deref(), &req.arenas),
            max_tokens: SINGLE_MAX_TOKENS,
            temperature: TEMPERATURE,
            timeout: MODEL_TIMEOUT,
        };

        match self.complete(&chat).await {
            Some(content) => extract_json(&content)
                .and_then(|v| decision_from_value(&v))
                .unwrap_or_else(|| {
                    warn!(agent = %req.agent_name, "planner output failed schema validation");
                    TradeDecision::model_error()
                }),
            None => TradeDecision::model_error(),
        }
    }

    /// Multi-arena entry point: exactly one decision per arena, in input
    /// order. Always returns `req.arenas.len()` decisions.
    pub async fn decide_trades_for_all_arenas(&self, req: &DecisionRequest) -> Vec<TradeDecision> {
        let n = req.arenas.len();
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![self.decide_trade(req).await];
        }

        let chat = ChatRequest {
            system: system_prompt_multi(n),
            user: build_user_message(&req.profile, req.memory.as_deref(), &req.arenas),
            max_tokens: Self::multi_token_budget(n),
            temperature: TEMPERATURE,
            timeout: MODEL_TIMEOUT,
        };

        let fallback = || vec![TradeDecision::model_error(); n];
        match self.complete(&chat).await {
            Some(content) => extract_json(&content)
                .and_then(|v| decisions_from_value(&v, n))
                .unwrap_or_else(|| {
                    warn!(
                        agent = %req.agent_name,
                        arenas = n,
                        "multi-arena planner output failed validation"
                    );
                    fallback()
                }),
            None => fallback(),
        }
    }

    async fn complete(&self, chat: &ChatRequest) -> Option<String> {
        match tokio::time::timeout(chat.timeout, self.backend.chat(chat)).await {
            Ok(Ok(content)) => Some(content),
            Ok(Err(e)) => {
                warn!(error = %e, "planner call failed");
                None
            }
            Err(_) => {
                warn!("planner call timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::prompt::PortfolioView;
    use crate::models::{
        MarketSnapshot, MomentumLabel, TradeAction, VolatilityLabel, VolumeTrendLabel,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct CannedBackend {
        responses: Mutex<Vec<Result<String>>>,
        last_user: Mutex<Option<String>>,
    }

    impl CannedBackend {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                last_user: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for CannedBackend {
        async fn chat(&self, req: &ChatRequest) -> Result<String> {
            *self.last_user.lock() = Some(req.user.clone());
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(anyhow!("exhausted")))
        }
    }

    fn snapshot(tick: u64) -> MarketSnapshot {
        MarketSnapshot {
            token: "0x00000000000000000000000000000000000000aa".to_string(),
            tick,
            price: 2.0,
            ret_1m_pct: 0.0,
            ret_5m_pct: 0.0,
            vol_5m_pct: 1.0,
            events_1h: 10,
            volume_1h: 100.0,
            price_tail: vec![2.0],
            buys_1h: 5,
            sells_1h: 5,
            swaps_1h: 0,
            buy_sell_ratio: 1.0,
            recent_events: vec![],
            unique_traders: 3,
            avg_volume_per_trader: 33.0,
            largest_trade: 50.0,
            whale_activity: true,
            momentum: MomentumLabel::Neutral,
            volume_trend: VolumeTrendLabel::Stable,
            price_volatility: VolatilityLabel::Low,
        }
    }

    fn request(n: usize) -> DecisionRequest {
        let profile: AgentProfile = serde_json::from_value(serde_json::json!({
            "goal": "maximize_pnl",
            "style": "moderate",
            "constraints": {
                "max_trade_pct": 0.2,
                "max_position_pct": 0.5,
                "cooldown_ticks": 5,
                "max_trades_per_window": 10
            },
            "filters": { "min_events_1h": 0, "min_volume_mon_1h": 0.0 }
        }))
        .unwrap();
        let arenas = (0..n)
            .map(|i| ArenaPromptBlock {
                label: format!("0x{:040x}", i + 1),
                snapshot: snapshot(96),
                portfolio: PortfolioView {
                    cash_mon: 100.0,
                    token_units: 0.0,
                    initial_capital: 100.0,
                    avg_entry_price: None,
                    trades_this_window: 0,
                    last_trade_tick: None,
                },
                filters_effective: false,
            })
            .collect();
        DecisionRequest {
            agent_name: "alpha".to_string(),
            profile,
            memory: None,
            arenas,
        }
    }

    #[tokio::test]
    async fn single_decision_parses() {
        let backend = CannedBackend::new(vec![Ok(
            r#"{"action":"BUY","sizePct":0.1,"confidence":0.8,"reason":"flow"}"#.to_string(),
        )]);
        let gw = ModelGateway::new(backend);
        let d = gw.decide_trade(&request(1)).await;
        assert_eq!(d.action, TradeAction::Buy);
        assert_eq!(d.size_pct, 0.1);
    }

    #[tokio::test]
    async fn multi_length_mismatch_falls_back() {
        let backend = CannedBackend::new(vec![Ok(
            r#"[{"action":"BUY","sizePct":0.1,"confidence":0.8,"reason":"x"}]"#.to_string(),
        )]);
        let gw = ModelGateway::new(backend);
        let ds = gw.decide_trades_for_all_arenas(&request(3)).await;
        assert_eq!(ds.len(), 3);
        assert!(ds.iter().all(|d| d.action == TradeAction::Hold));
        assert!(ds.iter().all(|d| d.reason == "model_error"));
    }

    #[tokio::test]
    async fn backend_error_falls_back_per_arena() {
        let backend = CannedBackend::new(vec![Err(anyhow!("upstream 500"))]);
        let gw = ModelGateway::new(backend);
        let ds = gw.decide_trades_for_all_arenas(&request(2)).await;
        assert_eq!(ds.len(), 2);
        assert!(ds.iter().all(|d| d.reason == "model_error"));
    }

    #[tokio::test]
    async fn multi_valid_array_in_order() {
        let backend = CannedBackend::new(vec![Ok(r#"sure!
```json
[{"action":"BUY","sizePct":0.1,"confidence":0.9,"reason":"a"},
 {"action":"HOLD","sizePct":0.0,"confidence":0.2,"reason":"b"}]
```"#
            .to_string())]);
        let gw = ModelGateway::new(backend);
        let ds = gw.decide_trades_for_all_arenas(&request(2)).await;
        assert_eq!(ds[0].action, TradeAction::Buy);
        assert_eq!(ds[1].action, TradeAction::Hold);
        assert_eq!(ds[1].reason, "b");
    }

    #[test]
    fn token_budget_formula() {
        assert_eq!(ModelGateway::multi_token_budget(2), 1_024);
        assert_eq!(ModelGateway::multi_token_budget(20), 4_096);
    }
}
