//! Core domain types shared across the engine, stores and gateways.
//!
//! Agent profiles arrive as untyped JSON from storage and are validated here
//! into strict values before any tick uses them. All monetary quantities are
//! `f64` internally and 18-decimal fixed-point wei at the chain boundary.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub const DEFAULT_TICK_SECONDS: u64 = 60;
pub const DEFAULT_EPOCH_DURATION_MINUTES: i64 = 1440;
pub const DEFAULT_RENEWAL_FEE_MOLTI: f64 = 100.0;
pub const MAX_CUSTOM_RULES_CHARS: usize = 500;
pub const MAX_MEMORY_CHARS: usize = 1000;

/// Process configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    pub tick_seconds: u64,
    /// Event retention in hours for the store cleanup loop.
    pub cleanup_hours: i64,
    pub arena_tokens: Vec<String>,
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub indexer_rpc_url: String,
    pub chain_id: u64,
    pub epoch_duration_minutes: i64,
    pub renewal_fee_molti: f64,
    pub memory_summarization_interval_hours: u64,
    pub operator_private_key: String,
    pub bundler_url: String,
    pub bundler_api_key: Option<String>,
    pub wallet_service_url: Option<String>,
    pub llm_api_key: String,
    pub llm_model: String,
    pub nad_network: NadNetwork,
    pub use_dex_stream: bool,
    pub events_db_path: String,
    pub arena_db_path: String,
    pub molti_token_address: String,
    pub arena_contract_address: String,
    pub entry_point_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NadNetwork {
    Testnet,
    Mainnet,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let tick_seconds = env_parse("TICK_SECONDS", DEFAULT_TICK_SECONDS);
        let cleanup_hours = env_parse("CLEANUP_TIME", 24i64).max(1);

        let arena_tokens: Vec<String> = std::env::var("ARENA_TOKENS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| is_hex_address(s))
            .collect();

        let rpc_url = std::env::var("RPC_URL").context("RPC_URL missing (set env var)")?;
        let ws_url = std::env::var("WS_URL").ok().filter(|s| !s.trim().is_empty());
        let indexer_rpc_url = std::env::var("INDEXER_RPC_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| rpc_url.clone());

        let nad_network = match std::env::var("NAD_NETWORK").as_deref() {
            Ok("mainnet") => NadNetwork::Mainnet,
            _ => NadNetwork::Testnet,
        };
        let default_chain_id = match nad_network {
            NadNetwork::Testnet => 10143u64,
            NadNetwork::Mainnet => 143u64,
        };
        let chain_id = env_parse("CHAIN_ID", default_chain_id);

        let epoch_duration_minutes =
            env_parse("EPOCH_DURATION_MINUTES", DEFAULT_EPOCH_DURATION_MINUTES).clamp(1, 10_080);
        let renewal_fee_molti = env_parse("EPOCH_RENEWAL_FEE_MOLTI", DEFAULT_RENEWAL_FEE_MOLTI);
        let memory_summarization_interval_hours =
            env_parse("MEMORY_SUMMARIZATION_INTERVAL_HOURS", 6u64).max(1);

        let operator_private_key = std::env::var("OPERATOR_PRIVATE_KEY")
            .context("OPERATOR_PRIVATE_KEY missing (set env var)")?;
        let bundler_url = std::env::var("BUNDLER_URL").context("BUNDLER_URL missing")?;
        let bundler_api_key = std::env::var("BUNDLER_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let wallet_service_url = std::env::var("WALLET_SERVICE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let llm_api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY missing (set env var)")?;
        let llm_model = std::env::var("LLM_MODEL")
            .unwrap_or_else(|_| "google/gemini-3.0-flash".to_string());

        let use_dex_stream = std::env::var("USE_DEX_STREAM")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let events_db_path = resolve_data_path(
            std::env::var("EVENTS_DB_PATH").ok(),
            "moltiarena_events.db",
        );
        let arena_db_path =
            resolve_data_path(std::env::var("ARENA_DB_PATH").ok(), "moltiarena_arena.db");

        let molti_token_address = require_address("MOLTI_TOKEN_ADDRESS")?;
        let arena_contract_address = require_address("ARENA_CONTRACT_ADDRESS")?;
        let entry_point_address = std::env::var("ENTRY_POINT_ADDRESS")
            .ok()
            .filter(|s| is_hex_address(&s.to_ascii_lowercase()))
            .unwrap_or_else(|| "0x0000000071727de22e5e9d8baf0edac6f37da032".to_string());

        Ok(Self {
            tick_seconds,
            cleanup_hours,
            arena_tokens,
            rpc_url,
            ws_url,
            indexer_rpc_url,
            chain_id,
            epoch_duration_minutes,
            renewal_fee_molti,
            memory_summarization_interval_hours,
            operator_private_key,
            bundler_url,
            bundler_api_key,
            wallet_service_url,
            llm_api_key,
            llm_model,
            nad_network,
            use_dex_stream,
            events_db_path,
            arena_db_path,
            molti_token_address,
            arena_contract_address,
            entry_point_address,
        })
    }

    /// Demo mode: sub-daily epochs anchored from the transition moment.
    pub fn demo_mode(&self) -> bool {
        self.epoch_duration_minutes < 1440
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn require_address(key: &str) -> Result<String> {
    let v = std::env::var(key)
        .with_context(|| format!("{key} missing (set env var)"))?
        .trim()
        .to_ascii_lowercase();
    if !is_hex_address(&v) {
        return Err(anyhow!("{key} is not a 20-byte hex address: {v}"));
    }
    Ok(v)
}

pub fn is_hex_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

pub fn is_hex_tx_hash(s: &str) -> bool {
    s.len() == 66
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    // Anchor relative paths to the crate directory, not the caller's cwd.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

// ---------------------------------------------------------------------------
// Actions & decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            _ => None,
        }
    }

    /// Contract enum value: BUY=0, SELL=1, HOLD=2.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Buy => 0,
            Self::Sell => 1,
            Self::Hold => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        }
    }
}

/// A planner proposal or guardrail-finalized decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub action: TradeAction,
    pub size_pct: f64,
    pub confidence: f64,
    pub reason: String,
}

impl TradeDecision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            size_pct: 0.0,
            confidence: 0.0,
            reason: reason.into(),
        }
    }

    pub fn model_error() -> Self {
        Self::hold("model_error")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionStatus {
    Pending,
    Success,
    Failed,
    SkippedNoGas,
}

impl DecisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::SkippedNoGas => "skipped_no_gas",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped_no_gas" => Some(Self::SkippedNoGas),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentGoal {
    MaximizePnl,
    RiskAdjusted,
    MinDrawdown,
}

impl AgentGoal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaximizePnl => "maximize_pnl",
            Self::RiskAdjusted => "risk_adjusted",
            Self::MinDrawdown => "min_drawdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStyle {
    Conservative,
    Moderate,
    Aggressive,
}

impl AgentStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConstraints {
    /// Per-trade size ceiling as a fraction of the relevant balance, (0, 1].
    pub max_trade_pct: f64,
    /// Token exposure ceiling as a fraction of equity, (0, 1].
    pub max_position_pct: f64,
    /// Minimum ticks between trades.
    pub cooldown_ticks: u32,
    pub max_trades_per_window: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFilters {
    pub min_events_1h: u32,
    pub min_volume_mon_1h: f64,
}

impl ProfileFilters {
    /// Both thresholds at 0 disables the market-activity filter rules.
    pub fn disabled(&self) -> bool {
        self.min_events_1h == 0 && self.min_volume_mon_1h == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub goal: AgentGoal,
    pub style: AgentStyle,
    pub constraints: ProfileConstraints,
    pub filters: ProfileFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_rules: Option<String>,
}

impl AgentProfile {
    /// Validate untyped profile JSON from storage into a strict profile.
    pub fn validate(profile_json: &str) -> Result<Self> {
        let profile: AgentProfile =
            serde_json::from_str(profile_json).context("profile json parse")?;

        let c = &profile.constraints;
        if !(c.max_trade_pct > 0.0 && c.max_trade_pct <= 1.0) {
            return Err(anyhow!("max_trade_pct out of (0, 1]: {}", c.max_trade_pct));
        }
        if !(c.max_position_pct > 0.0 && c.max_position_pct <= 1.0) {
            return Err(anyhow!(
                "max_position_pct out of (0, 1]: {}",
                c.max_position_pct
            ));
        }
        let f = &profile.filters;
        if !f.min_volume_mon_1h.is_finite() || f.min_volume_mon_1h < 0.0 {
            return Err(anyhow!("min_volume_mon_1h invalid: {}", f.min_volume_mon_1h));
        }
        if let Some(rules) = &profile.custom_rules {
            if rules.chars().count() > MAX_CUSTOM_RULES_CHARS {
                return Err(anyhow!("custom_rules exceeds {MAX_CUSTOM_RULES_CHARS} chars"));
            }
        }
        Ok(profile)
    }

    /// Stable per-version hash over the canonical JSON encoding.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("0x{}", hex::encode(digest))
    }
}

// ---------------------------------------------------------------------------
// Entity rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: i64,
    pub onchain_id: Option<u64>,
    pub owner: String,
    pub name: String,
    pub smart_account: Option<String>,
    pub encrypted_signer_key: Option<String>,
    pub profile_json: String,
}

#[derive(Debug, Clone)]
pub struct ArenaRow {
    pub id: i64,
    pub onchain_id: Option<u64>,
    pub token: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EpochRow {
    pub id: i64,
    pub arena_id: i64,
    pub onchain_epoch_id: u64,
    pub start_at: i64,
    pub end_at: i64,
    pub status: EpochStatus,
    pub rewards_distributed_at: Option<i64>,
    pub rewards_swept_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStatus {
    Active,
    Ended,
}

impl EpochStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "ended" {
            Self::Ended
        } else {
            Self::Active
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortfolioRow {
    pub agent_id: i64,
    pub arena_id: i64,
    pub cash_mon: f64,
    pub token_units: f64,
    pub molti_locked: f64,
    pub avg_entry_price: Option<f64>,
    pub initial_capital: f64,
    pub trades_this_window: u32,
    pub last_trade_tick: Option<u64>,
}

impl PortfolioRow {
    pub fn equity(&self, price: f64) -> f64 {
        self.cash_mon + self.token_units * price
    }

    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.initial_capital > 0.0 {
            (self.equity(price) - self.initial_capital) / self.initial_capital * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub agent_id: i64,
    pub arena_id: i64,
    pub epoch_id: i64,
    pub tick: u64,
    pub action: TradeAction,
    pub size_pct: f64,
    pub price: f64,
    pub trade_value_mon: f64,
    pub avg_entry_price_before: Option<f64>,
    pub cash_after: f64,
    pub token_after: f64,
    pub reason: String,
    pub tx_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Market events & snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Buy,
    Sell,
    Swap,
    Create,
    Sync,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
            Self::Swap => "Swap",
            Self::Create => "Create",
            Self::Sync => "Sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Buy" => Some(Self::Buy),
            "Sell" => Some(Self::Sell),
            "Swap" => Some(Self::Swap),
            "Create" => Some(Self::Create),
            "Sync" => Some(Self::Sync),
            _ => None,
        }
    }

    pub fn is_trade(self) -> bool {
        matches!(self, Self::Buy | Self::Sell | Self::Swap)
    }
}

/// A raw market event from the token stream.
#[derive(Debug, Clone)]
pub struct MarketEvent {
    pub token: String,
    pub kind: EventKind,
    pub price: Option<f64>,
    pub volume_mon: Option<f64>,
    pub trader: Option<String>,
    pub pool: Option<String>,
    pub tx_hash: Option<String>,
    pub amount_in: Option<f64>,
    pub amount_out: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentumLabel {
    Buying,
    Selling,
    Neutral,
}

impl MomentumLabel {
    pub fn code(self) -> char {
        match self {
            Self::Buying => 'B',
            Self::Selling => 'S',
            Self::Neutral => 'N',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeTrendLabel {
    Increasing,
    Decreasing,
    Stable,
}

impl VolumeTrendLabel {
    pub fn code(self) -> char {
        match self {
            Self::Increasing => 'I',
            Self::Decreasing => 'D',
            Self::Stable => 'S',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityLabel {
    High,
    Medium,
    Low,
}

impl VolatilityLabel {
    pub fn code(self) -> char {
        match self {
            Self::High => 'H',
            Self::Medium => 'M',
            Self::Low => 'L',
        }
    }
}

/// Compact recent event used in snapshots and prompts: [kind, price, volume].
#[derive(Debug, Clone, PartialEq)]
pub struct CompactEvent {
    pub kind: EventKind,
    pub price: f64,
    pub volume_mon: f64,
}

/// Per-token immutable record of derived market features, emitted each tick.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub token: String,
    pub tick: u64,
    pub price: f64,
    pub ret_1m_pct: f64,
    pub ret_5m_pct: f64,
    pub vol_5m_pct: f64,
    pub events_1h: u64,
    pub volume_1h: f64,
    pub price_tail: Vec<f64>,
    pub buys_1h: u64,
    pub sells_1h: u64,
    pub swaps_1h: u64,
    pub buy_sell_ratio: f64,
    pub recent_events: Vec<CompactEvent>,
    pub unique_traders: u64,
    pub avg_volume_per_trader: f64,
    pub largest_trade: f64,
    pub whale_activity: bool,
    pub momentum: MomentumLabel,
    pub volume_trend: VolumeTrendLabel,
    pub price_volatility: VolatilityLabel,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_json() -> String {
        serde_json::json!({
            "goal": "risk_adjusted",
            "style": "moderate",
            "constraints": {
                "max_trade_pct": 0.2,
                "max_position_pct": 0.5,
                "cooldown_ticks": 5,
                "max_trades_per_window": 10
            },
            "filters": { "min_events_1h": 100, "min_volume_mon_1h": 10000.0 }
        })
        .to_string()
    }

    #[test]
    fn profile_validates_and_hashes_stably() {
        let p = AgentProfile::validate(&profile_json()).unwrap();
        assert_eq!(p.goal, AgentGoal::RiskAdjusted);
        assert_eq!(p.style, AgentStyle::Moderate);
        assert_eq!(p.hash(), AgentProfile::validate(&profile_json()).unwrap().hash());
        assert!(p.hash().starts_with("0x"));
    }

    #[test]
    fn profile_rejects_out_of_range_constraints() {
        let mut v: serde_json::Value = serde_json::from_str(&profile_json()).unwrap();
        v["constraints"]["max_trade_pct"] = serde_json::json!(1.5);
        assert!(AgentProfile::validate(&v.to_string()).is_err());

        let mut v: serde_json::Value = serde_json::from_str(&profile_json()).unwrap();
        v["goal"] = serde_json::json!("to_the_moon");
        assert!(AgentProfile::validate(&v.to_string()).is_err());
    }

    #[test]
    fn profile_rejects_oversized_custom_rules() {
        let mut v: serde_json::Value = serde_json::from_str(&profile_json()).unwrap();
        v["custom_rules"] = serde_json::json!("x".repeat(MAX_CUSTOM_RULES_CHARS + 1));
        assert!(AgentProfile::validate(&v.to_string()).is_err());
    }

    #[test]
    fn action_contract_encoding() {
        assert_eq!(TradeAction::Buy.as_u8(), 0);
        assert_eq!(TradeAction::Sell.as_u8(), 1);
        assert_eq!(TradeAction::Hold.as_u8(), 2);
        assert_eq!(TradeAction::parse("sell"), Some(TradeAction::Sell));
        assert_eq!(TradeAction::parse("nope"), None);
    }

    #[test]
    fn filters_disabled_convention() {
        let f = ProfileFilters {
            min_events_1h: 0,
            min_volume_mon_1h: 0.0,
        };
        assert!(f.disabled());
        let f = ProfileFilters {
            min_events_1h: 1,
            min_volume_mon_1h: 0.0,
        };
        assert!(!f.disabled());
    }
}
