//! The decision-and-execution pipeline: guardrails, paper ledger,
//! leaderboard scoring and the tick engine that drives them.

pub mod guardrails;
pub mod leaderboard;
pub mod paper_ledger;
pub mod tick;

pub use guardrails::apply_guardrails;
pub use leaderboard::{compute_rankings, AgentStanding, RankedEntry};
pub use paper_ledger::{execute_paper_trade, PaperTradeOutcome, TradeFill};
pub use tick::{EngineConfig, TickEngine};
