//! Persistence layer: raw market events and arena entity state.

pub mod arena_db;
pub mod event_store;

pub use arena_db::{ArenaDb, ArenaWork, EpochTradeStats, UnclaimedWinner};
pub use event_store::{EventStore, TraderMetrics, WindowStats};
