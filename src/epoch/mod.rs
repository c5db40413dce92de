//! Epoch lifecycle: scheduler, renewals, rewards and sweeps.

pub mod controller;
pub mod rewards;

pub use controller::{EpochConfig, EpochController};
pub use rewards::{linear_split, winner_count, CLAIM_WINDOW_DAYS};
