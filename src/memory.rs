//! Per-agent memory notes.
//!
//! The tick engine records one compact outcome line per agent per tick; the
//! gateway folds the newest notes into the prompt. A periodic compaction
//! pass collapses old notes so both the table and the prompt stay bounded.

use crate::models::MAX_MEMORY_CHARS;
use crate::store::ArenaDb;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const PROMPT_NOTES: usize = 8;
const KEEP_RAW_NOTES: usize = 24;

/// Record one tick's outcomes as a single note.
pub fn record_tick_note(db: &Arc<ArenaDb>, agent_id: i64, tick: u64, lines: &[String]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let note = lines.join(" | ");
    db.insert_memory_note(agent_id, tick, &note)
}

/// Newest notes joined for the prompt, clamped to the memory budget.
pub fn memory_for_prompt(db: &Arc<ArenaDb>, agent_id: i64) -> Option<String> {
    let notes = match db.recent_memory_notes(agent_id, PROMPT_NOTES) {
        Ok(n) => n,
        Err(e) => {
            warn!(agent = agent_id, error = %e, "memory read failed");
            return None;
        }
    };
    if notes.is_empty() {
        return None;
    }
    let mut joined = notes.join(" | ");
    if joined.chars().count() > MAX_MEMORY_CHARS {
        joined = joined.chars().take(MAX_MEMORY_CHARS).collect();
    }
    Some(joined)
}

/// Periodic compaction of every agent's older notes.
pub fn spawn_summarizer(
    db: Arc<ArenaDb>,
    interval_hours: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_hours, "🧠 Memory summarizer started");
        let period = Duration::from_secs(interval_hours.max(1) * 3_600);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => return,
            }

            let agents = match db.agents_with_memory() {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "memory summarizer query failed");
                    continue;
                }
            };
            for agent_id in agents {
                match db.compact_memory(agent_id, KEEP_RAW_NOTES) {
                    Ok(0) => {}
                    Ok(n) => debug!(agent = agent_id, compacted = n, "memory compacted"),
                    Err(e) => warn!(agent = agent_id, error = %e, "memory compaction failed"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_memory_joins_and_clamps() {
        let db = Arc::new(ArenaDb::in_memory().unwrap());
        let agent = db.insert_agent("0xowner", "alpha", "{}", "0xh").unwrap();
        assert!(memory_for_prompt(&db, agent).is_none());

        record_tick_note(&db, agent, 1, &["t1 buy ok".to_string()]).unwrap();
        record_tick_note(&db, agent, 2, &["t2 hold".to_string(), "t2 sell ok".to_string()])
            .unwrap();
        let mem = memory_for_prompt(&db, agent).unwrap();
        assert!(mem.contains("t1 buy ok"));
        assert!(mem.contains("t2 hold | t2 sell ok"));

        let long = "x".repeat(3_000);
        record_tick_note(&db, agent, 3, &[long]).unwrap();
        let mem = memory_for_prompt(&db, agent).unwrap();
        assert!(mem.chars().count() <= MAX_MEMORY_CHARS);
    }

    #[test]
    fn empty_tick_records_nothing() {
        let db = Arc::new(ArenaDb::in_memory().unwrap());
        let agent = db.insert_agent("0xowner", "alpha", "{}", "0xh").unwrap();
        record_tick_note(&db, agent, 1, &[]).unwrap();
        assert!(memory_for_prompt(&db, agent).is_none());
    }
}
