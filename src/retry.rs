//! Bounded retry for transaction-send operations.
//!
//! Transient errors are classified by substring match over the anyhow cause
//! chain; everything else is terminal and surfaces immediately.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;

const TRANSIENT_MARKERS: &[&str] = &[
    "nonce",
    "replacement transaction",
    "existing transaction had higher priority",
    "internal error",
    "timeout",
    "ECONNRESET",
    "ECONNREFUSED",
    "network",
];

#[derive(Debug, Clone, Copy)]
pub struct RetryOpts {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

/// True when the error (or any cause in its chain) looks transient.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string();
        TRANSIENT_MARKERS
            .iter()
            .any(|marker| msg.to_ascii_lowercase().contains(&marker.to_ascii_lowercase()))
    })
}

/// Run `f` up to `1 + max_retries` times with linear backoff between attempts.
pub async fn retry<T, F, Fut>(label: &str, opts: RetryOpts, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt > opts.max_retries || !is_transient(&e) {
                    return Err(e);
                }
                let delay = Duration::from_millis(opts.base_delay_ms * attempt as u64);
                warn!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
