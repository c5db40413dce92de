//! DEX token stream subscription.
//!
//! Single websocket connection pushing per-event records for the configured
//! arena tokens. Each frame is folded into the aggregator immediately (O(1))
//! and buffered for batched persistence into the event store. Reconnects
//! with capped exponential backoff.

use crate::market::MarketAggregator;
use crate::models::{is_hex_address, EventKind, MarketEvent};
use crate::store::EventStore;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_BATCH: usize = 50;

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    kind: String,
    token: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default, rename = "volumeMon")]
    volume_mon: Option<f64>,
    #[serde(default)]
    trader: Option<String>,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default, rename = "txHash")]
    tx_hash: Option<String>,
    #[serde(default, rename = "amountIn")]
    amount_in: Option<f64>,
    #[serde(default, rename = "amountOut")]
    amount_out: Option<f64>,
}

pub struct TokenStream {
    ws_url: String,
    tokens: Vec<String>,
    store: Arc<EventStore>,
    aggregator: Arc<MarketAggregator>,
}

impl TokenStream {
    pub fn new(
        ws_url: String,
        tokens: Vec<String>,
        store: Arc<EventStore>,
        aggregator: Arc<MarketAggregator>,
    ) -> Self {
        Self {
            ws_url,
            tokens: tokens.into_iter().map(|t| t.to_ascii_lowercase()).collect(),
            store,
            aggregator,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(url = %self.ws_url, tokens = self.tokens.len(), "🌊 Token stream starting");
            let mut delay = RECONNECT_BASE;
            loop {
                match self.connect_and_stream(&mut shutdown, &mut delay).await {
                    // Clean shutdown requested from inside the read loop.
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, delay_s = delay.as_secs(), "token stream disconnected; reconnecting");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                delay = (delay * 2).min(RECONNECT_MAX);
            }
        })
    }

    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        reconnect_delay: &mut Duration,
    ) -> Result<()> {
        let (ws, _) = connect_async(&self.ws_url)
            .await
            .context("token stream connect")?;
        let (mut write, mut read) = ws.split();

        let sub = serde_json::json!({
            "method": "subscribe",
            "tokens": self.tokens,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("token stream subscribe")?;
        info!("token stream connected");
        *reconnect_delay = RECONNECT_BASE;

        let mut pending: Vec<MarketEvent> = Vec::with_capacity(FLUSH_BATCH);
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            self.flush(&mut pending);
                            return Err(e).context("token stream read");
                        }
                        None => {
                            self.flush(&mut pending);
                            return Err(anyhow::anyhow!("token stream closed by peer"));
                        }
                    };
                    match msg {
                        Message::Text(text) => {
                            if let Some(ev) = self.handle_frame(&text) {
                                pending.push(ev);
                                if pending.len() >= FLUSH_BATCH {
                                    self.flush(&mut pending);
                                }
                            }
                        }
                        Message::Ping(data) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Message::Close(_) => {
                            self.flush(&mut pending);
                            return Err(anyhow::anyhow!("token stream close frame"));
                        }
                        _ => {}
                    }
                }
                _ = flush.tick() => {
                    self.flush(&mut pending);
                }
                _ = shutdown.changed() => {
                    self.flush(&mut pending);
                    return Ok(());
                }
            }
        }
    }

    /// Parse one frame, fold it into the aggregator, return it for storage.
    fn handle_frame(&self, text: &str) -> Option<MarketEvent> {
        let frame: StreamFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "unparseable stream frame");
                return None;
            }
        };

        let token = frame.token.trim().to_ascii_lowercase();
        if !is_hex_address(&token) {
            debug!(token = %frame.token, "dropping frame with invalid token address");
            return None;
        }
        let kind = EventKind::parse(&frame.kind)?;

        self.aggregator
            .apply_event(&token, frame.price, frame.volume_mon, frame.trader.as_deref());

        Some(MarketEvent {
            token,
            kind,
            price: frame.price,
            volume_mon: frame.volume_mon,
            trader: frame.trader,
            pool: frame.pool,
            tx_hash: frame.tx_hash,
            amount_in: frame.amount_in,
            amount_out: frame.amount_out,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    fn flush(&self, pending: &mut Vec<MarketEvent>) {
        if pending.is_empty() {
            return;
        }
        let stored = self.store.store_batch(pending);
        debug!(received = pending.len(), stored, "flushed stream events");
        pending.clear();
    }
}
