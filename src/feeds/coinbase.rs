//! Coinbase Exchange ticker feed.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::models::PriceSample;

use super::adapter::{AdapterExit, FeedAdapter};
use super::SOURCE_COINBASE;

const COINBASE_WSS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
}

pub struct CoinbaseAdapter;

impl CoinbaseAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CoinbaseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn run_once(&self, out: &mpsc::Sender<PriceSample>) -> AdapterExit {
        let (ws, _) = match connect_async(COINBASE_WSS_URL).await {
            Ok(ok) => ok,
            Err(e) => return AdapterExit::ConnectFailed(e.into()),
        };
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "product_ids": ["BTC-USD"],
            "channels": ["ticker"],
        });
        if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
            return AdapterExit::StreamFailed(e.into());
        }

        while let Some(message) = read.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => return AdapterExit::StreamFailed(e.into()),
            };
            match message {
                Message::Text(text) => {
                    if let Some(sample) = parse_ticker(&text) {
                        if out.send(sample).await.is_err() {
                            return AdapterExit::CleanClose;
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(frame) => {
                    debug!(?frame, "coinbase ws close");
                    return AdapterExit::CleanClose;
                }
                _ => {}
            }
        }
        AdapterExit::StreamFailed(anyhow::anyhow!("coinbase stream ended"))
    }
}

fn parse_ticker(text: &str) -> Option<PriceSample> {
    let msg: TickerMsg = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "unparseable coinbase message");
            return None;
        }
    };
    if msg.kind != "ticker" {
        return None;
    }
    let bid: f64 = msg.best_bid?.parse().ok()?;
    let ask: f64 = msg.best_ask?.parse().ok()?;
    if !(bid.is_finite() && ask.is_finite()) || bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    // Last trade price when present, else the book mid.
    let mid = msg
        .price
        .and_then(|p| p.parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p > 0.0)
        .unwrap_or((bid + ask) / 2.0);
    Some(PriceSample {
        source: SOURCE_COINBASE,
        mid,
        bid,
        ask,
        ts_ms: Utc::now().timestamp_millis(),
    })
}
