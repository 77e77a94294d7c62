//! Kraken ticker feed.
//!
//! Kraken's public v1 stream delivers ticker payloads as positional arrays
//! `[channelID, {..}, "ticker", "XBT/USD"]`, so parsing goes through
//! `serde_json::Value` rather than a typed struct.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::models::PriceSample;

use super::adapter::{AdapterExit, FeedAdapter};
use super::SOURCE_KRAKEN;

const KRAKEN_WSS_URL: &str = "wss://ws.kraken.com";

pub struct KrakenAdapter;

impl KrakenAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KrakenAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedAdapter for KrakenAdapter {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn run_once(&self, out: &mpsc::Sender<PriceSample>) -> AdapterExit {
        let (ws, _) = match connect_async(KRAKEN_WSS_URL).await {
            Ok(ok) => ok,
            Err(e) => return AdapterExit::ConnectFailed(e.into()),
        };
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "event": "subscribe",
            "pair": ["XBT/USD"],
            "subscription": {"name": "ticker"},
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
                    debug!(?frame, "kraken ws close");
                    return AdapterExit::CleanClose;
                }
                _ => {}
            }
        }
        AdapterExit::StreamFailed(anyhow::anyhow!("kraken stream ended"))
    }
}

fn parse_ticker(text: &str) -> Option<PriceSample> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "unparseable kraken message");
            return None;
        }
    };
    // Heartbeats and subscription events are objects; data frames are arrays.
    let frame = value.as_array()?;
    if frame.len() < 4 || frame.get(2)?.as_str() != Some("ticker") {
        return None;
    }
    let payload = frame.get(1)?.as_object()?;

    let first_number = |key: &str| -> Option<f64> {
        payload
            .get(key)?
            .as_array()?
            .first()?
            .as_str()?
            .parse::<f64>()
            .ok()
    };
    let ask = first_number("a")?;
    let bid = first_number("b")?;
    let last = first_number("c")?;
    if !(bid.is_finite() && ask.is_finite() && last.is_finite()) || bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    Some(PriceSample {
        source: SOURCE_KRAKEN,
        mid: if last > 0.0 { last } else { (bid + ask) / 2.0 },
        bid,
        ask,
        ts_ms: Utc::now().timestamp_millis(),
    })
}
