//! Binance combined bookTicker feed.
//!
//! One WebSocket carries both the USDT and USDC quote books, so this single
//! transport emits two logical sources into the aggregator.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::models::PriceSample;

use super::adapter::{AdapterExit, FeedAdapter};
use super::{SOURCE_BINANCE_USDC, SOURCE_BINANCE_USDT};

const BINANCE_STREAM_URL: &str =
    "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/btcusdc@bookTicker";

#[derive(Debug, Deserialize)]
struct CombinedMsg {
    #[allow(dead_code)]
    stream: String,
    data: BookTickerMsg,
}

/// `{"u":400900217,"s":"BTCUSDT","b":"97001.20","B":"31.2","a":"97001.30","A":"40.7"}`
#[derive(Debug, Deserialize)]
struct BookTickerMsg {
    s: String,
    b: String,
    a: String,
}

pub struct BinanceAdapter;

impl BinanceAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn run_once(&self, out: &mpsc::Sender<PriceSample>) -> AdapterExit {
        let (ws, _) = match connect_async(BINANCE_STREAM_URL).await {
            Ok(ok) => ok,
            Err(e) => return AdapterExit::ConnectFailed(e.into()),
        };
        let (mut write, mut read) = ws.split();

        while let Some(message) = read.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => return AdapterExit::StreamFailed(e.into()),
            };
            match message {
                Message::Text(text) => {
                    if let Some(sample) = parse_book_ticker(&text) {
                        if out.send(sample).await.is_err() {
                            return AdapterExit::CleanClose;
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(frame) => {
                    debug!(?frame, "binance ws close");
                    return AdapterExit::CleanClose;
                }
                _ => {}
            }
        }
        AdapterExit::StreamFailed(anyhow::anyhow!("binance stream ended"))
    }
}

fn parse_book_ticker(text: &str) -> Option<PriceSample> {
    let msg: CombinedMsg = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            // Subscription acks and control frames land here too.
            debug!(error = %e, "unparseable binance message");
            return None;
        }
    };
    let source = match msg.data.s.as_str() {
        "BTCUSDT" => SOURCE_BINANCE_USDT,
        "BTCUSDC" => SOURCE_BINANCE_USDC,
        _ => return None,
    };
    let bid: f64 = msg.data.b.parse().ok()?;
    let ask: f64 = msg.data.a.parse().ok()?;
    if !(bid.is_finite() && ask.is_finite()) || bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    Some(PriceSample {
        source,
        mid: (bid + ask) / 2.0,
        bid,
        ask,
        ts_ms: Utc::now().timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_routes_sub_sources() {
        let usdt = r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"97000.00","B":"1.5","a":"97001.00","A":"2.0"}}"#;
        let sample = parse_book_ticker(usdt).unwrap();
        assert_eq!(sample.source, SOURCE_BINANCE_USDT);
        assert!((sample.mid - 97000.5).abs() < 1e-9);

        let usdc = r#"{"stream":"btcusdc@bookTicker","data":{"u":2,"s":"BTCUSDC","b":"96990.00","B":"1.0","a":"96992.00","A":"1.0"}}"#;
        let sample = parse_book_ticker(usdc).unwrap();
        assert_eq!(sample.source, SOURCE_BINANCE_USDC);
    }

    #[test]
    fn test_parse_drops_garbage() {
        assert!(parse_book_ticker("not json").is_none());
        assert!(parse_book_ticker(r#"{"result":null,"id":1}"#).is_none());
        let bad_price = r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"-1","B":"1","a":"97001.00","A":"2"}}"#;
        assert!(parse_book_ticker(bad_price).is_none());
    }
}
