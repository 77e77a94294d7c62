//! Bitfinex REST polling feed.
//!
//! No streaming transport here: the public ticker endpoint is polled at a
//! fixed interval that respects Bitfinex's rate limit. A failed first fetch
//! counts as a connect failure for backoff purposes; failures after data
//! has flowed count as stream failures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::models::PriceSample;

use super::adapter::{AdapterExit, FeedAdapter};
use super::SOURCE_BITFINEX;

const BITFINEX_TICKER_URL: &str = "https://api-pub.bitfinex.com/v2/ticker/tBTCUSD";
/// 90 requests/minute allowed; 2 s keeps comfortable headroom.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct BitfinexAdapter {
    client: reqwest::Client,
    poll_interval: Duration,
}

impl BitfinexAdapter {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            poll_interval,
        }
    }

    async fn fetch(&self) -> anyhow::Result<PriceSample> {
        let ticker: Vec<f64> = self
            .client
            .get(BITFINEX_TICKER_URL)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_ticker(&ticker).ok_or_else(|| anyhow::anyhow!("short or invalid ticker payload"))
    }
}

impl Default for BitfinexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedAdapter for BitfinexAdapter {
    fn name(&self) -> &'static str {
        "bitfinex"
    }

    async fn run_once(&self, out: &mpsc::Sender<PriceSample>) -> AdapterExit {
        let mut delivered = false;
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            poll.tick().await;
            match self.fetch().await {
                Ok(sample) => {
                    delivered = true;
                    if out.send(sample).await.is_err() {
                        return AdapterExit::CleanClose;
                    }
                }
                Err(e) if delivered => return AdapterExit::StreamFailed(e),
                Err(e) => return AdapterExit::ConnectFailed(e),
            }
        }
    }
}

/// `[BID, BID_SIZE, ASK, ASK_SIZE, CHANGE, CHANGE_REL, LAST, VOLUME, HIGH, LOW]`
fn parse_ticker(fields: &[f64]) -> Option<PriceSample> {
    if fields.len() < 7 {
        return None;
    }
    let (bid, ask, last) = (fields[0], fields[2], fields[6]);
    if !(bid.is_finite() && ask.is_finite() && last.is_finite()) || bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    Some(PriceSample {
        source: SOURCE_BITFINEX,
        mid: if last > 0.0 { last } else { (bid + ask) / 2.0 },
        bid,
        ask,
        ts_ms: Utc::now().timestamp_millis(),
    })
}
