//! Reference-price aggregator.
//!
//! Keeps the newest sample per source and publishes one weighted-average
//! `AggregatedPrice` per tick. Samples are never dropped for age: when the
//! upstream is the only feed, a stale-but-known price is better than none
//! for one-minute settlement. Staleness is surfaced in the status snapshot
//! instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::models::{AggregatedPrice, PriceSample};

use super::weight_of;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: &'static str,
    pub price: f64,
    pub age_ms: i64,
    pub weight: f64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStatus {
    pub sources: Vec<SourceStatus>,
    pub staleness_threshold_ms: i64,
    pub aggregate_interval_ms: u64,
}

pub struct PriceAggregator {
    samples: RwLock<HashMap<&'static str, PriceSample>>,
    latest: RwLock<Option<AggregatedPrice>>,
    tx: broadcast::Sender<AggregatedPrice>,
    interval_ms: u64,
    staleness_threshold_ms: i64,
}

impl PriceAggregator {
    pub fn new(interval_ms: u64, staleness_threshold_ms: i64) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            samples: RwLock::new(HashMap::new()),
            latest: RwLock::new(None),
            tx,
            interval_ms,
            staleness_threshold_ms,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatedPrice> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<AggregatedPrice> {
        *self.latest.read()
    }

    /// Record the newest sample for its source.
    pub fn ingest(&self, sample: PriceSample) {
        self.samples.write().insert(sample.source, sample);
    }

    /// Weighted average over all sources that have ever reported. Missing
    /// sources reduce the denominator, never the numerator.
    pub fn compute(&self, now_ms: i64) -> AggregatedPrice {
        let samples = self.samples.read();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for sample in samples.values() {
            let w = weight_of(sample.source);
            weighted_sum += w * sample.mid;
            weight_total += w;
        }
        let price = if weight_total > 0.0 {
            Some(weighted_sum / weight_total)
        } else {
            None
        };
        AggregatedPrice {
            price,
            sources: samples.len(),
            ts_ms: now_ms,
        }
    }

    pub fn status(&self, now_ms: i64) -> AggregatorStatus {
        let samples = self.samples.read();
        let mut sources: Vec<SourceStatus> = samples
            .values()
            .map(|s| {
                let age_ms = (now_ms - s.ts_ms).max(0);
                SourceStatus {
                    source: s.source,
                    price: s.mid,
                    age_ms,
                    weight: weight_of(s.source),
                    stale: age_ms > self.staleness_threshold_ms,
                }
            })
            .collect();
        sources.sort_by_key(|s| s.source);
        AggregatorStatus {
            sources,
            staleness_threshold_ms: self.staleness_threshold_ms,
            aggregate_interval_ms: self.interval_ms,
        }
    }

    /// Consume adapter samples and publish one aggregate per tick.
    pub async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<PriceSample>) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                sample = intake.recv() => match sample {
                    Some(sample) => self.ingest(sample),
                    None => {
                        warn!("all feed adapters gone; aggregator stopping");
                        return;
                    }
                },
                _ = tick.tick() => {
                    let agg = self.compute(Utc::now().timestamp_millis());
                    *self.latest.write() = Some(agg);
                    let _ = self.tx.send(agg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{SOURCE_BINANCE_USDT, SOURCE_COINBASE, SOURCE_KRAKEN};

    fn sample(source: &'static str, mid: f64, ts_ms: i64) -> PriceSample {
        PriceSample {
            source,
            mid,
            bid: mid - 0.5,
            ask: mid + 0.5,
            ts_ms,
        }
    }

    #[test]
    fn test_no_sources_publishes_null() {
        let agg = PriceAggregator::new(1000, 30_000);
        let out = agg.compute(1_000);
        assert_eq!(out.price, None);
        assert_eq!(out.sources, 0);
    }

    #[test]
    fn test_weighted_average_over_present_sources() {
        let agg = PriceAggregator::new(1000, 30_000);
        agg.ingest(sample(SOURCE_BINANCE_USDT, 100_000.0, 0)); // w = 0.30
        agg.ingest(sample(SOURCE_COINBASE, 100_100.0, 0)); // w = 0.25

        let out = agg.compute(1_000);
        let expected = (0.30 * 100_000.0 + 0.25 * 100_100.0) / 0.55;
        assert_eq!(out.sources, 2);
        assert!((out.price.unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_newest_sample_per_source_wins() {
        let agg = PriceAggregator::new(1000, 30_000);
        agg.ingest(sample(SOURCE_KRAKEN, 100_000.0, 0));
        agg.ingest(sample(SOURCE_KRAKEN, 100_400.0, 500));

        let out = agg.compute(1_000);
        assert_eq!(out.sources, 1);
        assert!((out.price.unwrap() - 100_400.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_samples_still_count_but_are_flagged() {
        let agg = PriceAggregator::new(1000, 30_000);
        agg.ingest(sample(SOURCE_KRAKEN, 100_000.0, 0));

        // Far past the staleness threshold.
        let now = 120_000;
        let out = agg.compute(now);
        assert!(out.price.is_some());

        let status = agg.status(now);
        assert_eq!(status.sources.len(), 1);
        assert!(status.sources[0].stale);
        assert_eq!(status.sources[0].age_ms, 120_000);
    }
}
