//! Upstream price feeds: one adapter per exchange transport, fanned into
//! the aggregator through a single sample channel.

pub mod adapter;
pub mod aggregator;
pub mod binance;
pub mod bitfinex;
pub mod coinbase;
pub mod kraken;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::models::PriceSample;
use adapter::{spawn_adapter, BackoffPolicy};

pub const SOURCE_BINANCE_USDT: &str = "binance-usdt";
pub const SOURCE_BINANCE_USDC: &str = "binance-usdc";
pub const SOURCE_COINBASE: &str = "coinbase";
pub const SOURCE_KRAKEN: &str = "kraken";
pub const SOURCE_BITFINEX: &str = "bitfinex";

/// Static source weights; they sum to 1.0. A missing source shrinks the
/// denominator of the weighted average, never the numerator.
pub const SOURCE_WEIGHTS: &[(&str, f64)] = &[
    (SOURCE_BINANCE_USDT, 0.30),
    (SOURCE_BINANCE_USDC, 0.10),
    (SOURCE_COINBASE, 0.25),
    (SOURCE_KRAKEN, 0.20),
    (SOURCE_BITFINEX, 0.15),
];

pub fn weight_of(source: &str) -> f64 {
    SOURCE_WEIGHTS
        .iter()
        .find(|(name, _)| *name == source)
        .map(|(_, w)| *w)
        .unwrap_or(0.0)
}

/// Spawn every exchange adapter against the shared sample intake.
pub fn spawn_all(out: mpsc::Sender<PriceSample>) {
    spawn_adapter(
        Arc::new(binance::BinanceAdapter::new()),
        out.clone(),
        BackoffPolicy::default(),
    );
    spawn_adapter(
        Arc::new(coinbase::CoinbaseAdapter::new()),
        out.clone(),
        BackoffPolicy::default(),
    );
    spawn_adapter(
        Arc::new(kraken::KrakenAdapter::new()),
        out.clone(),
        BackoffPolicy::default(),
    );
    spawn_adapter(
        Arc::new(bitfinex::BitfinexAdapter::new()),
        out,
        BackoffPolicy::default(),
    );
}
