//! Core domain types shared across the exchange.
//!
//! All monetary amounts are integer cents inside the process; dollars only
//! exist as two-decimal strings at the wire boundary. Share prices live on
//! the YES scale as integers in [1, 99].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type OrderId = i64;
pub type TradeId = i64;
/// Minute start of a round, unix epoch milliseconds (UTC).
pub type RoundStart = i64;
/// Integer cents.
pub type Cents = i64;

pub const MIN_BOOK_PRICE: u8 = 1;
pub const MAX_BOOK_PRICE: u8 = 99;
pub const ROUND_DURATION_MS: i64 = 60_000;

/// Format integer cents as a two-decimal dollar string for the wire.
pub fn cents_to_dollars(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a dollar amount ("12.34", "12.3", "12") into integer cents.
/// Rejects negatives, more than two fractional digits and non-numeric input.
pub fn dollars_to_cents(s: &str) -> Option<Cents> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
        return None;
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: Cents = whole.parse().ok()?;
    let frac_cents: Cents = match frac.len() {
        0 => 0,
        1 => frac.parse::<Cents>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac_cents)
}

/// Truncate a unix-millis timestamp down to its minute start.
pub fn minute_start(ts_ms: i64) -> RoundStart {
    ts_ms - ts_ms.rem_euclid(ROUND_DURATION_MS)
}

// ============================================================================
// Markets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provision,
    Active,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Provision => "provision",
            Phase::Active => "active",
            Phase::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "provision" => Some(Phase::Provision),
            "active" => Some(Phase::Active),
            "closed" => Some(Phase::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Up,
    Down,
}

impl RoundOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundOutcome::Up => "up",
            RoundOutcome::Down => "down",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "up" => Some(RoundOutcome::Up),
            "down" => Some(RoundOutcome::Down),
            _ => None,
        }
    }
}

/// One one-minute prediction market, unique by its minute start and slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub round_start: RoundStart,
    pub slug: String,
    pub phase: Phase,
    pub price_to_beat: Option<f64>,
    pub final_price: Option<f64>,
    pub outcome: Option<RoundOutcome>,
}

impl Market {
    pub fn provision(round_start: RoundStart) -> Self {
        Self {
            round_start,
            slug: slug_for(round_start),
            phase: Phase::Provision,
            price_to_beat: None,
            final_price: None,
            outcome: None,
        }
    }

    pub fn close_time(&self) -> i64 {
        self.round_start + ROUND_DURATION_MS
    }
}

/// Market slug: `btc-YYYYMMDD-HHMM` in UTC.
pub fn slug_for(round_start: RoundStart) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(round_start)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH);
    dt.format("btc-%Y%m%d-%H%M").to_string()
}

// ============================================================================
// Orders and trades
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSide {
    Yes,
    No,
}

impl OutcomeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSide::Yes => "yes",
            OutcomeSide::No => "no",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(OutcomeSide::Yes),
            "no" => Some(OutcomeSide::No),
            _ => None,
        }
    }
}

/// Side of the book an order lives on, after normalisation to the YES scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Bid => "bid",
            BookSide::Ask => "ask",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bid" => Some(BookSide::Bid),
            "ask" => Some(BookSide::Ask),
            _ => None,
        }
    }

    pub fn opposite(&self) -> BookSide {
        match self {
            BookSide::Bid => BookSide::Ask,
            BookSide::Ask => BookSide::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    MarketFak,
    MarketFok,
    Limit,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::MarketFak => "market_fak",
            OrderType::MarketFok => "market_fok",
            OrderType::Limit => "limit",
            OrderType::StopLimit => "stop_limit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "market_fak" => Some(OrderType::MarketFak),
            "market_fok" => Some(OrderType::MarketFok),
            "limit" => Some(OrderType::Limit),
            "stop_limit" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    pub fn is_market(&self) -> bool {
        matches!(self, OrderType::MarketFak | OrderType::MarketFok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Pre-trigger state of a stop-limit order. No balance is reserved.
    Stopped,
    /// Reserved for a future time-in-force feature; no code path reaches it.
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Stopped => "stopped",
            OrderStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "stopped" => Some(OrderStatus::Stopped),
            "expired" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub round_start: RoundStart,
    pub side: Side,
    pub outcome: OutcomeSide,
    pub book_side: BookSide,
    pub order_type: OrderType,
    /// Price on the YES scale, [1, 99]. Market orders carry the crossing
    /// pseudo-price (99 for bids, 1 for asks).
    pub book_price: u8,
    pub stop_price: Option<u8>,
    pub shares: u32,
    pub filled_shares: u32,
    pub remaining_shares: u32,
    /// Integer cents reserved from the placer's balance per share.
    pub cost_per_share: u8,
    pub status: OrderStatus,
    pub created_at_ms: i64,
}

impl Order {
    /// Cents reserved for the still-unfilled part of this order.
    pub fn remaining_reservation(&self) -> Cents {
        self.remaining_shares as Cents * self.cost_per_share as Cents
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub round_start: RoundStart,
    pub bid_order_id: OrderId,
    pub ask_order_id: OrderId,
    pub yes_user_id: UserId,
    pub no_user_id: UserId,
    /// Maker's book price on the YES scale.
    pub exec_price: u8,
    pub shares: u32,
    pub created_at_ms: i64,
}

// ============================================================================
// Users and positions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub username: Option<String>,
    pub balance_cents: Cents,
    pub created_at: DateTime<Utc>,
}

/// Per user-per round outcome share holdings. Both counts are non-negative.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub yes_shares: i64,
    pub no_shares: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityProvision {
    pub id: i64,
    pub user_id: UserId,
    pub round_start: RoundStart,
    pub amount_cents: Cents,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Price feed
// ============================================================================

/// One top-of-book observation from a single upstream source.
#[derive(Debug, Clone)]
pub struct PriceSample {
    pub source: &'static str,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
}

/// Weighted-average reference price over all sources that have ever reported.
/// `price` is `None` until the first sample arrives.
#[derive(Debug, Clone, Copy)]
pub struct AggregatedPrice {
    pub price: Option<f64>,
    pub sources: usize,
    pub ts_ms: i64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Application configuration, env-driven with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    /// Shared secret of the identity provider. Absent disables auth.
    pub bot_secret: Option<String>,
    pub aggregate_interval_ms: u64,
    pub staleness_threshold_ms: i64,
    pub max_shares_per_order: u32,
    /// How many future provision markets to keep ahead of the active one.
    pub provision_horizon: i64,
    /// Minutes after close before a market is pruned from memory.
    pub prune_after_min: i64,
    pub orderbook_debounce_ms: u64,
    pub client_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            port: env_parse("PORT", 8080),
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./updown.db".to_string()),
            bot_secret: std::env::var("BOT_SECRET").ok().filter(|s| !s.is_empty()),
            aggregate_interval_ms: env_parse("AGGREGATE_INTERVAL_MS", 1000),
            staleness_threshold_ms: env_parse("STALENESS_THRESHOLD_MS", 30_000),
            max_shares_per_order: env_parse("MAX_SHARES_PER_ORDER", 10_000),
            provision_horizon: env_parse("PROVISION_HORIZON_MIN", 5),
            prune_after_min: env_parse("PRUNE_AFTER_MIN", 10),
            orderbook_debounce_ms: env_parse("ORDERBOOK_DEBOUNCE_MS", 50),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", 256),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_format() {
        // 2024-03-05 14:07:00 UTC
        let ts = Utc
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(slug_for(ts), "btc-20240305-1407");
    }

    #[test]
    fn test_minute_start() {
        let ts = 1_700_000_000_123i64;
        let start = minute_start(ts);
        assert_eq!(start % 60_000, 0);
        assert!(start <= ts && ts - start < 60_000);
        assert_eq!(minute_start(start), start);
    }

    #[test]
    fn test_cents_to_dollars() {
        assert_eq!(cents_to_dollars(0), "0.00");
        assert_eq!(cents_to_dollars(5), "0.05");
        assert_eq!(cents_to_dollars(360), "3.60");
        assert_eq!(cents_to_dollars(100_000), "1000.00");
        assert_eq!(cents_to_dollars(-150), "-1.50");
    }

    #[test]
    fn test_dollars_to_cents() {
        assert_eq!(dollars_to_cents("12.34"), Some(1234));
        assert_eq!(dollars_to_cents("12.3"), Some(1230));
        assert_eq!(dollars_to_cents("12"), Some(1200));
        assert_eq!(dollars_to_cents("0.05"), Some(5));
        assert_eq!(dollars_to_cents("-1.00"), None);
        assert_eq!(dollars_to_cents("1.234"), None);
        assert_eq!(dollars_to_cents("abc"), None);
        assert_eq!(dollars_to_cents(""), None);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            OrderStatus::Open,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Stopped,
            OrderStatus::Expired,
        ] {
            assert_eq!(OrderStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::from_str("bogus"), None);
    }
}
