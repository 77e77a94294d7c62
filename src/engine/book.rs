//! Per-round central limit order book.
//!
//! Two `BTreeMap`s keyed by a side-aware compound key give price-time
//! priority in iteration order: bids price-descending, asks price-ascending,
//! ties broken by earlier `created_at` then insertion id. A per-price sum
//! cache backs the aggregated display snapshot so no user data leaks out.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::models::{BookSide, OrderId, RoundStart, UserId};

/// One resting order as the book sees it.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub price: u8,
    pub remaining: u32,
    pub cost_per_share: u8,
    pub side: BookSide,
    pub created_at_ms: i64,
}

/// Compound ordering key. The `is_bid` flag inverts the price component so
/// that natural BTreeMap iteration always walks best-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BookKey {
    price: u8,
    created_at_ms: i64,
    order_id: OrderId,
    is_bid: bool,
}

impl Ord for BookKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let by_price = if self.is_bid {
            other.price.cmp(&self.price)
        } else {
            self.price.cmp(&other.price)
        };
        by_price
            .then(self.created_at_ms.cmp(&other.created_at_ms))
            .then(self.order_id.cmp(&other.order_id))
            .then(self.is_bid.cmp(&other.is_bid))
    }
}

impl PartialOrd for BookKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Aggregated price level for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookLevel {
    pub price: u8,
    pub shares: u32,
}

/// User-blind snapshot of one round's book.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub round_start: RoundStart,
    /// Price descending.
    pub bids: Vec<BookLevel>,
    /// Price ascending.
    pub asks: Vec<BookLevel>,
}

#[derive(Debug)]
pub struct RoundBook {
    round_start: RoundStart,
    bids: BTreeMap<BookKey, BookEntry>,
    asks: BTreeMap<BookKey, BookEntry>,
    /// order_id -> key, for unlink without scanning.
    index: HashMap<OrderId, BookKey>,
    bid_levels: BTreeMap<u8, u32>,
    ask_levels: BTreeMap<u8, u32>,
}

impl RoundBook {
    pub fn new(round_start: RoundStart) -> Self {
        Self {
            round_start,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            bid_levels: BTreeMap::new(),
            ask_levels: BTreeMap::new(),
        }
    }

    pub fn round_start(&self) -> RoundStart {
        self.round_start
    }

    pub fn insert(&mut self, entry: BookEntry) {
        debug_assert!(entry.remaining > 0);
        let key = BookKey {
            price: entry.price,
            created_at_ms: entry.created_at_ms,
            order_id: entry.order_id,
            is_bid: entry.side == BookSide::Bid,
        };
        let (map, levels) = self.side_mut(entry.side);
        *levels.entry(entry.price).or_insert(0) += entry.remaining;
        map.insert(key, entry.clone());
        self.index.insert(entry.order_id, key);
    }

    /// Unlink an order entirely; sorted positions of the rest are untouched.
    pub fn remove(&mut self, order_id: OrderId) -> Option<BookEntry> {
        let key = self.index.remove(&order_id)?;
        let side = if key.is_bid { BookSide::Bid } else { BookSide::Ask };
        let (map, levels) = self.side_mut(side);
        let entry = map.remove(&key)?;
        match levels.get_mut(&entry.price) {
            Some(total) if *total > entry.remaining => *total -= entry.remaining,
            _ => {
                levels.remove(&entry.price);
            }
        }
        Some(entry)
    }

    /// Reduce a resting order by `qty` filled shares, unlinking it when it
    /// reaches zero. Returns the remaining shares after the reduction.
    pub fn reduce(&mut self, order_id: OrderId, qty: u32) -> Option<u32> {
        let key = *self.index.get(&order_id)?;
        let side = if key.is_bid { BookSide::Bid } else { BookSide::Ask };
        let (map, levels) = self.side_mut(side);
        let entry = map.get_mut(&key)?;
        let qty = qty.min(entry.remaining);
        entry.remaining -= qty;
        let left = entry.remaining;
        let price = entry.price;
        match levels.get_mut(&price) {
            Some(total) if *total > qty => *total -= qty,
            _ => {
                levels.remove(&price);
            }
        }
        if left == 0 {
            map.remove(&key);
            self.index.remove(&order_id);
        }
        Some(left)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    pub fn best_bid(&self) -> Option<u8> {
        self.bids.keys().next().map(|k| k.price)
    }

    pub fn best_ask(&self) -> Option<u8> {
        self.asks.keys().next().map(|k| k.price)
    }

    /// Entries of one side in match priority order.
    pub fn iter_side(&self, side: BookSide) -> impl Iterator<Item = &BookEntry> {
        match side {
            BookSide::Bid => self.bids.values(),
            BookSide::Ask => self.asks.values(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            round_start: self.round_start,
            bids: self
                .bid_levels
                .iter()
                .rev()
                .map(|(&price, &shares)| BookLevel { price, shares })
                .collect(),
            asks: self
                .ask_levels
                .iter()
                .map(|(&price, &shares)| BookLevel { price, shares })
                .collect(),
        }
    }

    fn side_mut(
        &mut self,
        side: BookSide,
    ) -> (&mut BTreeMap<BookKey, BookEntry>, &mut BTreeMap<u8, u32>) {
        match side {
            BookSide::Bid => (&mut self.bids, &mut self.bid_levels),
            BookSide::Ask => (&mut self.asks, &mut self.ask_levels),
        }
    }
}
