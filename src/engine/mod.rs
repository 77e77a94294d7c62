//! Matching engine: per-round books, stop sets and the write path.
//!
//! Mutation is serialised through a single write gate plus one store
//! transaction per client operation; readers take snapshots through the
//! state lock and never block the writer for long. The engine owns the
//! in-memory books and stop sets; the store is their durable shadow.

pub mod book;
pub mod lifecycle;
pub mod matching;
pub mod orders;
pub mod settlement;
pub mod stops;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::models::{
    BookSide, Cents, Market, Order, OrderId, OrderStatus, OrderType, Position, RoundOutcome,
    RoundStart, Trade, UserId,
};
use crate::store::{ledger, prices, Store};
use book::{BookEntry, BookSnapshot, RoundBook};

/// Markets map owned by the lifecycle controller; the engine only reads it
/// for phase checks.
pub type SharedMarkets = Arc<RwLock<HashMap<RoundStart, Market>>>;

/// A parked stop-limit order awaiting its trigger.
#[derive(Debug, Clone)]
pub struct StopEntry {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub book_side: BookSide,
    pub limit_price: u8,
    pub stop_price: u8,
    pub shares: u32,
    pub cost_per_share: u8,
    pub created_at_ms: i64,
}

/// Engine push events, fanned out to the gateway.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    OrderAccepted { order: Order },
    OrderUpdate { order: Order },
    OrderCancelled {
        user_id: UserId,
        order_id: OrderId,
        refund_cents: Cents,
        reason: Option<String>,
    },
    TradeExecuted { trade: Trade },
    BalanceUpdate { user_id: UserId, balance_cents: Cents },
    LiquidityAdded {
        user_id: UserId,
        round_start: RoundStart,
        amount_cents: Cents,
        position: Position,
    },
    SettlementPaid {
        user_id: UserId,
        round_start: RoundStart,
        outcome: RoundOutcome,
        payout_cents: Cents,
        balance_cents: Cents,
    },
    BookChanged { round_start: RoundStart },
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) books: HashMap<RoundStart, RoundBook>,
    pub(crate) stops: HashMap<RoundStart, HashMap<OrderId, StopEntry>>,
}

pub struct MatchingEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) markets: SharedMarkets,
    pub(crate) state: RwLock<EngineState>,
    /// Serialises every mutating operation (placement, cancel, trigger,
    /// settlement) against each other and against the lifecycle boundary.
    pub(crate) write_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<EngineEvent>,
    pub(crate) max_shares_per_order: u32,
}

impl MatchingEngine {
    pub fn new(store: Arc<Store>, markets: SharedMarkets, max_shares_per_order: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(4096);
        Arc::new(Self {
            store,
            markets,
            state: RwLock::new(EngineState::default()),
            write_gate: tokio::sync::Mutex::new(()),
            events,
            max_shares_per_order,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // No receivers yet is fine; the gateway attaches at boot.
        let _ = self.events.send(event);
    }

    /// Make the engine ready to take orders for a round.
    pub fn init_round(&self, round_start: RoundStart) {
        let mut state = self.state.write();
        state
            .books
            .entry(round_start)
            .or_insert_with(|| RoundBook::new(round_start));
        state.stops.entry(round_start).or_default();
    }

    /// Drop all in-memory structures of a settled or pruned round.
    pub fn clear_round(&self, round_start: RoundStart) {
        let mut state = self.state.write();
        state.books.remove(&round_start);
        state.stops.remove(&round_start);
    }

    /// User-blind aggregated book snapshot; empty for unknown rounds.
    pub fn orderbook(&self, round_start: RoundStart) -> BookSnapshot {
        let state = self.state.read();
        match state.books.get(&round_start) {
            Some(book) => book.snapshot(),
            None => BookSnapshot {
                round_start,
                bids: Vec::new(),
                asks: Vec::new(),
            },
        }
    }

    /// Re-load resting and parked orders for every non-closed round after a
    /// restart, preserving `created_at` for time priority.
    pub async fn recover(&self) -> Result<usize> {
        let conn = self.store.conn().await;
        let unsettled = prices::get_unsettled_markets(&conn)?;
        let mut restored = 0usize;

        for market in &unsettled {
            let open = ledger::get_open_round_orders(&conn, market.round_start)?;
            let stopped = ledger::get_stopped_round_orders(&conn, market.round_start)?;
            if open.is_empty() && stopped.is_empty() {
                continue;
            }

            let mut state = self.state.write();
            let book = state
                .books
                .entry(market.round_start)
                .or_insert_with(|| RoundBook::new(market.round_start));
            for order in &open {
                debug_assert!(matches!(
                    order.status,
                    OrderStatus::Open | OrderStatus::PartiallyFilled
                ));
                book.insert(BookEntry {
                    order_id: order.id,
                    user_id: order.user_id,
                    price: order.book_price,
                    remaining: order.remaining_shares,
                    cost_per_share: order.cost_per_share,
                    side: order.book_side,
                    created_at_ms: order.created_at_ms,
                });
            }
            let stops = state.stops.entry(market.round_start).or_default();
            for order in &stopped {
                let Some(stop_price) = order.stop_price else {
                    continue;
                };
                debug_assert_eq!(order.order_type, OrderType::StopLimit);
                stops.insert(
                    order.id,
                    StopEntry {
                        order_id: order.id,
                        user_id: order.user_id,
                        book_side: order.book_side,
                        limit_price: order.book_price,
                        stop_price,
                        shares: order.shares,
                        cost_per_share: order.cost_per_share,
                        created_at_ms: order.created_at_ms,
                    },
                );
            }
            restored += open.len() + stopped.len();
        }

        if restored > 0 {
            info!(orders = restored, "restored working orders from store");
        }
        Ok(restored)
    }
}
