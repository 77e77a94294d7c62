//! Session gateway: connection registry, per-user fan-out and broadcast
//! plumbing between the engine/lifecycle/aggregator buses and client
//! sockets.
//!
//! Every connection owns a bounded outbound queue. Under pressure the
//! oldest sheddable frame (price ticks, book refreshes) goes first; trades,
//! settlements and order events are never dropped. Order-book broadcasts
//! are debounced so one round emits at most one snapshot per window.

pub mod http;
pub mod messages;
pub mod ws;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::engine::lifecycle::{LifecycleEvent, RoundLifecycle};
use crate::engine::{EngineEvent, MatchingEngine};
use crate::feeds::aggregator::PriceAggregator;
use crate::models::{cents_to_dollars, slug_for, RoundStart, UserId};
use messages::ServerMessage;

pub type ConnId = u64;

/// One frame queued for a client socket.
#[derive(Debug, Clone)]
pub struct Frame {
    pub critical: bool,
    pub text: String,
}

/// Bounded outbound queue with shed-oldest-non-critical overflow.
pub struct OutboundQueue {
    frames: Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        })
    }

    pub fn push(&self, frame: Frame) {
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                if let Some(pos) = frames.iter().position(|f| !f.critical) {
                    frames.remove(pos);
                } else if !frame.critical {
                    // Full of critical traffic; shed the incoming tick.
                    return;
                }
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Frame {
        loop {
            if let Some(frame) = self.frames.lock().pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

struct ClientSlot {
    queue: Arc<OutboundQueue>,
    user_id: Option<UserId>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ConnId, ClientSlot>,
    by_user: HashMap<UserId, HashSet<ConnId>>,
}

pub struct Gateway {
    registry: RwLock<Registry>,
    next_conn_id: AtomicU64,
    dirty_books: Mutex<HashSet<RoundStart>>,
}

impl Gateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            next_conn_id: AtomicU64::new(1),
            dirty_books: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, queue: Arc<OutboundQueue>) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().clients.insert(
            conn_id,
            ClientSlot {
                queue,
                user_id: None,
            },
        );
        conn_id
    }

    pub fn unregister(&self, conn_id: ConnId) {
        let mut registry = self.registry.write();
        if let Some(slot) = registry.clients.remove(&conn_id) {
            if let Some(user_id) = slot.user_id {
                if let Some(conns) = registry.by_user.get_mut(&user_id) {
                    conns.remove(&conn_id);
                    if conns.is_empty() {
                        registry.by_user.remove(&user_id);
                    }
                }
            }
        }
    }

    /// Bind a connection to an authenticated user.
    pub fn authenticate(&self, conn_id: ConnId, user_id: UserId) {
        let mut registry = self.registry.write();
        if let Some(slot) = registry.clients.get_mut(&conn_id) {
            if let Some(previous) = slot.user_id.replace(user_id) {
                if let Some(conns) = registry.by_user.get_mut(&previous) {
                    conns.remove(&conn_id);
                }
            }
            registry.by_user.entry(user_id).or_default().insert(conn_id);
        }
    }

    pub fn user_of(&self, conn_id: ConnId) -> Option<UserId> {
        self.registry.read().clients.get(&conn_id).and_then(|c| c.user_id)
    }

    pub fn client_count(&self) -> usize {
        self.registry.read().clients.len()
    }

    pub fn send_to_conn(&self, conn_id: ConnId, message: &ServerMessage) {
        let Some(frame) = encode(message) else { return };
        let registry = self.registry.read();
        if let Some(slot) = registry.clients.get(&conn_id) {
            slot.queue.push(frame);
        }
    }

    pub fn send_to_user(&self, user_id: UserId, message: &ServerMessage) {
        let Some(frame) = encode(message) else { return };
        let registry = self.registry.read();
        let Some(conns) = registry.by_user.get(&user_id) else {
            return;
        };
        for conn_id in conns {
            if let Some(slot) = registry.clients.get(conn_id) {
                slot.queue.push(frame.clone());
            }
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) {
        let Some(frame) = encode(message) else { return };
        let registry = self.registry.read();
        for slot in registry.clients.values() {
            slot.queue.push(frame.clone());
        }
    }

    fn mark_book_dirty(&self, round_start: RoundStart) {
        self.dirty_books.lock().insert(round_start);
    }

    fn take_dirty_books(&self) -> Vec<RoundStart> {
        self.dirty_books.lock().drain().collect()
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Frame {
            critical: message.is_critical(),
            text,
        }),
        Err(e) => {
            warn!(error = %e, "failed to serialize server message");
            None
        }
    }
}

/// Pump engine, lifecycle and aggregator events out to clients.
pub async fn run_event_pump(
    gateway: Arc<Gateway>,
    engine: Arc<MatchingEngine>,
    lifecycle: Arc<RoundLifecycle>,
    aggregator: Arc<PriceAggregator>,
) {
    let mut engine_rx = engine.subscribe();
    let mut lifecycle_rx = lifecycle.subscribe();
    let mut agg_rx = aggregator.subscribe();

    loop {
        tokio::select! {
            event = engine_rx.recv() => match event {
                Ok(event) => handle_engine_event(&gateway, event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "gateway lagged behind engine events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            event = lifecycle_rx.recv() => match event {
                Ok(event) => handle_lifecycle_event(&gateway, event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "gateway lagged behind lifecycle events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            agg = agg_rx.recv() => match agg {
                Ok(agg) => {
                    if let Some(price) = agg.price {
                        gateway.broadcast(&ServerMessage::Price {
                            price,
                            sources: agg.sources,
                            timestamp: agg.ts_ms,
                        });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn handle_engine_event(gateway: &Gateway, event: EngineEvent) {
    match event {
        EngineEvent::OrderAccepted { order } => {
            gateway.send_to_user(
                order.user_id,
                &ServerMessage::OrderAccepted {
                    order: (&order).into(),
                },
            );
        }
        EngineEvent::OrderUpdate { order } => {
            gateway.send_to_user(
                order.user_id,
                &ServerMessage::OrderUpdate {
                    order: (&order).into(),
                },
            );
        }
        EngineEvent::OrderCancelled {
            user_id,
            order_id,
            refund_cents,
            reason,
        } => {
            gateway.send_to_user(
                user_id,
                &ServerMessage::OrderCancelled {
                    order_id,
                    refund: cents_to_dollars(refund_cents),
                    reason,
                },
            );
        }
        EngineEvent::TradeExecuted { trade } => {
            let message = ServerMessage::Trade {
                trade: (&trade).into(),
            };
            gateway.send_to_user(trade.yes_user_id, &message);
            if trade.no_user_id != trade.yes_user_id {
                gateway.send_to_user(trade.no_user_id, &message);
            }
        }
        EngineEvent::BalanceUpdate {
            user_id,
            balance_cents,
        } => {
            gateway.send_to_user(
                user_id,
                &ServerMessage::BalanceUpdate {
                    balance: cents_to_dollars(balance_cents),
                },
            );
        }
        EngineEvent::LiquidityAdded {
            user_id,
            round_start,
            amount_cents,
            position,
        } => {
            gateway.send_to_user(
                user_id,
                &ServerMessage::LiquidityAdded {
                    slug: slug_for(round_start),
                    amount: cents_to_dollars(amount_cents),
                    yes_shares: position.yes_shares,
                    no_shares: position.no_shares,
                },
            );
        }
        EngineEvent::SettlementPaid {
            user_id,
            round_start,
            outcome,
            payout_cents,
            balance_cents,
        } => {
            gateway.send_to_user(
                user_id,
                &ServerMessage::Settlement {
                    slug: slug_for(round_start),
                    outcome,
                    payout: cents_to_dollars(payout_cents),
                    balance: cents_to_dollars(balance_cents),
                },
            );
        }
        EngineEvent::BookChanged { round_start } => {
            gateway.mark_book_dirty(round_start);
        }
    }
}

fn handle_lifecycle_event(gateway: &Gateway, event: LifecycleEvent) {
    match event {
        LifecycleEvent::MarketPhaseChange { market } => {
            gateway.broadcast(&ServerMessage::MarketPhaseChange { market });
        }
        LifecycleEvent::PriceToBeat { slug, price, .. } => {
            gateway.broadcast(&ServerMessage::PriceToBeat { slug, price });
        }
        LifecycleEvent::MarketList { markets } => {
            gateway.broadcast(&ServerMessage::MarketList { markets });
        }
    }
}

/// Flush dirty order books at most once per debounce window.
pub async fn run_orderbook_debouncer(
    gateway: Arc<Gateway>,
    engine: Arc<MatchingEngine>,
    debounce_ms: u64,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(debounce_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        for round_start in gateway.take_dirty_books() {
            let snapshot = engine.orderbook(round_start);
            debug!(round_start, "broadcasting orderbook");
            gateway.broadcast(&ServerMessage::Orderbook {
                slug: slug_for(round_start),
                bids: snapshot.bids,
                asks: snapshot.asks,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(critical: bool, text: &str) -> Frame {
        Frame {
            critical,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_queue_sheds_oldest_non_critical_first() {
        let queue = OutboundQueue::new(3);
        queue.push(frame(false, "price-1"));
        queue.push(frame(true, "trade-1"));
        queue.push(frame(false, "price-2"));
        // Overflow: price-1 is the oldest sheddable frame.
        queue.push(frame(true, "trade-2"));

        let frames = queue.frames.lock().clone();
        let texts: Vec<&str> = frames.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["trade-1", "price-2", "trade-2"]);
    }

    #[test]
    fn test_queue_never_drops_critical_for_price() {
        let queue = OutboundQueue::new(2);
        queue.push(frame(true, "trade-1"));
        queue.push(frame(true, "settlement-1"));
        // No sheddable frame in the queue and the incoming is sheddable.
        queue.push(frame(false, "price-1"));

        let frames = queue.frames.lock().clone();
        let texts: Vec<&str> = frames.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["trade-1", "settlement-1"]);

        // An incoming critical frame still gets through by evicting nothing:
        // the queue grows past capacity rather than lose it.
        queue.push(frame(true, "trade-2"));
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_queue_pop_returns_in_order() {
        let queue = OutboundQueue::new(8);
        queue.push(frame(true, "a"));
        queue.push(frame(false, "b"));
        assert_eq!(queue.pop().await.text, "a");
        assert_eq!(queue.pop().await.text, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_registry_user_fanout() {
        let gateway = Gateway::new();
        let q1 = OutboundQueue::new(8);
        let q2 = OutboundQueue::new(8);
        let q3 = OutboundQueue::new(8);
        let c1 = gateway.register(q1.clone());
        let c2 = gateway.register(q2.clone());
        let _c3 = gateway.register(q3.clone());

        gateway.authenticate(c1, 7);
        gateway.authenticate(c2, 7);

        gateway.send_to_user(
            7,
            &ServerMessage::BalanceUpdate {
                balance: "1.00".into(),
            },
        );
        assert_eq!(q1.len(), 1);
        assert_eq!(q2.len(), 1);
        assert_eq!(q3.len(), 0);

        gateway.unregister(c1);
        gateway.send_to_user(
            7,
            &ServerMessage::BalanceUpdate {
                balance: "2.00".into(),
            },
        );
        assert_eq!(q2.len(), 2);
        assert_eq!(gateway.client_count(), 2);
    }

    #[test]
    fn test_dirty_book_coalescing() {
        let gateway = Gateway::new();
        gateway.mark_book_dirty(60_000);
        gateway.mark_book_dirty(60_000);
        gateway.mark_book_dirty(120_000);
        let mut dirty = gateway.take_dirty_books();
        dirty.sort_unstable();
        assert_eq!(dirty, vec![60_000, 120_000]);
        assert!(gateway.take_dirty_books().is_empty());
    }
}
