//! End-to-end matching, liquidity and settlement scenarios against an
//! in-memory store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use updown_backend::engine::orders::PlaceOrderRequest;
use updown_backend::engine::{EngineEvent, MatchingEngine, SharedMarkets};
use updown_backend::error::Reject;
use updown_backend::models::{
    slug_for, Cents, Market, OrderStatus, OrderType, OutcomeSide, Phase, RoundOutcome, Side,
    UserId,
};
use updown_backend::store::{ledger, prices, Store};

/// Minute-aligned round start used throughout.
const ROUND: i64 = 1_893_456_000_000;

const U1: UserId = 1;
const U2: UserId = 2;
const U3: UserId = 3;

async fn setup() -> (Arc<Store>, Arc<MatchingEngine>, SharedMarkets) {
    assert_eq!(ROUND % 60_000, 0);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let markets: SharedMarkets = Arc::new(RwLock::new(HashMap::new()));
    let engine = MatchingEngine::new(store.clone(), markets.clone(), 10_000);
    set_phase(&store, &markets, Phase::Active).await;
    (store, engine, markets)
}

async fn set_phase(store: &Store, markets: &SharedMarkets, phase: Phase) {
    let market = Market {
        round_start: ROUND,
        slug: slug_for(ROUND),
        phase,
        price_to_beat: Some(100_000.0),
        final_price: None,
        outcome: None,
    };
    {
        let conn = store.conn().await;
        prices::upsert_market(&conn, &market).unwrap();
    }
    markets.write().insert(ROUND, market);
}

async fn fund(store: &Store, user_id: UserId, cents: Cents) {
    let mut conn = store.conn().await;
    let tx = conn.transaction().unwrap();
    ledger::get_or_create_user(&tx, user_id, &format!("user-{user_id}"), None).unwrap();
    ledger::credit_balance(&tx, user_id, cents).unwrap();
    tx.commit().unwrap();
}

async fn balance_of(store: &Store, user_id: UserId) -> Cents {
    let conn = store.conn().await;
    ledger::get_user(&conn, user_id).unwrap().unwrap().balance_cents
}

async fn position_of(store: &Store, user_id: UserId) -> (i64, i64) {
    let conn = store.conn().await;
    let p = ledger::get_position(&conn, user_id, ROUND).unwrap();
    (p.yes_shares, p.no_shares)
}

fn limit(side: Side, outcome: OutcomeSide, price: u8, shares: u32) -> PlaceOrderRequest {
    PlaceOrderRequest {
        round_start: ROUND,
        order_type: OrderType::Limit,
        side,
        outcome,
        shares,
        price: Some(price),
        stop_price: None,
    }
}

fn market(order_type: OrderType, side: Side, outcome: OutcomeSide, shares: u32) -> PlaceOrderRequest {
    PlaceOrderRequest {
        round_start: ROUND,
        order_type,
        side,
        outcome,
        shares,
        price: None,
        stop_price: None,
    }
}

fn stop_limit(
    side: Side,
    outcome: OutcomeSide,
    stop: u8,
    price: u8,
    shares: u32,
) -> PlaceOrderRequest {
    PlaceOrderRequest {
        round_start: ROUND,
        order_type: OrderType::StopLimit,
        side,
        outcome,
        shares,
        price: Some(price),
        stop_price: Some(stop),
    }
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn limit_cross_executes_at_maker_price_with_improvement_refund() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 10_000).await;
    fund(&store, U2, 10_000).await;

    // U1: buy yes 50c x 10 -> rests at bid 50, $5.00 reserved.
    let o1 = engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 10))
        .await
        .unwrap();
    assert_eq!(o1.status, OrderStatus::Open);
    assert_eq!(balance_of(&store, U1).await, 9_500);

    // U2: sell yes 40c x 6 -> crosses; executes at the maker's 50.
    let o2 = engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 40, 6))
        .await
        .unwrap();
    assert_eq!(o2.status, OrderStatus::Filled);
    assert_eq!(o2.filled_shares, 6);

    // U2 reserved (100-40)*6 = $3.60 but actually paid (100-50)*6 = $3.00.
    assert_eq!(balance_of(&store, U2).await, 10_000 - 360 + 60);

    assert_eq!(position_of(&store, U1).await, (6, 0));
    assert_eq!(position_of(&store, U2).await, (0, 6));

    // Remaining book: U1's bid 50 x 4.
    let snapshot = engine.orderbook(ROUND);
    assert_eq!(snapshot.bids.len(), 1);
    assert_eq!(snapshot.bids[0].price, 50);
    assert_eq!(snapshot.bids[0].shares, 4);
    assert!(snapshot.asks.is_empty());

    // Trades record the bid side as the YES counterparty.
    let conn = store.conn().await;
    let trades = ledger::get_order_trades(&conn, o1.id).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exec_price, 50);
    assert_eq!(trades[0].shares, 6);
    assert_eq!(trades[0].yes_user_id, U1);
    assert_eq!(trades[0].no_user_id, U2);
}

#[tokio::test]
async fn fok_rejects_when_not_fully_fillable() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 100_000).await;
    fund(&store, U2, 100_000).await;
    fund(&store, U3, 100_000).await;

    // Asks: 10 shares at 60, 5 shares at 61.
    engine
        .place_order(U1, limit(Side::Sell, OutcomeSide::Yes, 60, 10))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 61, 5))
        .await
        .unwrap();

    let before = balance_of(&store, U3).await;
    let err = engine
        .place_order(U3, market(OrderType::MarketFok, Side::Buy, OutcomeSide::Yes, 20))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Insufficient liquidity: 15 shares available, need 20"
    );
    assert!(matches!(err, Reject::InsufficientLiquidity { .. }));

    // No state change at all: balance untouched, no orders, no trades.
    assert_eq!(balance_of(&store, U3).await, before);
    let conn = store.conn().await;
    assert!(ledger::get_user_orders(&conn, U3, None, None)
        .unwrap()
        .is_empty());

    // Book still intact.
    drop(conn);
    let snapshot = engine.orderbook(ROUND);
    assert_eq!(snapshot.asks.iter().map(|l| l.shares).sum::<u32>(), 15);
}

#[tokio::test]
async fn fok_executes_fully_when_fillable() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 100_000).await;
    fund(&store, U2, 100_000).await;

    engine
        .place_order(U1, limit(Side::Sell, OutcomeSide::Yes, 60, 10))
        .await
        .unwrap();
    let order = engine
        .place_order(U2, market(OrderType::MarketFok, Side::Buy, OutcomeSide::Yes, 10))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.remaining_shares, 0);

    // Reserved 99/share, paid 60/share at the maker's price.
    assert_eq!(balance_of(&store, U2).await, 100_000 - 600);
    assert_eq!(position_of(&store, U2).await, (10, 0));
}

#[tokio::test]
async fn self_trade_prevention_skips_own_resting_order() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 100_000).await;

    // U1 rests sell yes 40c x 5.
    let resting = engine
        .place_order(U1, limit(Side::Sell, OutcomeSide::Yes, 40, 5))
        .await
        .unwrap();
    let after_resting = balance_of(&store, U1).await;

    // U1's own FAK buy must skip it, find nothing else and cancel in full.
    let fak = engine
        .place_order(U1, market(OrderType::MarketFak, Side::Buy, OutcomeSide::Yes, 5))
        .await
        .unwrap();
    assert_eq!(fak.status, OrderStatus::Cancelled);
    assert_eq!(fak.filled_shares, 0);

    // Full refund of the FAK reservation; the resting ask is untouched.
    assert_eq!(balance_of(&store, U1).await, after_resting);
    let conn = store.conn().await;
    let read = ledger::get_order(&conn, resting.id).unwrap().unwrap();
    assert_eq!(read.status, OrderStatus::Open);
    assert_eq!(read.remaining_shares, 5);
    assert!(ledger::get_order_trades(&conn, resting.id).unwrap().is_empty());
}

#[tokio::test]
async fn fak_fills_what_it_can_and_refunds_the_rest() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 100_000).await;
    fund(&store, U2, 100_000).await;

    engine
        .place_order(U1, limit(Side::Sell, OutcomeSide::Yes, 60, 5))
        .await
        .unwrap();

    let fak = engine
        .place_order(U2, market(OrderType::MarketFak, Side::Buy, OutcomeSide::Yes, 8))
        .await
        .unwrap();
    assert_eq!(fak.status, OrderStatus::PartiallyFilled);
    assert_eq!(fak.filled_shares, 5);
    assert_eq!(fak.remaining_shares, 3);

    // Paid exactly 5 shares at 60; everything else came back.
    assert_eq!(balance_of(&store, U2).await, 100_000 - 300);
    // Market orders never rest.
    assert!(engine.orderbook(ROUND).bids.is_empty());
}

#[tokio::test]
async fn stop_limit_triggers_funds_and_matches() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 10_000).await;
    fund(&store, U2, 10_000).await;

    // U1: stop-limit sell yes stop=30 limit=25 x 10. Nothing reserved yet.
    let stop = engine
        .place_order(U1, stop_limit(Side::Sell, OutcomeSide::Yes, 30, 25, 10))
        .await
        .unwrap();
    assert_eq!(stop.status, OrderStatus::Stopped);
    assert_eq!(balance_of(&store, U1).await, 10_000);

    // U2 lifts the bid to 30: the ask stop triggers (best bid >= 30),
    // reserves (100-25)*10 = $7.50 and matches against the bid.
    engine
        .place_order(U2, limit(Side::Buy, OutcomeSide::Yes, 30, 10))
        .await
        .unwrap();

    let conn = store.conn().await;
    let read = ledger::get_order(&conn, stop.id).unwrap().unwrap();
    assert_eq!(read.status, OrderStatus::Filled);
    assert_eq!(read.filled_shares, 10);
    let trades = ledger::get_order_trades(&conn, stop.id).unwrap();
    assert_eq!(trades.len(), 1);
    // Maker is U2's resting bid at 30.
    assert_eq!(trades[0].exec_price, 30);
    assert_eq!(trades[0].yes_user_id, U2);
    assert_eq!(trades[0].no_user_id, U1);
    drop(conn);

    // U1 reserved 750 at trigger, got (75-70)*10 = 50 back as improvement.
    assert_eq!(balance_of(&store, U1).await, 10_000 - 750 + 50);
    assert_eq!(position_of(&store, U1).await, (0, 10));
    assert_eq!(position_of(&store, U2).await, (10, 0));
}

#[tokio::test]
async fn stop_limit_cancelled_when_balance_gone_at_trigger() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 1_000).await;
    fund(&store, U2, 10_000).await;
    let mut events = engine.subscribe();

    let stop = engine
        .place_order(U1, stop_limit(Side::Sell, OutcomeSide::Yes, 30, 25, 10))
        .await
        .unwrap();

    // Drain the U1 balance so the $7.50 trigger reservation must fail.
    {
        let mut conn = store.conn().await;
        let tx = conn.transaction().unwrap();
        ledger::deduct_balance(&tx, U1, 900).unwrap();
        tx.commit().unwrap();
    }
    drain(&mut events);

    engine
        .place_order(U2, limit(Side::Buy, OutcomeSide::Yes, 30, 10))
        .await
        .unwrap();

    let conn = store.conn().await;
    let read = ledger::get_order(&conn, stop.id).unwrap().unwrap();
    assert_eq!(read.status, OrderStatus::Cancelled);
    drop(conn);
    assert_eq!(balance_of(&store, U1).await, 100);

    let cancelled = drain(&mut events).into_iter().find_map(|e| match e {
        EngineEvent::OrderCancelled {
            order_id, reason, ..
        } if order_id == stop.id => Some(reason),
        _ => None,
    });
    assert_eq!(
        cancelled.flatten().as_deref(),
        Some("Insufficient balance at trigger")
    );
}

#[tokio::test]
async fn cancel_refunds_remaining_reservation() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 10_000).await;
    fund(&store, U2, 10_000).await;

    let order = engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 10))
        .await
        .unwrap();
    // Partial fill leaves 4 shares reserved.
    engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 50, 6))
        .await
        .unwrap();
    assert_eq!(balance_of(&store, U1).await, 9_500);

    let cancelled = engine.cancel_order(U1, order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    // refund = remaining * cost = 4 * 50.
    assert_eq!(balance_of(&store, U1).await, 9_500 + 200);
    assert!(engine.orderbook(ROUND).bids.is_empty());

    // Cancels are not idempotent: a second attempt reports not cancellable.
    let err = engine.cancel_order(U1, order.id).await.unwrap_err();
    assert!(matches!(err, Reject::NotCancellable));

    // A parked stop cancels with zero refund.
    let stop = engine
        .place_order(U1, stop_limit(Side::Sell, OutcomeSide::Yes, 30, 25, 10))
        .await
        .unwrap();
    let before = balance_of(&store, U1).await;
    engine.cancel_order(U1, stop.id).await.unwrap();
    assert_eq!(balance_of(&store, U1).await, before);
}

#[tokio::test]
async fn cancel_rejects_foreign_and_market_orders() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 10_000).await;
    fund(&store, U2, 10_000).await;

    let order = engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 10))
        .await
        .unwrap();
    let err = engine.cancel_order(U2, order.id).await.unwrap_err();
    assert!(matches!(err, Reject::OrderNotFound));

    let fak = engine
        .place_order(U2, market(OrderType::MarketFak, Side::Buy, OutcomeSide::Yes, 2))
        .await
        .unwrap();
    let err = engine.cancel_order(U2, fak.id).await.unwrap_err();
    assert!(matches!(err, Reject::NotCancellable));
}

#[tokio::test]
async fn liquidity_mints_equal_pairs_in_provision_only() {
    let (store, engine, markets) = setup().await;
    fund(&store, U1, 10_000).await;

    // Active phase refuses provisioning.
    let err = engine.add_liquidity(U1, ROUND, 500).await.unwrap_err();
    assert!(matches!(err, Reject::MarketNotProvisioning));

    set_phase(&store, &markets, Phase::Provision).await;
    let position = engine.add_liquidity(U1, ROUND, 500).await.unwrap();
    assert_eq!((position.yes_shares, position.no_shares), (5, 5));
    assert_eq!(balance_of(&store, U1).await, 9_500);

    {
        let conn = store.conn().await;
        assert_eq!(ledger::get_total_liquidity(&conn, ROUND).unwrap(), 500);
    }

    // Fractional dollars cannot mint fractional shares.
    let err = engine.add_liquidity(U1, ROUND, 150).await.unwrap_err();
    assert!(matches!(err, Reject::InvalidInput(_)));

    let err = engine.add_liquidity(U1, ROUND, 100_000).await.unwrap_err();
    assert!(matches!(err, Reject::InsufficientBalance));
}

#[tokio::test]
async fn settlement_pays_winning_side_and_refunds_open_orders() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 10_000).await;
    fund(&store, U2, 10_000).await;

    // Build crossed positions: U1 (+4 yes, +6 no), U2 (+6 yes, +4 no).
    engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 4))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 50, 4))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Buy, OutcomeSide::Yes, 45, 6))
        .await
        .unwrap();
    engine
        .place_order(U1, limit(Side::Sell, OutcomeSide::Yes, 45, 6))
        .await
        .unwrap();
    assert_eq!(position_of(&store, U1).await, (4, 6));
    assert_eq!(position_of(&store, U2).await, (6, 4));

    // Plus an open order that must be refunded at settlement.
    engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 20, 10))
        .await
        .unwrap();

    let u1_before = balance_of(&store, U1).await;
    let u2_before = balance_of(&store, U2).await;

    engine.settle_round(ROUND, RoundOutcome::Up).await.unwrap();

    // U1: 4 winning yes shares -> $4.00, plus the 10x20c refund.
    assert_eq!(balance_of(&store, U1).await, u1_before + 400 + 200);
    // U2: 6 winning yes shares -> $6.00.
    assert_eq!(balance_of(&store, U2).await, u2_before + 600);

    // Book and stops are gone; orders are terminal.
    assert!(engine.orderbook(ROUND).bids.is_empty());
    let conn = store.conn().await;
    for order in ledger::get_user_orders(&conn, U1, Some(ROUND), None).unwrap() {
        assert!(matches!(
            order.status,
            OrderStatus::Filled | OrderStatus::Cancelled
        ));
    }
}

#[tokio::test]
async fn dollars_are_conserved_through_trading_and_settlement() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 10_000).await;
    fund(&store, U2, 10_000).await;

    engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 10))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 40, 6))
        .await
        .unwrap();

    // 600 cents are in minted shares, 200 locked in the resting residual.
    let total = balance_of(&store, U1).await + balance_of(&store, U2).await;
    assert_eq!(total, 20_000 - 600 - 200);

    // Settlement releases both: winners get the share pool, the residual is
    // refunded, and the system nets to its initial endowment.
    engine.settle_round(ROUND, RoundOutcome::Up).await.unwrap();
    let total = balance_of(&store, U1).await + balance_of(&store, U2).await;
    assert_eq!(total, 20_000);
}

#[tokio::test]
async fn no_trade_ever_pairs_a_user_with_itself() {
    let (store, engine, _markets) = setup().await;
    fund(&store, U1, 100_000).await;
    fund(&store, U2, 100_000).await;

    engine
        .place_order(U1, limit(Side::Sell, OutcomeSide::Yes, 50, 5))
        .await
        .unwrap();
    engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 55, 8))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 40, 10))
        .await
        .unwrap();

    let conn = store.conn().await;
    let mut stmt = conn_all_trades(&conn);
    let pairs = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(!pairs.is_empty());
    for (yes_user, no_user) in pairs {
        assert_ne!(yes_user, no_user);
    }
}

fn conn_all_trades(conn: &rusqlite::Connection) -> rusqlite::Statement<'_> {
    conn.prepare("SELECT yes_user_id, no_user_id FROM trades")
        .unwrap()
}

#[tokio::test]
async fn placement_requires_active_market() {
    let (store, engine, markets) = setup().await;
    fund(&store, U1, 10_000).await;

    let mut req = limit(Side::Buy, OutcomeSide::Yes, 50, 5);
    req.round_start = ROUND + 60_000;
    let err = engine.place_order(U1, req).await.unwrap_err();
    assert!(matches!(err, Reject::MarketNotFound));

    set_phase(&store, &markets, Phase::Provision).await;
    let err = engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, Reject::MarketNotActive));
}

#[tokio::test]
async fn restart_recovers_books_and_stops_with_time_priority() {
    let (store, engine, markets) = setup().await;
    fund(&store, U1, 100_000).await;
    fund(&store, U2, 100_000).await;

    engine
        .place_order(U1, limit(Side::Buy, OutcomeSide::Yes, 50, 5))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Buy, OutcomeSide::Yes, 50, 7))
        .await
        .unwrap();
    engine
        .place_order(U2, limit(Side::Sell, OutcomeSide::Yes, 60, 3))
        .await
        .unwrap();
    engine
        .place_order(U1, stop_limit(Side::Sell, OutcomeSide::Yes, 90, 85, 2))
        .await
        .unwrap();
    let before = engine.orderbook(ROUND);

    // A fresh engine over the same store sees the same world.
    let revived = MatchingEngine::new(store.clone(), markets.clone(), 10_000);
    revived.recover().await.unwrap();
    let after = revived.orderbook(ROUND);
    assert_eq!(before.bids, after.bids);
    assert_eq!(before.asks, after.asks);

    // Time priority survived: U1's earlier bid at 50 still matches first.
    fund(&store, U3, 100_000).await;
    revived
        .place_order(U3, limit(Side::Sell, OutcomeSide::Yes, 50, 5))
        .await
        .unwrap();
    let conn = store.conn().await;
    let trades = ledger::get_order_trades(&conn, 1).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].shares, 5);
}
