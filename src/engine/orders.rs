//! Order placement, normalisation and cancellation.
//!
//! User-facing orders arrive as a `(side, outcome, price)` triple; the book
//! lives on the YES price scale, so NO prices are mirrored through 100.
//! `cost_per_share` is what the placer reserves per share, in cents.

use anyhow::anyhow;
use chrono::Utc;

use crate::error::Reject;
use crate::models::{
    BookSide, Cents, Order, OrderId, OrderStatus, OrderType, OutcomeSide, Phase, RoundStart, Side,
    UserId, MAX_BOOK_PRICE, MIN_BOOK_PRICE,
};
use crate::store::ledger::{self, NewOrder};

use super::book::BookEntry;
use super::matching::{available_shares, plan_fills};
use super::{EngineEvent, MatchingEngine, StopEntry};

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub round_start: RoundStart,
    pub order_type: OrderType,
    pub side: Side,
    pub outcome: OutcomeSide,
    pub shares: u32,
    pub price: Option<u8>,
    pub stop_price: Option<u8>,
}

/// An order's coordinates after translation onto the YES scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalised {
    pub book_side: BookSide,
    pub book_price: u8,
    pub stop_price: Option<u8>,
    pub cost_per_share: u8,
}

pub fn book_side_for(side: Side, outcome: OutcomeSide) -> BookSide {
    match (side, outcome) {
        (Side::Buy, OutcomeSide::Yes) => BookSide::Bid,
        (Side::Buy, OutcomeSide::No) => BookSide::Ask,
        (Side::Sell, OutcomeSide::Yes) => BookSide::Ask,
        (Side::Sell, OutcomeSide::No) => BookSide::Bid,
    }
}

/// Translate a user-facing price onto the YES scale.
fn to_book_price(outcome: OutcomeSide, price: u8) -> u8 {
    match outcome {
        OutcomeSide::Yes => price,
        OutcomeSide::No => 100 - price,
    }
}

/// Cents reserved per share for an order resting at `book_price`.
fn cost_for(book_side: BookSide, book_price: u8) -> u8 {
    match book_side {
        BookSide::Bid => book_price,
        BookSide::Ask => 100 - book_price,
    }
}

pub fn normalise(req: &PlaceOrderRequest, max_shares: u32) -> Result<Normalised, Reject> {
    if req.shares < 1 || req.shares > max_shares {
        return Err(Reject::invalid(format!(
            "shares must be an integer between 1 and {max_shares}"
        )));
    }

    let book_side = book_side_for(req.side, req.outcome);

    let (book_price, cost_per_share) = if req.order_type.is_market() {
        // Market orders cross the whole book; the crossing pseudo-price also
        // sets the (maximal) reservation, with improvement refunded per fill.
        let pseudo = match book_side {
            BookSide::Bid => MAX_BOOK_PRICE,
            BookSide::Ask => MIN_BOOK_PRICE,
        };
        (pseudo, cost_for(book_side, pseudo))
    } else {
        let price = req
            .price
            .ok_or_else(|| Reject::invalid("price is required for limit orders"))?;
        check_price_range("price", price)?;
        let book_price = to_book_price(req.outcome, price);
        (book_price, cost_for(book_side, book_price))
    };

    let stop_price = match req.order_type {
        OrderType::StopLimit => {
            let stop = req
                .stop_price
                .ok_or_else(|| Reject::invalid("stop_price is required for stop-limit orders"))?;
            check_price_range("stop_price", stop)?;
            Some(to_book_price(req.outcome, stop))
        }
        _ => None,
    };

    Ok(Normalised {
        book_side,
        book_price,
        stop_price,
        cost_per_share,
    })
}

fn check_price_range(field: &str, value: u8) -> Result<(), Reject> {
    if !(MIN_BOOK_PRICE..=MAX_BOOK_PRICE).contains(&value) {
        return Err(Reject::invalid(format!(
            "{field} must be an integer between {MIN_BOOK_PRICE} and {MAX_BOOK_PRICE}"
        )));
    }
    Ok(())
}

impl MatchingEngine {
    /// Place an order for an authenticated user. On success the accepted
    /// order (post-matching) is returned and all pushes go out on the event
    /// bus; on failure nothing was persisted.
    pub async fn place_order(
        &self,
        user_id: UserId,
        req: PlaceOrderRequest,
    ) -> Result<Order, Reject> {
        let norm = normalise(&req, self.max_shares_per_order)?;

        let _gate = self.write_gate.lock().await;

        {
            let markets = self.markets.read();
            let market = markets
                .get(&req.round_start)
                .ok_or(Reject::MarketNotFound)?;
            if market.phase != Phase::Active {
                return Err(Reject::MarketNotActive);
            }
        }
        self.init_round(req.round_start);

        let now_ms = Utc::now().timestamp_millis();

        // FOK walks the book before any store mutation.
        if req.order_type == OrderType::MarketFok {
            let state = self.state.read();
            let book = state
                .books
                .get(&req.round_start)
                .ok_or_else(|| Reject::Internal(anyhow!("missing book for active round")))?;
            let available = available_shares(book, user_id, norm.book_side, norm.book_price);
            if available < req.shares {
                return Err(Reject::InsufficientLiquidity {
                    available,
                    need: req.shares,
                });
            }
        }

        let mut order;
        let fills;
        let mut rests = false;
        let balance_after;
        {
            let mut conn = self.store.conn().await;
            let tx = conn.transaction().map_err(Reject::from)?;

            let reservation: Cents = req.shares as Cents * norm.cost_per_share as Cents;
            let initial_status = if req.order_type == OrderType::StopLimit {
                OrderStatus::Stopped
            } else {
                ledger::deduct_balance(&tx, user_id, reservation)?;
                OrderStatus::Open
            };

            order = ledger::insert_order(
                &tx,
                &NewOrder {
                    user_id,
                    round_start: req.round_start,
                    side: req.side,
                    outcome: req.outcome,
                    book_side: norm.book_side,
                    order_type: req.order_type,
                    book_price: norm.book_price,
                    stop_price: norm.stop_price,
                    shares: req.shares,
                    cost_per_share: norm.cost_per_share,
                    status: initial_status,
                    created_at_ms: now_ms,
                },
            )?;

            if req.order_type == OrderType::StopLimit {
                tx.commit().map_err(Reject::from)?;
                drop(conn);

                let stop_price = norm.stop_price.unwrap_or(norm.book_price);
                let mut state = self.state.write();
                state.stops.entry(req.round_start).or_default().insert(
                    order.id,
                    StopEntry {
                        order_id: order.id,
                        user_id,
                        book_side: norm.book_side,
                        limit_price: norm.book_price,
                        stop_price,
                        shares: req.shares,
                        cost_per_share: norm.cost_per_share,
                        created_at_ms: now_ms,
                    },
                );
                drop(state);

                self.emit(EngineEvent::OrderAccepted {
                    order: order.clone(),
                });
                return Ok(order);
            }

            let plan = {
                let state = self.state.read();
                let book = state
                    .books
                    .get(&req.round_start)
                    .ok_or_else(|| Reject::Internal(anyhow!("missing book for active round")))?;
                plan_fills(book, user_id, norm.book_side, norm.book_price, req.shares)
            };

            let (fills_inner, _refund) = self.execute_fills(&tx, &mut order, &plan, now_ms)?;

            // Residual policy by order type.
            match req.order_type {
                OrderType::Limit => {
                    order.status = if order.remaining_shares == 0 {
                        OrderStatus::Filled
                    } else if order.filled_shares > 0 {
                        rests = true;
                        OrderStatus::PartiallyFilled
                    } else {
                        rests = true;
                        OrderStatus::Open
                    };
                }
                OrderType::MarketFak => {
                    if order.remaining_shares > 0 {
                        // Unused reservation goes straight back.
                        ledger::credit_balance(&tx, user_id, order.remaining_reservation())
                            .map_err(Reject::from)?;
                        order.status = if order.filled_shares > 0 {
                            OrderStatus::PartiallyFilled
                        } else {
                            OrderStatus::Cancelled
                        };
                    } else {
                        order.status = OrderStatus::Filled;
                    }
                }
                OrderType::MarketFok => {
                    if order.remaining_shares != 0 {
                        // The pre-check said this fills completely; anything else
                        // is a bug and must roll back.
                        return Err(Reject::Internal(anyhow!(
                            "FOK residual of {} shares after passing pre-check",
                            order.remaining_shares
                        )));
                    }
                    order.status = OrderStatus::Filled;
                }
                OrderType::StopLimit => unreachable!("parked above"),
            }

            ledger::update_order_fill(
                &tx,
                order.id,
                order.filled_shares,
                order.remaining_shares,
                order.status,
            )?;
            balance_after = ledger::get_balance_for_update(&tx, user_id)?;

            tx.commit().map_err(Reject::from)?;
            drop(conn);
            fills = fills_inner;
        }

        // Mirror the committed result into the in-memory book.
        self.apply_fills_to_book(&fills);
        if rests {
            let mut state = self.state.write();
            if let Some(book) = state.books.get_mut(&req.round_start) {
                book.insert(BookEntry {
                    order_id: order.id,
                    user_id,
                    price: norm.book_price,
                    remaining: order.remaining_shares,
                    cost_per_share: norm.cost_per_share,
                    side: norm.book_side,
                    created_at_ms: now_ms,
                });
            }
        }

        self.emit(EngineEvent::OrderAccepted {
            order: order.clone(),
        });
        self.emit_fill_events(&fills);
        self.emit(EngineEvent::BalanceUpdate {
            user_id,
            balance_cents: balance_after,
        });
        if rests || !fills.is_empty() {
            self.emit(EngineEvent::BookChanged {
                round_start: req.round_start,
            });
        }

        // New liquidity on either side can move top-of-book through a stop.
        if rests || !fills.is_empty() {
            self.run_stop_checks(req.round_start).await;
        }

        Ok(order)
    }

    /// Cancel a resting or parked order and refund its unused reservation.
    pub async fn cancel_order(&self, user_id: UserId, order_id: OrderId) -> Result<Order, Reject> {
        let _gate = self.write_gate.lock().await;

        let mut conn = self.store.conn().await;
        let tx = conn.transaction().map_err(Reject::from)?;

        let order = ledger::get_order(&tx, order_id)?.ok_or(Reject::OrderNotFound)?;
        if order.user_id != user_id {
            return Err(Reject::OrderNotFound);
        }
        if !matches!(order.order_type, OrderType::Limit | OrderType::StopLimit) {
            return Err(Reject::NotCancellable);
        }
        if !matches!(
            order.status,
            OrderStatus::Open | OrderStatus::PartiallyFilled | OrderStatus::Stopped
        ) {
            return Err(Reject::NotCancellable);
        }

        // Parked stops never reserved balance.
        let refund: Cents = if order.status == OrderStatus::Stopped {
            0
        } else {
            order.remaining_reservation()
        };

        ledger::set_order_status(&tx, order_id, OrderStatus::Cancelled)?;
        let balance_after = if refund > 0 {
            ledger::credit_balance(&tx, user_id, refund)?
        } else {
            ledger::get_balance_for_update(&tx, user_id)?
        };
        tx.commit().map_err(Reject::from)?;
        drop(conn);

        let was_resting = {
            let mut state = self.state.write();
            let from_book = state
                .books
                .get_mut(&order.round_start)
                .and_then(|b| b.remove(order_id))
                .is_some();
            if let Some(stops) = state.stops.get_mut(&order.round_start) {
                stops.remove(&order_id);
            }
            from_book
        };

        self.emit(EngineEvent::OrderCancelled {
            user_id,
            order_id,
            refund_cents: refund,
            reason: None,
        });
        self.emit(EngineEvent::BalanceUpdate {
            user_id,
            balance_cents: balance_after,
        });
        if was_resting {
            self.emit(EngineEvent::BookChanged {
                round_start: order.round_start,
            });
        }

        let cancelled = Order {
            status: OrderStatus::Cancelled,
            ..order
        };
        Ok(cancelled)
    }

    /// Mint equal yes/no share pairs during the provisioning window. The
    /// amount must be a whole number of dollars; one dollar mints one share
    /// of each outcome.
    pub async fn add_liquidity(
        &self,
        user_id: UserId,
        round_start: RoundStart,
        amount_cents: Cents,
    ) -> Result<crate::models::Position, Reject> {
        if amount_cents <= 0 || amount_cents % 100 != 0 {
            return Err(Reject::invalid(
                "amount must be a whole number of dollars greater than zero",
            ));
        }

        let _gate = self.write_gate.lock().await;

        {
            let markets = self.markets.read();
            let market = markets.get(&round_start).ok_or(Reject::MarketNotFound)?;
            if market.phase != Phase::Provision {
                return Err(Reject::MarketNotProvisioning);
            }
        }

        let shares = amount_cents / 100;
        let mut conn = self.store.conn().await;
        let tx = conn.transaction().map_err(Reject::from)?;

        ledger::deduct_balance(&tx, user_id, amount_cents)?;
        ledger::insert_liquidity_provision(&tx, user_id, round_start, amount_cents)?;
        let position = ledger::upsert_position(&tx, user_id, round_start, shares, shares)?;
        let balance_after = ledger::get_balance_for_update(&tx, user_id)?;
        tx.commit().map_err(Reject::from)?;
        drop(conn);

        self.emit(EngineEvent::LiquidityAdded {
            user_id,
            round_start,
            amount_cents,
            position,
        });
        self.emit(EngineEvent::BalanceUpdate {
            user_id,
            balance_cents: balance_after,
        });

        Ok(position)
    }
}
