//! Crossing core shared by order placement and stop-limit activation.
//!
//! The incoming (taker) order walks the opposing side in priority order.
//! Execution price is always the resting (maker) order's book price; the
//! taker gets the difference between its reserved cost and the actual cost
//! refunded per fill.

use anyhow::anyhow;
use rusqlite::Transaction;

use crate::error::Reject;
use crate::models::{BookSide, Cents, Order, OrderStatus, Trade};
use crate::store::ledger::{self, NewTrade};

use super::book::{BookEntry, RoundBook};
use super::MatchingEngine;

/// One planned fill against a resting entry.
#[derive(Debug, Clone)]
pub(crate) struct PlannedFill {
    pub maker: BookEntry,
    pub qty: u32,
}

/// A fill after it has been written to the store.
#[derive(Debug, Clone)]
pub(crate) struct FillRecord {
    pub trade: Trade,
    /// Maker order row after the fill was applied.
    pub maker_order: Order,
    pub qty: u32,
}

/// Walk the opposing side collecting fills for up to `want` shares.
///
/// Resting entries owned by the taker are skipped, not matched and not
/// removed; the walk continues past them. The walk stops at the first entry
/// whose price no longer crosses the taker's book price.
pub(crate) fn plan_fills(
    book: &RoundBook,
    taker_user: i64,
    taker_side: BookSide,
    taker_price: u8,
    want: u32,
) -> Vec<PlannedFill> {
    let mut plan = Vec::new();
    let mut left = want;

    for entry in book.iter_side(taker_side.opposite()) {
        if left == 0 {
            break;
        }
        let crosses = match taker_side {
            BookSide::Bid => entry.price <= taker_price,
            BookSide::Ask => entry.price >= taker_price,
        };
        if !crosses {
            break;
        }
        if entry.user_id == taker_user {
            continue;
        }
        let qty = left.min(entry.remaining);
        plan.push(PlannedFill {
            maker: entry.clone(),
            qty,
        });
        left -= qty;
    }

    plan
}

/// Total matchable shares for a would-be taker, for the FOK pre-check.
pub(crate) fn available_shares(
    book: &RoundBook,
    taker_user: i64,
    taker_side: BookSide,
    taker_price: u8,
) -> u32 {
    plan_fills(book, taker_user, taker_side, taker_price, u32::MAX)
        .iter()
        .map(|f| f.qty)
        .sum()
}

impl MatchingEngine {
    /// Write one taker's planned fills to the store: trades, position
    /// credits, maker fill progress and taker price-improvement refunds.
    /// The taker's own row is written by the caller once its residual
    /// policy is decided. Returns the fills and total refund in cents.
    ///
    /// Caller holds the write gate and the transaction.
    pub(crate) fn execute_fills(
        &self,
        tx: &Transaction<'_>,
        taker: &mut Order,
        plan: &[PlannedFill],
        now_ms: i64,
    ) -> Result<(Vec<FillRecord>, Cents), Reject> {
        let mut fills = Vec::with_capacity(plan.len());
        let mut refund_total: Cents = 0;

        for planned in plan {
            let qty = planned.qty;
            let exec_price = planned.maker.price;

            // The bid side of a fill is the YES counterparty.
            let (bid_order_id, ask_order_id, yes_user_id, no_user_id) =
                match taker.book_side {
                    BookSide::Bid => (
                        taker.id,
                        planned.maker.order_id,
                        taker.user_id,
                        planned.maker.user_id,
                    ),
                    BookSide::Ask => (
                        planned.maker.order_id,
                        taker.id,
                        planned.maker.user_id,
                        taker.user_id,
                    ),
                };

            let trade = ledger::insert_trade(
                tx,
                &NewTrade {
                    round_start: taker.round_start,
                    bid_order_id,
                    ask_order_id,
                    yes_user_id,
                    no_user_id,
                    exec_price,
                    shares: qty,
                    created_at_ms: now_ms,
                },
            )?;

            ledger::upsert_position(tx, yes_user_id, taker.round_start, qty as i64, 0)?;
            ledger::upsert_position(tx, no_user_id, taker.round_start, 0, qty as i64)?;

            let maker_row = ledger::get_order(tx, planned.maker.order_id)?
                .ok_or_else(|| Reject::Internal(anyhow!("maker order vanished mid-match")))?;
            let new_filled = maker_row.filled_shares + qty;
            let new_remaining = maker_row
                .remaining_shares
                .checked_sub(qty)
                .ok_or_else(|| Reject::Internal(anyhow!("maker overfill")))?;
            let maker_status = if new_remaining == 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            ledger::update_order_fill(tx, maker_row.id, new_filled, new_remaining, maker_status)?;

            taker.filled_shares += qty;
            taker.remaining_shares -= qty;

            // Maker reserved exactly its own price; only the taker can have
            // reserved more than the execution actually cost.
            let taker_actual = match taker.book_side {
                BookSide::Bid => exec_price,
                BookSide::Ask => 100 - exec_price,
            };
            if taker.cost_per_share > taker_actual {
                let diff =
                    (taker.cost_per_share - taker_actual) as Cents * qty as Cents;
                ledger::credit_balance(tx, taker.user_id, diff)?;
                refund_total += diff;
            }

            fills.push(FillRecord {
                trade,
                maker_order: Order {
                    filled_shares: new_filled,
                    remaining_shares: new_remaining,
                    status: maker_status,
                    ..maker_row
                },
                qty,
            });
        }

        Ok((fills, refund_total))
    }

    /// Mirror committed fills into the in-memory book.
    pub(crate) fn apply_fills_to_book(&self, fills: &[FillRecord]) {
        if fills.is_empty() {
            return;
        }
        let round_start = fills[0].trade.round_start;
        let mut state = self.state.write();
        if let Some(book) = state.books.get_mut(&round_start) {
            for fill in fills {
                book.reduce(fill.maker_order.id, fill.qty);
            }
        }
    }

    pub(crate) fn emit_fill_events(&self, fills: &[FillRecord]) {
        for fill in fills {
            self.emit(super::EngineEvent::TradeExecuted {
                trade: fill.trade.clone(),
            });
            self.emit(super::EngineEvent::OrderUpdate {
                order: fill.maker_order.clone(),
            });
        }
    }
}
