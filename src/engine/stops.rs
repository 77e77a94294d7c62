//! Stop-limit parking and trigger evaluation.
//!
//! A parked stop reserves no balance. When top-of-book moves through its
//! stop price the engine funds it in a fresh transaction and runs it as a
//! limit order; a failed deduction cancels it with a reason the owner sees.
//! Trigger evaluation repeats until a pass produces no new triggers, which
//! terminates because each stop leaves the set when it fires.

use anyhow::anyhow;
use chrono::Utc;
use tracing::error;

use crate::error::Reject;
use crate::models::{BookSide, Cents, OrderStatus, RoundStart};
use crate::store::ledger;

use super::book::BookEntry;
use super::matching::plan_fills;
use super::{EngineEvent, MatchingEngine, StopEntry};

impl MatchingEngine {
    /// Evaluate and fire triggered stops for a round until quiescent.
    /// Caller must hold the write gate.
    pub(crate) async fn run_stop_checks(&self, round_start: RoundStart) {
        loop {
            let triggered = self.collect_triggered(round_start);
            if triggered.is_empty() {
                return;
            }
            for stop in triggered {
                // Unpark first so a stop can fire at most once per round.
                let removed = {
                    let mut state = self.state.write();
                    state
                        .stops
                        .get_mut(&round_start)
                        .and_then(|stops| stops.remove(&stop.order_id))
                };
                if removed.is_none() {
                    continue;
                }
                if let Err(e) = self.trigger_stop(round_start, &stop).await {
                    error!(
                        order_id = stop.order_id,
                        error = %e,
                        "stop-limit trigger failed"
                    );
                }
            }
            // Fills from triggered orders can move top-of-book; go again.
        }
    }

    fn collect_triggered(&self, round_start: RoundStart) -> Vec<StopEntry> {
        let state = self.state.read();
        let Some(book) = state.books.get(&round_start) else {
            return Vec::new();
        };
        let Some(stops) = state.stops.get(&round_start) else {
            return Vec::new();
        };
        let best_bid = book.best_bid();
        let best_ask = book.best_ask();

        let mut triggered: Vec<StopEntry> = stops
            .values()
            .filter(|stop| match stop.book_side {
                // A bid stop waits for YES to become cheap enough to buy.
                BookSide::Bid => best_ask.is_some_and(|ask| ask <= stop.stop_price),
                // An ask stop waits for YES to become expensive enough to sell.
                BookSide::Ask => best_bid.is_some_and(|bid| bid >= stop.stop_price),
            })
            .cloned()
            .collect();
        triggered.sort_by_key(|s| (s.created_at_ms, s.order_id));
        triggered
    }

    async fn trigger_stop(
        &self,
        round_start: RoundStart,
        stop: &StopEntry,
    ) -> Result<(), Reject> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.store.conn().await;
        let tx = conn.transaction().map_err(Reject::from)?;

        let reservation: Cents = stop.shares as Cents * stop.cost_per_share as Cents;
        match ledger::deduct_balance(&tx, stop.user_id, reservation) {
            Ok(()) => {}
            Err(Reject::InsufficientBalance) => {
                ledger::set_order_status(&tx, stop.order_id, OrderStatus::Cancelled)?;
                tx.commit().map_err(Reject::from)?;
                drop(conn);
                self.emit(EngineEvent::OrderCancelled {
                    user_id: stop.user_id,
                    order_id: stop.order_id,
                    refund_cents: 0,
                    reason: Some("Insufficient balance at trigger".to_string()),
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        ledger::activate_stop_order(&tx, stop.order_id)?;
        let mut order = ledger::get_order(&tx, stop.order_id)?
            .ok_or_else(|| Reject::Internal(anyhow!("triggered stop order vanished")))?;
        order.status = OrderStatus::Open;

        // From here on it is a fresh limit order: match, then rest.
        let plan = {
            let state = self.state.read();
            let book = state
                .books
                .get(&round_start)
                .ok_or_else(|| Reject::Internal(anyhow!("missing book for active round")))?;
            plan_fills(
                book,
                stop.user_id,
                stop.book_side,
                stop.limit_price,
                order.remaining_shares,
            )
        };
        let (fills, _refund) = self.execute_fills(&tx, &mut order, &plan, now_ms)?;

        order.status = if order.remaining_shares == 0 {
            OrderStatus::Filled
        } else if order.filled_shares > 0 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        };
        ledger::update_order_fill(
            &tx,
            order.id,
            order.filled_shares,
            order.remaining_shares,
            order.status,
        )?;
        let balance_after = ledger::get_balance_for_update(&tx, stop.user_id)?;

        tx.commit().map_err(Reject::from)?;
        drop(conn);

        self.apply_fills_to_book(&fills);
        if order.remaining_shares > 0 {
            let mut state = self.state.write();
            if let Some(book) = state.books.get_mut(&round_start) {
                book.insert(BookEntry {
                    order_id: order.id,
                    user_id: stop.user_id,
                    price: stop.limit_price,
                    remaining: order.remaining_shares,
                    cost_per_share: stop.cost_per_share,
                    side: stop.book_side,
                    // Keeps the same priority a recovery reload would give it.
                    created_at_ms: order.created_at_ms,
                });
            }
        }

        self.emit(EngineEvent::OrderUpdate {
            order: order.clone(),
        });
        self.emit_fill_events(&fills);
        self.emit(EngineEvent::BalanceUpdate {
            user_id: stop.user_id,
            balance_cents: balance_after,
        });
        self.emit(EngineEvent::BookChanged { round_start });

        Ok(())
    }
}
