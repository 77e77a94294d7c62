//! Round settlement: cancel-and-refund every live order, pay the winners.
//!
//! Runs in one transaction so a crash can never leave a round half-settled.
//! Winning shares pay one dollar each; refunds use the pre-cancel snapshot
//! so a stopped order (which never reserved balance) refunds nothing.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::info;

use crate::models::{Cents, OrderStatus, RoundOutcome, RoundStart, UserId};
use crate::store::ledger;

use super::{EngineEvent, MatchingEngine};

impl MatchingEngine {
    /// Close a round with its decided outcome. Invoked by the lifecycle
    /// controller at the minute boundary.
    pub async fn settle_round(
        &self,
        round_start: RoundStart,
        outcome: RoundOutcome,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().await;

        let mut conn = self.store.conn().await;
        let tx = conn.transaction()?;

        let cancelled = ledger::cancel_all_round_orders(&tx, round_start)?;
        let mut touched: BTreeSet<UserId> = BTreeSet::new();
        let mut refunded: Cents = 0;
        for order in &cancelled {
            touched.insert(order.user_id);
            if order.status == OrderStatus::Stopped {
                continue;
            }
            let refund = order.remaining_reservation();
            if refund > 0 {
                ledger::credit_balance(&tx, order.user_id, refund)?;
                refunded += refund;
            }
        }

        let positions = ledger::get_all_round_positions(&tx, round_start)?;
        let mut payouts: BTreeMap<UserId, Cents> = BTreeMap::new();
        for (user_id, position) in &positions {
            touched.insert(*user_id);
            let winning_shares = match outcome {
                RoundOutcome::Up => position.yes_shares,
                RoundOutcome::Down => position.no_shares,
            };
            let payout = winning_shares * 100;
            if payout > 0 {
                ledger::credit_balance(&tx, *user_id, payout)?;
            }
            payouts.insert(*user_id, payout);
        }

        let mut balances: BTreeMap<UserId, Cents> = BTreeMap::new();
        for user_id in &touched {
            balances.insert(*user_id, ledger::get_balance_for_update(&tx, *user_id)?);
        }

        tx.commit()?;
        drop(conn);

        self.clear_round(round_start);

        for (user_id, payout_cents) in &payouts {
            self.emit(EngineEvent::SettlementPaid {
                user_id: *user_id,
                round_start,
                outcome,
                payout_cents: *payout_cents,
                balance_cents: balances.get(user_id).copied().unwrap_or_default(),
            });
        }
        for (user_id, balance_cents) in &balances {
            self.emit(EngineEvent::BalanceUpdate {
                user_id: *user_id,
                balance_cents: *balance_cents,
            });
        }

        info!(
            round_start,
            outcome = outcome.as_str(),
            cancelled = cancelled.len(),
            refunded_cents = refunded,
            positions = positions.len(),
            "round settled"
        );
        Ok(())
    }
}
