//! Transactional primitives over orders, trades, positions and balances.
//!
//! Mutations take a `rusqlite::Transaction` so callers cannot forget the
//! transaction boundary; reads take any connection (a transaction derefs to
//! one). `deduct_balance` is the single place an insufficient-funds error
//! can originate.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::error::Reject;
use crate::models::{
    BookSide, Cents, Order, OrderId, OrderStatus, OrderType, OutcomeSide, Position, RoundStart,
    Side, Trade, TradeId, User, UserId,
};

/// Fields of an order row not yet assigned by the store.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: UserId,
    pub round_start: RoundStart,
    pub side: Side,
    pub outcome: OutcomeSide,
    pub book_side: BookSide,
    pub order_type: OrderType,
    pub book_price: u8,
    pub stop_price: Option<u8>,
    pub shares: u32,
    pub cost_per_share: u8,
    pub status: OrderStatus,
    pub created_at_ms: i64,
}

// ============================================================================
// Users and balances
// ============================================================================

pub fn get_or_create_user(
    tx: &Transaction<'_>,
    user_id: UserId,
    first_name: &str,
    username: Option<&str>,
) -> Result<User> {
    if let Some(user) = get_user(tx, user_id)? {
        // Refresh display attributes on each login.
        tx.execute(
            "UPDATE users SET first_name = ?1, username = ?2 WHERE id = ?3",
            params![first_name, username, user_id],
        )?;
        return Ok(User {
            first_name: first_name.to_string(),
            username: username.map(str::to_string),
            ..user
        });
    }

    let now = Utc::now();
    tx.execute(
        "INSERT INTO users (id, first_name, username, balance_cents, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![user_id, first_name, username, now.to_rfc3339()],
    )?;
    Ok(User {
        id: user_id,
        first_name: first_name.to_string(),
        username: username.map(str::to_string),
        balance_cents: 0,
        created_at: now,
    })
}

pub fn get_user(conn: &Connection, user_id: UserId) -> Result<Option<User>> {
    conn.query_row(
        "SELECT id, first_name, username, balance_cents, created_at
         FROM users WHERE id = ?1",
        [user_id],
        map_user,
    )
    .optional()
    .map_err(Into::into)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        first_name: row.get(1)?,
        username: row.get(2)?,
        balance_cents: row.get(3)?,
        created_at: parse_timestamp(4, row.get::<_, String>(4)?)?,
    })
}

/// Read a user's balance inside the caller's transaction.
pub fn get_balance_for_update(tx: &Transaction<'_>, user_id: UserId) -> Result<Cents> {
    tx.query_row(
        "SELECT balance_cents FROM users WHERE id = ?1",
        [user_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Deduct `amount` cents, failing if the pre-balance is insufficient.
pub fn deduct_balance(tx: &Transaction<'_>, user_id: UserId, amount: Cents) -> Result<(), Reject> {
    if amount < 0 {
        return Err(Reject::Internal(anyhow::anyhow!(
            "negative deduction of {amount} cents for user {user_id}"
        )));
    }
    let changed = tx.execute(
        "UPDATE users SET balance_cents = balance_cents - ?1
         WHERE id = ?2 AND balance_cents >= ?1",
        params![amount, user_id],
    )?;
    if changed == 1 {
        Ok(())
    } else {
        Err(Reject::InsufficientBalance)
    }
}

/// Credit `amount` cents and return the new balance.
pub fn credit_balance(tx: &Transaction<'_>, user_id: UserId, amount: Cents) -> Result<Cents> {
    if amount < 0 {
        anyhow::bail!("negative credit of {amount} cents for user {user_id}");
    }
    let changed = tx.execute(
        "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
        params![amount, user_id],
    )?;
    if changed != 1 {
        anyhow::bail!("credit for unknown user {user_id}");
    }
    get_balance_for_update(tx, user_id)
}

// ============================================================================
// Orders
// ============================================================================

pub fn insert_order(tx: &Transaction<'_>, new: &NewOrder) -> Result<Order> {
    tx.execute(
        "INSERT INTO orders (user_id, round_start, side, outcome, book_side, order_type,
                             book_price, stop_price, shares, filled_shares, remaining_shares,
                             cost_per_share, status, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?9, ?10, ?11, ?12)",
        params![
            new.user_id,
            new.round_start,
            new.side.as_str(),
            new.outcome.as_str(),
            new.book_side.as_str(),
            new.order_type.as_str(),
            new.book_price,
            new.stop_price,
            new.shares,
            new.cost_per_share,
            new.status.as_str(),
            new.created_at_ms,
        ],
    )?;
    Ok(Order {
        id: tx.last_insert_rowid(),
        user_id: new.user_id,
        round_start: new.round_start,
        side: new.side,
        outcome: new.outcome,
        book_side: new.book_side,
        order_type: new.order_type,
        book_price: new.book_price,
        stop_price: new.stop_price,
        shares: new.shares,
        filled_shares: 0,
        remaining_shares: new.shares,
        cost_per_share: new.cost_per_share,
        status: new.status,
        created_at_ms: new.created_at_ms,
    })
}

const ORDER_COLUMNS: &str = "id, user_id, round_start, side, outcome, book_side, order_type,
     book_price, stop_price, shares, filled_shares, remaining_shares, cost_per_share,
     status, created_at_ms";

pub fn get_order(conn: &Connection, order_id: OrderId) -> Result<Option<Order>> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        [order_id],
        map_order,
    )
    .optional()
    .map_err(Into::into)
}

pub fn map_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        user_id: row.get(1)?,
        round_start: row.get(2)?,
        side: parse_text(3, row.get::<_, String>(3)?, Side::from_str)?,
        outcome: parse_text(4, row.get::<_, String>(4)?, OutcomeSide::from_str)?,
        book_side: parse_text(5, row.get::<_, String>(5)?, BookSide::from_str)?,
        order_type: parse_text(6, row.get::<_, String>(6)?, OrderType::from_str)?,
        book_price: row.get(7)?,
        stop_price: row.get(8)?,
        shares: row.get(9)?,
        filled_shares: row.get(10)?,
        remaining_shares: row.get(11)?,
        cost_per_share: row.get(12)?,
        status: parse_text(13, row.get::<_, String>(13)?, OrderStatus::from_str)?,
        created_at_ms: row.get(14)?,
    })
}

/// Write back an order's fill progress. The schema re-checks
/// `filled + remaining = shares`.
pub fn update_order_fill(
    tx: &Transaction<'_>,
    order_id: OrderId,
    filled_shares: u32,
    remaining_shares: u32,
    status: OrderStatus,
) -> Result<()> {
    let changed = tx.execute(
        "UPDATE orders SET filled_shares = ?1, remaining_shares = ?2, status = ?3
         WHERE id = ?4",
        params![filled_shares, remaining_shares, status.as_str(), order_id],
    )?;
    if changed != 1 {
        anyhow::bail!("fill update for unknown order {order_id}");
    }
    Ok(())
}

pub fn set_order_status(tx: &Transaction<'_>, order_id: OrderId, status: OrderStatus) -> Result<()> {
    let changed = tx.execute(
        "UPDATE orders SET status = ?1 WHERE id = ?2",
        params![status.as_str(), order_id],
    )?;
    if changed != 1 {
        anyhow::bail!("status update for unknown order {order_id}");
    }
    Ok(())
}

/// Flip a parked stop-limit order to `open` at trigger time.
pub fn activate_stop_order(tx: &Transaction<'_>, order_id: OrderId) -> Result<()> {
    let changed = tx.execute(
        "UPDATE orders SET status = 'open' WHERE id = ?1 AND status = 'stopped'",
        [order_id],
    )?;
    if changed != 1 {
        anyhow::bail!("stop activation for order {order_id} not in stopped state");
    }
    Ok(())
}

/// Snapshot then cancel every live order of a round. Returns the pre-cancel
/// rows so settlement can compute refunds from them. Market orders are
/// excluded: they finish synchronously and any residual was already
/// refunded at placement.
pub fn cancel_all_round_orders(tx: &Transaction<'_>, round_start: RoundStart) -> Result<Vec<Order>> {
    let snapshot = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE round_start = ?1
               AND status IN ('open', 'partially_filled', 'stopped')
               AND order_type IN ('limit', 'stop_limit')
             ORDER BY id"
        ))?;
        let rows = stmt.query_map([round_start], map_order)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    tx.execute(
        "UPDATE orders SET status = 'cancelled'
         WHERE round_start = ?1 AND status IN ('open', 'partially_filled', 'stopped')
           AND order_type IN ('limit', 'stop_limit')",
        [round_start],
    )?;
    Ok(snapshot)
}

pub fn get_user_orders(
    conn: &Connection,
    user_id: UserId,
    round_start: Option<RoundStart>,
    statuses: Option<&[OrderStatus]>,
) -> Result<Vec<Order>> {
    let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = ?1");
    if round_start.is_some() {
        sql.push_str(" AND round_start = ?2");
    }
    if let Some(statuses) = statuses {
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND status IN ({list})"));
    }
    sql.push_str(" ORDER BY created_at_ms DESC, id DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = match round_start {
        Some(rs) => stmt.query_map(params![user_id, rs], map_order)?,
        None => stmt.query_map(params![user_id], map_order)?,
    };
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Resting book orders of a round, in time priority. Used for crash recovery.
pub fn get_open_round_orders(conn: &Connection, round_start: RoundStart) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE round_start = ?1
           AND status IN ('open', 'partially_filled')
           AND order_type IN ('limit', 'stop_limit')
         ORDER BY created_at_ms, id"
    ))?;
    let rows = stmt.query_map([round_start], map_order)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Parked (never triggered) stop-limit orders of a round.
pub fn get_stopped_round_orders(conn: &Connection, round_start: RoundStart) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE round_start = ?1 AND status = 'stopped'
         ORDER BY created_at_ms, id"
    ))?;
    let rows = stmt.query_map([round_start], map_order)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

// ============================================================================
// Trades
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub round_start: RoundStart,
    pub bid_order_id: OrderId,
    pub ask_order_id: OrderId,
    pub yes_user_id: UserId,
    pub no_user_id: UserId,
    pub exec_price: u8,
    pub shares: u32,
    pub created_at_ms: i64,
}

pub fn insert_trade(tx: &Transaction<'_>, new: &NewTrade) -> Result<Trade> {
    tx.execute(
        "INSERT INTO trades (round_start, bid_order_id, ask_order_id, yes_user_id,
                             no_user_id, exec_price, shares, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new.round_start,
            new.bid_order_id,
            new.ask_order_id,
            new.yes_user_id,
            new.no_user_id,
            new.exec_price,
            new.shares,
            new.created_at_ms,
        ],
    )?;
    Ok(Trade {
        id: tx.last_insert_rowid(),
        round_start: new.round_start,
        bid_order_id: new.bid_order_id,
        ask_order_id: new.ask_order_id,
        yes_user_id: new.yes_user_id,
        no_user_id: new.no_user_id,
        exec_price: new.exec_price,
        shares: new.shares,
        created_at_ms: new.created_at_ms,
    })
}

pub fn get_order_trades(conn: &Connection, order_id: OrderId) -> Result<Vec<Trade>> {
    let mut stmt = conn.prepare(
        "SELECT id, round_start, bid_order_id, ask_order_id, yes_user_id, no_user_id,
                exec_price, shares, created_at_ms
         FROM trades WHERE bid_order_id = ?1 OR ask_order_id = ?1
         ORDER BY id",
    )?;
    let rows = stmt.query_map([order_id], map_trade)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn map_trade(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get::<_, TradeId>(0)?,
        round_start: row.get(1)?,
        bid_order_id: row.get(2)?,
        ask_order_id: row.get(3)?,
        yes_user_id: row.get(4)?,
        no_user_id: row.get(5)?,
        exec_price: row.get(6)?,
        shares: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

// ============================================================================
// Positions and liquidity
// ============================================================================

/// Apply share deltas to a user's per-round position, creating the row on
/// first touch. Returns the resulting position.
pub fn upsert_position(
    tx: &Transaction<'_>,
    user_id: UserId,
    round_start: RoundStart,
    delta_yes: i64,
    delta_no: i64,
) -> Result<Position> {
    tx.execute(
        "INSERT INTO positions (user_id, round_start, yes_shares, no_shares)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id, round_start) DO UPDATE SET
             yes_shares = yes_shares + excluded.yes_shares,
             no_shares = no_shares + excluded.no_shares",
        params![user_id, round_start, delta_yes, delta_no],
    )?;
    get_position(tx, user_id, round_start)
}

pub fn get_position(
    conn: &Connection,
    user_id: UserId,
    round_start: RoundStart,
) -> Result<Position> {
    let pos = conn
        .query_row(
            "SELECT yes_shares, no_shares FROM positions
             WHERE user_id = ?1 AND round_start = ?2",
            params![user_id, round_start],
            |row| {
                Ok(Position {
                    yes_shares: row.get(0)?,
                    no_shares: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(pos.unwrap_or_default())
}

pub fn get_all_round_positions(
    conn: &Connection,
    round_start: RoundStart,
) -> Result<Vec<(UserId, Position)>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, yes_shares, no_shares FROM positions
         WHERE round_start = ?1 ORDER BY user_id",
    )?;
    let rows = stmt.query_map([round_start], |row| {
        Ok((
            row.get::<_, UserId>(0)?,
            Position {
                yes_shares: row.get(1)?,
                no_shares: row.get(2)?,
            },
        ))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn insert_liquidity_provision(
    tx: &Transaction<'_>,
    user_id: UserId,
    round_start: RoundStart,
    amount_cents: Cents,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO liquidity_provisions (user_id, round_start, amount_cents, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![user_id, round_start, amount_cents, Utc::now().to_rfc3339()],
    )?;
    Ok(tx.last_insert_rowid())
}

pub fn get_total_liquidity(conn: &Connection, round_start: RoundStart) -> Result<Cents> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM liquidity_provisions
         WHERE round_start = ?1",
        [round_start],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

// ============================================================================
// Row-parsing helpers
// ============================================================================

fn parse_text<T>(
    idx: usize,
    raw: String,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognised value: {raw}").into(),
        )
    })
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
