//! Durable store on SQLite.
//!
//! One connection guarded by an async mutex; every engine operation runs
//! inside a single `rusqlite` transaction taken from that connection, which
//! is what serialises mutation across the process. Check constraints mirror
//! the in-process invariants so a bug cannot persist inconsistent rows.

pub mod ledger;
pub mod prices;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection. Mutating callers open a transaction on the
    /// guard and hold it for the whole logical operation.
    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            first_name TEXT NOT NULL DEFAULT '',
            username TEXT,
            balance_cents INTEGER NOT NULL DEFAULT 0 CHECK (balance_cents >= 0),
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS price_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            price REAL NOT NULL,
            sources INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_price_history_ts ON price_history(ts_ms);

        CREATE TABLE IF NOT EXISTS btc_1m_outcomes (
            round_start INTEGER PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            phase TEXT NOT NULL CHECK (phase IN ('provision', 'active', 'closed')),
            price_to_beat REAL,
            final_price REAL,
            outcome TEXT CHECK (outcome IN ('up', 'down')),
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            round_start INTEGER NOT NULL,
            side TEXT NOT NULL CHECK (side IN ('buy', 'sell')),
            outcome TEXT NOT NULL CHECK (outcome IN ('yes', 'no')),
            book_side TEXT NOT NULL CHECK (book_side IN ('bid', 'ask')),
            order_type TEXT NOT NULL
                CHECK (order_type IN ('market_fak', 'market_fok', 'limit', 'stop_limit')),
            book_price INTEGER NOT NULL CHECK (book_price BETWEEN 1 AND 99),
            stop_price INTEGER CHECK (stop_price BETWEEN 1 AND 99),
            shares INTEGER NOT NULL CHECK (shares > 0),
            filled_shares INTEGER NOT NULL DEFAULT 0 CHECK (filled_shares >= 0),
            remaining_shares INTEGER NOT NULL CHECK (remaining_shares >= 0),
            cost_per_share INTEGER NOT NULL CHECK (cost_per_share BETWEEN 1 AND 99),
            status TEXT NOT NULL CHECK (status IN
                ('open', 'partially_filled', 'filled', 'cancelled', 'stopped', 'expired')),
            created_at_ms INTEGER NOT NULL,
            CHECK (filled_shares + remaining_shares = shares)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
        CREATE INDEX IF NOT EXISTS idx_orders_round_status ON orders(round_start, status);

        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            round_start INTEGER NOT NULL,
            bid_order_id INTEGER NOT NULL REFERENCES orders(id),
            ask_order_id INTEGER NOT NULL REFERENCES orders(id),
            yes_user_id INTEGER NOT NULL REFERENCES users(id),
            no_user_id INTEGER NOT NULL REFERENCES users(id),
            exec_price INTEGER NOT NULL CHECK (exec_price BETWEEN 1 AND 99),
            shares INTEGER NOT NULL CHECK (shares > 0),
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_round ON trades(round_start);
        CREATE INDEX IF NOT EXISTS idx_trades_bid_order ON trades(bid_order_id);
        CREATE INDEX IF NOT EXISTS idx_trades_ask_order ON trades(ask_order_id);

        CREATE TABLE IF NOT EXISTS positions (
            user_id INTEGER NOT NULL REFERENCES users(id),
            round_start INTEGER NOT NULL,
            yes_shares INTEGER NOT NULL DEFAULT 0 CHECK (yes_shares >= 0),
            no_shares INTEGER NOT NULL DEFAULT 0 CHECK (no_shares >= 0),
            PRIMARY KEY (user_id, round_start)
        );

        CREATE TABLE IF NOT EXISTS liquidity_provisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            round_start INTEGER NOT NULL,
            amount_cents INTEGER NOT NULL CHECK (amount_cents > 0),
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_liquidity_round ON liquidity_provisions(round_start);
        ",
    )
    .context("failed to initialise schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initialises() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn.try_lock().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(n >= 7);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updown.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        drop(store);
        // Re-open over the same file: idempotent schema.
        Store::open(path.to_str().unwrap()).unwrap();
    }
}
