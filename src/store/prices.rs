//! Reference-price history and per-minute market persistence.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{Market, Phase, RoundOutcome, RoundStart};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub sources: usize,
    pub timestamp: i64,
}

/// Append one aggregated sample. Best-effort at the call site: a failed
/// insert is logged there and never blocks the price fan-out.
pub fn insert_price(conn: &Connection, price: f64, sources: usize, ts_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO price_history (price, sources, ts_ms) VALUES (?1, ?2, ?3)",
        params![price, sources, ts_ms],
    )?;
    Ok(())
}

/// Most recent `limit` samples, oldest first.
pub fn get_history(conn: &Connection, limit: usize) -> Result<Vec<PricePoint>> {
    let mut stmt = conn.prepare(
        "SELECT price, sources, ts_ms FROM
             (SELECT price, sources, ts_ms FROM price_history ORDER BY ts_ms DESC LIMIT ?1)
         ORDER BY ts_ms ASC",
    )?;
    let rows = stmt.query_map([limit], |row| {
        Ok(PricePoint {
            price: row.get(0)?,
            sources: row.get::<_, i64>(1)? as usize,
            timestamp: row.get(2)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Insert or update a market row keyed by its minute start.
pub fn upsert_market(conn: &Connection, market: &Market) -> Result<()> {
    conn.execute(
        "INSERT INTO btc_1m_outcomes
             (round_start, slug, phase, price_to_beat, final_price, outcome, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (round_start) DO UPDATE SET
             phase = excluded.phase,
             price_to_beat = excluded.price_to_beat,
             final_price = excluded.final_price,
             outcome = excluded.outcome,
             updated_at = excluded.updated_at",
        params![
            market.round_start,
            market.slug,
            market.phase.as_str(),
            market.price_to_beat,
            market.final_price,
            market.outcome.map(|o| o.as_str()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_market(conn: &Connection, round_start: RoundStart) -> Result<Option<Market>> {
    conn.query_row(
        "SELECT round_start, slug, phase, price_to_beat, final_price, outcome
         FROM btc_1m_outcomes WHERE round_start = ?1",
        [round_start],
        map_market,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_market_by_slug(conn: &Connection, slug: &str) -> Result<Option<Market>> {
    conn.query_row(
        "SELECT round_start, slug, phase, price_to_beat, final_price, outcome
         FROM btc_1m_outcomes WHERE slug = ?1",
        [slug],
        map_market,
    )
    .optional()
    .map_err(Into::into)
}

/// Markets not yet closed, for crash recovery. Oldest first.
pub fn get_unsettled_markets(conn: &Connection) -> Result<Vec<Market>> {
    let mut stmt = conn.prepare(
        "SELECT round_start, slug, phase, price_to_beat, final_price, outcome
         FROM btc_1m_outcomes WHERE phase != 'closed' ORDER BY round_start",
    )?;
    let rows = stmt.query_map([], map_market)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Recently settled markets, newest first.
pub fn get_recent_outcomes(conn: &Connection, limit: usize) -> Result<Vec<Market>> {
    let mut stmt = conn.prepare(
        "SELECT round_start, slug, phase, price_to_beat, final_price, outcome
         FROM btc_1m_outcomes WHERE phase = 'closed' AND outcome IS NOT NULL
         ORDER BY round_start DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], map_market)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn map_market(row: &Row<'_>) -> rusqlite::Result<Market> {
    let phase_raw: String = row.get(2)?;
    let phase = Phase::from_str(&phase_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unrecognised phase: {phase_raw}").into(),
        )
    })?;
    let outcome = row
        .get::<_, Option<String>>(5)?
        .and_then(|s| RoundOutcome::from_str(&s));
    Ok(Market {
        round_start: row.get(0)?,
        slug: row.get(1)?,
        phase,
        price_to_beat: row.get(3)?,
        final_price: row.get(4)?,
        outcome,
    })
}
