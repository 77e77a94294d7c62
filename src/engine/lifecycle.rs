//! Minute-boundary state machine.
//!
//! Single writer over the markets map. A timer armed just before each
//! minute edge does the real work; the 500 ms tick is a safety net, and an
//! atomic flag makes the boundary action no-op under overlap. Settlement of
//! the expiring round and activation of the next share one reference price,
//! which keeps the series continuous: close-of-previous = open-of-next.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::models::{
    minute_start, AggregatedPrice, Market, Phase, RoundOutcome, RoundStart, ROUND_DURATION_MS,
};
use crate::store::{prices, Store};

use super::{EngineEvent, MatchingEngine, SharedMarkets};

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    MarketPhaseChange { market: Market },
    PriceToBeat {
        round_start: RoundStart,
        slug: String,
        price: f64,
    },
    MarketList { markets: Vec<Market> },
}

pub struct RoundLifecycle {
    store: Arc<Store>,
    engine: Arc<MatchingEngine>,
    markets: SharedMarkets,
    current_round: AtomicI64,
    latest: RwLock<Option<AggregatedPrice>>,
    boundary_guard: AtomicBool,
    events: broadcast::Sender<LifecycleEvent>,
    provision_horizon: i64,
    prune_after_ms: i64,
}

impl RoundLifecycle {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<MatchingEngine>,
        markets: SharedMarkets,
        provision_horizon: i64,
        prune_after_min: i64,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            engine,
            markets,
            current_round: AtomicI64::new(0),
            latest: RwLock::new(None),
            boundary_guard: AtomicBool::new(false),
            events,
            provision_horizon,
            prune_after_ms: prune_after_min * 60_000,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    pub fn current_round(&self) -> RoundStart {
        self.current_round.load(Ordering::Acquire)
    }

    pub fn latest_price(&self) -> Option<AggregatedPrice> {
        *self.latest.read()
    }

    pub fn observe_price(&self, agg: AggregatedPrice) {
        if agg.price.is_some() {
            *self.latest.write() = Some(agg);
        }
    }

    /// All in-memory markets, oldest first.
    pub fn market_list(&self) -> Vec<Market> {
        let markets = self.markets.read();
        let mut list: Vec<Market> = markets.values().cloned().collect();
        list.sort_by_key(|m| m.round_start);
        list
    }

    pub fn get_market(&self, round_start: RoundStart) -> Option<Market> {
        self.markets.read().get(&round_start).cloned()
    }

    pub fn get_market_by_slug(&self, slug: &str) -> Option<Market> {
        self.markets.read().values().find(|m| m.slug == slug).cloned()
    }

    /// Bootstrap the markets map: restore unsettled rounds from the store,
    /// then make sure the current minute and the provision horizon exist.
    pub async fn init(&self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.init_at(now_ms).await
    }

    pub(crate) async fn init_at(&self, now_ms: i64) -> Result<()> {
        let m0 = minute_start(now_ms);
        self.current_round.store(m0, Ordering::Release);

        let restored = {
            let conn = self.store.conn().await;
            prices::get_unsettled_markets(&conn)?
        };
        {
            let mut markets = self.markets.write();
            for market in restored {
                debug!(slug = %market.slug, phase = ?market.phase, "restored market");
                markets.insert(market.round_start, market);
            }
        }

        self.ensure_future_markets(m0).await?;
        info!(
            current = m0,
            slug = %crate::models::slug_for(m0),
            "round lifecycle initialised"
        );
        Ok(())
    }

    /// Drive the state machine. The minute-edge timer does the real work;
    /// the 500 ms interval is a safety net behind it.
    pub async fn run(self: Arc<Self>, mut agg_rx: broadcast::Receiver<AggregatedPrice>) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let now = Utc::now().timestamp_millis();
            let until_edge = ((minute_start(now) + ROUND_DURATION_MS) - now).max(1) as u64;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(until_edge)) => {
                    self.tick().await;
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
                received = agg_rx.recv() => match received {
                    Ok(agg) => self.observe_price(agg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "lifecycle lagged behind aggregator");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("aggregator channel closed; lifecycle stopping");
                        return;
                    }
                },
            }
        }
    }

    async fn tick(&self) {
        let now_ms = Utc::now().timestamp_millis();
        if let Err(e) = self.step(now_ms).await {
            error!(error = %e, "lifecycle step failed");
        }
    }

    /// One evaluation of the state machine at `now_ms`. No-ops until the
    /// first reference price exists, and under a concurrent boundary action.
    pub(crate) async fn step(&self, now_ms: i64) -> Result<()> {
        let Some(agg) = self.latest_price() else {
            return Ok(());
        };
        let Some(price) = agg.price else {
            return Ok(());
        };

        if self.boundary_guard.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.step_guarded(now_ms, price).await;
        self.boundary_guard.store(false, Ordering::Release);
        result
    }

    async fn step_guarded(&self, now_ms: i64, price: f64) -> Result<()> {
        let now_min = minute_start(now_ms);
        let current = self.current_round();

        if now_min > current {
            self.cross_boundary(now_ms, now_min, price).await?;
            return Ok(());
        }

        // Deferred activation: the current minute's market goes live on the
        // first tick that has a reference price.
        let pre_active = self
            .get_market(current)
            .map_or(true, |m| m.phase == Phase::Provision);
        if pre_active {
            self.activate(current, price).await?;
        }
        Ok(())
    }

    async fn cross_boundary(&self, now_ms: i64, now_min: RoundStart, price: f64) -> Result<()> {
        // Settle everything overdue, not just the immediately previous
        // minute, so a stalled process catches up cleanly.
        let overdue: Vec<RoundStart> = {
            let markets = self.markets.read();
            let mut v: Vec<RoundStart> = markets
                .values()
                .filter(|m| m.phase != Phase::Closed && m.round_start < now_min)
                .map(|m| m.round_start)
                .collect();
            v.sort_unstable();
            v
        };
        for round_start in overdue {
            self.settle(round_start, price).await?;
        }

        self.current_round.store(now_min, Ordering::Release);

        // The close of the previous minute is the open of the next.
        self.activate(now_min, price).await?;
        self.ensure_future_markets(now_min).await?;
        self.prune(now_ms).await;

        self.emit(LifecycleEvent::MarketList {
            markets: self.market_list(),
        });
        Ok(())
    }

    /// Fix the price to beat and open trading. Idempotent for markets that
    /// already left the provision phase.
    async fn activate(&self, round_start: RoundStart, price: f64) -> Result<()> {
        let market = {
            let mut markets = self.markets.write();
            if let Some(other) = markets
                .values()
                .find(|m| m.phase == Phase::Active && m.round_start != round_start)
            {
                // The controller never produces two active rounds; seeing one
                // here is an internal fault, not something to demote.
                error!(
                    active = other.round_start,
                    activating = round_start,
                    "single-active invariant violated"
                );
            }
            let market = markets
                .entry(round_start)
                .or_insert_with(|| Market::provision(round_start));
            if market.phase != Phase::Provision {
                return Ok(());
            }
            market.phase = Phase::Active;
            market.price_to_beat = Some(price);
            market.clone()
        };

        self.engine.init_round(round_start);
        {
            let conn = self.store.conn().await;
            prices::upsert_market(&conn, &market)?;
        }

        info!(slug = %market.slug, price_to_beat = price, "round active");
        self.emit(LifecycleEvent::PriceToBeat {
            round_start,
            slug: market.slug.clone(),
            price,
        });
        self.emit(LifecycleEvent::MarketPhaseChange {
            market: market.clone(),
        });
        // Fresh round, empty book: let the gateway broadcast it.
        self.engine.emit(EngineEvent::BookChanged { round_start });
        Ok(())
    }

    async fn settle(&self, round_start: RoundStart, final_price: f64) -> Result<()> {
        let (market, outcome) = {
            let mut markets = self.markets.write();
            let Some(market) = markets.get_mut(&round_start) else {
                return Ok(());
            };
            // A round that never activated has no price to beat; settling it
            // against the final price pays the both-sided LP positions and
            // refunds everything else either way.
            let beat = market.price_to_beat.unwrap_or(final_price);
            let outcome = if final_price >= beat {
                RoundOutcome::Up
            } else {
                RoundOutcome::Down
            };
            market.phase = Phase::Closed;
            market.final_price = Some(final_price);
            market.outcome = Some(outcome);
            (market.clone(), outcome)
        };

        {
            let conn = self.store.conn().await;
            prices::upsert_market(&conn, &market)?;
        }
        self.engine.settle_round(round_start, outcome).await?;
        self.emit(LifecycleEvent::MarketPhaseChange { market });
        Ok(())
    }

    /// Keep the provision window populated out to the horizon.
    async fn ensure_future_markets(&self, from_min: RoundStart) -> Result<()> {
        let mut created = Vec::new();
        {
            let mut markets = self.markets.write();
            for i in 0..=self.provision_horizon {
                let round_start = from_min + i * ROUND_DURATION_MS;
                if !markets.contains_key(&round_start) {
                    let market = Market::provision(round_start);
                    markets.insert(round_start, market.clone());
                    created.push(market);
                }
            }
        }
        if !created.is_empty() {
            let conn = self.store.conn().await;
            for market in &created {
                prices::upsert_market(&conn, market)?;
            }
        }
        Ok(())
    }

    async fn prune(&self, now_ms: i64) {
        let expired: Vec<RoundStart> = {
            let markets = self.markets.read();
            markets
                .values()
                .filter(|m| m.close_time() + self.prune_after_ms < now_ms)
                .map(|m| m.round_start)
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        {
            let mut markets = self.markets.write();
            for round_start in &expired {
                markets.remove(round_start);
            }
        }
        for round_start in expired {
            self.engine.clear_round(round_start);
            debug!(round_start, "pruned market");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn agg(price: f64, ts_ms: i64) -> AggregatedPrice {
        AggregatedPrice {
            price: Some(price),
            sources: 3,
            ts_ms,
        }
    }

    async fn fixture() -> (Arc<RoundLifecycle>, Arc<MatchingEngine>, RoundStart) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let markets: SharedMarkets = Arc::new(RwLock::new(HashMap::new()));
        let engine = MatchingEngine::new(store.clone(), markets.clone(), 10_000);
        let lifecycle = RoundLifecycle::new(store, engine.clone(), markets, 5, 10);

        let t0 = 1_893_456_000_000i64; // minute-aligned
        assert_eq!(minute_start(t0), t0);
        lifecycle.init_at(t0).await.unwrap();
        (lifecycle, engine, t0)
    }

    #[tokio::test]
    async fn test_init_creates_provision_horizon() {
        let (lifecycle, _engine, t0) = fixture().await;
        let list = lifecycle.market_list();
        assert_eq!(list.len(), 6);
        assert!(list.iter().all(|m| m.phase == Phase::Provision));
        assert_eq!(list[0].round_start, t0);
        assert_eq!(list[5].round_start, t0 + 5 * ROUND_DURATION_MS);
    }

    #[tokio::test]
    async fn test_no_activation_without_reference_price() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.step(t0 + 1_000).await.unwrap();
        assert_eq!(
            lifecycle.get_market(t0).unwrap().phase,
            Phase::Provision
        );
    }

    #[tokio::test]
    async fn test_activation_sets_price_to_beat_once() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.observe_price(agg(100_000.0, t0 + 500));
        lifecycle.step(t0 + 1_000).await.unwrap();

        let market = lifecycle.get_market(t0).unwrap();
        assert_eq!(market.phase, Phase::Active);
        assert_eq!(market.price_to_beat, Some(100_000.0));

        // A later tick with a newer price must not move it.
        lifecycle.observe_price(agg(100_500.0, t0 + 2_000));
        lifecycle.step(t0 + 2_500).await.unwrap();
        assert_eq!(
            lifecycle.get_market(t0).unwrap().price_to_beat,
            Some(100_000.0)
        );
    }

    #[tokio::test]
    async fn test_boundary_settles_and_carries_price_forward() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.observe_price(agg(100_000.0, t0 + 500));
        lifecycle.step(t0 + 1_000).await.unwrap();

        // Cross the boundary with a higher price: up outcome, and the next
        // round opens exactly at the previous close.
        lifecycle.observe_price(agg(100_250.0, t0 + 59_900));
        let t1 = t0 + ROUND_DURATION_MS;
        lifecycle.step(t1 + 100).await.unwrap();

        let settled = lifecycle.get_market(t0).unwrap();
        assert_eq!(settled.phase, Phase::Closed);
        assert_eq!(settled.final_price, Some(100_250.0));
        assert_eq!(settled.outcome, Some(RoundOutcome::Up));

        let next = lifecycle.get_market(t1).unwrap();
        assert_eq!(next.phase, Phase::Active);
        assert_eq!(next.price_to_beat, settled.final_price);
        assert_eq!(lifecycle.current_round(), t1);

        // Horizon extended past the new current round.
        assert!(lifecycle
            .get_market(t1 + 5 * ROUND_DURATION_MS)
            .is_some());
    }

    #[tokio::test]
    async fn test_equal_final_price_settles_up() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.observe_price(agg(100_000.0, t0 + 500));
        lifecycle.step(t0 + 1_000).await.unwrap();

        let t1 = t0 + ROUND_DURATION_MS;
        lifecycle.step(t1 + 100).await.unwrap();
        assert_eq!(
            lifecycle.get_market(t0).unwrap().outcome,
            Some(RoundOutcome::Up)
        );
    }

    #[tokio::test]
    async fn test_down_outcome() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.observe_price(agg(100_000.0, t0 + 500));
        lifecycle.step(t0 + 1_000).await.unwrap();

        lifecycle.observe_price(agg(99_900.0, t0 + 59_000));
        let t1 = t0 + ROUND_DURATION_MS;
        lifecycle.step(t1 + 100).await.unwrap();
        assert_eq!(
            lifecycle.get_market(t0).unwrap().outcome,
            Some(RoundOutcome::Down)
        );
    }

    #[tokio::test]
    async fn test_prune_drops_old_closed_markets() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.observe_price(agg(100_000.0, t0 + 500));
        lifecycle.step(t0 + 1_000).await.unwrap();

        // Walk 12 minutes forward; the first round closed 11 minutes ago.
        for i in 1..=12 {
            let t = t0 + i * ROUND_DURATION_MS;
            lifecycle.observe_price(agg(100_000.0 + i as f64, t - 1_000));
            lifecycle.step(t + 100).await.unwrap();
        }
        assert!(lifecycle.get_market(t0).is_none());
        // Store still remembers it.
        let store_market = {
            let conn = lifecycle.store.conn().await;
            prices::get_market(&conn, t0).unwrap()
        };
        assert!(store_market.is_some());
        assert_eq!(store_market.unwrap().phase, Phase::Closed);
    }

    #[tokio::test]
    async fn test_stalled_process_catches_up() {
        let (lifecycle, _engine, t0) = fixture().await;
        lifecycle.observe_price(agg(100_000.0, t0 + 500));
        lifecycle.step(t0 + 1_000).await.unwrap();

        // Jump three minutes in one step.
        lifecycle.observe_price(agg(101_000.0, t0 + 180_500));
        let t3 = t0 + 3 * ROUND_DURATION_MS;
        lifecycle.step(t3 + 100).await.unwrap();

        assert_eq!(lifecycle.get_market(t0).unwrap().phase, Phase::Closed);
        assert_eq!(lifecycle.get_market(t3).unwrap().phase, Phase::Active);
        assert_eq!(lifecycle.current_round(), t3);
        // Intermediate provision markets were settled, not left dangling.
        let t1 = t0 + ROUND_DURATION_MS;
        assert_eq!(lifecycle.get_market(t1).unwrap().phase, Phase::Closed);
    }
}
