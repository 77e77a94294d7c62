//! updown: a minute-by-minute BTC up/down prediction exchange.
//!
//! Boot order matters: the store is fatal-on-failure, then markets and the
//! engine recover from it, and only then do feeds, the lifecycle clock and
//! the client-facing surfaces come up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updown_backend::{
    auth::AuthVerifier,
    engine::{lifecycle::RoundLifecycle, MatchingEngine, SharedMarkets},
    feeds::{self, aggregator::PriceAggregator},
    gateway::{
        self,
        http::{build_router, AppState},
        Gateway,
    },
    models::Config,
    store::{prices, Store},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        database = %config.database_path,
        "🚀 starting updown exchange"
    );

    let store =
        Arc::new(Store::open(&config.database_path).context("store initialisation failed")?);

    let markets: SharedMarkets = Arc::new(RwLock::new(HashMap::new()));
    let engine = MatchingEngine::new(store.clone(), markets.clone(), config.max_shares_per_order);
    let lifecycle = RoundLifecycle::new(
        store.clone(),
        engine.clone(),
        markets,
        config.provision_horizon,
        config.prune_after_min,
    );
    lifecycle.init().await?;
    engine.recover().await?;

    let aggregator = PriceAggregator::new(
        config.aggregate_interval_ms,
        config.staleness_threshold_ms,
    );
    let (sample_tx, sample_rx) = mpsc::channel(1024);
    feeds::spawn_all(sample_tx);
    spawn_supervised("aggregator", aggregator.clone().run(sample_rx));
    spawn_supervised("lifecycle", lifecycle.clone().run(aggregator.subscribe()));
    spawn_supervised(
        "price-persister",
        persist_prices(store.clone(), aggregator.subscribe()),
    );

    let gateway = Gateway::new();
    spawn_supervised(
        "event-pump",
        gateway::run_event_pump(
            gateway.clone(),
            engine.clone(),
            lifecycle.clone(),
            aggregator.clone(),
        ),
    );
    spawn_supervised(
        "orderbook-debouncer",
        gateway::run_orderbook_debouncer(
            gateway.clone(),
            engine.clone(),
            config.orderbook_debounce_ms,
        ),
    );

    if config.bot_secret.is_none() {
        warn!("BOT_SECRET not set; authentication is disabled");
    }
    let auth = Arc::new(AuthVerifier::new(config.bot_secret.clone()));

    let state = AppState {
        store,
        engine,
        lifecycle,
        aggregator,
        gateway,
        auth,
        config: config.clone(),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, "✅ listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Persist every aggregated sample, best-effort: a failed write warns and
/// never blocks the price fan-out.
async fn persist_prices(
    store: Arc<Store>,
    mut rx: broadcast::Receiver<updown_backend::models::AggregatedPrice>,
) {
    loop {
        match rx.recv().await {
            Ok(agg) => {
                let Some(price) = agg.price else { continue };
                let conn = store.conn().await;
                if let Err(e) = prices::insert_price(&conn, price, agg.sources, agg.ts_ms) {
                    warn!(error = %e, "price history write failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "price persister lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Run a long-lived task, logging a panic instead of dying with it. The
/// running state (books, markets) lives outside these tasks and survives.
fn spawn_supervised<F>(name: &'static str, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::spawn(task).await {
            if e.is_panic() {
                error!(task = name, "task panicked; state preserved");
            }
        }
    });
}
