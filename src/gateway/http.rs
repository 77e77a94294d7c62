//! REST surface and router assembly.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::auth::AuthVerifier;
use crate::engine::lifecycle::RoundLifecycle;
use crate::engine::MatchingEngine;
use crate::feeds::aggregator::PriceAggregator;
use crate::models::{Config, Market};
use crate::store::{ledger, prices, Store};

use super::messages::UserDto;
use super::ws::websocket_handler;
use super::Gateway;

const HISTORY_LIMIT_MAX: usize = 500;
const OUTCOMES_LIMIT_MAX: usize = 50;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub engine: Arc<MatchingEngine>,
    pub lifecycle: Arc<RoundLifecycle>,
    pub aggregator: Arc<PriceAggregator>,
    pub gateway: Arc<Gateway>,
    pub auth: Arc<AuthVerifier>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/history", get(get_history))
        .route("/api/outcomes", get(get_outcomes))
        .route("/api/markets", get(get_markets))
        .route("/api/market/:slug", get(get_market))
        .route("/api/auth/telegram", post(auth_telegram))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn get_history(
    Query(params): Query<LimitQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<prices::PricePoint>>, StatusCode> {
    let limit = params.limit.unwrap_or(100).min(HISTORY_LIMIT_MAX);
    let conn = state.store.conn().await;
    prices::get_history(&conn, limit)
        .map(Json)
        .map_err(|e| {
            warn!(error = %e, "history query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_outcomes(
    Query(params): Query<LimitQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Market>>, StatusCode> {
    let limit = params.limit.unwrap_or(10).min(OUTCOMES_LIMIT_MAX);
    let conn = state.store.conn().await;
    prices::get_recent_outcomes(&conn, limit)
        .map(Json)
        .map_err(|e| {
            warn!(error = %e, "outcomes query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_markets(State(state): State<AppState>) -> Json<Vec<Market>> {
    Json(state.lifecycle.market_list())
}

/// Single market by slug; memory first, store fallback for aged-out rounds.
async fn get_market(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Market>, StatusCode> {
    if let Some(market) = state.lifecycle.get_market_by_slug(&slug) {
        return Ok(Json(market));
    }
    let conn = state.store.conn().await;
    match prices::get_market_by_slug(&conn, &slug) {
        Ok(Some(market)) => Ok(Json(market)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(error = %e, slug, "market lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Exchange an identity-provider claim for a session token.
async fn auth_telegram(
    State(state): State<AppState>,
    Json(claim): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let verified = state.auth.verify_claim(&claim).map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    let user = {
        let mut conn = state.store.conn().await;
        let tx = conn.transaction().map_err(internal)?;
        let user = ledger::get_or_create_user(
            &tx,
            verified.id,
            &verified.first_name,
            verified.username.as_deref(),
        )
        .map_err(internal)?;
        tx.commit().map_err(internal)?;
        user
    };

    let token = state
        .auth
        .mint_token(verified.id, verified.auth_date)
        .map_err(|e| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": e.to_string() })),
            )
        })?;

    Ok(Json(json!({
        "user": UserDto::from(&user),
        "token": token,
        "auth_date": verified.auth_date,
    })))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "auth endpoint failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}
