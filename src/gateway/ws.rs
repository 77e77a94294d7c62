//! WebSocket endpoint: upgrade, per-connection writer task, and the
//! inbound dispatch loop.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error};

use crate::engine::orders::PlaceOrderRequest;
use crate::error::Reject;
use crate::models::{slug_for, RoundStart};
use crate::store::{ledger, prices};

use super::http::AppState;
use super::messages::{ClientMessage, ServerMessage};
use super::{ConnId, OutboundQueue};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let queue = OutboundQueue::new(state.config.client_queue_capacity);
    let conn_id = state.gateway.register(queue.clone());

    let writer_queue = queue.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let frame = writer_queue.pop().await;
            if sink.send(Message::Text(frame.text)).await.is_err() {
                break;
            }
        }
    });

    // A fresh client renders immediately: current markets plus the last
    // reference price, without waiting for the next tick.
    state.gateway.send_to_conn(
        conn_id,
        &ServerMessage::MarketList {
            markets: state.lifecycle.market_list(),
        },
    );
    if let Some(agg) = state.aggregator.latest() {
        if let Some(price) = agg.price {
            state.gateway.send_to_conn(
                conn_id,
                &ServerMessage::Price {
                    price,
                    sources: agg.sources,
                    timestamp: agg.ts_ms,
                },
            );
        }
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, conn_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id, error = %e, "client socket error");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    state.gateway.unregister(conn_id);
    writer.abort();
}

async fn handle_text(state: &AppState, conn_id: ConnId, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => {
            state.gateway.send_to_conn(
                conn_id,
                &ServerMessage::OrderRejected {
                    error: "unrecognised message type".to_string(),
                },
            );
            return;
        }
    };
    dispatch(state, conn_id, message).await;
}

async fn dispatch(state: &AppState, conn_id: ConnId, message: ClientMessage) {
    match message {
        ClientMessage::Auth {
            token,
            user_id,
            auth_date,
        } => handle_auth(state, conn_id, &token, user_id, auth_date).await,

        ClientMessage::PlaceOrder {
            order_type,
            side,
            outcome,
            shares,
            price,
            stop_price,
            slug,
        } => {
            let result = async {
                let user_id = require_auth(state, conn_id)?;
                let round_start = resolve_round(state, slug.as_deref()).await?;
                let request = PlaceOrderRequest {
                    round_start,
                    order_type,
                    side,
                    outcome,
                    shares: wire_shares(shares)?,
                    price: wire_price("price", price)?,
                    stop_price: wire_price("stop_price", stop_price)?,
                };
                state.engine.place_order(user_id, request).await
            }
            .await;
            if let Err(reject) = result {
                reply_rejected(state, conn_id, reject);
            }
        }

        ClientMessage::CancelOrder { order_id } => {
            let result = async {
                let user_id = require_auth(state, conn_id)?;
                state.engine.cancel_order(user_id, order_id).await
            }
            .await;
            if let Err(reject) = result {
                reply_rejected(state, conn_id, reject);
            }
        }

        ClientMessage::GetOrderbook { slug } => {
            match resolve_round(state, slug.as_deref()).await {
                Ok(round_start) => {
                    let snapshot = state.engine.orderbook(round_start);
                    state.gateway.send_to_conn(
                        conn_id,
                        &ServerMessage::Orderbook {
                            slug: slug_for(round_start),
                            bids: snapshot.bids,
                            asks: snapshot.asks,
                        },
                    );
                }
                Err(reject) => reply_rejected(state, conn_id, reject),
            }
        }

        ClientMessage::GetMyOrders { status, slug } => {
            let result = async {
                let user_id = require_auth(state, conn_id)?;
                let round_start = match slug.as_deref() {
                    Some(slug) => Some(resolve_round(state, Some(slug)).await?),
                    None => None,
                };
                let statuses = status.and_then(|f| f.statuses());
                let conn = state.store.conn().await;
                ledger::get_user_orders(&conn, user_id, round_start, statuses)
                    .map_err(Reject::from)
            }
            .await;
            match result {
                Ok(orders) => state.gateway.send_to_conn(
                    conn_id,
                    &ServerMessage::MyOrders {
                        orders: orders.iter().map(Into::into).collect(),
                    },
                ),
                Err(reject) => reply_rejected(state, conn_id, reject),
            }
        }

        ClientMessage::GetOrder { order_id } => {
            let result = async {
                let user_id = require_auth(state, conn_id)?;
                let conn = state.store.conn().await;
                let order = ledger::get_order(&conn, order_id)?.ok_or(Reject::OrderNotFound)?;
                if order.user_id != user_id {
                    return Err(Reject::OrderNotFound);
                }
                let trades = ledger::get_order_trades(&conn, order_id).map_err(Reject::from)?;
                Ok((order, trades))
            }
            .await;
            match result {
                Ok((order, trades)) => state.gateway.send_to_conn(
                    conn_id,
                    &ServerMessage::OrderDetail {
                        order: (&order).into(),
                        trades: trades.iter().map(Into::into).collect(),
                    },
                ),
                Err(reject) => reply_rejected(state, conn_id, reject),
            }
        }

        ClientMessage::AddLiquidity { slug, amount } => {
            let result = async {
                let user_id = require_auth(state, conn_id)?;
                let cents = amount
                    .as_cents()
                    .ok_or_else(|| Reject::invalid("amount must be a positive dollar amount"))?;
                let round_start = resolve_round(state, Some(&slug)).await?;
                state.engine.add_liquidity(user_id, round_start, cents).await
            }
            .await;
            if let Err(reject) = result {
                reply_rejected(state, conn_id, reject);
            }
        }

        ClientMessage::GetMarket { slug } => match find_market(state, &slug).await {
            Some(market) => {
                state
                    .gateway
                    .send_to_conn(conn_id, &ServerMessage::Market { market });
            }
            None => reply_rejected(state, conn_id, Reject::MarketNotFound),
        },

        ClientMessage::GetMarkets => {
            state.gateway.send_to_conn(
                conn_id,
                &ServerMessage::MarketList {
                    markets: state.lifecycle.market_list(),
                },
            );
        }

        ClientMessage::Status => {
            let now_ms = Utc::now().timestamp_millis();
            state.gateway.send_to_conn(
                conn_id,
                &ServerMessage::Status {
                    aggregator: state.aggregator.status(now_ms),
                    connected_clients: state.gateway.client_count(),
                },
            );
        }

        ClientMessage::Ping { timestamp } => {
            state
                .gateway
                .send_to_conn(conn_id, &ServerMessage::Pong { timestamp });
        }
    }
}

async fn handle_auth(
    state: &AppState,
    conn_id: ConnId,
    token: &str,
    user_id: i64,
    auth_date: i64,
) {
    if let Err(e) = state.auth.verify_token(token, user_id, auth_date) {
        state.gateway.send_to_conn(
            conn_id,
            &ServerMessage::AuthError {
                error: e.to_string(),
            },
        );
        return;
    }

    let user = {
        let mut conn = state.store.conn().await;
        match ledger::get_user(&conn, user_id) {
            Ok(Some(user)) => Ok(user),
            // Token holders normally exist already; a wiped database still
            // gets a fresh zero-balance account rather than a dead end.
            Ok(None) => conn
                .transaction()
                .map_err(anyhow::Error::new)
                .and_then(|tx| {
                    let user = ledger::get_or_create_user(&tx, user_id, "", None)?;
                    tx.commit()?;
                    Ok(user)
                }),
            Err(e) => Err(e),
        }
    };

    match user {
        Ok(user) => {
            state.gateway.authenticate(conn_id, user_id);
            state.gateway.send_to_conn(
                conn_id,
                &ServerMessage::AuthSuccess {
                    user: (&user).into(),
                },
            );
        }
        Err(e) => {
            error!(error = %e, "auth user lookup failed");
            state.gateway.send_to_conn(
                conn_id,
                &ServerMessage::AuthError {
                    error: "internal error".to_string(),
                },
            );
        }
    }
}

fn require_auth(state: &AppState, conn_id: ConnId) -> Result<i64, Reject> {
    state
        .gateway
        .user_of(conn_id)
        .ok_or(Reject::NotAuthenticated)
}

/// Map a slug to its round, defaulting to the current round. Falls back to
/// the store for markets already pruned from memory.
async fn resolve_round(state: &AppState, slug: Option<&str>) -> Result<RoundStart, Reject> {
    match slug {
        None => Ok(state.lifecycle.current_round()),
        Some(slug) => find_market(state, slug)
            .await
            .map(|m| m.round_start)
            .ok_or(Reject::MarketNotFound),
    }
}

async fn find_market(state: &AppState, slug: &str) -> Option<crate::models::Market> {
    if let Some(market) = state.lifecycle.get_market_by_slug(slug) {
        return Some(market);
    }
    let conn = state.store.conn().await;
    prices::get_market_by_slug(&conn, slug).ok().flatten()
}

fn wire_shares(shares: i64) -> Result<u32, Reject> {
    u32::try_from(shares)
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| Reject::invalid("shares must be a positive integer"))
}

fn wire_price(field: &str, price: Option<i64>) -> Result<Option<u8>, Reject> {
    match price {
        None => Ok(None),
        Some(p) if (1..=99).contains(&p) => Ok(Some(p as u8)),
        Some(_) => Err(Reject::invalid(format!(
            "{field} must be an integer between 1 and 99"
        ))),
    }
}

fn reply_rejected(state: &AppState, conn_id: ConnId, reject: Reject) {
    if reject.is_internal() {
        error!(error = ?reject, "internal error during request");
    }
    state.gateway.send_to_conn(
        conn_id,
        &ServerMessage::OrderRejected {
            error: reject.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shares_bounds() {
        assert_eq!(wire_shares(1).unwrap(), 1);
        assert_eq!(wire_shares(10_000).unwrap(), 10_000);
        assert!(matches!(wire_shares(0), Err(Reject::InvalidInput(_))));
        assert!(matches!(wire_shares(-5), Err(Reject::InvalidInput(_))));
        // Past u32: the conversion itself must refuse, not wrap.
        assert!(matches!(
            wire_shares(u32::MAX as i64 + 1),
            Err(Reject::InvalidInput(_))
        ));
    }

    #[test]
    fn test_wire_price_range() {
        assert_eq!(wire_price("price", None).unwrap(), None);
        assert_eq!(wire_price("price", Some(1)).unwrap(), Some(1));
        assert_eq!(wire_price("price", Some(99)).unwrap(), Some(99));
        for bad in [0, 100, -1, 1_000] {
            let err = wire_price("stop_price", Some(bad)).unwrap_err();
            assert!(matches!(err, Reject::InvalidInput(_)));
            assert_eq!(
                err.to_string(),
                "stop_price must be an integer between 1 and 99"
            );
        }
    }
}
