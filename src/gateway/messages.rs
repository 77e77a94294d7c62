//! Client protocol: tagged inbound requests and outbound events.
//!
//! Dollar amounts travel as two-decimal strings; book prices and share
//! counts are plain integers. Unknown inbound tags fail deserialization and
//! get one uniform `order_rejected` reply, the same channel every business
//! rejection uses.

use serde::{Deserialize, Serialize};

use crate::feeds::aggregator::AggregatorStatus;
use crate::models::{
    cents_to_dollars, slug_for, BookSide, Cents, Market, Order, OrderStatus, OrderType,
    OutcomeSide, RoundOutcome, Side, Trade, User,
};
use crate::engine::book::BookLevel;

// ============================================================================
// Inbound
// ============================================================================

/// Amounts arrive as `"12.34"` strings, but a bare number is tolerated.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireAmount {
    Text(String),
    Number(f64),
}

impl WireAmount {
    /// Integer cents, if the amount is well-formed and non-negative.
    pub fn as_cents(&self) -> Option<Cents> {
        match self {
            WireAmount::Text(s) => crate::models::dollars_to_cents(s),
            WireAmount::Number(n) if n.is_finite() && *n >= 0.0 => {
                let cents = (n * 100.0).round();
                // Reject sub-cent precision rather than silently rounding it.
                if (n * 100.0 - cents).abs() > 1e-6 {
                    return None;
                }
                Some(cents as Cents)
            }
            WireAmount::Number(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Open,
    All,
    Filled,
    Cancelled,
}

impl StatusFilter {
    /// Which stored statuses a filter selects; `None` means no constraint.
    pub fn statuses(&self) -> Option<&'static [OrderStatus]> {
        match self {
            StatusFilter::Open => Some(&[
                OrderStatus::Open,
                OrderStatus::PartiallyFilled,
                OrderStatus::Stopped,
            ]),
            StatusFilter::All => None,
            StatusFilter::Filled => Some(&[OrderStatus::Filled]),
            StatusFilter::Cancelled => Some(&[OrderStatus::Cancelled]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
        user_id: i64,
        auth_date: i64,
    },
    PlaceOrder {
        order_type: OrderType,
        side: Side,
        outcome: OutcomeSide,
        shares: i64,
        #[serde(default)]
        price: Option<i64>,
        #[serde(default)]
        stop_price: Option<i64>,
        #[serde(default)]
        slug: Option<String>,
    },
    CancelOrder {
        order_id: i64,
    },
    GetOrderbook {
        #[serde(default)]
        slug: Option<String>,
    },
    GetMyOrders {
        #[serde(default)]
        status: Option<StatusFilter>,
        #[serde(default)]
        slug: Option<String>,
    },
    GetOrder {
        order_id: i64,
    },
    AddLiquidity {
        slug: String,
        amount: WireAmount,
    },
    GetMarket {
        slug: String,
    },
    GetMarkets,
    Status,
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct OrderDto {
    pub id: i64,
    pub slug: String,
    pub side: Side,
    pub outcome: OutcomeSide,
    pub book_side: BookSide,
    pub order_type: OrderType,
    pub book_price: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<u8>,
    pub shares: u32,
    pub filled_shares: u32,
    pub remaining_shares: u32,
    pub cost_per_share: u8,
    pub status: OrderStatus,
    pub created_at: i64,
}

impl From<&Order> for OrderDto {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            slug: slug_for(order.round_start),
            side: order.side,
            outcome: order.outcome,
            book_side: order.book_side,
            order_type: order.order_type,
            book_price: order.book_price,
            stop_price: order.stop_price,
            shares: order.shares,
            filled_shares: order.filled_shares,
            remaining_shares: order.remaining_shares,
            cost_per_share: order.cost_per_share,
            status: order.status,
            created_at: order.created_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeDto {
    pub id: i64,
    pub slug: String,
    pub bid_order_id: i64,
    pub ask_order_id: i64,
    pub yes_user_id: i64,
    pub no_user_id: i64,
    pub exec_price: u8,
    pub shares: u32,
    pub created_at: i64,
}

impl From<&Trade> for TradeDto {
    fn from(trade: &Trade) -> Self {
        Self {
            id: trade.id,
            slug: slug_for(trade.round_start),
            bid_order_id: trade.bid_order_id,
            ask_order_id: trade.ask_order_id,
            yes_user_id: trade.yes_user_id,
            no_user_id: trade.no_user_id,
            exec_price: trade.exec_price,
            shares: trade.shares,
            created_at: trade.created_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDto {
    pub id: i64,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub balance: String,
}

impl From<&User> for UserDto {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name.clone(),
            username: user.username.clone(),
            balance: cents_to_dollars(user.balance_cents),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Price {
        price: f64,
        sources: usize,
        timestamp: i64,
    },
    PriceToBeat {
        slug: String,
        price: f64,
    },
    MarketList {
        markets: Vec<Market>,
    },
    MarketPhaseChange {
        market: Market,
    },
    Market {
        market: Market,
    },
    Orderbook {
        slug: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    OrderAccepted {
        order: OrderDto,
    },
    OrderRejected {
        error: String,
    },
    OrderUpdate {
        order: OrderDto,
    },
    OrderCancelled {
        order_id: i64,
        refund: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Trade {
        trade: TradeDto,
    },
    MyOrders {
        orders: Vec<OrderDto>,
    },
    OrderDetail {
        order: OrderDto,
        trades: Vec<TradeDto>,
    },
    LiquidityAdded {
        slug: String,
        amount: String,
        yes_shares: i64,
        no_shares: i64,
    },
    Settlement {
        slug: String,
        outcome: RoundOutcome,
        payout: String,
        balance: String,
    },
    BalanceUpdate {
        balance: String,
    },
    AuthSuccess {
        user: UserDto,
    },
    AuthError {
        error: String,
    },
    Status {
        aggregator: AggregatorStatus,
        connected_clients: usize,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl ServerMessage {
    /// Critical messages survive backpressure; price ticks and book
    /// refreshes may be shed.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            ServerMessage::Price { .. } | ServerMessage::Orderbook { .. }
        )
    }
}
