//! Client-visible rejection taxonomy.
//!
//! Everything a client can be told about a failed request lives here; the
//! message text is what goes out in `order_rejected` / error replies.
//! Internal faults are wrapped so callers roll back and report
//! "internal error" without leaking detail.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Reject {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Market not found")]
    MarketNotFound,

    #[error("Market is not open for trading")]
    MarketNotActive,

    #[error("Market is not in its provisioning window")]
    MarketNotProvisioning,

    #[error("Order not found")]
    OrderNotFound,

    #[error("Order cannot be cancelled")]
    NotCancellable,

    #[error("Insufficient liquidity: {available} shares available, need {need}")]
    InsufficientLiquidity { available: u32, need: u32 },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl Reject {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Reject::InvalidInput(msg.into())
    }

    /// Whether this rejection is a fault on our side rather than the client's.
    pub fn is_internal(&self) -> bool {
        matches!(self, Reject::Internal(_))
    }
}

impl From<rusqlite::Error> for Reject {
    fn from(e: rusqlite::Error) -> Self {
        Reject::Internal(anyhow::Error::new(e))
    }
}
