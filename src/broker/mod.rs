// =============================================================================
// Broker gateway — typed contract the engine speaks to the outside world
// =============================================================================
//
// The core consumes this trait; implementations live at the edges
// (`DhanGateway` for the real API, `PaperGateway` for simulation). Every
// method returns a typed success or a typed `BrokerError` — no response
// shape sniffing anywhere above this boundary.
// =============================================================================

mod dhan;
pub mod order_updates;
mod paper;

pub use dhan::DhanGateway;
pub use paper::PaperGateway;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Segment, TransactionType};

/// Typed broker failure.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker http error: {0}")]
    Http(String),
    #[error("broker api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("broker call timed out")]
    Timeout,
    #[error("broker response invalid: {0}")]
    InvalidResponse(String),
    #[error("order rejected: {0}")]
    Rejected(String),
}

/// A market order request. `client_order_id` makes placement idempotent at
/// the broker.
#[derive(Debug, Clone, Serialize)]
pub struct MarketOrderRequest {
    pub segment: Segment,
    pub security_id: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub client_order_id: String,
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Acknowledgement of a flatten request; `exit_price` is known immediately
/// only in paper mode or when the broker echoes the fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitAck {
    pub order_id: String,
    pub exit_price: Option<f64>,
}

/// Broker-side view of one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub qty: i64,
    pub avg_price: f64,
    pub upnl: f64,
    pub rpnl: f64,
    pub last_ltp: f64,
}

/// Account funds snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub cash: f64,
    pub equity: f64,
    pub mtm: f64,
    pub exposure: f64,
}

/// Narrow order/quote surface the engine depends on.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submit a market order. Idempotent per `client_order_id`.
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<OrderAck, BrokerError>;

    /// Flatten the net position in one instrument.
    async fn flat_position(
        &self,
        segment: Segment,
        security_id: &str,
    ) -> Result<ExitAck, BrokerError>;

    /// Current broker-side position for one instrument, if any.
    async fn position(
        &self,
        segment: Segment,
        security_id: &str,
    ) -> Result<Option<BrokerPosition>, BrokerError>;

    /// Account funds.
    async fn wallet_snapshot(&self) -> Result<WalletSnapshot, BrokerError>;

    /// Last traded prices for many instruments, grouped by segment. One RPC
    /// covers a whole segment.
    async fn ltp_batch(
        &self,
        request: &HashMap<Segment, Vec<String>>,
    ) -> Result<HashMap<Segment, HashMap<String, f64>>, BrokerError>;

    /// Move the protective stop leg of an open position. Rejected when the
    /// new trigger is not an improvement is a broker-side concern.
    async fn amend_protective_stop(
        &self,
        segment: Segment,
        security_id: &str,
        order_no: &str,
        trigger_price: f64,
    ) -> Result<(), BrokerError>;
}

/// Build the ≤25-char client order id: `AS-{KEY0..3}-{SID}-{last6(ts)}`.
pub fn client_order_id(api_key: &str, security_id: &str, unix_ts: i64) -> String {
    let key_prefix: String = api_key.chars().take(4).collect();
    let ts = format!("{unix_ts}");
    let ts_tail = if ts.len() > 6 { &ts[ts.len() - 6..] } else { &ts };
    let mut id = format!("AS-{key_prefix}-{security_id}-{ts_tail}");
    id.truncate(25);
    id
}
