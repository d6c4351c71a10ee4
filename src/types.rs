// =============================================================================
// Shared types used across the Kavach risk engine
// =============================================================================
//
// Wire-facing enums serialise to the SCREAMING_SNAKE_CASE strings the broker
// API expects; everything else is plain Rust.
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchange segment
// ---------------------------------------------------------------------------

/// Exchange and segment identifier used across the broker REST and feed APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Segment {
    /// Index value feed (segment code 0). Never pruned from caches.
    IdxI,
    /// NSE Equity Cash (segment code 1).
    NseEq,
    /// NSE Futures & Options (segment code 2). Index options live here.
    NseFno,
    /// BSE Equity Cash (segment code 4).
    BseEq,
    /// BSE Futures & Options (segment code 8).
    BseFno,
}

impl Segment {
    /// Numeric segment code used in feed packets.
    pub fn code(self) -> u8 {
        match self {
            Self::IdxI => 0,
            Self::NseEq => 1,
            Self::NseFno => 2,
            Self::BseEq => 4,
            Self::BseFno => 8,
        }
    }

    /// Construct from a numeric segment code found in feed packets.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::IdxI),
            1 => Some(Self::NseEq),
            2 => Some(Self::NseFno),
            4 => Some(Self::BseEq),
            8 => Some(Self::BseFno),
            _ => None,
        }
    }

    /// Wire string, e.g. "NSE_FNO".
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdxI => "IDX_I",
            Self::NseEq => "NSE_EQ",
            Self::NseFno => "NSE_FNO",
            Self::BseEq => "BSE_EQ",
            Self::BseFno => "BSE_FNO",
        }
    }

    /// Index feeds are exempt from stale-tick pruning.
    pub fn is_index_feed(self) -> bool {
        matches!(self, Self::IdxI)
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDX_I" => Ok(Self::IdxI),
            "NSE_EQ" => Ok(Self::NseEq),
            "NSE_FNO" => Ok(Self::NseFno),
            "BSE_EQ" => Ok(Self::BseEq),
            "BSE_FNO" => Ok(Self::BseFno),
            other => Err(format!("unknown segment '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Instrument key
// ---------------------------------------------------------------------------

/// `(segment, security_id)` pair identifying one instrument at the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub segment: Segment,
    pub security_id: String,
}

impl InstrumentKey {
    pub fn new(segment: Segment, security_id: impl Into<String>) -> Self {
        Self {
            segment,
            security_id: security_id.into(),
        }
    }
}

impl std::fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.security_id)
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// Packet kind reported by the streaming feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Ticker,
    Quote,
    Full,
    PrevClose,
}

impl Default for TickKind {
    fn default() -> Self {
        Self::Ticker
    }
}

/// One last-traded-price observation from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub segment: Segment,
    pub security_id: String,
    /// Last traded price in rupees. Non-negative.
    pub ltp: f64,
    #[serde(default)]
    pub kind: TickKind,
    /// Broker-provided epoch seconds.
    pub ts: i64,
}

impl Tick {
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(self.segment, self.security_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Position side & direction
// ---------------------------------------------------------------------------

/// Side of an options position. The engine only opens long option legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    /// Long call — a bullish view on the underlying index.
    LongCe,
    /// Long put — a bearish view on the underlying index.
    LongPe,
}

impl TradeSide {
    pub fn direction(self) -> PositionDirection {
        match self {
            Self::LongCe => PositionDirection::Bullish,
            Self::LongPe => PositionDirection::Bearish,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongCe => write!(f, "long_ce"),
            Self::LongPe => write!(f, "long_pe"),
        }
    }
}

/// View on the underlying that a position expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionDirection {
    Bullish,
    Bearish,
}

impl std::fmt::Display for PositionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}

// ---------------------------------------------------------------------------
// Exit kind
// ---------------------------------------------------------------------------

/// Machine-readable classification of an exit, produced by the exit engine
/// alongside the human-readable reason string. Downstream consumers (the
/// edge-failure detector in particular) switch on this enum, never on reason
/// substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    StopLoss,
    TakeProfit,
    SecureProfit,
    TimeBased,
    PeakDrawdown,
    TrailingStop,
    SessionEnd,
    Underlying,
    Manual,
}

impl ExitKind {
    /// Base reason string embedded into the tracker's exit_reason.
    pub fn base_reason(self) -> &'static str {
        match self {
            Self::StopLoss => "SL HIT",
            Self::TakeProfit => "TP HIT",
            Self::SecureProfit => "secure profit",
            Self::TimeBased => "time-based exit",
            Self::PeakDrawdown => "peak_drawdown_exit",
            Self::TrailingStop => "TRAILING STOP",
            Self::SessionEnd => "session end",
            Self::Underlying => "underlying_exit",
            Self::Manual => "manual exit",
        }
    }

    /// Whether this exit counts toward the consecutive-stop-loss breaker.
    pub fn is_stop_loss(self) -> bool {
        matches!(self, Self::StopLoss | Self::TrailingStop | Self::PeakDrawdown)
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base_reason())
    }
}

/// Underlying index an option symbol belongs to, for per-index counters.
/// Longer prefixes are checked first so BANKNIFTY never matches NIFTY.
pub fn index_of_symbol(symbol: &str) -> &'static str {
    const INDICES: [&str; 7] = [
        "MIDCPNIFTY",
        "NIFTYNXT50",
        "BANKNIFTY",
        "FINNIFTY",
        "BANKEX",
        "SENSEX",
        "NIFTY",
    ];
    let upper = symbol.to_uppercase();
    INDICES
        .iter()
        .find(|idx| upper.starts_with(**idx))
        .copied()
        .unwrap_or("NIFTY")
}

// ---------------------------------------------------------------------------
// Order update wire types
// ---------------------------------------------------------------------------

/// Order status values delivered by the broker's order-update stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderUpdateStatus {
    Traded,
    Complete,
    Pending,
    Cancelled,
    Rejected,
}

impl OrderUpdateStatus {
    /// A fill that should transition the tracker.
    pub fn is_fill(self) -> bool {
        matches!(self, Self::Traded | Self::Complete)
    }
}

/// Buy or sell side of a transaction on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

/// Normalised order-update payload from the broker stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_no: String,
    pub order_status: OrderUpdateStatus,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub average_traded_price: f64,
    #[serde(default)]
    pub filled_quantity: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_code_roundtrip() {
        for seg in [
            Segment::IdxI,
            Segment::NseEq,
            Segment::NseFno,
            Segment::BseEq,
            Segment::BseFno,
        ] {
            assert_eq!(Segment::from_code(seg.code()), Some(seg));
        }
        assert_eq!(Segment::from_code(99), None);
    }

    #[test]
    fn segment_wire_format() {
        let json = serde_json::to_string(&Segment::NseFno).unwrap();
        assert_eq!(json, "\"NSE_FNO\"");
        let back: Segment = serde_json::from_str("\"IDX_I\"").unwrap();
        assert_eq!(back, Segment::IdxI);
    }

    #[test]
    fn side_maps_to_direction() {
        assert_eq!(TradeSide::LongCe.direction(), PositionDirection::Bullish);
        assert_eq!(TradeSide::LongPe.direction(), PositionDirection::Bearish);
    }

    #[test]
    fn exit_kind_stop_loss_family() {
        assert!(ExitKind::StopLoss.is_stop_loss());
        assert!(ExitKind::TrailingStop.is_stop_loss());
        assert!(ExitKind::PeakDrawdown.is_stop_loss());
        assert!(!ExitKind::TakeProfit.is_stop_loss());
        assert!(!ExitKind::SessionEnd.is_stop_loss());
    }

    #[test]
    fn index_prefix_resolution() {
        assert_eq!(index_of_symbol("NIFTY25JAN22000CE"), "NIFTY");
        assert_eq!(index_of_symbol("BANKNIFTY25JAN48000PE"), "BANKNIFTY");
        assert_eq!(index_of_symbol("FINNIFTY25JAN21000CE"), "FINNIFTY");
        assert_eq!(index_of_symbol("SENSEX25JAN80000CE"), "SENSEX");
    }

    #[test]
    fn order_update_deserialises_wire_shape() {
        let json = r#"{
            "order_no": "112111182045",
            "order_status": "TRADED",
            "transaction_type": "BUY",
            "average_traded_price": 145.25,
            "filled_quantity": 75
        }"#;
        let upd: OrderUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(upd.order_status, OrderUpdateStatus::Traded);
        assert_eq!(upd.transaction_type, TransactionType::Buy);
        assert!(upd.order_status.is_fill());
    }
}
