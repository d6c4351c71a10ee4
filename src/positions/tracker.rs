// =============================================================================
// Tracker — authoritative state machine for one position
// =============================================================================
//
// Life-cycle:
//   pending ── fill ──▶ active ── exit ──▶ exited   (terminal)
//      │                                │
//      └── cancel/reject ──▶ cancelled ◀┘           (terminal)
//
// Once terminal, only exit_price, exit_reason/exit_kind and the PnL fields
// may change. `mark_exited` is a no-op on an already-exited tracker so exit
// retries cannot corrupt state.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::StoreError;
use crate::types::{ExitKind, Segment, TradeSide};

/// Status of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Pending,
    Active,
    Exited,
    Cancelled,
}

impl TrackerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Cancelled)
    }
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Exited => write!(f, "exited"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Persisted record of one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracker {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// Broker order number from the entry order acknowledgement.
    pub order_no: String,
    pub security_id: String,
    pub segment: Segment,
    pub symbol: String,
    pub side: TradeSide,
    /// Contracts held. Always >= 1.
    pub quantity: i64,
    /// Fill price of the entry leg. Positive before the tracker is active.
    pub entry_price: f64,
    #[serde(default)]
    pub avg_price: f64,
    pub status: TrackerStatus,
    #[serde(default)]
    pub last_pnl_rupees: f64,
    #[serde(default)]
    pub last_pnl_pct: f64,
    #[serde(default)]
    pub high_water_mark_pnl: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub exit_kind: Option<ExitKind>,
    /// Simulated fills only; no broker orders are placed for paper trackers.
    #[serde(default)]
    pub paper: bool,
    /// Sparse extensible metadata.
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tracker {
    /// Create a pending tracker after a successful order acknowledgement.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        order_no: impl Into<String>,
        security_id: impl Into<String>,
        segment: Segment,
        symbol: impl Into<String>,
        side: TradeSide,
        quantity: i64,
        entry_price: f64,
        paper: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            order_no: order_no.into(),
            security_id: security_id.into(),
            segment,
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            avg_price: 0.0,
            status: TrackerStatus::Pending,
            last_pnl_rupees: 0.0,
            last_pnl_pct: 0.0,
            high_water_mark_pnl: 0.0,
            exit_price: None,
            exit_reason: None,
            exit_kind: None,
            paper,
            meta: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn instrument_key(&self) -> crate::types::InstrumentKey {
        crate::types::InstrumentKey::new(self.segment, self.security_id.clone())
    }

    /// Transition pending → active on a buy fill. Ignored (with a warn) from
    /// any other state so replayed order updates cannot regress the machine.
    pub fn mark_active(&mut self, avg_price: f64, filled_quantity: i64) -> bool {
        if self.status != TrackerStatus::Pending {
            warn!(
                id = %self.id,
                status = %self.status,
                "mark_active ignored — tracker not pending"
            );
            return false;
        }
        if avg_price > 0.0 {
            self.avg_price = avg_price;
            self.entry_price = avg_price;
        }
        if filled_quantity > 0 {
            self.quantity = filled_quantity;
        }
        self.status = TrackerStatus::Active;
        self.updated_at = Utc::now();
        true
    }

    /// Transition to exited. Returns `false` (leaving every field untouched)
    /// when the tracker is already exited, making exit finalisation
    /// idempotent. A cancelled tracker cannot become exited.
    pub fn mark_exited(&mut self, exit_price: f64, reason: impl Into<String>, kind: ExitKind) -> bool {
        match self.status {
            TrackerStatus::Exited => {
                debug!(id = %self.id, "mark_exited no-op — already exited");
                false
            }
            TrackerStatus::Cancelled => {
                warn!(id = %self.id, "mark_exited ignored — tracker cancelled");
                false
            }
            _ => {
                self.status = TrackerStatus::Exited;
                self.exit_price = Some(exit_price);
                self.exit_reason = Some(reason.into());
                self.exit_kind = Some(kind);
                self.updated_at = Utc::now();
                true
            }
        }
    }

    /// Transition to cancelled (order rejected or cancelled before fill).
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TrackerStatus::Cancelled;
        self.exit_reason = Some(reason.into());
        self.updated_at = Utc::now();
        true
    }

    /// Update the cached PnL fields. High-water mark never decreases.
    pub fn record_pnl(&mut self, pnl_rupees: f64, pnl_pct: f64) {
        self.last_pnl_rupees = pnl_rupees;
        self.last_pnl_pct = pnl_pct;
        if pnl_rupees > self.high_water_mark_pnl {
            self.high_water_mark_pnl = pnl_rupees;
        }
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Store
// =============================================================================

/// Persistence contract for trackers. The production deployment backs this
/// with a database; the in-memory implementation carries the same semantics
/// for tests and standalone runs.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn insert(&self, tracker: Tracker) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Tracker>, StoreError>;

    /// Batched load — one call per cycle for all ids.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Tracker>, StoreError>;

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Tracker>, StoreError>;

    /// All trackers currently in `active` status.
    async fn active(&self) -> Result<Vec<Tracker>, StoreError>;

    /// Persist the given tracker row, replacing the stored one.
    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError>;
}

/// In-memory tracker store.
#[derive(Default)]
pub struct InMemoryTrackerStore {
    rows: RwLock<HashMap<String, Tracker>>,
}

impl InMemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl TrackerStore for InMemoryTrackerStore {
    async fn insert(&self, tracker: Tracker) -> Result<(), StoreError> {
        self.rows.write().insert(tracker.id.clone(), tracker);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Tracker>, StoreError> {
        Ok(self.rows.read().get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Tracker>, StoreError> {
        let rows = self.rows.read();
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Tracker>, StoreError> {
        Ok(self
            .rows
            .read()
            .values()
            .find(|t| t.order_no == order_no)
            .cloned())
    }

    async fn active(&self) -> Result<Vec<Tracker>, StoreError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|t| t.status == TrackerStatus::Active)
            .cloned()
            .collect())
    }

    async fn save(&self, tracker: &Tracker) -> Result<(), StoreError> {
        self.rows
            .write()
            .insert(tracker.id.clone(), tracker.clone());
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryTrackerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTrackerStore")
            .field("rows", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Tracker {
        Tracker::new_pending(
            "ORD-1",
            "49081",
            Segment::NseFno,
            "NIFTY25JAN22000CE",
            TradeSide::LongCe,
            75,
            0.0,
            false,
        )
    }

    #[test]
    fn lifecycle_pending_active_exited() {
        let mut t = pending();
        assert_eq!(t.status, TrackerStatus::Pending);

        assert!(t.mark_active(145.25, 75));
        assert_eq!(t.status, TrackerStatus::Active);
        assert!((t.entry_price - 145.25).abs() < 1e-9);

        assert!(t.mark_exited(151.0, "TP HIT 3.96%", ExitKind::TakeProfit));
        assert_eq!(t.status, TrackerStatus::Exited);
        assert_eq!(t.exit_price, Some(151.0));
        assert_eq!(t.exit_kind, Some(ExitKind::TakeProfit));
    }

    #[test]
    fn mark_exited_twice_is_noop() {
        let mut t = pending();
        t.mark_active(100.0, 75);
        assert!(t.mark_exited(96.0, "SL HIT -4.00%", ExitKind::StopLoss));

        let before = t.clone();
        assert!(!t.mark_exited(120.0, "TP HIT 20.00%", ExitKind::TakeProfit));
        assert_eq!(t.exit_price, before.exit_price);
        assert_eq!(t.exit_reason, before.exit_reason);
        assert_eq!(t.exit_kind, before.exit_kind);
    }

    #[test]
    fn no_state_regression() {
        let mut t = pending();
        t.mark_active(100.0, 75);
        // A replayed buy fill must not touch an active tracker.
        assert!(!t.mark_active(90.0, 50));
        assert!((t.entry_price - 100.0).abs() < 1e-9);

        t.mark_exited(105.0, "manual exit 5.00%", ExitKind::Manual);
        assert!(!t.mark_cancelled("late cancel"));
        assert_eq!(t.status, TrackerStatus::Exited);
    }

    #[test]
    fn cancelled_cannot_become_exited() {
        let mut t = pending();
        assert!(t.mark_cancelled("REJECTED"));
        assert!(!t.mark_exited(100.0, "SL HIT", ExitKind::StopLoss));
        assert_eq!(t.status, TrackerStatus::Cancelled);
    }

    #[test]
    fn hwm_is_monotone() {
        let mut t = pending();
        t.mark_active(100.0, 75);
        t.record_pnl(500.0, 6.7);
        t.record_pnl(200.0, 2.7);
        assert!((t.high_water_mark_pnl - 500.0).abs() < 1e-9);
        assert!((t.last_pnl_rupees - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn store_batch_and_active_queries() {
        let store = InMemoryTrackerStore::new();

        let mut a = pending();
        a.mark_active(100.0, 75);
        let b = pending();
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let many = store
            .get_many(&[a.id.clone(), b.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 2);

        let by_order = store.find_by_order_no("ORD-1").await.unwrap();
        assert!(by_order.is_some());
    }
}
