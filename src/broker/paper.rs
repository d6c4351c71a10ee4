// =============================================================================
// Paper gateway — simulated order execution against the freshest known LTP
// =============================================================================
//
// No request ever leaves the process. Fills and exits are computed from the
// hot tick cache; order ids are sequential `PAPER-n` strings so the rest of
// the engine cannot tell simulation from the real thing.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cache::TickCache;
use crate::types::{InstrumentKey, Segment, TransactionType};

use super::{
    BrokerError, BrokerGateway, BrokerPosition, ExitAck, MarketOrderRequest, OrderAck,
    WalletSnapshot,
};

/// Simulated paper wallet size.
const PAPER_CASH: f64 = 500_000.0;

#[derive(Debug, Clone)]
struct PaperLeg {
    qty: i64,
    avg_price: f64,
}

/// In-process [`BrokerGateway`] used when `paper_trading.enabled` is on.
pub struct PaperGateway {
    tick_cache: Arc<TickCache>,
    order_seq: AtomicU64,
    legs: RwLock<HashMap<InstrumentKey, PaperLeg>>,
}

impl PaperGateway {
    pub fn new(tick_cache: Arc<TickCache>) -> Self {
        Self {
            tick_cache,
            order_seq: AtomicU64::new(1),
            legs: RwLock::new(HashMap::new()),
        }
    }

    fn next_order_id(&self) -> String {
        format!("PAPER-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn ltp_for(&self, segment: Segment, security_id: &str) -> Option<f64> {
        self.tick_cache
            .ltp(&InstrumentKey::new(segment, security_id))
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<OrderAck, BrokerError> {
        let key = InstrumentKey::new(request.segment, request.security_id.clone());
        let ltp = self.ltp_for(request.segment, &request.security_id).ok_or(
            BrokerError::Rejected(format!("no LTP known for {key} — cannot simulate fill")),
        )?;

        let order_id = self.next_order_id();
        let mut legs = self.legs.write();
        match request.transaction_type {
            TransactionType::Buy => {
                let leg = legs.entry(key.clone()).or_insert(PaperLeg { qty: 0, avg_price: 0.0 });
                let total_cost = leg.avg_price * leg.qty as f64 + ltp * request.quantity as f64;
                leg.qty += request.quantity;
                leg.avg_price = if leg.qty > 0 { total_cost / leg.qty as f64 } else { 0.0 };
            }
            TransactionType::Sell => {
                if let Some(leg) = legs.get_mut(&key) {
                    leg.qty = (leg.qty - request.quantity).max(0);
                    if leg.qty == 0 {
                        legs.remove(&key);
                    }
                }
            }
        }

        info!(
            order_id = %order_id,
            instrument = %key,
            side = ?request.transaction_type,
            qty = request.quantity,
            fill = ltp,
            "paper order filled"
        );
        Ok(OrderAck { order_id })
    }

    async fn flat_position(
        &self,
        segment: Segment,
        security_id: &str,
    ) -> Result<ExitAck, BrokerError> {
        let key = InstrumentKey::new(segment, security_id);
        let ltp = self
            .ltp_for(segment, security_id)
            .ok_or(BrokerError::Rejected(format!(
                "no LTP known for {key} — cannot simulate exit"
            )))?;

        self.legs.write().remove(&key);
        let order_id = self.next_order_id();
        debug!(order_id = %order_id, instrument = %key, exit = ltp, "paper position flattened");
        Ok(ExitAck {
            order_id,
            exit_price: Some(ltp),
        })
    }

    async fn position(
        &self,
        segment: Segment,
        security_id: &str,
    ) -> Result<Option<BrokerPosition>, BrokerError> {
        let key = InstrumentKey::new(segment, security_id);
        let legs = self.legs.read();
        let Some(leg) = legs.get(&key) else {
            return Ok(None);
        };
        let ltp = self.ltp_for(segment, security_id).unwrap_or(leg.avg_price);
        Ok(Some(BrokerPosition {
            qty: leg.qty,
            avg_price: leg.avg_price,
            upnl: (ltp - leg.avg_price) * leg.qty as f64,
            rpnl: 0.0,
            last_ltp: ltp,
        }))
    }

    async fn wallet_snapshot(&self) -> Result<WalletSnapshot, BrokerError> {
        Ok(WalletSnapshot {
            cash: PAPER_CASH,
            equity: PAPER_CASH,
            mtm: 0.0,
            exposure: 0.0,
        })
    }

    async fn ltp_batch(
        &self,
        request: &HashMap<Segment, Vec<String>>,
    ) -> Result<HashMap<Segment, HashMap<String, f64>>, BrokerError> {
        let mut out: HashMap<Segment, HashMap<String, f64>> = HashMap::new();
        for (segment, sids) in request {
            let mut prices = HashMap::new();
            for sid in sids {
                if let Some(ltp) = self.ltp_for(*segment, sid) {
                    prices.insert(sid.clone(), ltp);
                }
            }
            if !prices.is_empty() {
                out.insert(*segment, prices);
            }
        }
        Ok(out)
    }

    async fn amend_protective_stop(
        &self,
        _segment: Segment,
        _security_id: &str,
        order_no: &str,
        trigger_price: f64,
    ) -> Result<(), BrokerError> {
        debug!(order_no, trigger_price, "paper protective stop amended (no-op)");
        Ok(())
    }
}

impl std::fmt::Debug for PaperGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperGateway")
            .field("open_legs", &self.legs.read().len())
            .finish()
    }
}
