// =============================================================================
// Order-update stream — applies broker fill/cancel events to trackers
// =============================================================================
//
// A BUY fill transitions the tracker to active (avg price + filled quantity)
// and seeds its live position; a SELL fill transitions it to exited with the
// traded price. Replayed or out-of-order updates are absorbed by the tracker
// state machine, which never regresses.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::feed::MarketFeedHub;
use crate::positions::{ActiveCache, PositionData, TrackerStore};
use crate::types::{ExitKind, OrderUpdate, OrderUpdateStatus, TransactionType};

/// What an order update did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedTransition {
    Activated,
    Exited,
    Cancelled,
    Ignored,
}

/// Apply one normalised order update.
///
/// Unknown order numbers and updates that would regress a tracker's state
/// machine are ignored (with a log line), never errors: the stream replays
/// on reconnect.
pub async fn apply_order_update(
    update: &OrderUpdate,
    trackers: &dyn TrackerStore,
    active_cache: &ActiveCache,
    hub: Option<&Arc<MarketFeedHub>>,
) -> Result<AppliedTransition> {
    let Some(mut tracker) = trackers
        .find_by_order_no(&update.order_no)
        .await
        .context("order-update tracker lookup failed")?
    else {
        debug!(order_no = %update.order_no, "order update for unknown tracker ignored");
        return Ok(AppliedTransition::Ignored);
    };

    match (update.order_status, update.transaction_type) {
        (status, TransactionType::Buy) if status.is_fill() => {
            if !tracker.mark_active(update.average_traded_price, update.filled_quantity) {
                return Ok(AppliedTransition::Ignored);
            }
            trackers.save(&tracker).await.context("tracker save failed")?;

            let position = PositionData::new(
                tracker.id.clone(),
                tracker.security_id.clone(),
                tracker.segment,
                tracker.entry_price,
                tracker.quantity,
                tracker.side.direction(),
            );
            let key = position.instrument_key();
            active_cache.add(position);
            if let Some(hub) = hub {
                hub.subscribe(key);
            }

            info!(
                tracker_id = %tracker.id,
                order_no = %update.order_no,
                avg_price = update.average_traded_price,
                qty = update.filled_quantity,
                "entry fill — tracker active"
            );
            Ok(AppliedTransition::Activated)
        }

        (status, TransactionType::Sell) if status.is_fill() => {
            let reason = format!("broker fill {:.2}", update.average_traded_price);
            if !tracker.mark_exited(update.average_traded_price, reason, ExitKind::Manual) {
                // Already exited by the exit engine — idempotent.
                return Ok(AppliedTransition::Ignored);
            }
            trackers.save(&tracker).await.context("tracker save failed")?;
            active_cache.remove(&tracker.id);

            info!(
                tracker_id = %tracker.id,
                order_no = %update.order_no,
                exit_price = update.average_traded_price,
                "exit fill — tracker exited via order update"
            );
            Ok(AppliedTransition::Exited)
        }

        (OrderUpdateStatus::Cancelled | OrderUpdateStatus::Rejected, _) => {
            let reason = format!("{:?}", update.order_status).to_uppercase();
            if !tracker.mark_cancelled(reason) {
                return Ok(AppliedTransition::Ignored);
            }
            trackers.save(&tracker).await.context("tracker save failed")?;
            active_cache.remove(&tracker.id);

            warn!(
                tracker_id = %tracker.id,
                order_no = %update.order_no,
                status = ?update.order_status,
                "order cancelled/rejected — tracker cancelled"
            );
            Ok(AppliedTransition::Cancelled)
        }

        _ => Ok(AppliedTransition::Ignored),
    }
}

/// Parse an order-update frame. Non-update frames yield `Ok(None)`.
pub fn parse_order_update_frame(text: &str) -> Result<Option<OrderUpdate>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse order-update JSON")?;

    if root["type"].as_str() != Some("order_update") {
        return Ok(None);
    }

    let update: OrderUpdate =
        serde_json::from_value(root).context("order-update payload malformed")?;
    Ok(Some(update))
}

/// Consume the broker's order-update WebSocket until it disconnects, then
/// return so the caller's outer loop can reconnect.
pub async fn run_order_update_stream(
    url: &str,
    trackers: Arc<dyn TrackerStore>,
    active_cache: Arc<ActiveCache>,
    hub: Arc<MarketFeedHub>,
) -> Result<()> {
    info!(url, "connecting to order-update WebSocket");
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to order-update WebSocket")?;
    info!("order-update WebSocket connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_order_update_frame(&text) {
                    Ok(Some(update)) => {
                        if let Err(e) =
                            apply_order_update(&update, trackers.as_ref(), &active_cache, Some(&hub))
                                .await
                        {
                            error!(error = %e, order_no = %update.order_no, "order update apply failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "unparseable order-update frame"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "order-update WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("order-update WebSocket stream ended");
                return Ok(());
            }
        }
    }
}
