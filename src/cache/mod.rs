// =============================================================================
// Tick & PnL caches — hot in-memory layer plus warm Redis layer
// =============================================================================

mod tick;
mod warm;

pub use tick::TickCache;
pub use warm::{PnlSnapshot, PruneStats, WarmCache, WarmPnl, WarmTick};
