// =============================================================================
// Entry gating — daily capital limits and edge-failure breakers
// =============================================================================

mod daily;
mod edge_failure;

pub use daily::{DailyLimits, TradeGate};
pub use edge_failure::{EdgeFailureDetector, PauseState};
