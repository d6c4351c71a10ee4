// =============================================================================
// Engine — exit execution, trailing, entry admission, driver loop,
// reconciliation, and lifecycle supervision
// =============================================================================

mod entry;
mod exit;
mod reconcile;
mod risk_loop;
mod supervisor;
mod trailing;

pub use entry::{CapitalAllocator, EntryGuard, EntryRejected, FixedLotAllocator, Instrument,
    InstrumentResolver, KillSwitch, ReentryBook, SignalPick, StaticInstrumentResolver};
pub use exit::{ExitEngine, ExitOutcome};
pub use reconcile::{ReconcileStats, Reconciler};
pub use risk_loop::{LoopMetrics, LoopMetricsView, RiskManager};
pub use supervisor::{run_prune_loop, Supervisor};
pub use trailing::{TrailingAction, TrailingEngine};
