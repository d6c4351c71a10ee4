// =============================================================================
// Positions — persisted trackers and the live in-memory snapshot
// =============================================================================

mod active;
mod tracker;

pub use active::{ActiveCache, PositionData, PositionEvent};
pub use tracker::{InMemoryTrackerStore, Tracker, TrackerStatus, TrackerStore};
