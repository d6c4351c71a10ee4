// =============================================================================
// Market feed — streaming hub and per-feed health tracking
// =============================================================================

mod health;
mod hub;

pub use health::{FeedHealth, FeedStatus, FeedStatusView};
pub use hub::MarketFeedHub;
