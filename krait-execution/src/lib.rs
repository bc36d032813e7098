//! The execution core: consumes trade plans and bar closes, drives risk
//! gates, order placement, exit management and reconciliation against the
//! venue, and publishes execution reports and risk events.

use std::sync::Arc;

use krait_bus::EventLog;
use krait_config::AppConfig;
use krait_exchange::VenueExecution;
use krait_store::Store;

pub mod executor;
pub mod gates;
pub mod lifecycle;
pub mod locks;
pub mod order_manager;
pub mod paper;
pub mod position_sync;
pub mod publisher;
pub mod quality;
pub mod reconcile;
pub mod risk_monitor;
pub mod sizing;
pub mod snapshotter;
pub mod trail;
pub mod ws_ingest;

pub use executor::TradePlanExecutor;
pub use lifecycle::BarCloseHandler;
pub use locks::PositionLocks;
pub use order_manager::EntryOrderManager;
pub use paper::PaperMatcher;
pub use position_sync::PositionSync;
pub use publisher::Publisher;
pub use reconcile::Reconciler;
pub use risk_monitor::RiskMonitor;
pub use snapshotter::Snapshotter;
pub use ws_ingest::WsIngest;

/// Shared service container handed to every loop at startup.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub venue: Arc<dyn VenueExecution>,
    pub publisher: Arc<Publisher>,
    /// Per-position advisory locks serializing matcher/reconcile/sync
    /// updates against the same row.
    pub position_locks: Arc<PositionLocks>,
}

impl Services {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<Store>,
        venue: Arc<dyn VenueExecution>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(
            log,
            Arc::clone(&store),
            config.consistency.drift_window_ms,
        ));
        Self {
            config,
            store,
            venue,
            publisher,
            position_locks: Arc::new(PositionLocks::new()),
        }
    }
}
