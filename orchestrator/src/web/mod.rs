// File: orchestrator/src/web/mod.rs
pub mod handlers;
pub mod server;

pub use server::{create_router, start_web_server};

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::history::OperationHistory;
use crate::scan_queue::ScanQueue;
use crate::session::Connection;
use crate::snapshot::SnapshotSource;

/// A configured pool: its connection and where its inventory comes from
#[derive(Clone)]
pub struct PoolHandle {
    pub connection: Connection,
    pub snapshots: Arc<dyn SnapshotSource>,
}

// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub history: OperationHistory,
    pub scans: ScanQueue<String>,
    pub pools: Arc<HashMap<String, PoolHandle>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, pools: HashMap<String, PoolHandle>) -> Self {
        let scans = ScanQueue::new(config.max_scans_per_connection());
        Self {
            config,
            history: OperationHistory::new(),
            scans,
            pools: Arc::new(pools),
        }
    }
}
