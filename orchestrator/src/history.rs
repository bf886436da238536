//! Operation history
//!
//! Keeps the user-facing operations a service instance has run so the status
//! API can list them, look one up, and cancel it. Internal sub-operations
//! (`suppress_history`) are never registered.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::limits::MAX_HISTORY_ENTRIES;
use crate::operation::{Operation, OperationSnapshot};

pub struct OperationHistory {
    entries: Arc<RwLock<Vec<Arc<Operation>>>>,
    max_entries: usize,
}

impl OperationHistory {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    /// Record an operation. Returns false for suppressed operations.
    pub async fn register(&self, operation: Arc<Operation>) -> bool {
        if operation.is_history_suppressed() {
            debug!("Not recording suppressed operation {}", operation.id());
            return false;
        }

        let mut entries = self.entries.write().await;
        if entries.iter().any(|op| op.id() == operation.id()) {
            return true;
        }
        entries.push(operation);

        // Over capacity: drop the oldest finished entries, never running ones
        let mut excess = entries.len().saturating_sub(self.max_entries);
        if excess > 0 {
            entries.retain(|op| {
                if excess > 0 && op.state().is_terminal() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
        true
    }

    /// Newest first
    pub async fn list(&self) -> Vec<OperationSnapshot> {
        let entries = self.entries.read().await;
        entries.iter().rev().map(|op| op.snapshot()).collect()
    }

    pub async fn find(&self, id: Uuid) -> Option<Arc<Operation>> {
        let entries = self.entries.read().await;
        entries.iter().find(|op| op.id() == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop finished operations older than `max_hours`
    pub async fn cleanup_finished(&self, max_hours: i64) -> u32 {
        let mut entries = self.entries.write().await;
        let cutoff = Utc::now() - chrono::Duration::hours(max_hours);
        let initial_count = entries.len();

        entries.retain(|op| match op.finished_at() {
            Some(finished) if op.state().is_terminal() => finished > cutoff,
            _ => true,
        });

        let cleaned_count = initial_count - entries.len();
        if cleaned_count > 0 {
            info!(
                "Removed {} finished operations older than {}h from history",
                cleaned_count, max_hours
            );
        }
        cleaned_count as u32
    }
}

impl Default for OperationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for OperationHistory {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            max_entries: self.max_entries,
        }
    }
}
