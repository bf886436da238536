//! Connections over the in-memory control plane

use std::sync::Arc;

use orchestrator::session::{AllowAll, Connection, PermissionSet};

use super::memory_session::{InMemorySession, RecordedCall};

pub fn connection(name: &str) -> (Arc<InMemorySession>, Connection) {
    let session = Arc::new(InMemorySession::new());
    let connection = Connection::new(name, session.clone(), Arc::new(AllowAll));
    (session, connection)
}

pub fn restricted_connection(name: &str, allowed: &[&str]) -> (Arc<InMemorySession>, Connection) {
    let session = Arc::new(InMemorySession::new());
    let connection = Connection::new(
        name,
        session.clone(),
        Arc::new(PermissionSet::new(allowed.iter().copied())),
    );
    (session, connection)
}

/// Compact `method(arg)` rendering of recorded calls, keeping only those
/// that carry `key`
pub fn calls_by(calls: &[RecordedCall], key: &str) -> Vec<String> {
    calls
        .iter()
        .filter_map(|call| call.arg(key).map(|v| format!("{}({})", call.method, v)))
        .collect()
}
