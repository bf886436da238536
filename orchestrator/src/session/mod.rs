//! Control-plane session abstractions
//!
//! The engine talks to the control plane only through [`RemoteSession`] and
//! asks [`RoleCheck`] before any call. A [`Connection`] bundles both with the
//! per-connection "disruption expected" flag that downstream connectivity
//! monitors read, and with the turn lock that keeps mutating operations on
//! one session from overlapping.

pub mod http;

#[cfg(test)]
#[allow(dead_code)]
#[path = "../../tests/common/fixtures/memory_session.rs"]
mod memory;

pub use http::HttpSession;
#[cfg(test)]
pub(crate) use memory::{InMemorySession, TaskScript};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use tracing::debug;

use crate::errors::SessionError;

/// Handle of a remote asynchronous task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(pub String);

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled
        )
    }
}

/// Point-in-time view of a remote task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    /// Remote progress in `[0, 1]`
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_info: Vec<String>,
}

/// Everything the engine needs from a control-plane session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Issue a named asynchronous call, returning the task that tracks it
    async fn call_async(&self, method: &str, args: Value) -> Result<TaskRef, SessionError>;

    async fn task_record(&self, task: &TaskRef) -> Result<TaskRecord, SessionError>;

    async fn cancel_task(&self, task: &TaskRef) -> Result<(), SessionError>;

    async fn destroy_task(&self, task: &TaskRef) -> Result<(), SessionError>;

    /// Write a key/value pair into the task's own metadata
    async fn add_task_tag(&self, task: &TaskRef, key: &str, value: &str)
        -> Result<(), SessionError>;

    /// Find a task carrying the given metadata tag
    async fn find_tagged_task(&self, key: &str, value: &str)
        -> Result<Option<TaskRef>, SessionError>;

    /// Synchronous call for simple property reads and writes
    async fn call(&self, method: &str, args: Value) -> Result<Value, SessionError>;
}

/// Answers "is method X permitted for the current session"
pub trait RoleCheck: Send + Sync {
    fn is_permitted(&self, method: &str) -> bool;
}

/// Role check for sessions with full administrative rights
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RoleCheck for AllowAll {
    fn is_permitted(&self, _method: &str) -> bool {
        true
    }
}

/// Role check backed by the list of methods the session's role may call.
/// Method names compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    methods: HashSet<String>,
}

impl PermissionSet {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            methods: methods
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl RoleCheck for PermissionSet {
    fn is_permitted(&self, method: &str) -> bool {
        self.methods.contains(&method.to_ascii_lowercase())
    }
}

#[derive(Debug, Default)]
struct DisruptionState {
    holders: u32,
    raised: u32,
    cleared: u32,
}

/// "Disruption expected" marker for a connection.
///
/// Set while a coordinated change may briefly cut the control plane off, so
/// connectivity-loss detectors reading it do not raise false alarms. Every
/// change holds it separately; it stays set until the last holder clears.
#[derive(Debug, Default)]
pub struct DisruptionFlag {
    state: Mutex<DisruptionState>,
}

impl DisruptionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_disruption(&self) {
        let mut state = self.lock();
        state.holders += 1;
        state.raised += 1;
        debug!("Disruption expected ({} holders)", state.holders);
    }

    /// Release one hold. Clearing a flag nobody holds does nothing.
    pub fn clear(&self) {
        let mut state = self.lock();
        if state.holders == 0 {
            return;
        }
        state.holders -= 1;
        state.cleared += 1;
        if state.holders == 0 {
            debug!("Disruption no longer expected");
        }
    }

    pub fn is_expected(&self) -> bool {
        self.lock().holders > 0
    }

    /// Number of holds taken so far
    pub fn raise_count(&self) -> u32 {
        self.lock().raised
    }

    /// Number of holds released so far
    pub fn clear_count(&self) -> u32 {
        self.lock().cleared
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DisruptionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A named control-plane connection as seen by operations
#[derive(Clone)]
pub struct Connection {
    name: String,
    session: Arc<dyn RemoteSession>,
    roles: Arc<dyn RoleCheck>,
    disruption: Arc<DisruptionFlag>,
    turns: Arc<TurnLock<()>>,
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        session: Arc<dyn RemoteSession>,
        roles: Arc<dyn RoleCheck>,
    ) -> Self {
        Self {
            name: name.into(),
            session,
            roles,
            disruption: Arc::new(DisruptionFlag::new()),
            turns: Arc::new(TurnLock::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    pub fn roles(&self) -> &Arc<dyn RoleCheck> {
        &self.roles
    }

    pub fn disruption(&self) -> &Arc<DisruptionFlag> {
        &self.disruption
    }

    /// Wait until no other serialized operation holds this connection.
    /// Turns are handed out first come, first served.
    pub async fn take_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.turns).lock_owned().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("disruption_expected", &self.disruption.is_expected())
            .finish()
    }
}
