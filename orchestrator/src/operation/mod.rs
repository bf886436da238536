//! Operations: the atomic unit of asynchronous work
//!
//! An [`Operation`] wraps an [`OperationBody`] with everything callers observe:
//! a monotonic state machine, a clamped non-decreasing percentage, the retained
//! error, the result, cancellation and an ordered event stream.
//!
//! # Lifecycle
//!
//! ```ignore
//! let op = Arc::new(Operation::new(Some(connection), "Scan SR", "Scanning...", body));
//! let mut events = op.subscribe();
//! op.run_async();            // or op.run_sync(&connection).await
//! while let Some(event) = events.recv().await { /* progress, description, completion */ }
//! ```
//!
//! For any single transition events arrive as progress, then description,
//! then completion. An operation starts at most once and never leaves a
//! terminal state.

pub mod composite;
pub mod poller;

pub use composite::{Composite, CompositeMode};
pub use poller::{map_progress, PollSettings};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::constants::tags;
use crate::errors::OperationError;
use crate::session::{Connection, RemoteSession, TaskRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    NotStarted,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OperationEvent {
    Started { id: Uuid },
    ProgressChanged { id: Uuid, percent: u8 },
    DescriptionChanged { id: Uuid, description: String },
    TitleChanged { id: Uuid, title: String },
    Completed { id: Uuid },
    Cancelled { id: Uuid },
    Failed { id: Uuid, message: String },
}

impl OperationEvent {
    pub fn operation_id(&self) -> Uuid {
        match self {
            OperationEvent::Started { id }
            | OperationEvent::ProgressChanged { id, .. }
            | OperationEvent::DescriptionChanged { id, .. }
            | OperationEvent::TitleChanged { id, .. }
            | OperationEvent::Completed { id }
            | OperationEvent::Cancelled { id }
            | OperationEvent::Failed { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationEvent::Completed { .. }
                | OperationEvent::Cancelled { .. }
                | OperationEvent::Failed { .. }
        )
    }
}

/// Error as retained on an operation for progress displays and history logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationFailure {
    pub message: String,
    pub short_message: String,
    pub details: Vec<String>,
}

impl From<&OperationError> for OperationFailure {
    fn from(err: &OperationError) -> Self {
        Self {
            message: err.to_string(),
            short_message: err.short_message(),
            details: err.details(),
        }
    }
}

/// The unit's own logic
#[async_trait]
pub trait OperationBody: Send + Sync {
    async fn run(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError>;

    /// Remote methods checked against the session's role before `run`
    fn required_permissions(&self) -> Vec<String> {
        Vec::new()
    }

    fn children(&self) -> &[Arc<Operation>] {
        &[]
    }

    /// Called once when cancellation is first requested
    fn on_cancel(&self) {}
}

struct Status {
    state: OperationState,
    title: String,
    description: String,
    percent: u8,
    error: Option<OperationError>,
    result: Option<String>,
    related_task: Option<TaskRef>,
    /// Restore tasks must run to completion even when the operation is cancelled
    related_task_cancellable: bool,
    running_on: Option<Connection>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancel_allowed: bool,
    subscribers: Vec<mpsc::UnboundedSender<OperationEvent>>,
}

impl Status {
    fn emit(&mut self, event: OperationEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Serializable view of an operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub state: OperationState,
    pub percent_complete: u8,
    pub error: Option<OperationFailure>,
    pub result: Option<String>,
    pub cancel_allowed: bool,
    pub connection: Option<String>,
    pub applies_to: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OperationSnapshot>,
}

pub struct Operation {
    id: Uuid,
    connection: Option<Connection>,
    body: Box<dyn OperationBody>,
    applies_to: Vec<String>,
    suppress_history: bool,
    settings: PollSettings,
    rehydrate: AtomicBool,
    cancel_requested: AtomicBool,
    cancel_signal: Notify,
    status: Mutex<Status>,
}

impl Operation {
    pub fn new(
        connection: Option<Connection>,
        title: impl Into<String>,
        description: impl Into<String>,
        body: impl OperationBody + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            body: Box::new(body),
            applies_to: Vec::new(),
            suppress_history: false,
            settings: PollSettings::default(),
            rehydrate: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            status: Mutex::new(Status {
                state: OperationState::NotStarted,
                title: title.into(),
                description: description.into(),
                percent: 0,
                error: None,
                result: None,
                related_task: None,
                related_task_cancellable: true,
                running_on: None,
                started_at: None,
                finished_at: None,
                cancel_allowed: true,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Construct with a known id so the first remote task this operation
    /// starts re-attaches to a still-running task stamped with that id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self.rehydrate = AtomicBool::new(true);
        self
    }

    pub fn applies_to(mut self, references: Vec<String>) -> Self {
        self.applies_to = references;
        self
    }

    pub fn suppress_history(mut self, suppress: bool) -> Self {
        self.suppress_history = suppress;
        self
    }

    pub fn with_poll_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cancel_allowed(mut self, allowed: bool) -> Self {
        self.status
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_allowed = allowed;
        self
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Running ===

    /// Spawn the operation on its own worker task and return immediately.
    /// `Started` has been emitted by the time this returns.
    pub fn run_async(self: &Arc<Self>) -> JoinHandle<Result<(), OperationError>> {
        let begun = self.begin();
        let operation = Arc::clone(self);
        tokio::spawn(async move {
            begun?;
            let connection = operation.connection.clone();
            operation.execute(connection).await
        })
    }

    /// Spawn the operation once every earlier serialized operation on the
    /// same connection has finished. It stays `NotStarted` while it waits, so
    /// cancelling it in the meantime means it never calls out.
    pub fn run_serialized(self: &Arc<Self>) -> JoinHandle<Result<(), OperationError>> {
        let operation = Arc::clone(self);
        tokio::spawn(async move {
            let _turn = match operation.connection.clone() {
                Some(connection) => Some(connection.take_turn().await),
                None => None,
            };
            operation.run_inline().await
        })
    }

    /// Run inline on the caller's task with a caller-supplied connection
    pub async fn run_sync(&self, connection: &Connection) -> Result<(), OperationError> {
        self.begin()?;
        self.execute(Some(connection.clone())).await
    }

    /// Run inline on the caller's task with the operation's own connection
    pub async fn run_inline(&self) -> Result<(), OperationError> {
        self.begin()?;
        self.execute(self.connection.clone()).await
    }

    fn begin(&self) -> Result<(), OperationError> {
        let mut status = self.lock_status();
        if status.state != OperationState::NotStarted {
            return Err(OperationError::precondition(format!(
                "operation '{}' ({}) was already started",
                status.title, self.id
            )));
        }
        status.state = OperationState::Running;
        status.started_at = Some(Utc::now());
        status.emit(OperationEvent::Started { id: self.id });
        Ok(())
    }

    #[instrument(skip(self, connection), fields(operation = %self.id))]
    async fn execute(&self, connection: Option<Connection>) -> Result<(), OperationError> {
        if self.suppress_history {
            debug!("Running sub-operation '{}'", self.title());
        } else {
            info!("Started operation '{}'", self.title());
        }
        self.lock_status().running_on = connection.clone();

        let outcome = match self.check_permissions(connection.as_ref()) {
            Err(e) => Err(e),
            Ok(()) if self.is_cancel_requested() => Err(OperationError::Cancelled),
            Ok(()) => {
                let ctx = OperationContext {
                    operation: self,
                    connection,
                };
                self.body.run(&ctx).await
            }
        };

        self.finish(&outcome);
        outcome
    }

    /// RBAC precheck: every required method must be permitted by the role
    pub fn check_permissions(&self, connection: Option<&Connection>) -> Result<(), OperationError> {
        let required = self.body.required_permissions();
        if required.is_empty() {
            return Ok(());
        }

        let connection = connection.ok_or_else(|| {
            OperationError::precondition(format!(
                "operation '{}' needs a connection to check permissions",
                self.title()
            ))
        })?;

        let missing: Vec<String> = required
            .into_iter()
            .filter(|method| !connection.roles().is_permitted(method))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            warn!(
                "Operation '{}' denied on {}: missing {}",
                self.title(),
                connection.name(),
                missing.join(", ")
            );
            Err(OperationError::PermissionDenied { missing })
        }
    }

    fn finish(&self, outcome: &Result<(), OperationError>) {
        let mut status = self.lock_status();
        status.finished_at = Some(Utc::now());
        let elapsed = status
            .started_at
            .map(|started| Utc::now().signed_duration_since(started).num_seconds())
            .unwrap_or_default();

        match outcome {
            Ok(()) => {
                if status.percent < 100 {
                    status.percent = 100;
                    status.emit(OperationEvent::ProgressChanged {
                        id: self.id,
                        percent: 100,
                    });
                }
                let description = "Completed".to_string();
                status.description = description.clone();
                status.emit(OperationEvent::DescriptionChanged {
                    id: self.id,
                    description,
                });
                status.state = OperationState::Completed;
                status.emit(OperationEvent::Completed { id: self.id });
                if self.suppress_history {
                    debug!("Sub-operation '{}' completed", status.title);
                } else {
                    info!("Operation '{}' completed (took {}s)", status.title, elapsed);
                }
            }
            Err(OperationError::Cancelled) => {
                let description = "Cancelled".to_string();
                status.description = description.clone();
                status.emit(OperationEvent::DescriptionChanged {
                    id: self.id,
                    description,
                });
                status.error = Some(OperationError::Cancelled);
                status.state = OperationState::Cancelled;
                status.emit(OperationEvent::Cancelled { id: self.id });
                warn!("Operation '{}' cancelled after {}s", status.title, elapsed);
            }
            Err(e) => {
                let description = e.short_message();
                status.description = description.clone();
                status.emit(OperationEvent::DescriptionChanged {
                    id: self.id,
                    description,
                });
                status.error = Some(e.clone());
                status.state = OperationState::Failed;
                status.emit(OperationEvent::Failed {
                    id: self.id,
                    message: e.to_string(),
                });
                error!("Operation '{}' failed: {}", status.title, e);
            }
        }

        // Terminal: close every subscription
        status.subscribers.clear();
    }

    // === Cancellation ===

    /// Request cancellation. Returns false when the operation is terminal or
    /// does not allow cancelling. Never preempts a remote mutation in flight.
    pub fn cancel(&self) -> bool {
        let (related_task, running_on) = {
            let status = self.lock_status();
            if status.state.is_terminal() || !status.cancel_allowed {
                return false;
            }
            let related_task = status
                .related_task
                .clone()
                .filter(|_| status.related_task_cancellable);
            (related_task, status.running_on.clone())
        };

        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return true;
        }

        info!("Cancellation requested for operation {}", self.id);
        self.cancel_signal.notify_waiters();
        self.body.on_cancel();

        if let (Some(task), Some(connection)) = (related_task, running_on) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let session = connection.session().clone();
                    handle.spawn(async move {
                        if let Err(e) = session.cancel_task(&task).await {
                            warn!("Failed to cancel remote task {}: {}", task, e);
                        }
                    });
                }
                Err(_) => debug!("No runtime to cancel task {}; the poller will do it", task),
            }
        }
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    // === Observation ===

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OperationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe_with(tx);
        rx
    }

    /// Deliver events into an existing channel, e.g. one shared by siblings
    pub fn subscribe_with(&self, tx: mpsc::UnboundedSender<OperationEvent>) {
        let mut status = self.lock_status();
        if !status.state.is_terminal() {
            status.subscribers.push(tx);
        }
    }

    pub fn set_title(&self, title: impl Into<String>) {
        let mut status = self.lock_status();
        status.title = title.into();
        let title = status.title.clone();
        status.emit(OperationEvent::TitleChanged { id: self.id, title });
    }

    fn update_percent(&self, percent: u8) {
        let percent = percent.min(100);
        let mut status = self.lock_status();
        if status.state != OperationState::Running || percent <= status.percent {
            return;
        }
        status.percent = percent;
        status.emit(OperationEvent::ProgressChanged {
            id: self.id,
            percent,
        });
    }

    fn update_description(&self, description: String) {
        let mut status = self.lock_status();
        if status.state.is_terminal() || status.description == description {
            return;
        }
        status.description = description.clone();
        status.emit(OperationEvent::DescriptionChanged {
            id: self.id,
            description,
        });
    }

    fn set_related_task(&self, task: TaskRef, cancellable: bool) {
        let mut status = self.lock_status();
        status.related_task = Some(task);
        status.related_task_cancellable = cancellable;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn title(&self) -> String {
        self.lock_status().title.clone()
    }

    pub fn description(&self) -> String {
        self.lock_status().description.clone()
    }

    pub fn state(&self) -> OperationState {
        self.lock_status().state
    }

    pub fn percent_complete(&self) -> u8 {
        self.lock_status().percent
    }

    pub fn error(&self) -> Option<OperationError> {
        self.lock_status().error.clone()
    }

    pub fn failure(&self) -> Option<OperationFailure> {
        self.lock_status().error.as_ref().map(OperationFailure::from)
    }

    pub fn result(&self) -> Option<String> {
        self.lock_status().result.clone()
    }

    pub fn can_cancel(&self) -> bool {
        let status = self.lock_status();
        status.cancel_allowed && !status.state.is_terminal()
    }

    pub fn related_task(&self) -> Option<TaskRef> {
        self.lock_status().related_task.clone()
    }

    pub fn applies_to_refs(&self) -> &[String] {
        &self.applies_to
    }

    pub fn is_history_suppressed(&self) -> bool {
        self.suppress_history
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.settings
    }

    pub fn children(&self) -> &[Arc<Operation>] {
        self.body.children()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_status().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock_status().finished_at
    }

    /// Time spent running, up to now for an operation still in progress
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let status = self.lock_status();
        let started = status.started_at?;
        let end = status.finished_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(started))
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let children = self.children().iter().map(|c| c.snapshot()).collect();
        let elapsed_seconds = self.elapsed().map(|d| d.num_seconds());
        let status = self.lock_status();
        OperationSnapshot {
            id: self.id,
            title: status.title.clone(),
            description: status.description.clone(),
            state: status.state,
            percent_complete: status.percent,
            error: status.error.as_ref().map(OperationFailure::from),
            result: status.result.clone(),
            cancel_allowed: status.cancel_allowed,
            connection: self.connection.as_ref().map(|c| c.name().to_string()),
            applies_to: self.applies_to.clone(),
            started_at: status.started_at,
            finished_at: status.finished_at,
            elapsed_seconds,
            children,
        }
    }
}

/// What a running body sees of its operation
pub struct OperationContext<'a> {
    operation: &'a Operation,
    connection: Option<Connection>,
}

impl<'a> OperationContext<'a> {
    pub fn operation(&self) -> &Operation {
        self.operation
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation.id
    }

    pub fn connection(&self) -> Result<&Connection, OperationError> {
        self.connection.as_ref().ok_or_else(|| {
            OperationError::precondition(format!(
                "operation '{}' has no connection",
                self.operation.title()
            ))
        })
    }

    pub fn settings(&self) -> PollSettings {
        self.operation.settings
    }

    pub fn percent(&self) -> u8 {
        self.operation.percent_complete()
    }

    pub fn set_percent(&self, percent: u8) {
        self.operation.update_percent(percent);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.operation.update_description(description.into());
    }

    pub fn set_result(&self, result: impl Into<String>) {
        self.operation.lock_status().result = Some(result.into());
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.operation.is_cancel_requested()
    }

    pub fn check_cancelled(&self) -> Result<(), OperationError> {
        if self.is_cancel_requested() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early if cancellation is requested
    pub async fn wait(&self, duration: Duration) {
        if self.is_cancel_requested() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.operation.cancel_signal.notified() => {}
        }
    }

    /// Issue an asynchronous call and stamp the resulting task with this
    /// operation's id.
    pub async fn start_task(&self, method: &str, args: Value) -> Result<TaskRef, OperationError> {
        let connection = self.connection()?;
        let session = connection.session();
        let id = self.operation.id.to_string();

        if self.operation.rehydrate.swap(false, Ordering::SeqCst) {
            if let Some(task) = self.reattach(session, &id).await {
                return Ok(task);
            }
        }

        self.issue_task(method, args, true).await
    }

    /// Call out, record the task on the operation and stamp it with the
    /// operation id
    async fn issue_task(
        &self,
        method: &str,
        args: Value,
        cancellable: bool,
    ) -> Result<TaskRef, OperationError> {
        let connection = self.connection()?;
        let session = connection.session();
        let id = self.operation.id.to_string();

        let task = session.call_async(method, args).await?;
        debug!("{} started as task {} on {}", method, task, connection.name());
        self.operation.set_related_task(task.clone(), cancellable);

        if let Err(e) = session
            .add_task_tag(&task, tags::OPERATION_UUID_KEY, &id)
            .await
        {
            warn!("Could not tag task {} with operation {}: {}", task, id, e);
        }
        Ok(task)
    }

    async fn reattach(&self, session: &Arc<dyn RemoteSession>, id: &str) -> Option<TaskRef> {
        let task = match session.find_tagged_task(tags::OPERATION_UUID_KEY, id).await {
            Ok(Some(task)) => task,
            Ok(None) => return None,
            Err(e) => {
                warn!("Lookup of tasks tagged with operation {} failed: {}", id, e);
                return None;
            }
        };

        match session.task_record(&task).await {
            Ok(record) if !record.status.is_terminal() => {
                info!("Re-attached operation {} to running task {}", id, task);
                self.operation.set_related_task(task.clone(), true);
                Some(task)
            }
            Ok(_) => {
                debug!("Task {} tagged with operation {} already finished", task, id);
                None
            }
            Err(e) => {
                warn!("Could not read task {} for operation {}: {}", task, id, e);
                None
            }
        }
    }

    pub async fn poll_to_completion(
        &self,
        task: &TaskRef,
        start: u8,
        finish: u8,
        suppress_failures: bool,
    ) -> Result<Option<String>, OperationError> {
        poller::poll_to_completion(self, task, start, finish, suppress_failures).await
    }

    /// Start `method` and drive it to completion inside the `[start, finish]` window
    pub async fn run_task(
        &self,
        method: &str,
        args: Value,
        start: u8,
        finish: u8,
    ) -> Result<Option<String>, OperationError> {
        let task = self.start_task(method, args).await?;
        self.poll_to_completion(&task, start, finish, false).await
    }

    /// Like `run_task`, but keeps going after cancellation was requested.
    /// Used to restore state the operation itself took down.
    pub async fn run_task_to_restore(
        &self,
        method: &str,
        args: Value,
    ) -> Result<Option<String>, OperationError> {
        let task = self.issue_task(method, args, false).await?;
        let percent = self.percent();
        poller::poll_task(self, &task, percent, percent, false, false).await
    }
}
