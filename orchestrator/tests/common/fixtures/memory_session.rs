//! In-process control plane
//!
//! `InMemorySession` plays the control plane in tests: every asynchronous
//! call becomes a simulated task whose progress and outcome follow a
//! [`TaskScript`], and every call is recorded in issue order.
//!
//! Shared by the integration tests and the library's own unit tests, so the
//! session types come from whichever module includes this file.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use super::{RemoteSession, SessionError, TaskRecord, TaskRef, TaskStatus};

/// A call observed by the simulated control plane
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: String,
    pub args: Value,
}

impl RecordedCall {
    /// String argument by name, if present
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScriptedOutcome {
    Success(Option<String>),
    Failure(Vec<String>),
    Hang,
}

/// How a simulated task behaves when polled
#[derive(Debug, Clone, PartialEq)]
pub struct TaskScript {
    progress: Vec<f64>,
    outcome: ScriptedOutcome,
}

impl TaskScript {
    pub fn succeed() -> Self {
        Self {
            progress: Vec::new(),
            outcome: ScriptedOutcome::Success(None),
        }
    }

    pub fn succeed_with(result: impl Into<String>) -> Self {
        Self {
            progress: Vec::new(),
            outcome: ScriptedOutcome::Success(Some(result.into())),
        }
    }

    pub fn fail(details: &[&str]) -> Self {
        Self {
            progress: Vec::new(),
            outcome: ScriptedOutcome::Failure(details.iter().map(|d| d.to_string()).collect()),
        }
    }

    /// Never reaches a terminal state on its own
    pub fn hang() -> Self {
        Self {
            progress: Vec::new(),
            outcome: ScriptedOutcome::Hang,
        }
    }

    /// Progress values reported by successive polls before the outcome applies
    pub fn with_progress(mut self, steps: Vec<f64>) -> Self {
        self.progress = steps;
        self
    }
}

struct ScriptRule {
    method: String,
    arg: Option<(String, String)>,
    script: TaskScript,
}

impl ScriptRule {
    fn matches(&self, method: &str, args: &Value) -> bool {
        if self.method != method {
            return false;
        }
        match &self.arg {
            Some((key, value)) => args.get(key).and_then(|v| v.as_str()) == Some(value.as_str()),
            None => true,
        }
    }
}

struct SimulatedTask {
    remaining: VecDeque<f64>,
    outcome: ScriptedOutcome,
    record: TaskRecord,
    tags: HashMap<String, String>,
    destroyed: bool,
}

#[derive(Default)]
struct SimulatedState {
    next_task: u64,
    calls: Vec<RecordedCall>,
    rules: Vec<ScriptRule>,
    rejections: HashMap<String, String>,
    tasks: HashMap<String, SimulatedTask>,
    cancelled: Vec<TaskRef>,
    destroyed: Vec<TaskRef>,
    in_flight: usize,
    max_in_flight: usize,
    failing_polls: u32,
    sync_results: HashMap<String, Value>,
}

impl SimulatedState {
    fn script_for(&self, method: &str, args: &Value) -> TaskScript {
        // Latest rule wins; argument-specific rules are just more selective ones
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(method, args))
            .map(|rule| rule.script.clone())
            .unwrap_or_else(TaskScript::succeed)
    }

    fn spawn_task(&mut self, script: TaskScript) -> TaskRef {
        self.next_task += 1;
        let task = TaskRef(format!("task-{}", self.next_task));
        self.tasks.insert(
            task.0.clone(),
            SimulatedTask {
                remaining: script.progress.into_iter().collect(),
                outcome: script.outcome,
                record: TaskRecord {
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    result: None,
                    error_info: Vec::new(),
                },
                tags: HashMap::new(),
                destroyed: false,
            },
        );
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        task
    }
}

/// Simulated control-plane session
pub struct InMemorySession {
    state: Mutex<SimulatedState>,
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script every task started by `method`
    pub fn script(&self, method: &str, script: TaskScript) {
        self.lock().rules.push(ScriptRule {
            method: method.to_string(),
            arg: None,
            script,
        });
    }

    /// Script tasks started by `method` whose string argument `key` equals `value`
    pub fn script_with_arg(&self, method: &str, key: &str, value: &str, script: TaskScript) {
        self.lock().rules.push(ScriptRule {
            method: method.to_string(),
            arg: Some((key.to_string(), value.to_string())),
            script,
        });
    }

    /// Refuse `method` outright, as an older or restricted control plane would
    pub fn reject(&self, method: &str, message: &str) {
        self.lock()
            .rejections
            .insert(method.to_string(), message.to_string());
    }

    /// Make the next `count` status queries fail at the transport level
    pub fn fail_next_polls(&self, count: u32) {
        self.lock().failing_polls = count;
    }

    /// Value returned by synchronous calls to `method`
    pub fn set_sync_result(&self, method: &str, value: Value) {
        self.lock().sync_results.insert(method.to_string(), value);
    }

    /// Start a task that was not issued through this session, e.g. one left
    /// running by a previous client process.
    pub fn seed_task(&self, script: TaskScript, tag: Option<(&str, &str)>) -> TaskRef {
        let mut state = self.lock();
        let task = state.spawn_task(script);
        if let (Some((key, value)), Some(sim)) = (tag, state.tasks.get_mut(&task.0)) {
            sim.tags.insert(key.to_string(), value.to_string());
        }
        task
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    pub fn cancelled_tasks(&self) -> Vec<TaskRef> {
        self.lock().cancelled.clone()
    }

    pub fn destroyed_tasks(&self) -> Vec<TaskRef> {
        self.lock().destroyed.clone()
    }

    /// Highest number of simultaneously pending tasks observed
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn task_tags(&self, task: &TaskRef) -> HashMap<String, String> {
        self.lock()
            .tasks
            .get(&task.0)
            .map(|sim| sim.tags.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteSession for InMemorySession {
    async fn call_async(&self, method: &str, args: Value) -> Result<TaskRef, SessionError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            method: method.to_string(),
            args: args.clone(),
        });

        if let Some(message) = state.rejections.get(method) {
            return Err(SessionError::Rejected {
                method: method.to_string(),
                message: message.clone(),
            });
        }

        let script = state.script_for(method, &args);
        let task = state.spawn_task(script);
        debug!("Simulated {} as {}", method, task);
        Ok(task)
    }

    async fn task_record(&self, task: &TaskRef) -> Result<TaskRecord, SessionError> {
        let mut state = self.lock();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(SessionError::ConnectionFailed {
                endpoint: "in-memory".to_string(),
                reason: "simulated transport failure".to_string(),
            });
        }

        let sim = state
            .tasks
            .get_mut(&task.0)
            .filter(|sim| !sim.destroyed)
            .ok_or_else(|| SessionError::UnknownTask {
                task: task.0.clone(),
            })?;

        let mut finished = false;
        if sim.record.status == TaskStatus::Pending {
            if let Some(progress) = sim.remaining.pop_front() {
                sim.record.progress = progress;
            } else {
                match &sim.outcome {
                    ScriptedOutcome::Success(result) => {
                        sim.record.status = TaskStatus::Success;
                        sim.record.progress = 1.0;
                        sim.record.result = result.clone();
                        finished = true;
                    }
                    ScriptedOutcome::Failure(details) => {
                        sim.record.status = TaskStatus::Failure;
                        sim.record.error_info = details.clone();
                        finished = true;
                    }
                    ScriptedOutcome::Hang => {}
                }
            }
        }

        let record = sim.record.clone();
        if finished {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        Ok(record)
    }

    async fn cancel_task(&self, task: &TaskRef) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.cancelled.push(task.clone());
        let sim = state
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| SessionError::UnknownTask {
                task: task.0.clone(),
            })?;

        if !sim.record.status.is_terminal() {
            sim.record.status = TaskStatus::Cancelled;
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        Ok(())
    }

    async fn destroy_task(&self, task: &TaskRef) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.destroyed.push(task.clone());
        if let Some(sim) = state.tasks.get_mut(&task.0) {
            sim.destroyed = true;
        }
        Ok(())
    }

    async fn add_task_tag(
        &self,
        task: &TaskRef,
        key: &str,
        value: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.lock();
        let sim = state
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| SessionError::UnknownTask {
                task: task.0.clone(),
            })?;
        sim.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn find_tagged_task(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<TaskRef>, SessionError> {
        let state = self.lock();
        Ok(state
            .tasks
            .iter()
            .filter(|(_, sim)| !sim.destroyed)
            .find(|(_, sim)| sim.tags.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| TaskRef(id.clone())))
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, SessionError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            method: method.to_string(),
            args,
        });
        if let Some(message) = state.rejections.get(method) {
            return Err(SessionError::Rejected {
                method: method.to_string(),
                message: message.clone(),
            });
        }
        Ok(state.sync_results.get(method).cloned().unwrap_or(Value::Null))
    }
}
