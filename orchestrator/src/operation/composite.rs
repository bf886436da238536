//! Composite operations
//!
//! A composite runs child operations either one after another or with a
//! bound on how many run at once. Children are prechecked as a whole before
//! the first one starts, and cancelling the composite cancels every child.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Operation, OperationBody, OperationContext, OperationEvent};
use crate::errors::OperationError;
use crate::session::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    Sequential,
    /// Never more than `bound` children running at once
    BoundedParallel { bound: usize },
}

pub struct Composite {
    children: Vec<Arc<Operation>>,
    mode: CompositeMode,
    stop_on_first_failure: bool,
}

impl Composite {
    pub fn new(children: Vec<Arc<Operation>>, mode: CompositeMode) -> Self {
        Self {
            children,
            mode,
            stop_on_first_failure: false,
        }
    }

    pub fn stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    async fn run_sequential(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError> {
        let total = self.children.len();
        let fallback = ctx.connection().ok().cloned();
        let mut first_error = None;

        for (index, child) in self.children.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.set_description(child.title());

            let (tx, mut rx) = mpsc::unbounded_channel();
            child.subscribe_with(tx);
            let run = run_child(Arc::clone(child), fallback.clone());
            tokio::pin!(run);

            let outcome = loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    Some(event) = rx.recv() => {
                        if let OperationEvent::ProgressChanged { percent, .. } = event {
                            ctx.set_percent(sequential_percent(index, percent, total));
                        }
                    }
                }
            };

            match outcome {
                Ok(()) => ctx.set_percent(sequential_percent(index + 1, 0, total)),
                Err(OperationError::Cancelled) => return Err(OperationError::Cancelled),
                Err(e) if self.stop_on_first_failure => {
                    debug!(
                        "Stopping after '{}' failed; {} children not started",
                        child.title(),
                        total - index - 1
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!("Child '{}' failed, continuing: {}", child.title(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn run_parallel(
        &self,
        ctx: &OperationContext<'_>,
        bound: usize,
    ) -> Result<(), OperationError> {
        let bound = bound.max(1);
        let total = self.children.len();
        let fallback = ctx.connection().ok().cloned();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending: VecDeque<Arc<Operation>> = self.children.iter().cloned().collect();
        let mut running = JoinSet::new();
        let mut progress: HashMap<Uuid, u8> = HashMap::new();
        let mut first_error: Option<OperationError> = None;

        loop {
            while !ctx.is_cancel_requested() && running.len() < bound {
                let Some(child) = pending.pop_front() else {
                    break;
                };
                child.subscribe_with(tx.clone());
                let fallback = fallback.clone();
                running.spawn(async move {
                    let id = child.id();
                    (id, run_child(child, fallback).await)
                });
            }

            if running.is_empty() {
                break;
            }

            let failure = tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok((id, outcome))) => {
                        progress.insert(id, 100);
                        ctx.set_percent(average_percent(&progress, total));
                        outcome.err()
                    }
                    Some(Err(join_error)) => {
                        warn!("Child operation task aborted: {}", join_error);
                        Some(OperationError::precondition(format!(
                            "child operation aborted: {}",
                            join_error
                        )))
                    }
                    None => break,
                },
                Some(event) = rx.recv() => {
                    if let OperationEvent::ProgressChanged { id, percent } = event {
                        let slot = progress.entry(id).or_insert(0);
                        *slot = (*slot).max(percent);
                        ctx.set_percent(average_percent(&progress, total));
                    }
                    None
                }
            };

            if let Some(e) = failure {
                if self.stop_on_first_failure {
                    // Fail now; children already running finish on their own
                    debug!(
                        "Stopping after a child failed; {} still running, {} not started",
                        running.len(),
                        pending.len()
                    );
                    running.detach_all();
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        if !pending.is_empty() {
            debug!("{} children left not started", pending.len());
        }
        ctx.check_cancelled()?;
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl OperationBody for Composite {
    async fn run(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError> {
        let fallback = ctx.connection().ok();
        for child in &self.children {
            precheck_tree(child, fallback)?;
        }

        match self.mode {
            CompositeMode::Sequential => self.run_sequential(ctx).await,
            CompositeMode::BoundedParallel { bound } => self.run_parallel(ctx, bound).await,
        }
    }

    fn children(&self) -> &[Arc<Operation>] {
        &self.children
    }

    fn on_cancel(&self) {
        for child in &self.children {
            child.cancel();
        }
    }
}

impl Operation {
    /// Composite running `children` in order
    pub fn sequential(
        connection: Option<Connection>,
        title: impl Into<String>,
        children: Vec<Arc<Operation>>,
        stop_on_first_failure: bool,
    ) -> Self {
        let title = title.into();
        Operation::new(
            connection,
            title.clone(),
            title,
            Composite::new(children, CompositeMode::Sequential)
                .stop_on_first_failure(stop_on_first_failure),
        )
    }

    /// Composite running at most `bound` of `children` at once
    pub fn parallel(
        connection: Option<Connection>,
        title: impl Into<String>,
        children: Vec<Arc<Operation>>,
        bound: usize,
        stop_on_first_failure: bool,
    ) -> Self {
        let title = title.into();
        Operation::new(
            connection,
            title.clone(),
            title,
            Composite::new(children, CompositeMode::BoundedParallel { bound })
                .stop_on_first_failure(stop_on_first_failure),
        )
    }
}

fn precheck_tree(child: &Operation, fallback: Option<&Connection>) -> Result<(), OperationError> {
    let connection = child.connection().or(fallback);
    child.check_permissions(connection)?;
    for grandchild in child.children() {
        precheck_tree(grandchild, connection)?;
    }
    Ok(())
}

async fn run_child(child: Arc<Operation>, fallback: Option<Connection>) -> Result<(), OperationError> {
    match fallback {
        Some(connection) if child.connection().is_none() => child.run_sync(&connection).await,
        _ => child.run_inline().await,
    }
}

fn sequential_percent(index: usize, child_percent: u8, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((index * 100 + usize::from(child_percent)) / total).min(100) as u8
}

fn average_percent(progress: &HashMap<Uuid, u8>, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let sum: usize = progress.values().map(|p| usize::from(*p)).sum();
    (sum / total).min(100) as u8
}
