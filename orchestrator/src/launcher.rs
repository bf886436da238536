//! Operation launcher
//!
//! Turns a flat batch of operations into one root operation: work on the
//! same connection is serialized so a session never sees two mutating calls
//! at once, and groups on distinct connections run side by side.

use std::sync::Arc;
use tracing::{debug, info};

use crate::operation::{Composite, CompositeMode, Operation};
use crate::session::Connection;

pub struct OperationLauncher {
    title: String,
    description: String,
    operations: Vec<Arc<Operation>>,
    stop_on_first_failure: bool,
}

struct Group {
    name: String,
    connection: Option<Connection>,
    operations: Vec<Arc<Operation>>,
}

impl OperationLauncher {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        operations: Vec<Arc<Operation>>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            operations,
            stop_on_first_failure: false,
        }
    }

    pub fn stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    fn group(operations: Vec<Arc<Operation>>) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for operation in operations {
            let name = operation
                .connection()
                .map(|c| c.name().to_string())
                .unwrap_or_default();
            match groups.iter_mut().find(|g| g.name == name) {
                Some(group) => group.operations.push(operation),
                None => groups.push(Group {
                    name,
                    connection: operation.connection().cloned(),
                    operations: vec![operation],
                }),
            }
        }
        groups
    }

    /// Build the root operation without starting it.
    /// A batch of one is returned unchanged.
    pub fn build(self) -> Arc<Operation> {
        let OperationLauncher {
            title,
            description,
            mut operations,
            stop_on_first_failure,
        } = self;

        if operations.len() == 1 {
            if let Some(single) = operations.pop() {
                return single;
            }
        }

        let applies_to: Vec<String> = operations
            .iter()
            .flat_map(|op| op.applies_to_refs().iter().cloned())
            .collect();
        let mut groups = Self::group(operations);

        if groups.len() == 1 {
            if let Some(group) = groups.pop() {
                debug!(
                    "Serializing {} operations on {}",
                    group.operations.len(),
                    group.name
                );
                return Arc::new(
                    Operation::new(
                        group.connection,
                        title,
                        description,
                        Composite::new(group.operations, CompositeMode::Sequential)
                            .stop_on_first_failure(stop_on_first_failure),
                    )
                    .applies_to(applies_to),
                );
            }
        }

        let bound = groups.len();
        let children: Vec<Arc<Operation>> = groups
            .into_iter()
            .map(|mut group| {
                if group.operations.len() == 1 {
                    if let Some(single) = group.operations.pop() {
                        return single;
                    }
                }
                Arc::new(
                    Operation::new(
                        group.connection,
                        format!("{} ({})", title, group.name),
                        description.clone(),
                        Composite::new(group.operations, CompositeMode::Sequential)
                            .stop_on_first_failure(stop_on_first_failure),
                    )
                    .suppress_history(true),
                )
            })
            .collect();

        info!("Launching '{}' across {} connections", title, bound);
        Arc::new(
            Operation::new(
                None,
                title,
                description,
                Composite::new(children, CompositeMode::BoundedParallel { bound })
                    .stop_on_first_failure(stop_on_first_failure),
            )
            .applies_to(applies_to),
        )
    }

    /// Build the root operation and start it on its own task
    pub fn launch(self) -> Arc<Operation> {
        let root = self.build();
        drop(root.run_async());
        root
    }
}
