use std::collections::HashMap;
use std::sync::Arc;

use crate::task::Task;

/// Maps task names to their registrations.
///
/// Rows referring to names with no registration are logged and left intact
/// so a later deployment that knows the task can still handle them.
pub(crate) struct TaskRegistry {
    tasks: HashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut registry = Self {
            tasks: HashMap::new(),
        };

        for task in tasks {
            registry.register(task);
        }

        registry
    }

    pub fn register(&mut self, task: Task) {
        let name = task.name().to_owned();
        if self.tasks.insert(name.clone(), Arc::new(task)).is_some() {
            tracing::warn!("task `{name}` registered twice, the last registration wins");
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }
}
