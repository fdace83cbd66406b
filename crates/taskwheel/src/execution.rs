use std::fmt;

use chrono::{DateTime, Utc};

/// The identity of a scheduled execution: `(task_name, instance_id)` is
/// globally unique at rest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecutionId {
    pub task_name: String,
    pub instance_id: String,
}

impl ExecutionId {
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_name, self.instance_id)
    }
}

/// A persisted task instance plus its runtime state.
///
/// `version` is the optimistic-concurrency counter: every mutation
/// increments it and every conditional update predicates on the observed
/// value. The one exception is the heartbeat stamp, which is a liveness
/// signal rather than a state transition and leaves `version` untouched so
/// the owner's pending completion update stays valid.
#[derive(Clone, Debug)]
pub struct Execution {
    pub task_name: String,
    pub instance_id: String,
    pub payload: Option<Vec<u8>>,
    pub execution_time: DateTime<Utc>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Execution {
    /// A fresh, unpicked execution due at `execution_time`.
    pub fn new(id: ExecutionId, execution_time: DateTime<Utc>, payload: Option<Vec<u8>>) -> Self {
        Self {
            task_name: id.task_name,
            instance_id: id.instance_id,
            payload,
            execution_time,
            picked: false,
            picked_by: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            last_heartbeat: None,
            version: 1,
        }
    }

    pub fn id(&self) -> ExecutionId {
        ExecutionId::new(self.task_name.clone(), self.instance_id.clone())
    }
}
