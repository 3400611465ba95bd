//! Core domain records shared by the engine, the command coordinator and the
//! persistence backends.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    Submitted,
    WaitToRun,
    Running,
    ReadyPause,
    Paused,
    ReadyStop,
    Stopped,
    SerialWait,
    Success,
    Failure,
}

/// How a stop request is carried out for a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPath {
    /// Nothing runs on a worker yet; persisting `Stopped` is enough.
    DirectDb,
    /// Tasks may be running; kill requests go out over RPC first.
    Live,
}

impl WorkflowExecutionStatus {
    pub const ALL: [WorkflowExecutionStatus; 10] = [
        WorkflowExecutionStatus::Submitted,
        WorkflowExecutionStatus::WaitToRun,
        WorkflowExecutionStatus::Running,
        WorkflowExecutionStatus::ReadyPause,
        WorkflowExecutionStatus::Paused,
        WorkflowExecutionStatus::ReadyStop,
        WorkflowExecutionStatus::Stopped,
        WorkflowExecutionStatus::SerialWait,
        WorkflowExecutionStatus::Success,
        WorkflowExecutionStatus::Failure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowExecutionStatus::Submitted => "SUBMITTED",
            WorkflowExecutionStatus::WaitToRun => "WAIT_TO_RUN",
            WorkflowExecutionStatus::Running => "RUNNING",
            WorkflowExecutionStatus::ReadyPause => "READY_PAUSE",
            WorkflowExecutionStatus::Paused => "PAUSED",
            WorkflowExecutionStatus::ReadyStop => "READY_STOP",
            WorkflowExecutionStatus::Stopped => "STOPPED",
            WorkflowExecutionStatus::SerialWait => "SERIAL_WAIT",
            WorkflowExecutionStatus::Success => "SUCCESS",
            WorkflowExecutionStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowExecutionStatus::Success
                | WorkflowExecutionStatus::Failure
                | WorkflowExecutionStatus::Stopped
        )
    }

    pub fn can_stop(self) -> bool {
        self.stop_path().is_some()
    }

    pub fn is_direct_db_stop(self) -> bool {
        matches!(self.stop_path(), Some(StopPath::DirectDb))
    }

    pub fn stop_path(self) -> Option<StopPath> {
        match self {
            WorkflowExecutionStatus::SerialWait | WorkflowExecutionStatus::WaitToRun => {
                Some(StopPath::DirectDb)
            }
            WorkflowExecutionStatus::Running
            | WorkflowExecutionStatus::ReadyPause
            | WorkflowExecutionStatus::ReadyStop => Some(StopPath::Live),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowExecutionStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ParseEnumError::new("workflow status", value))
    }
}

/// Lifecycle status of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    Submitted,
    Dispatched,
    Running,
    Success,
    Failure,
    Killed,
}

impl TaskExecutionStatus {
    pub const ALL: [TaskExecutionStatus; 6] = [
        TaskExecutionStatus::Submitted,
        TaskExecutionStatus::Dispatched,
        TaskExecutionStatus::Running,
        TaskExecutionStatus::Success,
        TaskExecutionStatus::Failure,
        TaskExecutionStatus::Killed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskExecutionStatus::Submitted => "SUBMITTED",
            TaskExecutionStatus::Dispatched => "DISPATCHED",
            TaskExecutionStatus::Running => "RUNNING",
            TaskExecutionStatus::Success => "SUCCESS",
            TaskExecutionStatus::Failure => "FAILURE",
            TaskExecutionStatus::Killed => "KILLED",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskExecutionStatus::Success
                | TaskExecutionStatus::Failure
                | TaskExecutionStatus::Killed
        )
    }

    /// Handed to a worker and not yet reported back as finished.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskExecutionStatus::Dispatched | TaskExecutionStatus::Running
        )
    }
}

impl fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskExecutionStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ParseEnumError::new("task status", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Start,
    Rerun,
    Recover,
    Backfill,
    Scheduler,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Start => "START",
            CommandType::Rerun => "RERUN",
            CommandType::Recover => "RECOVER",
            CommandType::Backfill => "BACKFILL",
            CommandType::Scheduler => "SCHEDULER",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            CommandType::Start,
            CommandType::Rerun,
            CommandType::Recover,
            CommandType::Backfill,
            CommandType::Scheduler,
        ]
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
        .ok_or_else(|| ParseEnumError::new("command type", value))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub workflow_definition_code: i64,
    pub workflow_definition_version: i32,
    pub status: WorkflowExecutionStatus,
    pub command_type: CommandType,
    /// Address of the owning master.
    pub host: Option<String>,
    pub worker_group: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub restart_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub task_version: i32,
    pub name: String,
    pub task_type: String,
    pub status: TaskExecutionStatus,
    /// Worker the task was handed to.
    pub host: Option<String>,
    pub retry_times: u32,
    pub max_retry_times: u32,
    pub worker_group: String,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskInstance {
    /// Fresh, not yet persisted instance of `node` (id 0).
    pub fn from_node(workflow_instance_id: i64, node: &TaskNode, fallback_group: &str) -> Self {
        let worker_group = if node.worker_group.is_empty() {
            fallback_group.to_string()
        } else {
            node.worker_group.clone()
        };
        Self {
            id: 0,
            workflow_instance_id,
            task_code: node.code,
            task_version: node.version,
            name: node.name.clone(),
            task_type: node.task_type.clone(),
            status: TaskExecutionStatus::Submitted,
            host: None,
            retry_times: 0,
            max_retry_times: node.max_retry_times,
            worker_group,
            submit_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub command_type: CommandType,
    pub workflow_definition_code: i64,
    pub workflow_definition_version: i32,
    pub workflow_instance_id: Option<i64>,
    pub worker_group: String,
    #[serde(default)]
    pub params: Value,
    pub created_at: DateTime<Utc>,
}

/// Latest heartbeat reported by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostWorkload {
    /// Fraction in `[0, 1]`.
    pub cpu_usage: f64,
    /// Fraction in `[0, 1]`.
    pub memory_usage: f64,
    pub load_average: f64,
    pub startup_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// `ip:port`
    pub address: String,
    pub weight: u32,
    pub worker_group: String,
    #[serde(default)]
    pub workload: Option<HostWorkload>,
}

impl Host {
    pub fn new(address: impl Into<String>, weight: u32, worker_group: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight,
            worker_group: worker_group.into(),
            workload: None,
        }
    }

    pub fn with_workload(mut self, workload: HostWorkload) -> Self {
        self.workload = Some(workload);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub code: i64,
    pub version: i32,
    pub name: String,
    pub task_type: String,
    /// Empty means "inherit the instance's group".
    #[serde(default)]
    pub worker_group: String,
    #[serde(default)]
    pub upstream_codes: Vec<i64>,
    #[serde(default)]
    pub max_retry_times: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("duplicate task code {0}")]
    DuplicateTask(i64),
    #[error("task {task} depends on unknown task {upstream}")]
    UnknownUpstream { task: i64, upstream: i64 },
    #[error("workflow graph contains a cycle")]
    Cycle,
}

/// Task graph of one workflow definition, nodes in topological order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowDag {
    nodes: Vec<TaskNode>,
}

impl WorkflowDag {
    pub fn new(nodes: Vec<TaskNode>) -> Result<Self, DagError> {
        let mut index: HashMap<i64, usize> = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if index.insert(node.code, position).is_some() {
                return Err(DagError::DuplicateTask(node.code));
            }
        }
        let mut in_degree = vec![0usize; nodes.len()];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (position, node) in nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for upstream in &node.upstream_codes {
                let Some(&parent) = index.get(upstream) else {
                    return Err(DagError::UnknownUpstream {
                        task: node.code,
                        upstream: *upstream,
                    });
                };
                if seen.insert(parent) {
                    in_degree[position] += 1;
                    downstream[parent].push(position);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..nodes.len())
            .filter(|position| in_degree[*position] == 0)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(position) = queue.pop_front() {
            order.push(position);
            for &child in &downstream[position] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(DagError::Cycle);
        }

        let mut slots: Vec<Option<TaskNode>> = nodes.into_iter().map(Some).collect();
        let nodes = order
            .into_iter()
            .filter_map(|position| slots[position].take())
            .collect();
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, code: i64) -> Option<&TaskNode> {
        self.nodes.iter().find(|node| node.code == code)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<'de> Deserialize<'de> for WorkflowDag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            nodes: Vec<TaskNode>,
        }
        let raw = Raw::deserialize(deserializer)?;
        WorkflowDag::new(raw.nodes).map_err(serde::de::Error::custom)
    }
}
