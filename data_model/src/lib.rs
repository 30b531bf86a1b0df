pub mod test_objects;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt::{self, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

/// Version number carried by the first dynamic filter publication. The
/// coordinator starts below this so the first published version is fetched.
pub const INITIAL_DYNAMIC_FILTERS_VERSION: i64 = 0;

/// Version attached to the locally synthesized task status, before any
/// response from the worker has been observed.
pub const INITIAL_TASK_STATUS_VERSION: i64 = 0;

pub fn epoch_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId {
    pub query_id: QueryId,
    pub id: u32,
}

impl StageId {
    pub fn new(query_id: QueryId, id: u32) -> Self {
        Self { query_id, id }
    }
}

impl Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query_id, self.id)
    }
}

/// Identifier of one task within a query stage, assigned once at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub stage_id: StageId,
    pub partition: u32,
}

impl TaskId {
    pub fn new(query_id: QueryId, stage: u32, partition: u32) -> Self {
        Self {
            stage_id: StageId::new(query_id, stage),
            partition,
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.stage_id.query_id
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage_id, self.partition)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlanNodeId(String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SplitId(String);

impl SplitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

/// Sub-partition grouping of splits used for grouped execution. Ungrouped
/// splits belong to the task-wide lifespan.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Lifespan {
    TaskWide,
    DriverGroup(u32),
}

/// One unit of input data assigned to a task. The payload is opaque to the
/// coordinator and round-trips through the wire codec unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Split {
    pub id: SplitId,
    pub lifespan: Lifespan,
    pub payload: serde_json::Value,
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Planned,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    /// Terminal states are absorbing; once entered, no further transition is
    /// allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Aborted | TaskState::Failed
        )
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The worker's instance identity token changed mid-task. The task was
    /// lost and recreated elsewhere without coordinator knowledge.
    RemoteTaskMismatch,
    /// Transport-level failure while communicating with the worker.
    RemoteTaskError,
    /// Failure cause reported by the worker itself, propagated as-is.
    WorkerReported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionFailureInfo {
    pub error_code: ErrorCode,
    pub message: String,
}

impl ExecutionFailureInfo {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }
}

/// Snapshot of a task's execution state as reported by the worker.
///
/// The version is monotonically non-decreasing for the lifetime of one
/// physical execution (one `task_instance_id`). A version that goes backward
/// while the instance id is unchanged is a protocol error; a changed instance
/// id is a fatal task mismatch regardless of version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub task_instance_id: String,
    pub version: i64,
    pub state: TaskState,
    pub self_uri: String,
    #[builder(default)]
    pub failures: Vec<ExecutionFailureInfo>,
    #[builder(default)]
    pub queued_splits: u64,
    #[builder(default)]
    pub running_splits: u64,
    #[builder(default)]
    pub output_buffer_overutilized: bool,
    #[builder(default)]
    pub memory_reservation_bytes: u64,
    #[builder(default = "INITIAL_DYNAMIC_FILTERS_VERSION")]
    pub dynamic_filters_version: i64,
}

impl TaskStatus {
    /// Status synthesized by the coordinator before the worker has answered.
    pub fn initial(task_id: TaskId, self_uri: String) -> Self {
        Self {
            task_id,
            task_instance_id: String::new(),
            version: INITIAL_TASK_STATUS_VERSION,
            state: TaskState::Planned,
            self_uri,
            failures: Vec::new(),
            queued_splits: 0,
            running_splits: 0,
            output_buffer_overutilized: false,
            memory_reservation_bytes: 0,
            dynamic_filters_version: INITIAL_DYNAMIC_FILTERS_VERSION,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Local state override. Bumps the version past the last applied one so
    /// listeners observe the transition.
    pub fn with_state(&self, state: TaskState) -> Self {
        let mut status = self.clone();
        status.state = state;
        status.version = self.version + 1;
        status
    }

    /// Local failure override with a recorded cause.
    pub fn fail_with(&self, failure: ExecutionFailureInfo) -> Self {
        let mut status = self.with_state(TaskState::Failed);
        status.failures.push(failure);
        status
    }
}

/// Pointer to where task output flows. Owned by the scheduler and immutable
/// from the controller's perspective.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputBuffers {
    pub kind: OutputBufferKind,
    pub buffers: BTreeMap<u32, String>,
    pub no_more_buffers: bool,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum OutputBufferKind {
    Broadcast,
    Partitioned,
    Arbitrary,
}

impl OutputBuffers {
    pub fn initial_empty(kind: OutputBufferKind) -> Self {
        Self {
            kind,
            buffers: BTreeMap::new(),
            no_more_buffers: false,
        }
    }
}

/// Per plan-node split assignment record. Mutations are monotonic: splits
/// are only added, never removed, and the no-more-splits flags only
/// transition false to true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSource {
    pub plan_node_id: PlanNodeId,
    pub splits: Vec<Split>,
    pub no_more_splits_for_lifespan: BTreeSet<Lifespan>,
    pub no_more_splits: bool,
}

impl TaskSource {
    pub fn new(plan_node_id: PlanNodeId) -> Self {
        Self {
            plan_node_id,
            splits: Vec::new(),
            no_more_splits_for_lifespan: BTreeSet::new(),
            no_more_splits: false,
        }
    }

    pub fn split_ids(&self) -> HashSet<&SplitId> {
        self.splits.iter().map(|split| &split.id).collect()
    }

    /// Merge another assignment record for the same plan node. Splits are
    /// deduplicated by id; splits arriving after `no_more_splits` was set are
    /// dropped.
    pub fn update(&self, other: &TaskSource) -> TaskSource {
        let mut merged = self.clone();
        if !self.no_more_splits {
            let known: HashSet<SplitId> =
                self.splits.iter().map(|split| split.id.clone()).collect();
            for split in &other.splits {
                if !known.contains(&split.id) {
                    merged.splits.push(split.clone());
                }
            }
        }
        merged
            .no_more_splits_for_lifespan
            .extend(other.no_more_splits_for_lifespan.iter().copied());
        merged.no_more_splits |= other.no_more_splits;
        merged
    }
}

/// Body of the create/update call to the worker. The plan fragment is sent
/// until the worker acknowledges having it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskUpdateRequest {
    pub fragment: Option<String>,
    pub sources: Vec<TaskSource>,
    pub output_buffers: OutputBuffers,
}

/// Aggregate view of a task, embedding the latest status. Only the fields
/// the coordinator consumes are modeled here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub task_status: TaskStatus,
    pub needs_plan: bool,
    pub last_heartbeat_ms: u64,
}

impl TaskInfo {
    pub fn initial(task_status: TaskStatus) -> Self {
        Self {
            task_status,
            needs_plan: true,
            last_heartbeat_ms: epoch_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DynamicFilterId(String);

impl DynamicFilterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for DynamicFilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnHandle(String);

impl ColumnHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

/// Runtime-computed value constraint for one dynamic filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    All,
    None,
    Values(Vec<serde_json::Value>),
}

impl Domain {
    pub fn single_value(value: impl Into<serde_json::Value>) -> Self {
        Domain::Values(vec![value.into()])
    }
}

/// Incremental dynamic filter publication. Each fetch returns only filters
/// updated since the acknowledged version; the coordinator merges entries
/// into a cumulative mapping and never removes prior ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VersionedDynamicFilterDomains {
    pub version: i64,
    pub dynamic_filter_domains: HashMap<DynamicFilterId, Domain>,
}

impl VersionedDynamicFilterDomains {
    pub fn new(version: i64, dynamic_filter_domains: HashMap<DynamicFilterId, Domain>) -> Self {
        Self {
            version,
            dynamic_filter_domains,
        }
    }
}
