use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{
    epoch_time_ms, PlanNodeId, TaskId, TaskInfo, TaskState, TaskStatus, TaskUpdateRequest,
    VersionedDynamicFilterDomains, INITIAL_DYNAMIC_FILTERS_VERSION,
};

use crate::transport::TaskTransport;

pub const INITIAL_TASK_INSTANCE_ID: &str = "task-instance-id";
pub const NEW_TASK_INSTANCE_ID: &str = "task-instance-id-x";

/// Status fetch on which the failure scenarios trigger, simulating a worker
/// restart or an http client shutdown after a period of healthy polling.
const FAILURE_TRIGGER_FETCH: u64 = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureScenario {
    NoFailure,
    /// The worker restarts: new instance id, version reset to zero.
    TaskMismatch,
    /// As TaskMismatch, but the pre-restart version is so large the reset
    /// version can never catch up. Mismatch detection must not depend on it.
    TaskMismatchWhenVersionIsHigh,
    /// The transport starts rejecting every request.
    RejectedExecution,
}

struct Inner {
    version: i64,
    task_state: TaskState,
    task_instance_id: String,
    initial_status: Option<TaskStatus>,
    dynamic_filter_domains: Option<VersionedDynamicFilterDomains>,
    task_sources: HashMap<PlanNodeId, data_model::TaskSource>,
    status_fetches: u64,
    dynamic_filter_fetches: u64,
    update_requests: u64,
    rejecting: bool,
}

/// In-memory worker double implementing the transport capability. It keeps
/// the cumulative per-node split assignment the way a real worker would, so
/// tests can assert what was effectively applied regardless of batching.
pub struct TestingTaskWorker {
    scenario: FailureScenario,
    inner: Mutex<Inner>,
    update_in_flight: AtomicBool,
}

impl TestingTaskWorker {
    pub fn new(scenario: FailureScenario) -> Arc<Self> {
        Arc::new(Self {
            scenario,
            inner: Mutex::new(Inner {
                version: 0,
                task_state: TaskState::Planned,
                task_instance_id: INITIAL_TASK_INSTANCE_ID.to_string(),
                initial_status: None,
                dynamic_filter_domains: None,
                task_sources: HashMap::new(),
                status_fetches: 0,
                dynamic_filter_fetches: 0,
                update_requests: 0,
                rejecting: false,
            }),
            update_in_flight: AtomicBool::new(false),
        })
    }

    pub fn set_initial_task_info(&self, info: TaskInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.version = match self.scenario {
            // Large enough that the version can't be reached after the
            // post-restart reset to zero.
            FailureScenario::TaskMismatchWhenVersionIsHigh => 1_000_000,
            _ => info.task_status.version,
        };
        inner.task_state = info.task_status.state;
        inner.initial_status = Some(info.task_status);
    }

    pub fn set_dynamic_filter_domains(&self, domains: VersionedDynamicFilterDomains) {
        self.inner.lock().unwrap().dynamic_filter_domains = Some(domains);
    }

    pub fn task_source(&self, plan_node_id: &PlanNodeId) -> Option<data_model::TaskSource> {
        self.inner.lock().unwrap().task_sources.get(plan_node_id).cloned()
    }

    pub fn task_state(&self) -> TaskState {
        self.inner.lock().unwrap().task_state
    }

    pub fn status_fetches(&self) -> u64 {
        self.inner.lock().unwrap().status_fetches
    }

    pub fn dynamic_filter_fetches(&self) -> u64 {
        self.inner.lock().unwrap().dynamic_filter_fetches
    }

    pub fn update_requests(&self) -> u64 {
        self.inner.lock().unwrap().update_requests
    }

    fn check_rejecting(inner: &Inner) -> Result<()> {
        if inner.rejecting {
            return Err(anyhow!("request rejected: http client is closed"));
        }
        Ok(())
    }

    fn current_status(inner: &Inner) -> Result<TaskStatus> {
        let initial = inner
            .initial_status
            .as_ref()
            .ok_or_else(|| anyhow!("initial task info not set"))?;
        let mut status = initial.clone();
        status.task_instance_id = inner.task_instance_id.clone();
        status.version = inner.version;
        status.state = inner.task_state;
        status.dynamic_filters_version = inner
            .dynamic_filter_domains
            .as_ref()
            .map(|domains| domains.version)
            .unwrap_or(INITIAL_DYNAMIC_FILTERS_VERSION);
        Ok(status)
    }

    fn current_info(inner: &Inner) -> Result<TaskInfo> {
        Ok(TaskInfo {
            task_status: Self::current_status(inner)?,
            needs_plan: false,
            last_heartbeat_ms: epoch_time_ms(),
        })
    }
}

#[async_trait]
impl TaskTransport for TestingTaskWorker {
    async fn get_task_info(
        &self,
        _task_id: &TaskId,
        _current_version: i64,
        _max_wait: Duration,
    ) -> Result<TaskInfo> {
        let inner = self.inner.lock().unwrap();
        Self::check_rejecting(&inner)?;
        Self::current_info(&inner)
    }

    async fn create_or_update_task(
        &self,
        _task_id: &TaskId,
        request: TaskUpdateRequest,
    ) -> Result<TaskInfo> {
        // Single-flight discipline: the controller must never have two
        // update requests outstanding for one task.
        assert!(
            !self.update_in_flight.swap(true, Ordering::SeqCst),
            "overlapping task update requests"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = {
            let mut inner = self.inner.lock().unwrap();
            match Self::check_rejecting(&inner) {
                Ok(()) => {
                    inner.update_requests += 1;
                    for source in &request.sources {
                        let merged = match inner.task_sources.get(&source.plan_node_id) {
                            Some(existing) => existing.update(source),
                            None => source.clone(),
                        };
                        inner.task_sources.insert(source.plan_node_id.clone(), merged);
                    }
                    if inner.task_state == TaskState::Planned {
                        inner.task_state = TaskState::Running;
                        inner.version += 1;
                    }
                    Self::current_info(&inner)
                }
                Err(err) => Err(err),
            }
        };
        self.update_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn get_task_status(
        &self,
        _task_id: &TaskId,
        _current_version: i64,
        max_wait: Duration,
    ) -> Result<TaskStatus> {
        // Simulate the worker holding the long-poll for its full budget.
        tokio::time::sleep(max_wait).await;
        let mut inner = self.inner.lock().unwrap();
        Self::check_rejecting(&inner)?;
        inner.status_fetches += 1;
        match self.scenario {
            FailureScenario::TaskMismatch | FailureScenario::TaskMismatchWhenVersionIsHigh => {
                if inner.status_fetches == FAILURE_TRIGGER_FETCH {
                    inner.task_instance_id = NEW_TASK_INSTANCE_ID.to_string();
                    inner.version = 0;
                }
            }
            FailureScenario::RejectedExecution => {
                if inner.status_fetches >= FAILURE_TRIGGER_FETCH {
                    inner.rejecting = true;
                    return Err(anyhow!("request rejected: http client is closed"));
                }
            }
            FailureScenario::NoFailure => {}
        }
        inner.version += 1;
        Self::current_status(&inner)
    }

    async fn get_dynamic_filter_domains(
        &self,
        _task_id: &TaskId,
        _current_version: i64,
    ) -> Result<VersionedDynamicFilterDomains> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_rejecting(&inner)?;
        inner.dynamic_filter_fetches += 1;
        Ok(inner.dynamic_filter_domains.clone().unwrap_or_default())
    }

    async fn delete_task(&self, _task_id: &TaskId, abort: bool) -> Result<TaskInfo> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_rejecting(&inner)?;
        inner.task_state = if abort {
            TaskState::Aborted
        } else {
            TaskState::Canceled
        };
        inner.version += 1;
        Self::current_info(&inner)
    }
}
