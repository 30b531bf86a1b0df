mod filter_poller;
mod status_poller;
mod update_sender;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use data_model::{
    ErrorCode, ExecutionFailureInfo, Lifespan, OutputBuffers, PlanNodeId, Split, TaskId, TaskInfo,
    TaskState, TaskStatus, TaskUpdateRequest, VersionedDynamicFilterDomains,
    INITIAL_DYNAMIC_FILTERS_VERSION,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use self::update_sender::SplitAssignmentBuffer;
use self::{filter_poller::DynamicFilterPoller, status_poller::StatusPoller};
use crate::{
    config::RemoteTaskConfig, dynamic_filters::DynamicFilterRegistry, metrics::RemoteTaskMetrics,
    transport::TaskTransport,
};

/// Coordinator-side controller for one task running on a remote worker.
///
/// Owns the task lifecycle state machine and the three single-flight
/// channels to the worker: split/assignment updates, status long-polling and
/// dynamic filter long-polling. The cached status snapshot is replaced only
/// by the controller's own reactive callbacks; callers read immutable
/// snapshots or subscribe for change notification.
pub struct RemoteTaskController {
    pub(crate) task_id: TaskId,
    pub(crate) transport: Arc<dyn TaskTransport>,
    pub(crate) config: RemoteTaskConfig,
    pub(crate) metrics: Arc<RemoteTaskMetrics>,
    pub(crate) dynamic_filters: Arc<DynamicFilterRegistry>,
    pub(crate) update_buffer: SplitAssignmentBuffer,

    status_tx: watch::Sender<TaskStatus>,
    task_info: Mutex<TaskInfo>,
    // Instance identity token from the first worker response; any later
    // change is a fatal task mismatch.
    instance_id: Mutex<Option<String>>,
    // Latest dynamic filter version the worker advertised through applied
    // statuses; the filter poller wakes when it moves past what was applied.
    advertised_filter_version_tx: watch::Sender<i64>,
    applied_filter_version: AtomicI64,

    started: AtomicBool,
    shutdown_tx: watch::Sender<()>,
}

impl RemoteTaskController {
    pub fn new(
        task_id: TaskId,
        task_uri: String,
        fragment: String,
        output_buffers: OutputBuffers,
        transport: Arc<dyn TaskTransport>,
        dynamic_filters: Arc<DynamicFilterRegistry>,
        config: RemoteTaskConfig,
    ) -> Arc<Self> {
        let initial_status = TaskStatus::initial(task_id.clone(), task_uri);
        let (status_tx, _) = watch::channel(initial_status.clone());
        let (advertised_filter_version_tx, _) = watch::channel(INITIAL_DYNAMIC_FILTERS_VERSION);
        let (shutdown_tx, _) = watch::channel(());
        Arc::new(Self {
            task_id,
            transport,
            config,
            metrics: Arc::new(RemoteTaskMetrics::new()),
            dynamic_filters,
            update_buffer: SplitAssignmentBuffer::new(fragment, output_buffers),
            status_tx,
            task_info: Mutex::new(TaskInfo::initial(initial_status)),
            instance_id: Mutex::new(None),
            advertised_filter_version_tx,
            applied_filter_version: AtomicI64::new(INITIAL_DYNAMIC_FILTERS_VERSION),
            started: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Begin polling the worker and deliver the initial task creation
    /// request. Idempotent; a no-op once started or terminal.
    pub fn start(self: &Arc<Self>) {
        if self.task_status().is_terminal() {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status_tx.send_if_modified(|current| {
            if current.state != TaskState::Planned {
                return false;
            }
            *current = current.with_state(TaskState::Running);
            true
        });
        info!(task_id = %self.task_id, "starting remote task");

        let status_poller = StatusPoller::new(self.clone(), self.shutdown_tx.subscribe());
        tokio::spawn(status_poller.start());

        if self.dynamic_filters.has_filters(self.task_id.query_id()) {
            let filter_poller = DynamicFilterPoller::new(
                self.clone(),
                self.shutdown_tx.subscribe(),
                self.advertised_filter_version_tx.subscribe(),
            );
            tokio::spawn(filter_poller.start());
        }

        self.schedule_update();
    }

    /// Merge splits into the assignment buffer and flush. Silently dropped
    /// once the task is terminal.
    pub fn add_splits(self: &Arc<Self>, splits_by_node: HashMap<PlanNodeId, Vec<Split>>) {
        if self.task_status().is_terminal() {
            debug!(task_id = %self.task_id, "ignoring splits added to terminal task");
            return;
        }
        if self.update_buffer.add_splits(splits_by_node) {
            self.schedule_update();
        }
    }

    pub fn no_more_splits_for_lifespan(
        self: &Arc<Self>,
        plan_node_id: PlanNodeId,
        lifespan: Lifespan,
    ) {
        if self
            .update_buffer
            .no_more_splits_for_lifespan(plan_node_id, lifespan)
        {
            self.schedule_update();
        }
    }

    pub fn no_more_splits(self: &Arc<Self>, plan_node_id: PlanNodeId) {
        if self.update_buffer.no_more_splits(plan_node_id) {
            self.schedule_update();
        }
    }

    /// User cancellation. Safe to call concurrently with in-flight polls and
    /// a no-op on an already terminal task.
    pub fn cancel(self: &Arc<Self>) {
        self.terminate(TaskState::Canceled, false);
    }

    /// Coordinator gave up on the task; terminal label differs from a user
    /// cancellation.
    pub fn abort(self: &Arc<Self>) {
        self.terminate(TaskState::Aborted, true);
    }

    /// Latest locally cached status snapshot. Never blocks.
    pub fn task_status(&self) -> TaskStatus {
        self.status_tx.borrow().clone()
    }

    /// Latest locally cached task info snapshot. Never blocks.
    pub fn task_info(&self) -> TaskInfo {
        self.task_info.lock().unwrap().clone()
    }

    /// Change notification channel; every applied status is published here.
    pub fn status_changes(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<RemoteTaskMetrics> {
        &self.metrics
    }

    fn terminate(self: &Arc<Self>, state: TaskState, abort: bool) {
        let mut transitioned = false;
        self.status_tx.send_if_modified(|current| {
            if current.state.is_terminal() {
                return false;
            }
            *current = current.with_state(state);
            transitioned = true;
            true
        });
        if !transitioned {
            debug!(task_id = %self.task_id, state = state.as_ref(), "task already terminal");
            return;
        }
        info!(task_id = %self.task_id, state = state.as_ref(), "terminating remote task");
        self.sync_info_to_status();
        self.stop();

        // Best-effort worker-side teardown; the response is ignored because
        // the local state machine is already terminal.
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.transport.delete_task(&this.task_id, abort).await {
                warn!(task_id = %this.task_id, "task delete failed: {:#}", err);
            }
        });
    }

    /// Resolve a fatal condition into a terminal FAILED state with a
    /// recorded cause. Callers observe it via the status snapshot; there is
    /// no separate error channel.
    pub(crate) fn fail(self: &Arc<Self>, error_code: ErrorCode, message: String) {
        let failure = ExecutionFailureInfo::new(error_code, message.clone());
        let mut transitioned = false;
        self.status_tx.send_if_modified(|current| {
            if current.state.is_terminal() {
                return false;
            }
            *current = current.fail_with(failure.clone());
            transitioned = true;
            true
        });
        if !transitioned {
            return;
        }
        error!(task_id = %self.task_id, error_code = error_code.as_ref(), "{}", message);
        self.sync_info_to_status();
        self.stop();

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.transport.delete_task(&this.task_id, true).await {
                warn!(task_id = %this.task_id, "task delete failed: {:#}", err);
            }
        });
    }

    /// Apply a status reported by the worker. Ordered by version, not by
    /// arrival time: only strictly newer versions replace the snapshot,
    /// stale ones are ignored (long-poll responses may race), and nothing
    /// is applied once the local state machine is terminal.
    pub(crate) fn update_task_status(&self, status: TaskStatus) -> bool {
        let version = status.version;
        let dynamic_filters_version = status.dynamic_filters_version;
        let state = status.state;
        let mut stale = None;
        let applied = self.status_tx.send_if_modified(|current| {
            if current.state.is_terminal() {
                return false;
            }
            if version <= current.version {
                if version < current.version {
                    stale = Some(current.version);
                }
                return false;
            }
            *current = status.clone();
            true
        });
        if let Some(current_version) = stale {
            // Version regression with an unchanged instance id: logged and
            // ignored, the snapshot keeps the newer version.
            debug!(
                task_id = %self.task_id,
                version,
                current_version,
                "ignoring stale task status"
            );
        }
        if !applied {
            return false;
        }
        self.advertised_filter_version_tx.send_if_modified(|advertised| {
            if dynamic_filters_version > *advertised {
                *advertised = dynamic_filters_version;
                return true;
            }
            false
        });
        self.sync_info_to_status();
        if state.is_terminal() {
            self.stop();
        }
        true
    }

    /// Apply a task info returned by the update or delete calls. The status
    /// snapshot itself is fed only through the status poller so the instance
    /// identity check is never bypassed.
    pub(crate) fn update_task_info(&self, info: TaskInfo) {
        let mut cached = self.task_info.lock().unwrap();
        if info.task_status.version < cached.task_status.version {
            return;
        }
        // Once terminal, only a refinement of the same outcome is accepted
        // (the best-effort final info fetch); the outcome itself is settled.
        if cached.task_status.is_terminal() && info.task_status.state != cached.task_status.state {
            return;
        }
        *cached = info;
    }

    /// Record the worker's instance identity token. Returns false when the
    /// token differs from the one recorded on the first response, which is a
    /// fatal task mismatch independent of the version field.
    pub(crate) fn record_instance(&self, task_instance_id: &str) -> bool {
        let mut guard = self.instance_id.lock().unwrap();
        match guard.as_deref() {
            None => {
                *guard = Some(task_instance_id.to_string());
                true
            }
            Some(known) => known == task_instance_id,
        }
    }

    pub(crate) fn applied_filter_version(&self) -> i64 {
        self.applied_filter_version.load(Ordering::Acquire)
    }

    /// Merge a dynamic filter fetch result. Responses at or below the
    /// applied version are ignored; newer ones move the applied version and
    /// merge into the registry's cumulative mapping.
    pub(crate) fn apply_dynamic_filter_domains(&self, domains: VersionedDynamicFilterDomains) {
        let applied = self.applied_filter_version();
        if domains.version <= applied {
            debug!(
                task_id = %self.task_id,
                version = domains.version,
                applied,
                "ignoring stale dynamic filter domains"
            );
            return;
        }
        self.applied_filter_version
            .store(domains.version, Ordering::Release);
        let added = self
            .dynamic_filters
            .add_task_domains(self.task_id.query_id(), domains.dynamic_filter_domains);
        debug!(
            task_id = %self.task_id,
            version = domains.version,
            added,
            "applied dynamic filter domains"
        );
    }

    /// Flush pending assignment mutations, keeping at most one update
    /// request outstanding.
    pub(crate) fn schedule_update(self: &Arc<Self>) {
        if self.task_status().is_terminal() {
            return;
        }
        let Some(request) = self.update_buffer.begin_flush() else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.send_update(request).await;
        });
    }

    async fn send_update(self: Arc<Self>, request: TaskUpdateRequest) {
        self.metrics.record_update_round();
        match self
            .transport
            .create_or_update_task(&self.task_id, request.clone())
            .await
        {
            Ok(info) => {
                self.update_task_info(info);
                if self.update_buffer.complete_flush(&request, true) {
                    self.schedule_update();
                }
            }
            Err(err) => {
                self.update_buffer.complete_flush(&request, false);
                self.fail(
                    ErrorCode::RemoteTaskError,
                    format!("task update failed: {:#}", err),
                );
            }
        }
    }

    fn sync_info_to_status(&self) {
        let status = self.task_status();
        let mut cached = self.task_info.lock().unwrap();
        if cached.task_status.version < status.version {
            cached.task_status = status;
        }
    }

    /// Tear down scheduling: no new requests are issued, in-flight ones
    /// complete and are ignored.
    fn stop(&self) {
        self.update_buffer.close();
        let _ = self.shutdown_tx.send(());
    }
}
