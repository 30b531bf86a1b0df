use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use data_model::{
    Lifespan, OutputBuffers, PlanNodeId, Split, SplitId, TaskSource, TaskUpdateRequest,
};
use tracing::warn;

#[derive(Default)]
struct NodeAssignment {
    pending_splits: HashMap<SplitId, Split>,
    no_more_splits_for_lifespan: BTreeSet<Lifespan>,
    acked_no_more_splits_for_lifespan: BTreeSet<Lifespan>,
    no_more_splits: bool,
    acked_no_more_splits: bool,
}

impl NodeAssignment {
    fn has_unacked(&self) -> bool {
        !self.pending_splits.is_empty() ||
            self.no_more_splits != self.acked_no_more_splits ||
            self.no_more_splits_for_lifespan != self.acked_no_more_splits_for_lifespan
    }

    fn snapshot(&self, plan_node_id: &PlanNodeId) -> TaskSource {
        TaskSource {
            plan_node_id: plan_node_id.clone(),
            splits: self.pending_splits.values().cloned().collect(),
            // Resending already acknowledged flags is harmless; they are
            // monotonic on the worker side.
            no_more_splits_for_lifespan: self.no_more_splits_for_lifespan.clone(),
            no_more_splits: self.no_more_splits,
        }
    }
}

struct BufferState {
    assignments: HashMap<PlanNodeId, NodeAssignment>,
    request_in_flight: bool,
    dirty: bool,
    needs_plan: bool,
    closed: bool,
}

/// Accumulates pending split/no-more-splits mutations per plan node until
/// they can be flushed to the worker. Flushes coalesce everything
/// unacknowledged into one request; an explicit in-flight flag plus a dirty
/// flag keep at most one update request outstanding so the worker applies
/// mutations in order. Acknowledged splits are never resent.
pub struct SplitAssignmentBuffer {
    fragment: String,
    output_buffers: OutputBuffers,
    state: Mutex<BufferState>,
}

impl SplitAssignmentBuffer {
    pub fn new(fragment: String, output_buffers: OutputBuffers) -> Self {
        Self {
            fragment,
            output_buffers,
            state: Mutex::new(BufferState {
                assignments: HashMap::new(),
                request_in_flight: false,
                dirty: false,
                needs_plan: true,
                closed: false,
            }),
        }
    }

    /// Merge splits into the pending set. Returns true if any split was
    /// newly recorded.
    pub fn add_splits(&self, splits_by_node: HashMap<PlanNodeId, Vec<Split>>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        let mut recorded = false;
        for (plan_node_id, splits) in splits_by_node {
            let assignment = state.assignments.entry(plan_node_id.clone()).or_default();
            if assignment.no_more_splits {
                warn!(
                    plan_node_id = plan_node_id.get(),
                    "dropping splits added after no-more-splits"
                );
                continue;
            }
            for split in splits {
                if assignment.pending_splits.contains_key(&split.id) {
                    continue;
                }
                assignment.pending_splits.insert(split.id.clone(), split);
                recorded = true;
            }
        }
        recorded
    }

    pub fn no_more_splits_for_lifespan(&self, plan_node_id: PlanNodeId, lifespan: Lifespan) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state
            .assignments
            .entry(plan_node_id)
            .or_default()
            .no_more_splits_for_lifespan
            .insert(lifespan)
    }

    pub fn no_more_splits(&self, plan_node_id: PlanNodeId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        let assignment = state.assignments.entry(plan_node_id).or_default();
        let changed = !assignment.no_more_splits;
        assignment.no_more_splits = true;
        changed
    }

    /// Start a flush round. Returns the coalesced request while marking the
    /// buffer in flight, or None when a request is already outstanding (the
    /// buffer stays dirty and the caller retries after completion) or when
    /// nothing needs sending.
    pub fn begin_flush(&self) -> Option<TaskUpdateRequest> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return None;
        }
        if state.request_in_flight {
            state.dirty = true;
            return None;
        }
        let sources: Vec<TaskSource> = {
            let mut nodes: Vec<&PlanNodeId> = state
                .assignments
                .iter()
                .filter(|(_, assignment)| assignment.has_unacked())
                .map(|(plan_node_id, _)| plan_node_id)
                .collect();
            nodes.sort();
            nodes
                .into_iter()
                .map(|plan_node_id| state.assignments[plan_node_id].snapshot(plan_node_id))
                .collect()
        };
        if sources.is_empty() && !state.needs_plan {
            return None;
        }
        state.request_in_flight = true;
        state.dirty = false;
        Some(TaskUpdateRequest {
            fragment: state.needs_plan.then(|| self.fragment.clone()),
            sources,
            output_buffers: self.output_buffers.clone(),
        })
    }

    /// Finish a flush round. On success the sent splits are acknowledged and
    /// removed; unacknowledged ones stay for the next coalesced round.
    /// Returns true when mutations arrived while the request was in flight
    /// and another flush is needed.
    pub fn complete_flush(&self, sent: &TaskUpdateRequest, success: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        state.request_in_flight = false;
        if !success || state.closed {
            return false;
        }
        state.needs_plan = false;
        for source in &sent.sources {
            if let Some(assignment) = state.assignments.get_mut(&source.plan_node_id) {
                for split in &source.splits {
                    assignment.pending_splits.remove(&split.id);
                }
                assignment
                    .acked_no_more_splits_for_lifespan
                    .extend(source.no_more_splits_for_lifespan.iter().copied());
                assignment.acked_no_more_splits |= source.no_more_splits;
            }
        }
        state.dirty
    }

    /// Terminal teardown: queued mutations are released and further ones
    /// are refused.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.dirty = false;
        state.assignments.clear();
    }
}
