pub mod tests {
    use rand::{distr::Alphanumeric, Rng};

    use crate::{
        Lifespan, OutputBufferKind, OutputBuffers, PlanNodeId, QueryId, Split, SplitId, TaskId,
        TaskInfo, TaskStatus,
    };

    pub const TEST_QUERY: &str = "test_query";
    pub const TEST_FRAGMENT: &str = "{\"root\":\"table_scan\"}";
    pub const TABLE_SCAN_NODE_ID: &str = "table_scan";

    pub fn mock_query_id() -> QueryId {
        QueryId::new(TEST_QUERY)
    }

    pub fn mock_task_id() -> TaskId {
        TaskId::new(mock_query_id(), 1, 2)
    }

    pub fn mock_table_scan_node() -> PlanNodeId {
        PlanNodeId::new(TABLE_SCAN_NODE_ID)
    }

    pub fn mock_split(id: &str, lifespan: Lifespan) -> Split {
        Split {
            id: SplitId::new(id),
            lifespan,
            payload: serde_json::json!({ "path": format!("file:///data/{}", id) }),
        }
    }

    pub fn mock_splits(count: usize, lifespan: Lifespan) -> Vec<Split> {
        (0..count)
            .map(|i| mock_split(&format!("split-{}", i), lifespan))
            .collect()
    }

    pub fn mock_instance_id() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect()
    }

    pub fn mock_split_id() -> SplitId {
        SplitId::new(nanoid::nanoid!())
    }

    pub fn mock_initial_task_info(task_id: TaskId) -> TaskInfo {
        let status = TaskStatus::initial(task_id, "http://worker:8080/v1/task".to_string());
        TaskInfo::initial(status)
    }

    pub fn mock_output_buffers() -> OutputBuffers {
        OutputBuffers::initial_empty(OutputBufferKind::Broadcast)
    }
}
