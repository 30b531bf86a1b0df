use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::{TaskId, TaskInfo, TaskStatus, TaskUpdateRequest, VersionedDynamicFilterDomains};
use url::Url;

use crate::config::RemoteTaskConfig;

pub const TASK_CURRENT_VERSION_HEADER: &str = "x-task-current-version";
pub const TASK_MAX_WAIT_HEADER: &str = "x-task-max-wait-ms";

/// Capability the controller needs from the worker. One production HTTP
/// implementation, one in-memory double for tests.
#[async_trait]
pub trait TaskTransport: Send + Sync + 'static {
    async fn get_task_info(
        &self,
        task_id: &TaskId,
        current_version: i64,
        max_wait: Duration,
    ) -> Result<TaskInfo>;

    async fn create_or_update_task(
        &self,
        task_id: &TaskId,
        request: TaskUpdateRequest,
    ) -> Result<TaskInfo>;

    async fn get_task_status(
        &self,
        task_id: &TaskId,
        current_version: i64,
        max_wait: Duration,
    ) -> Result<TaskStatus>;

    async fn get_dynamic_filter_domains(
        &self,
        task_id: &TaskId,
        current_version: i64,
    ) -> Result<VersionedDynamicFilterDomains>;

    async fn delete_task(&self, task_id: &TaskId, abort: bool) -> Result<TaskInfo>;
}

/// Worker transport over HTTP. Long-poll budgets ride in request headers;
/// the local request timeout is the budget plus a configured grace, so a
/// worker that never answers surfaces as a transport failure.
pub struct HttpTaskTransport {
    client: reqwest::Client,
    base_url: Url,
    request_timeout_grace: Duration,
}

impl HttpTaskTransport {
    pub fn new(base_url: Url, config: &RemoteTaskConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("error building http client for task transport")?;
        Ok(Self {
            client,
            base_url,
            request_timeout_grace: config.request_timeout_grace(),
        })
    }

    fn task_url(&self, task_id: &TaskId, suffix: &str) -> Result<Url> {
        self.base_url
            .join(&format!("v1/task/{}{}", task_id, suffix))
            .with_context(|| format!("error building url for task {}", task_id))
    }
}

#[async_trait]
impl TaskTransport for HttpTaskTransport {
    async fn get_task_info(
        &self,
        task_id: &TaskId,
        current_version: i64,
        max_wait: Duration,
    ) -> Result<TaskInfo> {
        let url = self.task_url(task_id, "")?;
        let response = self
            .client
            .get(url)
            .header(TASK_CURRENT_VERSION_HEADER, current_version.to_string())
            .header(TASK_MAX_WAIT_HEADER, max_wait.as_millis().to_string())
            .timeout(max_wait + self.request_timeout_grace)
            .send()
            .await
            .with_context(|| format!("error fetching info for task {}", task_id))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn create_or_update_task(
        &self,
        task_id: &TaskId,
        request: TaskUpdateRequest,
    ) -> Result<TaskInfo> {
        let url = self.task_url(task_id, "")?;
        let response = self
            .client
            .post(url)
            .json(&request)
            .timeout(self.request_timeout_grace)
            .send()
            .await
            .with_context(|| format!("error sending update for task {}", task_id))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get_task_status(
        &self,
        task_id: &TaskId,
        current_version: i64,
        max_wait: Duration,
    ) -> Result<TaskStatus> {
        let url = self.task_url(task_id, "/status")?;
        let response = self
            .client
            .get(url)
            .header(TASK_CURRENT_VERSION_HEADER, current_version.to_string())
            .header(TASK_MAX_WAIT_HEADER, max_wait.as_millis().to_string())
            .timeout(max_wait + self.request_timeout_grace)
            .send()
            .await
            .with_context(|| format!("error fetching status for task {}", task_id))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get_dynamic_filter_domains(
        &self,
        task_id: &TaskId,
        current_version: i64,
    ) -> Result<VersionedDynamicFilterDomains> {
        let url = self.task_url(task_id, "/dynamicfilters")?;
        let response = self
            .client
            .get(url)
            .header(TASK_CURRENT_VERSION_HEADER, current_version.to_string())
            .timeout(self.request_timeout_grace)
            .send()
            .await
            .with_context(|| format!("error fetching dynamic filters for task {}", task_id))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn delete_task(&self, task_id: &TaskId, abort: bool) -> Result<TaskInfo> {
        let mut url = self.task_url(task_id, "")?;
        url.query_pairs_mut()
            .append_pair("abort", if abort { "true" } else { "false" });
        let response = self
            .client
            .delete(url)
            .timeout(self.request_timeout_grace)
            .send()
            .await
            .with_context(|| format!("error deleting task {}", task_id))?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
