use std::sync::Arc;

use data_model::ErrorCode;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::RemoteTaskController;

/// Continuous status long-poll loop, one outstanding request at a time.
/// Each request carries the last applied version and a max-wait budget the
/// worker blocks for, so propagation latency stays low without busy-polling.
pub(crate) struct StatusPoller {
    controller: Arc<RemoteTaskController>,
    shutdown_rx: watch::Receiver<()>,
}

impl StatusPoller {
    pub fn new(controller: Arc<RemoteTaskController>, shutdown_rx: watch::Receiver<()>) -> Self {
        Self {
            controller,
            shutdown_rx,
        }
    }

    pub async fn start(mut self) {
        let max_wait = self.controller.config.status_refresh_max_wait();
        loop {
            let current = self.controller.task_status();
            if current.is_terminal() {
                break;
            }
            let fetch = self.controller.transport.get_task_status(
                &self.controller.task_id,
                current.version,
                max_wait,
            );
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    debug!(task_id = %self.controller.task_id, "status poller shutting down");
                    break;
                }
                result = fetch => {
                    self.controller.metrics.record_status_fetch();
                    match result {
                        Ok(status) => {
                            // Identity first: a changed instance token is fatal
                            // no matter what the version field claims.
                            if !self.controller.record_instance(&status.task_instance_id) {
                                self.controller.fail(
                                    ErrorCode::RemoteTaskMismatch,
                                    format!(
                                        "worker answered for task {} with instance id {}, another instance was expected",
                                        self.controller.task_id, status.task_instance_id
                                    ),
                                );
                                break;
                            }
                            let terminal = status.is_terminal();
                            self.controller.update_task_status(status);
                            if terminal {
                                self.fetch_final_info().await;
                                break;
                            }
                        }
                        Err(err) => {
                            // Not retried: worker-side task lifetime is managed
                            // by scheduler-level rescheduling, not this client.
                            self.controller.fail(
                                ErrorCode::RemoteTaskError,
                                format!("status fetch failed: {:#}", err),
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn fetch_final_info(&self) {
        let result = self
            .controller
            .transport
            .get_task_info(
                &self.controller.task_id,
                self.controller.task_info().task_status.version,
                self.controller.config.info_fetch_max_wait(),
            )
            .await;
        match result {
            Ok(info) => self.controller.update_task_info(info),
            Err(err) => {
                warn!(
                    task_id = %self.controller.task_id,
                    "final task info fetch failed: {:#}", err
                );
            }
        }
    }
}
