use std::sync::Arc;

use data_model::ErrorCode;
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use super::RemoteTaskController;

/// Dynamic filter long-poll loop, independent of and on a coarser cadence
/// than the status channel: it only fetches when an applied status advertises
/// a filter version newer than the one already applied, and a minimum
/// inter-request spacing bounds its rate. Keeping the channels separate
/// avoids re-fetching the larger filter payload on every status tick.
pub(crate) struct DynamicFilterPoller {
    controller: Arc<RemoteTaskController>,
    shutdown_rx: watch::Receiver<()>,
    advertised_rx: watch::Receiver<i64>,
}

impl DynamicFilterPoller {
    pub fn new(
        controller: Arc<RemoteTaskController>,
        shutdown_rx: watch::Receiver<()>,
        advertised_rx: watch::Receiver<i64>,
    ) -> Self {
        Self {
            controller,
            shutdown_rx,
            advertised_rx,
        }
    }

    pub async fn start(mut self) {
        let min_interval = self.controller.config.dynamic_filter_min_interval();
        let query_id = self.controller.task_id.query_id().clone();
        let mut last_fetch: Option<Instant> = None;
        loop {
            if self.controller.task_status().is_terminal() {
                break;
            }
            if self.controller.dynamic_filters.is_complete(&query_id) {
                debug!(
                    task_id = %self.controller.task_id,
                    "all dynamic filters collected, stopping filter poller"
                );
                break;
            }

            let advertised = *self.advertised_rx.borrow_and_update();
            let applied = self.controller.applied_filter_version();
            if advertised <= applied {
                tokio::select! {
                    _ = self.shutdown_rx.changed() => {
                        debug!(task_id = %self.controller.task_id, "filter poller shutting down");
                        return;
                    }
                    changed = self.advertised_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            if let Some(last) = last_fetch {
                let elapsed = last.elapsed();
                if elapsed < min_interval {
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => return,
                        _ = tokio::time::sleep(min_interval - elapsed) => {}
                    }
                }
            }

            let fetch = self
                .controller
                .transport
                .get_dynamic_filter_domains(&self.controller.task_id, applied);
            tokio::select! {
                _ = self.shutdown_rx.changed() => return,
                result = fetch => {
                    self.controller.metrics.record_dynamic_filter_fetch();
                    last_fetch = Some(Instant::now());
                    match result {
                        Ok(domains) => self.controller.apply_dynamic_filter_domains(domains),
                        Err(err) => {
                            self.controller.fail(
                                ErrorCode::RemoteTaskError,
                                format!("dynamic filter fetch failed: {:#}", err),
                            );
                            return;
                        }
                    }
                }
            }
        }
    }
}
