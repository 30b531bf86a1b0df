use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use data_model::{ColumnHandle, Domain, DynamicFilterId, QueryId};
use tokio::sync::watch;
use tracing::debug;

/// Binding of one dynamic filter to the column its collected domain
/// constrains.
#[derive(Debug, Clone)]
pub struct DynamicFilterDescriptor {
    pub filter_id: DynamicFilterId,
    pub column: ColumnHandle,
}

struct QueryDynamicFilters {
    descriptors: HashMap<DynamicFilterId, ColumnHandle>,
    collected: HashMap<DynamicFilterId, Domain>,
    // Bumped once per merge that introduces at least one new filter; blocked
    // consumers wait on it.
    generation: watch::Sender<u64>,
}

/// Explicitly owned registry of dynamic filter state per query. Injected into
/// controllers by the scheduler; registered at query start and dropped via
/// `stop_tracking` when the query finishes.
pub struct DynamicFilterRegistry {
    queries: Mutex<HashMap<QueryId, QueryDynamicFilters>>,
}

impl Default for DynamicFilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicFilterRegistry {
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_query(&self, query_id: QueryId, descriptors: Vec<DynamicFilterDescriptor>) {
        let (generation, _) = watch::channel(0);
        let descriptors = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.filter_id, descriptor.column))
            .collect();
        self.queries.lock().unwrap().insert(
            query_id,
            QueryDynamicFilters {
                descriptors,
                collected: HashMap::new(),
                generation,
            },
        );
    }

    pub fn stop_tracking(&self, query_id: &QueryId) {
        self.queries.lock().unwrap().remove(query_id);
    }

    pub fn has_filters(&self, query_id: &QueryId) -> bool {
        self.queries
            .lock()
            .unwrap()
            .get(query_id)
            .is_some_and(|query| !query.descriptors.is_empty())
    }

    /// True once every registered filter has a collected domain, or when the
    /// query is no longer tracked. Pollers use this as their stop signal.
    pub fn is_complete(&self, query_id: &QueryId) -> bool {
        self.queries
            .lock()
            .unwrap()
            .get(query_id)
            .is_none_or(|query| {
                query
                    .descriptors
                    .keys()
                    .all(|filter_id| query.collected.contains_key(filter_id))
            })
    }

    /// Merge freshly fetched domains into the cumulative mapping. Only new
    /// keys are accepted; a filter already collected is never overwritten
    /// (version gating upstream keeps stale data out). Returns the number of
    /// newly collected filters.
    pub fn add_task_domains(
        &self,
        query_id: &QueryId,
        domains: HashMap<DynamicFilterId, Domain>,
    ) -> usize {
        let mut queries = self.queries.lock().unwrap();
        let Some(query) = queries.get_mut(query_id) else {
            debug!(query_id = query_id.get(), "dropping domains for untracked query");
            return 0;
        };
        let mut added = 0;
        for (filter_id, domain) in domains {
            if query.collected.contains_key(&filter_id) {
                continue;
            }
            query.collected.insert(filter_id, domain);
            added += 1;
        }
        if added > 0 {
            query.generation.send_modify(|generation| *generation += 1);
        }
        added
    }

    /// The merged predicate visible to downstream scans: collected domains
    /// keyed by the column each filter constrains.
    pub fn current_predicate(&self, query_id: &QueryId) -> BTreeMap<ColumnHandle, Domain> {
        let queries = self.queries.lock().unwrap();
        let Some(query) = queries.get(query_id) else {
            return BTreeMap::new();
        };
        query
            .collected
            .iter()
            .filter_map(|(filter_id, domain)| {
                query
                    .descriptors
                    .get(filter_id)
                    .map(|column| (column.clone(), domain.clone()))
            })
            .collect()
    }

    /// Subscription that resolves once per merge introducing new filters.
    /// Each call observes only changes after it; a resolved wait is never
    /// reused.
    pub fn subscribe(&self, query_id: &QueryId) -> Option<watch::Receiver<u64>> {
        self.queries
            .lock()
            .unwrap()
            .get(query_id)
            .map(|query| query.generation.subscribe())
    }

    /// Block until new dynamic filter data arrives for the query. Returns
    /// immediately if the query is not tracked.
    pub async fn notified(&self, query_id: &QueryId) {
        let Some(mut receiver) = self.subscribe(query_id) else {
            return;
        };
        // Err means the query was dropped from the registry; unblock either way.
        let _ = receiver.changed().await;
    }
}
