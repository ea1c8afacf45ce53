//! Shard-based index provider
//!
//! The default observability provider. Workflow-level status lands in
//! `__index:<type>:<shard>` actors; step-level events are not indexed (step
//! data lives in the workflow's own storage). Reads fan out to every shard
//! of the matching types, deduplicate by id keeping the freshest entry, and
//! sort by `updated_at` descending. Readers must tolerate staleness: shard
//! entries are best-effort projections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::warn;

use super::{Collector, ListFilter, ListedWorkflow, ObservabilityProvider};
use crate::error::EngineError;
use crate::persistence::{IndexEntry, WorkflowStatus};
use crate::shard::shard_index;

/// Name of the shard actor owning an index partition.
pub fn index_actor(workflow_type: &str, shard: u32) -> String {
    format!("__index:{workflow_type}:{shard}")
}

/// Routing surface to the index shard actors.
#[async_trait]
pub trait ShardRouter: Send + Sync + 'static {
    async fn index_write(&self, actor: &str, entry: IndexEntry) -> Result<(), EngineError>;

    async fn index_list(
        &self,
        actor: &str,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, EngineError>;
}

/// Default provider writing workflow identity/status to index shard actors.
pub struct ShardIndexProvider {
    router: Arc<dyn ShardRouter>,
    shard_count: u32,
    workflow_types: Vec<String>,
}

impl ShardIndexProvider {
    pub fn new(router: Arc<dyn ShardRouter>, shard_count: u32, workflow_types: Vec<String>) -> Self {
        Self {
            router,
            shard_count: shard_count.max(1),
            workflow_types,
        }
    }

    fn types_for(&self, filter: &ListFilter) -> Vec<String> {
        match &filter.workflow_type {
            Some(t) => vec![t.clone()],
            None => self.workflow_types.clone(),
        }
    }

    async fn list_type(
        &self,
        workflow_type: &str,
        status: Option<WorkflowStatus>,
    ) -> Vec<(String, IndexEntry)> {
        let shards = (0..self.shard_count)
            .map(|shard| {
                let actor = index_actor(workflow_type, shard);
                async move {
                    match self.router.index_list(&actor, status, None).await {
                        Ok(entries) => entries,
                        Err(err) => {
                            warn!(%actor, %err, "index shard read failed");
                            Vec::new()
                        }
                    }
                }
            })
            .collect::<Vec<_>>();

        join_all(shards)
            .await
            .into_iter()
            .flatten()
            .map(|entry| (workflow_type.to_string(), entry))
            .collect()
    }
}

#[async_trait]
impl ObservabilityProvider for ShardIndexProvider {
    fn on_step_start(
        &self,
        _collector: &mut Collector,
        _name: &str,
        _step_type: crate::persistence::StepType,
        _timestamp: i64,
    ) {
        // Step-level events are no-ops for this provider.
    }

    fn on_step_complete(
        &self,
        _collector: &mut Collector,
        _name: &str,
        _step_type: crate::persistence::StepType,
        _duration_ms: i64,
        _timestamp: i64,
    ) {
    }

    fn on_step_retry(
        &self,
        _collector: &mut Collector,
        _name: &str,
        _attempt: u32,
        _error: &str,
        _error_stack: Option<&str>,
        _next_retry_at: i64,
        _timestamp: i64,
    ) {
    }

    fn on_workflow_start(&self, collector: &mut Collector, _payload: &Value, timestamp: i64) {
        collector.created_at = Some(timestamp);
        collector.updated_at = collector.updated_at.max(timestamp);
    }

    async fn flush(
        &self,
        collector: Collector,
        reason: WorkflowStatus,
    ) -> Result<(), EngineError> {
        let shard = shard_index(&collector.id, self.shard_count);
        let actor = index_actor(&collector.workflow_type, shard);

        let entry = IndexEntry {
            id: collector.id,
            status: reason,
            created_at: collector.created_at.unwrap_or(collector.updated_at),
            updated_at: collector.updated_at,
        };

        self.router.index_write(&actor, entry).await
    }

    async fn list_workflows(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ListedWorkflow>, EngineError> {
        let mut best: HashMap<String, ListedWorkflow> = HashMap::new();

        for workflow_type in self.types_for(&filter) {
            for (wtype, entry) in self.list_type(&workflow_type, filter.status).await {
                let listed = ListedWorkflow {
                    id: entry.id.clone(),
                    workflow_type: wtype,
                    status: entry.status,
                    created_at: entry.created_at,
                    updated_at: entry.updated_at,
                };
                match best.get(&entry.id) {
                    Some(existing) if existing.updated_at >= listed.updated_at => {}
                    _ => {
                        best.insert(entry.id.clone(), listed);
                    }
                }
            }
        }

        let mut entries: Vec<_> = best.into_values().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn get_indexed(&self, id: &str) -> Result<Option<ListedWorkflow>, EngineError> {
        let shard = shard_index(id, self.shard_count);
        let mut best: Option<ListedWorkflow> = None;

        for workflow_type in &self.workflow_types {
            let actor = index_actor(workflow_type, shard);
            let entries = match self.router.index_list(&actor, None, None).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(%actor, %err, "index shard read failed");
                    continue;
                }
            };
            for entry in entries {
                if entry.id != id {
                    continue;
                }
                let fresher = best
                    .as_ref()
                    .map(|b| entry.updated_at > b.updated_at)
                    .unwrap_or(true);
                if fresher {
                    best = Some(ListedWorkflow {
                        id: entry.id,
                        workflow_type: workflow_type.clone(),
                        status: entry.status,
                        created_at: entry.created_at,
                        updated_at: entry.updated_at,
                    });
                }
            }
        }

        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InstanceStore, MemoryStore};
    use dashmap::DashMap;

    /// Router backed by in-memory shard stores, for provider tests.
    struct MemoryRouter {
        shards: DashMap<String, Arc<MemoryStore>>,
    }

    impl MemoryRouter {
        fn new() -> Self {
            Self {
                shards: DashMap::new(),
            }
        }

        fn shard(&self, actor: &str) -> Arc<MemoryStore> {
            self.shards
                .entry(actor.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new()))
                .clone()
        }
    }

    #[async_trait]
    impl ShardRouter for MemoryRouter {
        async fn index_write(&self, actor: &str, entry: IndexEntry) -> Result<(), EngineError> {
            self.shard(actor).index_upsert(&entry).await?;
            Ok(())
        }

        async fn index_list(
            &self,
            actor: &str,
            status: Option<WorkflowStatus>,
            limit: Option<usize>,
        ) -> Result<Vec<IndexEntry>, EngineError> {
            Ok(self.shard(actor).index_list(status, limit).await?)
        }
    }

    fn provider(router: Arc<MemoryRouter>) -> ShardIndexProvider {
        ShardIndexProvider::new(router, 4, vec!["test".to_string()])
    }

    async fn flush_one(provider: &ShardIndexProvider, id: &str, status: WorkflowStatus, at: i64) {
        let mut collector = provider.create_collector(id, "test");
        provider.on_workflow_status_change(&mut collector, status, Some(at), at);
        provider.flush(collector, status).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_routes_to_stable_shard() {
        let router = Arc::new(MemoryRouter::new());
        let provider = provider(router.clone());

        flush_one(&provider, "abc", WorkflowStatus::Running, 100).await;

        // FNV-1a("abc") % 4 == 3; the entry must land on exactly that shard.
        let expected = index_actor("test", shard_index("abc", 4));
        let entries = router.shard(&expected).index_list(None, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "abc");
    }

    #[tokio::test]
    async fn test_list_fans_out_and_sorts() {
        let router = Arc::new(MemoryRouter::new());
        let provider = provider(router);

        flush_one(&provider, "wf-a", WorkflowStatus::Running, 100).await;
        flush_one(&provider, "wf-b", WorkflowStatus::Completed, 300).await;
        flush_one(&provider, "wf-c", WorkflowStatus::Running, 200).await;

        let all = provider.list_workflows(ListFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|w| w.id.as_str()).collect::<Vec<_>>(),
            vec!["wf-b", "wf-c", "wf-a"]
        );

        let running = provider
            .list_workflows(ListFilter {
                status: Some(WorkflowStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 2);

        let limited = provider
            .list_workflows(ListFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "wf-b");
    }

    #[tokio::test]
    async fn test_dedup_keeps_freshest() {
        let router = Arc::new(MemoryRouter::new());
        let provider = provider(router);

        flush_one(&provider, "wf-a", WorkflowStatus::Running, 100).await;
        flush_one(&provider, "wf-a", WorkflowStatus::Completed, 200).await;

        let all = provider.list_workflows(ListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, WorkflowStatus::Completed);
        assert_eq!(all[0].updated_at, 200);
    }

    #[tokio::test]
    async fn test_get_indexed() {
        let router = Arc::new(MemoryRouter::new());
        let provider = provider(router);

        flush_one(&provider, "wf-a", WorkflowStatus::Sleeping, 150).await;

        let found = provider.get_indexed("wf-a").await.unwrap().unwrap();
        assert_eq!(found.status, WorkflowStatus::Sleeping);
        assert!(provider.get_indexed("missing").await.unwrap().is_none());
    }
}
