//! In-memory implementation of InstanceStore
//!
//! Primarily for tests and embedded use. Provides the same semantics as the
//! SQLite implementation, including `updated_at` clamping and conflict rules.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

use super::store::*;

#[derive(Default)]
struct Tables {
    workflow: Option<WorkflowRow>,
    steps: BTreeMap<String, StepRow>,
    event_buffer: HashMap<String, EventBufferRow>,
    live_messages: Vec<LiveMessageRow>,
    instances: HashMap<String, IndexEntry>,
}

/// One actor's in-memory tables.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_workflow(&self) -> Result<Option<WorkflowRow>, StoreError> {
        Ok(self.tables.read().workflow.clone())
    }

    async fn insert_workflow(&self, row: &WorkflowRow) -> Result<(), StoreError> {
        self.tables.write().workflow = Some(row.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        status: WorkflowStatus,
        paused: Option<bool>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if let Some(workflow) = tables.workflow.as_mut() {
            workflow.status = status;
            if let Some(paused) = paused {
                workflow.paused = paused;
            }
            workflow.updated_at = workflow.updated_at.max(updated_at);
        }
        Ok(())
    }

    async fn finish_workflow(
        &self,
        status: WorkflowStatus,
        result: Option<&Value>,
        error: Option<&str>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if let Some(workflow) = tables.workflow.as_mut() {
            workflow.status = status;
            workflow.result = result.cloned();
            workflow.error = error.map(str::to_string);
            workflow.updated_at = workflow.updated_at.max(updated_at);
        }
        Ok(())
    }

    async fn get_step(&self, name: &str) -> Result<Option<StepRow>, StoreError> {
        Ok(self.tables.read().steps.get(name).cloned())
    }

    async fn list_steps(&self) -> Result<Vec<StepRow>, StoreError> {
        Ok(self.tables.read().steps.values().cloned().collect())
    }

    async fn upsert_step(&self, row: &StepRow) -> Result<(), StoreError> {
        self.tables
            .write()
            .steps
            .insert(row.name.clone(), row.clone());
        Ok(())
    }

    async fn buffer_event(
        &self,
        event: &str,
        payload: &Value,
        received_at: i64,
    ) -> Result<(), StoreError> {
        self.tables.write().event_buffer.insert(
            event.to_string(),
            EventBufferRow {
                event: event.to_string(),
                payload: payload.clone(),
                received_at,
            },
        );
        Ok(())
    }

    async fn take_event(&self, event: &str) -> Result<Option<EventBufferRow>, StoreError> {
        Ok(self.tables.write().event_buffer.remove(event))
    }

    async fn clear_event_buffer(&self) -> Result<(), StoreError> {
        self.tables.write().event_buffer.clear();
        Ok(())
    }

    async fn append_live_message(
        &self,
        event: &str,
        data: &Value,
        created_at: i64,
    ) -> Result<i64, StoreError> {
        let mut tables = self.tables.write();
        let seq = tables.live_messages.last().map(|m| m.seq).unwrap_or(0) + 1;
        tables.live_messages.push(LiveMessageRow {
            seq,
            event: event.to_string(),
            data: data.clone(),
            created_at,
        });
        Ok(seq)
    }

    async fn list_live_messages(&self) -> Result<Vec<LiveMessageRow>, StoreError> {
        Ok(self.tables.read().live_messages.clone())
    }

    async fn index_upsert(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        match tables.instances.get_mut(&entry.id) {
            Some(existing) => {
                // Conflict rule: keep created_at, never decrease updated_at.
                existing.status = entry.status;
                existing.updated_at = existing.updated_at.max(entry.updated_at);
            }
            None => {
                tables.instances.insert(entry.id.clone(), entry.clone());
            }
        }
        Ok(())
    }

    async fn index_list(
        &self,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let tables = self.tables.read();
        let mut entries: Vec<_> = tables
            .instances
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

/// In-memory storage backend: one [`MemoryStore`] per actor name.
pub struct MemoryBackend {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
        }
    }

    /// Number of actors with storage.
    pub fn actor_count(&self) -> usize {
        self.stores.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open(&self, actor: &str) -> Result<Arc<dyn InstanceStore>, StoreError> {
        let store = self
            .stores
            .entry(actor.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow_row() -> WorkflowRow {
        WorkflowRow {
            id: "wf-1".into(),
            workflow_type: "test".into(),
            status: WorkflowStatus::Running,
            payload: json!({ "n": 1 }),
            result: None,
            error: None,
            paused: false,
            created_at: 100,
            updated_at: 100,
        }
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_workflow().await.unwrap().is_none());

        store.insert_workflow(&workflow_row()).await.unwrap();
        let row = store.get_workflow().await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_updated_at_is_monotone() {
        let store = MemoryStore::new();
        store.insert_workflow(&workflow_row()).await.unwrap();

        store
            .update_status(WorkflowStatus::Sleeping, None, 500)
            .await
            .unwrap();
        // A stale timestamp must not move updated_at backwards.
        store
            .update_status(WorkflowStatus::Running, None, 200)
            .await
            .unwrap();

        let row = store.get_workflow().await.unwrap().unwrap();
        assert_eq!(row.updated_at, 500);
        assert_eq!(row.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_event_buffer_last_write_wins() {
        let store = MemoryStore::new();
        store
            .buffer_event("approval", &json!({ "approved": false }), 1)
            .await
            .unwrap();
        store
            .buffer_event("approval", &json!({ "approved": true }), 2)
            .await
            .unwrap();

        let entry = store.take_event("approval").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!({ "approved": true }));
        assert!(store.take_event("approval").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_messages_sequence() {
        let store = MemoryStore::new();
        let seq1 = store
            .append_live_message("progress", &json!(1), 10)
            .await
            .unwrap();
        let seq2 = store
            .append_live_message("progress", &json!(2), 20)
            .await
            .unwrap();
        assert!(seq2 > seq1);

        let messages = store.list_live_messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].seq, seq1);
    }

    #[tokio::test]
    async fn test_index_upsert_preserves_created_at() {
        let store = MemoryStore::new();
        store
            .index_upsert(&IndexEntry {
                id: "wf-1".into(),
                status: WorkflowStatus::Running,
                created_at: 100,
                updated_at: 100,
            })
            .await
            .unwrap();
        store
            .index_upsert(&IndexEntry {
                id: "wf-1".into(),
                status: WorkflowStatus::Completed,
                created_at: 999,
                updated_at: 300,
            })
            .await
            .unwrap();

        let entries = store.index_list(None, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].created_at, 100);
        assert_eq!(entries[0].updated_at, 300);
        assert_eq!(entries[0].status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_index_list_filter_and_limit() {
        let store = MemoryStore::new();
        for (i, status) in [
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Running,
        ]
        .iter()
        .enumerate()
        {
            store
                .index_upsert(&IndexEntry {
                    id: format!("wf-{i}"),
                    status: *status,
                    created_at: i as i64,
                    updated_at: i as i64,
                })
                .await
                .unwrap();
        }

        let running = store
            .index_list(Some(WorkflowStatus::Running), None)
            .await
            .unwrap();
        assert_eq!(running.len(), 2);

        let limited = store.index_list(None, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "wf-2");
    }

    #[tokio::test]
    async fn test_backend_reopens_same_store() {
        let backend = MemoryBackend::new();
        let store = backend.open("wf-1").await.unwrap();
        store.insert_workflow(&workflow_row()).await.unwrap();

        let reopened = backend.open("wf-1").await.unwrap();
        assert!(reopened.get_workflow().await.unwrap().is_some());
        assert_eq!(backend.actor_count(), 1);
    }
}
