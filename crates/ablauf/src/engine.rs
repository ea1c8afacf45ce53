//! Engine: actor directory and entry point
//!
//! The engine plays the durable actor host for its instances: it owns the
//! registry of workflow definitions, opens per-actor storage, spawns runner
//! actors on demand, and routes index-shard RPCs between them.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::handle::WorkflowHandle;
use crate::observe::{
    DisabledObservability, ListFilter, ListedWorkflow, ObservabilityProvider, ShardIndexProvider,
    ShardRouter,
};
use crate::persistence::{IndexEntry, MemoryBackend, StorageBackend, WorkflowStatus};
use crate::runner::{self, RunnerHandle};
use crate::workflow::{DurableWorkflow, Registry};

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of index shards per workflow type.
    pub shard_count: u32,

    /// Safety-alarm interval set at every mutating RPC entry point.
    pub safety_alarm: Duration,

    /// Buffer size of live subscriber channels (on top of the persisted
    /// backlog).
    pub live_buffer: usize,

    /// Actor mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 8,
            safety_alarm: Duration::from_secs(1),
            live_buffer: 64,
            mailbox_capacity: 64,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Registry,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) clock: Clock,
    actors: DashMap<String, RunnerHandle>,
    observer: OnceLock<Arc<dyn ObservabilityProvider>>,
}

impl EngineInner {
    pub(crate) fn observer(&self) -> Arc<dyn ObservabilityProvider> {
        self.observer
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(DisabledObservability))
    }

    /// Get or spawn the actor for a name (workflow id or index shard).
    pub(crate) async fn actor(self: Arc<Self>, name: &str) -> Result<RunnerHandle, EngineError> {
        if let Some(handle) = self.actors.get(name) {
            return Ok(handle.clone());
        }

        let store = self.backend.open(name).await?;
        let handle = self
            .actors
            .entry(name.to_string())
            .or_insert_with(|| runner::spawn(name, store, Arc::clone(&self)))
            .clone();
        Ok(handle)
    }
}

/// Routes index RPCs to shard actors through the actor directory.
pub(crate) struct EngineRouter(pub(crate) Arc<EngineInner>);

#[async_trait]
impl ShardRouter for EngineRouter {
    async fn index_write(&self, actor: &str, entry: IndexEntry) -> Result<(), EngineError> {
        self.0.clone().actor(actor).await?.index_write(entry).await
    }

    async fn index_list(
        &self,
        actor: &str,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, EngineError> {
        self.0
            .clone()
            .actor(actor)
            .await?
            .index_list(status, limit)
            .await
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Registry,
    backend: Option<Arc<dyn StorageBackend>>,
    provider: Option<Arc<dyn ObservabilityProvider>>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: Registry::new(),
            backend: None,
            provider: None,
        }
    }

    /// Register a workflow definition; validates its schemas.
    pub fn register<W: DurableWorkflow>(mut self, workflow: W) -> Result<Self, EngineError> {
        self.registry.register(workflow)?;
        Ok(self)
    }

    /// Use a specific storage backend. Defaults to [`MemoryBackend`].
    pub fn storage<B: StorageBackend>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Use a specific observability provider. Defaults to the shard-based
    /// index provider.
    pub fn observability<P: ObservabilityProvider>(mut self, provider: P) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn shard_count(mut self, shard_count: u32) -> Self {
        self.config.shard_count = shard_count.max(1);
        self
    }

    pub fn safety_alarm(mut self, interval: Duration) -> Self {
        self.config.safety_alarm = interval;
        self
    }

    pub fn build(self) -> Engine {
        let workflow_types = self.registry.workflow_types();
        let shard_count = self.config.shard_count;

        let inner = Arc::new(EngineInner {
            config: self.config,
            registry: self.registry,
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(MemoryBackend::new())),
            clock: Clock::new(),
            actors: DashMap::new(),
            observer: OnceLock::new(),
        });

        let provider = self.provider.unwrap_or_else(|| {
            Arc::new(ShardIndexProvider::new(
                Arc::new(EngineRouter(inner.clone())),
                shard_count,
                workflow_types,
            ))
        });
        let _ = inner.observer.set(provider);

        info!(
            workflow_types = inner.registry.len(),
            shard_count, "engine built"
        );
        Engine { inner }
    }
}

/// The workflow engine.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::builder()
///     .register(Approval)?
///     .build();
///
/// let handle = engine.create::<Approval>("order-42", input).await?;
/// let snapshot = handle.status().await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create (or idempotently re-create) a typed workflow instance.
    pub async fn create<W: DurableWorkflow>(
        &self,
        id: &str,
        input: W::Input,
    ) -> Result<WorkflowHandle, EngineError> {
        let payload = serde_json::to_value(input)
            .map_err(|e| EngineError::internal(format!("failed to encode payload: {e}")))?;
        self.start(W::TYPE, id, payload).await
    }

    /// Create an instance by type name with a raw payload.
    pub async fn start(
        &self,
        workflow_type: &str,
        id: &str,
        payload: Value,
    ) -> Result<WorkflowHandle, EngineError> {
        let actor = self.inner.clone().actor(id).await?;
        actor.initialize(workflow_type.to_string(), payload).await?;
        Ok(WorkflowHandle::new(self.inner.clone(), id))
    }

    /// Handle to an instance without creating it.
    pub fn workflow(&self, id: &str) -> WorkflowHandle {
        WorkflowHandle::new(self.inner.clone(), id)
    }

    /// List indexed workflows via the observability provider's read side.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<ListedWorkflow>, EngineError> {
        self.inner.observer().list_workflows(filter).await
    }

    /// Look up a single indexed workflow by id.
    pub async fn get_indexed(&self, id: &str) -> Result<Option<ListedWorkflow>, EngineError> {
        self.inner.observer().get_indexed(id).await
    }
}
