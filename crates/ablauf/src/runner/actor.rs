//! Runner actor implementation
//!
//! The actor owns its store, its single alarm, and the live subscriber set.
//! `replay()` drives the workflow: it re-runs the user body from the top,
//! the step cache skips completed work, and the first interrupt (or the
//! return value) decides the next state and alarm. All storage writes and
//! alarm sets happen before control returns from a cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{RunnerHandle, RunnerMsg, WorkflowSnapshot};
use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::interrupt::{Interrupt, RunError};
use crate::live::{LiveContext, LiveFrame, LiveShared, CLOSE_ERROR, CLOSE_NORMAL, CLOSE_NO_UPDATES};
use crate::observe::{Collector, ObservabilityProvider};
use crate::persistence::{
    IndexEntry, InstanceStore, StepStatus, WorkflowRow, WorkflowStatus,
};
use crate::schema::Schema;
use crate::step::StepContext;
use crate::workflow::AnyDefinition;

/// Spawn the actor task for one instance and return its mailbox handle.
pub(crate) fn spawn(
    name: &str,
    store: Arc<dyn InstanceStore>,
    engine: Arc<EngineInner>,
) -> RunnerHandle {
    let (tx, rx) = mpsc::channel(engine.config.mailbox_capacity);
    let runner = Runner {
        name: name.to_string(),
        store,
        engine,
        live: Arc::new(LiveShared::new()),
        alarm: None,
        event_schemas: None,
        update_schemas: None,
        self_tx: tx.clone(),
    };
    tokio::spawn(runner.run(rx));
    RunnerHandle::new(name.to_string(), tx)
}

struct Runner {
    name: String,
    store: Arc<dyn InstanceStore>,
    engine: Arc<EngineInner>,
    live: Arc<LiveShared>,
    alarm: Option<JoinHandle<()>>,
    event_schemas: Option<Arc<HashMap<String, Schema>>>,
    update_schemas: Option<Arc<HashMap<String, Schema>>>,
    self_tx: mpsc::Sender<RunnerMsg>,
}

impl Runner {
    async fn run(mut self, mut rx: mpsc::Receiver<RunnerMsg>) {
        // Construction: run schema migrations to idempotence, nothing else.
        if let Err(err) = self.store.migrate().await {
            error!(actor = %self.name, %err, "store migration failed");
        }

        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        self.delete_alarm();
    }

    async fn handle(&mut self, msg: RunnerMsg) {
        match msg {
            RunnerMsg::Initialize {
                workflow_type,
                payload,
                reply,
            } => {
                let _ = reply.send(self.initialize(workflow_type, payload).await);
            }
            RunnerMsg::GetStatus { reply } => {
                let _ = reply.send(self.get_status().await);
            }
            RunnerMsg::DeliverEvent {
                event,
                payload,
                reply,
            } => {
                let _ = reply.send(self.deliver_event(event, payload).await);
            }
            RunnerMsg::Pause { reply } => {
                let _ = reply.send(self.pause().await);
            }
            RunnerMsg::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            RunnerMsg::Terminate { reply } => {
                let _ = reply.send(self.terminate().await);
            }
            RunnerMsg::ConnectLive { reply } => {
                let _ = reply.send(self.connect_live().await);
            }
            RunnerMsg::Alarm => self.handle_alarm().await,
            RunnerMsg::IndexWrite { entry, reply } => {
                let _ = reply.send(self.index_write(entry).await);
            }
            RunnerMsg::IndexList {
                status,
                limit,
                reply,
            } => {
                let _ = reply.send(self.index_list(status, limit).await);
            }
        }
    }

    // =========================================================================
    // RPC surface
    // =========================================================================

    #[instrument(skip(self, payload), fields(workflow_id = %self.name, workflow_type = %workflow_type))]
    async fn initialize(
        &mut self,
        workflow_type: String,
        payload: Value,
    ) -> Result<(), EngineError> {
        if let Some(existing) = self.store.get_workflow().await? {
            if existing.workflow_type != workflow_type {
                return Err(EngineError::workflow_already_exists(
                    &self.name,
                    &existing.workflow_type,
                ));
            }
            debug!("workflow already initialized");
            return Ok(());
        }

        let now = self.engine.clock.now_ms();

        let Some(def) = self.engine.registry.get(&workflow_type) else {
            // Unknown type is persisted, not thrown: the instance durably
            // records why it can never run.
            let err = EngineError::workflow_type_unknown(&workflow_type);
            let row = WorkflowRow {
                id: self.name.clone(),
                workflow_type: workflow_type.clone(),
                status: WorkflowStatus::Errored,
                payload,
                result: None,
                error: Some(err.to_envelope()),
                paused: false,
                created_at: now,
                updated_at: now,
            };
            self.store.insert_workflow(&row).await?;
            warn!("initialized with unknown workflow type");
            self.flush_status(&workflow_type, WorkflowStatus::Errored, now);
            return Ok(());
        };

        def.validate_payload(&payload)?;

        let row = WorkflowRow {
            id: self.name.clone(),
            workflow_type,
            status: WorkflowStatus::Running,
            payload,
            result: None,
            error: None,
            paused: false,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_workflow(&row).await?;
        info!("workflow initialized");

        self.set_safety_alarm();
        self.replay(true).await;
        Ok(())
    }

    async fn get_status(&self) -> Result<WorkflowSnapshot, EngineError> {
        let workflow = self
            .store
            .get_workflow()
            .await?
            .ok_or_else(|| EngineError::workflow_not_found(&self.name))?;
        let steps = self.store.list_steps().await?;
        Ok(WorkflowSnapshot { workflow, steps })
    }

    #[instrument(skip(self, payload), fields(workflow_id = %self.name, event = %event))]
    async fn deliver_event(&mut self, event: String, payload: Value) -> Result<(), EngineError> {
        let workflow = self
            .store
            .get_workflow()
            .await?
            .ok_or_else(|| EngineError::workflow_not_found(&self.name))?;

        let def = self
            .engine
            .registry
            .get(&workflow.workflow_type)
            .ok_or_else(|| EngineError::workflow_type_unknown(&workflow.workflow_type))?;

        let schema = def.event_schema(&event).ok_or_else(|| {
            EngineError::event_invalid(format!(
                "workflow type {:?} declares no event {event:?}",
                workflow.workflow_type
            ))
        })?;
        schema
            .validate(&payload)
            .map_err(|e| EngineError::event_invalid(format!("event {event:?}: {e}")))?;

        let now = self.engine.clock.now_ms();
        let waiting = self
            .store
            .get_step(&event)
            .await?
            .filter(|s| s.status == StepStatus::Waiting);

        if let Some(mut step) = waiting {
            // A step is already waiting on this event: consume directly.
            step.status = StepStatus::Completed;
            step.result = Some(payload);
            step.error = None;
            step.wake_at = None;
            step.completed_at = Some(now);
            step.duration_ms = step.started_at.map(|s| now - s);
            self.store.upsert_step(&step).await?;
            debug!("event delivered to waiting step");

            self.set_safety_alarm();
            self.replay(false).await;
            Ok(())
        } else if workflow.status.is_terminal() {
            Err(EngineError::workflow_not_running(
                &self.name,
                workflow.status.as_str(),
            ))
        } else {
            // Buffer without waking the actor; the event is picked up when
            // the workflow reaches the matching wait_for_event.
            self.store.buffer_event(&event, &payload, now).await?;
            debug!("event buffered");
            Ok(())
        }
    }

    #[instrument(skip(self), fields(workflow_id = %self.name))]
    async fn pause(&mut self) -> Result<(), EngineError> {
        let workflow = self
            .store
            .get_workflow()
            .await?
            .ok_or_else(|| EngineError::workflow_not_found(&self.name))?;
        if workflow.status.is_terminal() {
            return Err(EngineError::workflow_not_running(
                &self.name,
                workflow.status.as_str(),
            ));
        }

        let now = self.engine.clock.now_ms();
        self.store
            .update_status(WorkflowStatus::Paused, Some(true), now)
            .await?;
        info!("workflow paused");
        self.flush_status(&workflow.workflow_type, WorkflowStatus::Paused, workflow.created_at);
        Ok(())
    }

    #[instrument(skip(self), fields(workflow_id = %self.name))]
    async fn resume(&mut self) -> Result<(), EngineError> {
        let workflow = self
            .store
            .get_workflow()
            .await?
            .ok_or_else(|| EngineError::workflow_not_found(&self.name))?;
        if workflow.status.is_terminal() {
            return Err(EngineError::workflow_not_running(
                &self.name,
                workflow.status.as_str(),
            ));
        }

        let now = self.engine.clock.now_ms();
        self.store
            .update_status(WorkflowStatus::Running, Some(false), now)
            .await?;
        info!("workflow resumed");

        self.set_safety_alarm();
        self.replay(false).await;
        Ok(())
    }

    #[instrument(skip(self), fields(workflow_id = %self.name))]
    async fn terminate(&mut self) -> Result<(), EngineError> {
        let workflow = self
            .store
            .get_workflow()
            .await?
            .ok_or_else(|| EngineError::workflow_not_found(&self.name))?;
        if workflow.status.is_terminal() {
            return Err(EngineError::workflow_not_running(
                &self.name,
                workflow.status.as_str(),
            ));
        }

        let now = self.engine.clock.now_ms();
        self.delete_alarm();
        self.store.clear_event_buffer().await?;
        self.store
            .finish_workflow(WorkflowStatus::Terminated, None, None, now)
            .await?;
        self.live.close(CLOSE_NORMAL);
        info!("workflow terminated");
        self.flush_status(
            &workflow.workflow_type,
            WorkflowStatus::Terminated,
            workflow.created_at,
        );
        Ok(())
    }

    async fn connect_live(&mut self) -> Result<mpsc::Receiver<LiveFrame>, EngineError> {
        let workflow = self
            .store
            .get_workflow()
            .await?
            .ok_or_else(|| EngineError::workflow_not_found(&self.name))?;
        let def = self
            .engine
            .registry
            .get(&workflow.workflow_type)
            .ok_or_else(|| EngineError::workflow_type_unknown(&workflow.workflow_type))?;

        if !def.has_updates() {
            // Accept the subscriber, then close with 1008.
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(LiveFrame::Close {
                code: CLOSE_NO_UPDATES,
            });
            return Ok(rx);
        }

        let live = self.live_context(&def);
        let rx = live.subscribe(self.engine.config.live_buffer).await?;

        if workflow.status.is_terminal() {
            let code = if workflow.status == WorkflowStatus::Errored {
                CLOSE_ERROR
            } else {
                CLOSE_NORMAL
            };
            live.close(code);
        }
        Ok(rx)
    }

    async fn index_write(&self, entry: IndexEntry) -> Result<(), EngineError> {
        self.store.index_upsert(&entry).await?;
        Ok(())
    }

    async fn index_list(
        &self,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, EngineError> {
        Ok(self.store.index_list(status, limit).await?)
    }

    // =========================================================================
    // Alarm handling
    // =========================================================================

    #[instrument(skip(self), fields(workflow_id = %self.name))]
    async fn handle_alarm(&mut self) {
        // The task behind this firing is done; drop the handle.
        self.alarm.take();
        if let Err(err) = self.alarm_inner().await {
            error!(%err, "alarm handling failed");
        }
    }

    async fn alarm_inner(&mut self) -> Result<(), EngineError> {
        let Some(workflow) = self.store.get_workflow().await? else {
            return Ok(());
        };
        if workflow.status.is_terminal() {
            // A safety alarm may fire after natural completion.
            debug!("alarm fired on terminal workflow");
            return Ok(());
        }

        let now = self.engine.clock.now_ms();

        // Promote steps whose wake time has passed.
        for mut step in self.store.list_steps().await? {
            if !step.wake_at.map(|w| w <= now).unwrap_or(false) {
                continue;
            }
            match step.status {
                StepStatus::Sleeping => {
                    step.status = StepStatus::Completed;
                    step.result = None;
                    step.wake_at = None;
                    step.completed_at = Some(now);
                    step.duration_ms = step.started_at.map(|s| now - s);
                    self.store.upsert_step(&step).await?;
                    debug!(step = %step.name, "sleep elapsed");
                }
                StepStatus::Waiting => {
                    let err = EngineError::event_timeout(&step.name);
                    step.status = StepStatus::Failed;
                    step.error = Some(err.to_envelope());
                    step.wake_at = None;
                    self.store.upsert_step(&step).await?;
                    debug!(step = %step.name, "wait timed out");
                }
                _ => {}
            }
        }

        // Delete the alarm, then schedule the next earliest pending wake.
        self.delete_alarm();
        let next = self
            .store
            .list_steps()
            .await?
            .into_iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Sleeping | StepStatus::Waiting | StepStatus::Failed
                )
            })
            .filter_map(|s| s.wake_at)
            .min();
        if let Some(wake_at) = next {
            self.set_alarm(wake_at);
        }

        self.store
            .update_status(WorkflowStatus::Running, None, now)
            .await?;
        self.replay(false).await;
        Ok(())
    }

    // =========================================================================
    // Replay
    // =========================================================================

    async fn replay(&mut self, just_started: bool) {
        if let Err(err) = self.replay_inner(just_started).await {
            error!(workflow_id = %self.name, %err, "replay failed");
        }
    }

    async fn replay_inner(&mut self, just_started: bool) -> Result<(), EngineError> {
        let Some(workflow) = self.store.get_workflow().await? else {
            return Ok(());
        };
        if workflow.status.is_terminal() {
            return Ok(());
        }

        let now = self.engine.clock.now_ms();
        let provider = self.engine.observer();

        let Some(def) = self.engine.registry.get(&workflow.workflow_type) else {
            let err = EngineError::workflow_type_unknown(&workflow.workflow_type);
            self.delete_alarm();
            self.store
                .finish_workflow(WorkflowStatus::Errored, None, Some(&err.to_envelope()), now)
                .await?;
            self.store.clear_event_buffer().await?;
            self.live.close(CLOSE_ERROR);
            self.flush_status(&workflow.workflow_type, WorkflowStatus::Errored, workflow.created_at);
            return Ok(());
        };

        let mut collector = provider.create_collector(&self.name, &workflow.workflow_type);
        if just_started {
            provider.on_workflow_start(&mut collector, &workflow.payload, workflow.created_at);
        }
        let collector = Arc::new(Mutex::new(collector));

        let live = self.live_context(&def);
        live.set_replay(true);

        if workflow.paused {
            self.store
                .update_status(WorkflowStatus::Paused, Some(true), now)
                .await?;
            self.flush(&provider, &collector, WorkflowStatus::Paused, &workflow);
            return Ok(());
        }

        let mut step = StepContext::new(
            self.store.clone(),
            self.engine.clock.clone(),
            def.retries().clone(),
            def.result_limit().clone(),
            self.event_schemas(&def),
            provider.clone(),
            collector.clone(),
            self.live.clone(),
            false,
        );

        debug!(workflow_id = %self.name, "replaying");
        let outcome = def.run(&mut step, workflow.payload.clone(), &live).await;
        let now = self.engine.clock.now_ms();

        match outcome {
            Ok(result) => {
                self.delete_alarm();
                self.store
                    .finish_workflow(WorkflowStatus::Completed, Some(&result), None, now)
                    .await?;
                self.store.clear_event_buffer().await?;
                live.close(CLOSE_NORMAL);
                info!(workflow_id = %self.name, "workflow completed");
                self.flush(&provider, &collector, WorkflowStatus::Completed, &workflow);
            }
            Err(RunError::Suspend(Interrupt::Sleep { step, wake_at })) => {
                self.set_alarm(wake_at);
                self.store
                    .update_status(WorkflowStatus::Sleeping, None, now)
                    .await?;
                debug!(workflow_id = %self.name, step = %step, wake_at, "workflow sleeping");
                self.flush(&provider, &collector, WorkflowStatus::Sleeping, &workflow);
            }
            Err(RunError::Suspend(Interrupt::Wait { step, timeout_at })) => {
                if let Some(wake_at) = timeout_at {
                    self.set_alarm(wake_at);
                }
                self.store
                    .update_status(WorkflowStatus::Waiting, None, now)
                    .await?;
                debug!(workflow_id = %self.name, step = %step, "workflow waiting for event");
                self.flush(&provider, &collector, WorkflowStatus::Waiting, &workflow);
            }
            Err(RunError::Suspend(Interrupt::Pause)) => {
                self.store
                    .update_status(WorkflowStatus::Paused, Some(true), now)
                    .await?;
                debug!(workflow_id = %self.name, "workflow paused mid-replay");
                self.flush(&provider, &collector, WorkflowStatus::Paused, &workflow);
            }
            Err(RunError::Fail(err)) => {
                self.delete_alarm();
                self.store
                    .finish_workflow(WorkflowStatus::Errored, None, Some(&err.to_envelope()), now)
                    .await?;
                self.store.clear_event_buffer().await?;
                live.close(CLOSE_ERROR);
                warn!(workflow_id = %self.name, %err, "workflow errored");
                self.flush(&provider, &collector, WorkflowStatus::Errored, &workflow);
            }
            Err(RunError::Other(err)) => {
                self.delete_alarm();
                // Arbitrary user errors persist their message as-is.
                self.store
                    .finish_workflow(WorkflowStatus::Errored, None, Some(&err.to_string()), now)
                    .await?;
                self.store.clear_event_buffer().await?;
                live.close(CLOSE_ERROR);
                warn!(workflow_id = %self.name, %err, "workflow errored");
                self.flush(&provider, &collector, WorkflowStatus::Errored, &workflow);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Alarm primitive
    // =========================================================================

    /// Set the actor's alarm, atomically replacing any previous one.
    fn set_alarm(&mut self, wake_at: i64) {
        self.delete_alarm();
        let delay = (wake_at - self.engine.clock.now_ms()).max(0) as u64;
        let tx = self.self_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(RunnerMsg::Alarm).await;
        });
        self.alarm = Some(task);
    }

    /// Insurance against a crash killing the actor before its real alarm is
    /// set: every mutating entry point wakes the actor within ~1s.
    fn set_safety_alarm(&mut self) {
        let wake_at =
            self.engine.clock.now_ms() + self.engine.config.safety_alarm.as_millis() as i64;
        self.set_alarm(wake_at);
    }

    fn delete_alarm(&mut self) {
        if let Some(task) = self.alarm.take() {
            task.abort();
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn live_context(&mut self, def: &Arc<dyn AnyDefinition>) -> LiveContext {
        let schemas = self
            .update_schemas
            .get_or_insert_with(|| Arc::new(def.update_schemas().clone()))
            .clone();
        LiveContext::new(
            self.live.clone(),
            self.store.clone(),
            schemas,
            self.engine.clock.clone(),
        )
    }

    fn event_schemas(&mut self, def: &Arc<dyn AnyDefinition>) -> Arc<HashMap<String, Schema>> {
        self.event_schemas
            .get_or_insert_with(|| Arc::new(def.event_schemas().clone()))
            .clone()
    }

    /// Flush a cycle's collector through the host's background-completion
    /// hook; provider failures never affect the workflow.
    fn flush(
        &self,
        provider: &Arc<dyn ObservabilityProvider>,
        collector: &Arc<Mutex<Collector>>,
        reason: WorkflowStatus,
        workflow: &WorkflowRow,
    ) {
        let mut snapshot = collector.lock().clone();
        provider.on_workflow_status_change(
            &mut snapshot,
            reason,
            Some(workflow.created_at),
            self.engine.clock.now_ms(),
        );
        spawn_flush(provider.clone(), snapshot, reason);
    }

    /// Flush for entry points that never built a full cycle collector.
    fn flush_status(&self, workflow_type: &str, reason: WorkflowStatus, created_at: i64) {
        let provider = self.engine.observer();
        let mut collector = provider.create_collector(&self.name, workflow_type);
        provider.on_workflow_status_change(
            &mut collector,
            reason,
            Some(created_at),
            self.engine.clock.now_ms(),
        );
        spawn_flush(provider, collector, reason);
    }
}

fn spawn_flush(
    provider: Arc<dyn ObservabilityProvider>,
    collector: Collector,
    reason: WorkflowStatus,
) {
    tokio::spawn(async move {
        if let Err(err) = provider.flush(collector, reason).await {
            warn!(%err, "observability flush failed");
        }
    });
}
