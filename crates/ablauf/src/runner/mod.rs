//! Per-instance workflow actor
//!
//! Every workflow instance (and every index shard) is one actor: a spawned
//! task consuming a mailbox. The host serializes all invocations on an actor
//! by construction, so `replay()` never overlaps with itself or with any
//! other RPC for the same instance.

mod actor;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub(crate) use actor::spawn;

use crate::error::EngineError;
use crate::live::LiveFrame;
use crate::persistence::{IndexEntry, StepRow, WorkflowRow, WorkflowStatus};

/// Full state snapshot of an instance: the workflow row plus all step rows,
/// with decoded results and parsed retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow: WorkflowRow,
    pub steps: Vec<StepRow>,
}

impl WorkflowSnapshot {
    pub fn status(&self) -> WorkflowStatus {
        self.workflow.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.workflow.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.workflow.error.as_deref()
    }

    pub fn step(&self, name: &str) -> Option<&StepRow> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Mailbox messages of a runner actor.
pub(crate) enum RunnerMsg {
    Initialize {
        workflow_type: String,
        payload: Value,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    GetStatus {
        reply: oneshot::Sender<Result<WorkflowSnapshot, EngineError>>,
    },
    DeliverEvent {
        event: String,
        payload: Value,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Terminate {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ConnectLive {
        reply: oneshot::Sender<Result<mpsc::Receiver<LiveFrame>, EngineError>>,
    },
    /// The host alarm fired.
    Alarm,
    IndexWrite {
        entry: IndexEntry,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    IndexList {
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
        reply: oneshot::Sender<Result<Vec<IndexEntry>, EngineError>>,
    },
}

/// Cloneable handle to a runner actor's mailbox.
#[derive(Clone)]
pub(crate) struct RunnerHandle {
    name: String,
    tx: mpsc::Sender<RunnerMsg>,
}

impl RunnerHandle {
    pub(crate) fn new(name: String, tx: mpsc::Sender<RunnerMsg>) -> Self {
        Self { name, tx }
    }

    async fn request<T, F>(&self, make: F) -> Result<T, EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<T, EngineError>>) -> RunnerMsg,
    {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| {
            EngineError::internal(format!("actor {:?} is unavailable", self.name))
        })?;
        rx.await.map_err(|_| {
            EngineError::internal(format!("actor {:?} dropped the request", self.name))
        })?
    }

    pub(crate) async fn initialize(
        &self,
        workflow_type: String,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.request(|reply| RunnerMsg::Initialize {
            workflow_type,
            payload,
            reply,
        })
        .await
    }

    pub(crate) async fn get_status(&self) -> Result<WorkflowSnapshot, EngineError> {
        self.request(|reply| RunnerMsg::GetStatus { reply }).await
    }

    pub(crate) async fn deliver_event(
        &self,
        event: String,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.request(|reply| RunnerMsg::DeliverEvent {
            event,
            payload,
            reply,
        })
        .await
    }

    pub(crate) async fn pause(&self) -> Result<(), EngineError> {
        self.request(|reply| RunnerMsg::Pause { reply }).await
    }

    pub(crate) async fn resume(&self) -> Result<(), EngineError> {
        self.request(|reply| RunnerMsg::Resume { reply }).await
    }

    pub(crate) async fn terminate(&self) -> Result<(), EngineError> {
        self.request(|reply| RunnerMsg::Terminate { reply }).await
    }

    pub(crate) async fn connect_live(&self) -> Result<mpsc::Receiver<LiveFrame>, EngineError> {
        self.request(|reply| RunnerMsg::ConnectLive { reply }).await
    }

    pub(crate) async fn index_write(&self, entry: IndexEntry) -> Result<(), EngineError> {
        self.request(|reply| RunnerMsg::IndexWrite { entry, reply })
            .await
    }

    pub(crate) async fn index_list(
        &self,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, EngineError> {
        self.request(|reply| RunnerMsg::IndexList {
            status,
            limit,
            reply,
        })
        .await
    }
}
