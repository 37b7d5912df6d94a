//! Durable storage for histories, instance status and work queues.
//!
//! A provider is two things behind one object: an append-only [`HistoryStore`]
//! with optimistic concurrency, and a peek-lock [`WorkQueue`] with two queues
//! (orchestrator triggers and activity executions). [`Provider::commit`] ties
//! them together so history growth, outgoing messages and the status
//! projection become visible atomically.
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Event, TaskId};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::{ProviderError, ProviderErrorKind};

/// Lifecycle status of an orchestration instance.
///
/// Transitions only move forward: `Pending -> Running -> {Completed, Failed, Terminated}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "Terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status projection of one instance, as returned by the client status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub orchestration: String,
    pub input: String,
    pub status: InstanceStatus,
    /// Output when Completed, error when Failed, reason when Terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(instance_id: impl Into<String>, orchestration: impl Into<String>, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            orchestration: orchestration.into(),
            input: input.into(),
            status: InstanceStatus::Pending,
            output: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status update. Terminal records never change again.
    pub(crate) fn apply(&mut self, metadata: &ExecutionMetadata) -> bool {
        let Some(status) = metadata.status else {
            return false;
        };
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if metadata.output.is_some() {
            self.output = metadata.output.clone();
        }
        self.updated_at = Utc::now();
        true
    }
}

/// Messages carried by the work queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkItem {
    /// Run a scheduler turn for the instance.
    OrchestratorTrigger { instance: String },
    /// Execute activity call `task_id` of the instance.
    ActivityExecute {
        instance: String,
        task_id: TaskId,
        name: String,
        input: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::OrchestratorTrigger { instance } | WorkItem::ActivityExecute { instance, .. } => instance,
        }
    }

    /// Queue the item belongs to.
    pub fn queue(&self) -> QueueKind {
        match self {
            WorkItem::OrchestratorTrigger { .. } => QueueKind::Orchestrator,
            WorkItem::ActivityExecute { .. } => QueueKind::Worker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Orchestrator => "orchestrator",
            QueueKind::Worker => "worker",
        }
    }
}

/// A dequeued message together with its lease.
#[derive(Debug, Clone)]
pub struct LeasedItem {
    pub item: WorkItem,
    pub lock_token: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt_count: u32,
}

/// Status-projection update committed alongside history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub status: Option<InstanceStatus>,
    pub output: Option<String>,
}

impl ExecutionMetadata {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            output: None,
        }
    }

    pub fn finished(status: InstanceStatus, output: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            output: Some(output.into()),
        }
    }
}

/// Append-only per-instance event log.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full ordered history; empty when the instance does not exist.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Append `events` if the history still has exactly `expected_seq` events.
    /// Returns the new length. A stale `expected_seq` fails with a conflict.
    async fn append(&self, instance: &str, expected_seq: u64, events: Vec<Event>) -> Result<u64, ProviderError>;

    /// Register a new instance with its first events.
    async fn create_instance(&self, record: InstanceRecord, initial: Vec<Event>) -> Result<(), ProviderError>;

    async fn instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;
}

/// Peek-lock message queues with leases and redelivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue on the queue matching [`WorkItem::queue`].
    async fn enqueue(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lease the oldest visible message. Expired leases are redelivered with a
    /// higher attempt count.
    async fn dequeue(&self, kind: QueueKind, lease: Duration) -> Result<Option<LeasedItem>, ProviderError>;

    /// Delete a leased message.
    async fn ack(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError>;

    /// Release a lease, optionally hiding the message for `delay`.
    async fn abandon(&self, kind: QueueKind, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    /// Extend a held lease to `extend_for` from now.
    async fn renew_lease(&self, kind: QueueKind, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;
}

/// Combined store used by the runtime and the client.
#[async_trait]
pub trait Provider: HistoryStore + WorkQueue {
    /// Atomically create the instance and enqueue its first messages.
    async fn start_instance(
        &self,
        record: InstanceRecord,
        initial: Vec<Event>,
        work_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Atomically append `events` (optimistic on `expected_seq`), enqueue
    /// `work_items` and apply `metadata`. Nothing is visible on failure.
    async fn commit(
        &self,
        instance: &str,
        expected_seq: u64,
        events: Vec<Event>,
        work_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<u64, ProviderError>;
}

/// Validate an append against the existing history.
///
/// Enforces the sequence check, the single-start rule, at most one completion
/// per scheduled task and no events after a terminal event.
pub(crate) fn check_append(
    operation: &str,
    instance: &str,
    existing: &[Event],
    expected_seq: u64,
    new_events: &[Event],
) -> Result<(), ProviderError> {
    if existing.len() as u64 != expected_seq {
        return Err(ProviderError::conflict(
            operation,
            format!(
                "instance {instance}: expected sequence {expected_seq}, history has {}",
                existing.len()
            ),
        ));
    }

    let mut scheduled: BTreeSet<TaskId> = BTreeSet::new();
    let mut completed: BTreeSet<TaskId> = BTreeSet::new();
    let mut terminal = false;
    let mut started = !existing.is_empty();

    for event in existing {
        match event {
            Event::ActivityScheduled { task_id, .. } => {
                scheduled.insert(*task_id);
            }
            e if e.is_completion() => {
                if let Some(id) = e.task_id() {
                    completed.insert(id);
                }
            }
            e if e.is_terminal() => terminal = true,
            _ => {}
        }
    }

    for event in new_events {
        if terminal {
            return Err(ProviderError::permanent(
                operation,
                format!("instance {instance} is terminal; refusing {}", event.kind_name()),
            ));
        }
        match event {
            Event::OrchestratorStarted { .. } => {
                if started {
                    return Err(ProviderError::permanent(
                        operation,
                        format!("instance {instance} already started"),
                    ));
                }
            }
            Event::ActivityScheduled { task_id, .. } => {
                if !scheduled.insert(*task_id) {
                    return Err(ProviderError::permanent(
                        operation,
                        format!("instance {instance}: task {task_id} already scheduled"),
                    ));
                }
            }
            Event::ActivityCompleted { task_id, .. } | Event::ActivityFailed { task_id, .. } => {
                if !scheduled.contains(task_id) {
                    return Err(ProviderError::permanent(
                        operation,
                        format!("instance {instance}: completion for unscheduled task {task_id}"),
                    ));
                }
                if !completed.insert(*task_id) {
                    return Err(ProviderError::permanent(
                        operation,
                        format!("instance {instance}: task {task_id} already completed"),
                    ));
                }
            }
            _ => terminal = true,
        }
        if !started && !matches!(event, Event::OrchestratorStarted { .. }) {
            return Err(ProviderError::permanent(
                operation,
                format!("instance {instance}: history must begin with OrchestratorStarted"),
            ));
        }
        started = true;
    }
    Ok(())
}
