//! Orchestration dispatcher implementation for Runtime
//!
//! This module contains the orchestration dispatcher logic that:
//! - Spawns concurrent orchestration workers
//! - Leases orchestrator triggers from the queue
//! - Replays the instance and commits new events, messages and status atomically
//! - Renews leases during long-running turns

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{backoff, spawn_lease_renewal_task};
use crate::error::Error;
use crate::providers::{
    ExecutionMetadata, InstanceStatus, LeasedItem, Provider, ProviderError, QueueKind, WorkItem,
};
use crate::runtime::replay::replay;
use crate::runtime::{HistoryManager, OrchestrationRegistry, Runtime, RuntimeOptions};
use crate::{Action, Event, TaskId, TurnStatus};

/// What a scheduler pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// No such instance; the trigger is dropped.
    Dropped,
    /// History already ended; nothing to do.
    AlreadyTerminal(InstanceStatus),
    /// Replay produced nothing new (still waiting on scheduled activities).
    Idle,
    /// New events were committed.
    Committed {
        status: InstanceStatus,
        scheduled: Vec<TaskId>,
    },
}

struct TurnPlan {
    events: Vec<Event>,
    work_items: Vec<WorkItem>,
    metadata: ExecutionMetadata,
    scheduled: Vec<TaskId>,
}

/// Runs replay turns for instances and persists their decisions.
pub struct OrchestrationScheduler {
    store: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl OrchestrationScheduler {
    pub fn new(store: Arc<dyn Provider>, orchestrations: OrchestrationRegistry, options: RuntimeOptions) -> Self {
        Self {
            store,
            orchestrations,
            options,
        }
    }

    /// Advance `instance` by one turn.
    ///
    /// Reads the history, replays the orchestration and commits the new
    /// `ActivityScheduled` events with their activity messages (or the terminal
    /// event) against the history length that was read. A lost race re-reads
    /// and replays, so a message delivered twice never schedules a task twice.
    ///
    /// # Errors
    ///
    /// Returns a provider error if the store fails or the retry budget is spent.
    pub async fn on_message(&self, instance: &str) -> Result<SchedulerOutcome, Error> {
        for attempt in 0..=self.options.max_commit_retries {
            let history = self.store.read(instance).await?;
            let view = HistoryManager::from_history(&history);
            if view.is_empty() {
                warn!(target: "durafan::runtime", instance_id = %instance, "trigger for unknown instance; dropping");
                return Ok(SchedulerOutcome::Dropped);
            }
            if let Some(status) = view.terminal_status() {
                debug!(target: "durafan::runtime", instance_id = %instance, %status, "instance already terminal");
                return Ok(SchedulerOutcome::AlreadyTerminal(status));
            }

            let plan = self.plan_turn(instance, &view, &history);
            if plan.events.is_empty() {
                return Ok(SchedulerOutcome::Idle);
            }
            let status = plan.metadata.status.unwrap_or(InstanceStatus::Running);

            match self
                .store
                .commit(instance, view.next_seq(), plan.events, plan.work_items, plan.metadata)
                .await
            {
                Ok(_) => {
                    debug!(
                        target: "durafan::runtime",
                        instance_id = %instance,
                        %status,
                        scheduled = ?plan.scheduled,
                        "orchestration turn committed"
                    );
                    return Ok(SchedulerOutcome::Committed {
                        status,
                        scheduled: plan.scheduled,
                    });
                }
                Err(e) if e.is_conflict() || e.is_retryable() => {
                    debug!(
                        target: "durafan::runtime",
                        instance_id = %instance,
                        attempt,
                        error = %e,
                        "commit lost a race; replaying against fresh history"
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProviderError::conflict(
            "on_message",
            format!(
                "instance {instance}: gave up after {} conflicting commits",
                self.options.max_commit_retries + 1
            ),
        )
        .into())
    }

    fn plan_turn(&self, instance: &str, view: &HistoryManager, history: &[Event]) -> TurnPlan {
        let name = view.orchestration_name.clone().unwrap_or_default();
        let Some(handler) = self.orchestrations.get(&name) else {
            warn!(target: "durafan::runtime", instance_id = %instance, orchestration = %name, "unregistered orchestration");
            return Self::finish(InstanceStatus::Failed, Error::InvalidOrchestration(name).to_string());
        };

        let turn = replay(instance, handler, history);
        match turn.status {
            TurnStatus::Running => {
                let mut plan = TurnPlan {
                    events: Vec::with_capacity(turn.actions.len()),
                    work_items: Vec::with_capacity(turn.actions.len()),
                    metadata: ExecutionMetadata::status(InstanceStatus::Running),
                    scheduled: Vec::with_capacity(turn.actions.len()),
                };
                for Action::ScheduleActivity { task_id, name, input } in turn.actions {
                    plan.events.push(Event::ActivityScheduled {
                        task_id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    plan.work_items.push(WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        task_id,
                        name,
                        input,
                    });
                    plan.scheduled.push(task_id);
                }
                plan
            }
            TurnStatus::Completed(output) => Self::finish(InstanceStatus::Completed, output),
            TurnStatus::Failed(error) => {
                warn!(target: "durafan::runtime", instance_id = %instance, %error, "orchestration failed");
                Self::finish(InstanceStatus::Failed, error)
            }
        }
    }

    fn finish(status: InstanceStatus, output: String) -> TurnPlan {
        let event = match status {
            InstanceStatus::Completed => Event::OrchestratorCompleted { output: output.clone() },
            _ => Event::OrchestratorFailed { error: output.clone() },
        };
        TurnPlan {
            events: vec![event],
            work_items: Vec::new(),
            metadata: ExecutionMetadata::finished(status, output),
            scheduled: Vec::new(),
        }
    }
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        let mut worker_handles = Vec::with_capacity(concurrency);

        for worker_idx in 0..concurrency {
            let rt = self.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("orch-{}-{}", worker_idx, rt.runtime_id);
            let handle = tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match rt.store.dequeue(QueueKind::Orchestrator, rt.options.orchestrator_lease).await {
                        Ok(Some(leased)) => rt.process_orchestrator_message(leased, &worker_id).await,
                        Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                        Err(e) => {
                            warn!(target: "durafan::runtime", worker_id = %worker_id, error = %e, "orchestrator dequeue failed");
                            tokio::time::sleep(rt.options.dispatcher_idle_sleep).await;
                        }
                    }
                }
            });
            worker_handles.push(handle);
        }

        worker_handles
    }

    async fn process_orchestrator_message(&self, leased: LeasedItem, worker_id: &str) {
        let token = leased.lock_token.clone();
        let instance = match &leased.item {
            WorkItem::OrchestratorTrigger { instance } => instance.clone(),
            other => {
                tracing::error!(target: "durafan::runtime", item = ?other, "unexpected item on orchestrator queue; discarding");
                let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
        };

        let renewal = spawn_lease_renewal_task(
            self.store.clone(),
            QueueKind::Orchestrator,
            token.clone(),
            self.options.orchestrator_lease,
            self.options.lease_renewal_buffer,
            self.shutdown_flag.clone(),
        );
        let result = self.scheduler.on_message(&instance).await;
        renewal.abort();

        match result {
            Ok(outcome) => {
                tracing::trace!(target: "durafan::runtime", instance_id = %instance, worker_id = %worker_id, ?outcome, "scheduler pass");
                if let Err(e) = self.store.ack(QueueKind::Orchestrator, &token).await {
                    warn!(target: "durafan::runtime", instance_id = %instance, worker_id = %worker_id, error = %e, "orchestrator ack failed");
                }
            }
            Err(e) => {
                warn!(
                    target: "durafan::runtime",
                    instance_id = %instance,
                    worker_id = %worker_id,
                    attempt = leased.attempt_count,
                    error = %e,
                    "scheduler pass failed; abandoning trigger"
                );
                let delay = backoff(leased.attempt_count);
                if let Err(e) = self.store.abandon(QueueKind::Orchestrator, &token, Some(delay)).await {
                    warn!(target: "durafan::runtime", instance_id = %instance, error = %e, "orchestrator abandon failed");
                }
            }
        }
    }
}
