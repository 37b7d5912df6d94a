//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Leases activity messages and executes the registered handlers
//! - Records each result exactly once and re-triggers the orchestration

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{backoff, spawn_lease_renewal_task};
use crate::error::Error;
use crate::providers::{ExecutionMetadata, LeasedItem, Provider, ProviderError, QueueKind, WorkItem};
use crate::runtime::{ActivityContext, ActivityRegistry, HistoryManager, Runtime, RuntimeOptions};
use crate::{Event, TaskId};

/// What the dispatcher did with one activity message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// `ActivityCompleted` was recorded.
    Completed,
    /// `ActivityFailed` was recorded.
    Failed,
    /// A completion for this task already exists; nothing was written.
    Duplicate,
    /// Instance is terminal or unknown, or the task was never scheduled; the
    /// message was discarded.
    Ignored,
    /// The invocation exceeded the activity timeout; the lease is left to lapse.
    TimedOut,
}

/// Executes activity messages and appends their completions.
pub struct ActivityDispatcher {
    store: Arc<dyn Provider>,
    activities: Arc<ActivityRegistry>,
    options: RuntimeOptions,
}

impl ActivityDispatcher {
    pub fn new(store: Arc<dyn Provider>, activities: Arc<ActivityRegistry>, options: RuntimeOptions) -> Self {
        Self {
            store,
            activities,
            options,
        }
    }

    /// Execute one delivery of an activity message.
    ///
    /// `attempt` is the delivery count reported by the queue. Deliveries past
    /// `max_activity_attempts` are recorded as failures without running the
    /// handler.
    ///
    /// # Errors
    ///
    /// Returns a provider error when history cannot be read or written.
    pub async fn on_message(&self, item: &WorkItem, attempt: u32) -> Result<ActivityOutcome, Error> {
        let WorkItem::ActivityExecute {
            instance,
            task_id,
            name,
            input,
        } = item
        else {
            tracing::error!(target: "durafan::runtime", ?item, "unexpected item on worker queue; discarding");
            return Ok(ActivityOutcome::Ignored);
        };
        let task_id = *task_id;

        let history = self.store.read(instance).await?;
        let view = HistoryManager::from_history(&history);
        if view.is_empty() || view.is_terminal() {
            debug!(target: "durafan::runtime", instance_id = %instance, task_id, "instance gone or terminal; skipping activity");
            return Ok(ActivityOutcome::Ignored);
        }
        if view.is_completed(task_id) {
            debug!(target: "durafan::runtime", instance_id = %instance, task_id, "activity already completed; skipping");
            return Ok(ActivityOutcome::Duplicate);
        }
        if !view.is_scheduled(task_id) {
            warn!(target: "durafan::runtime", instance_id = %instance, task_id, activity_name = %name, "activity message for a task the history never scheduled; discarding");
            return Ok(ActivityOutcome::Ignored);
        }

        if attempt > self.options.max_activity_attempts {
            warn!(
                target: "durafan::runtime",
                instance_id = %instance,
                activity_name = %name,
                task_id,
                attempt,
                "activity exceeded max attempts"
            );
            let error = format!(
                "activity exceeded max attempts ({})",
                self.options.max_activity_attempts
            );
            return self.record_result(instance, task_id, Err(error)).await;
        }

        let Some(handler) = self.activities.get(name) else {
            tracing::error!(
                target: "durafan::runtime",
                instance_id = %instance,
                activity_name = %name,
                task_id,
                outcome = "system_error",
                error_type = "unregistered",
                "Activity failed (unregistered)"
            );
            return self
                .record_result(instance, task_id, Err(Error::ActivityNotFound(name.clone()).to_string()))
                .await;
        };

        debug!(
            target: "durafan::runtime",
            instance_id = %instance,
            activity_name = %name,
            task_id,
            attempt,
            "Activity started"
        );
        let start_time = Instant::now();
        let ctx = ActivityContext::new(instance.clone(), task_id, name.clone(), attempt);
        let invocation = AssertUnwindSafe(handler.invoke(ctx, input.clone())).catch_unwind();

        let caught = match self.options.activity_timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(caught) => caught,
                Err(_) => {
                    warn!(
                        target: "durafan::runtime",
                        instance_id = %instance,
                        activity_name = %name,
                        task_id,
                        attempt,
                        timeout_ms = %limit.as_millis(),
                        "Activity timed out; leaving message for redelivery"
                    );
                    return Ok(ActivityOutcome::TimedOut);
                }
            },
            None => invocation.await,
        };
        let result = caught.unwrap_or_else(|payload| Err(format!("activity panicked: {}", crate::panic_message(&*payload))));

        let duration_ms = start_time.elapsed().as_millis() as u64;
        match &result {
            Ok(output) => debug!(
                target: "durafan::runtime",
                instance_id = %instance,
                activity_name = %name,
                task_id,
                outcome = "success",
                duration_ms,
                result_size = output.len(),
                "Activity completed"
            ),
            Err(error) => warn!(
                target: "durafan::runtime",
                instance_id = %instance,
                activity_name = %name,
                task_id,
                outcome = "app_error",
                duration_ms,
                error = %error,
                "Activity failed (application error)"
            ),
        }
        self.record_result(instance, task_id, result).await
    }

    /// Append the completion for `task_id` and enqueue an orchestrator trigger,
    /// in one commit. Duplicate and late results are discarded.
    async fn record_result(
        &self,
        instance: &str,
        task_id: TaskId,
        result: Result<String, String>,
    ) -> Result<ActivityOutcome, Error> {
        for attempt in 0..=self.options.max_commit_retries {
            let history = self.store.read(instance).await?;
            let view = HistoryManager::from_history(&history);
            if view.is_empty() || view.is_terminal() {
                debug!(target: "durafan::runtime", instance_id = %instance, task_id, "instance terminal; discarding activity result");
                return Ok(ActivityOutcome::Ignored);
            }
            if view.is_completed(task_id) {
                return Ok(ActivityOutcome::Duplicate);
            }

            let (event, outcome) = match &result {
                Ok(output) => (
                    Event::ActivityCompleted {
                        task_id,
                        result: output.clone(),
                    },
                    ActivityOutcome::Completed,
                ),
                Err(error) => (
                    Event::ActivityFailed {
                        task_id,
                        error: error.clone(),
                    },
                    ActivityOutcome::Failed,
                ),
            };
            let trigger = WorkItem::OrchestratorTrigger {
                instance: instance.to_string(),
            };
            match self
                .store
                .commit(
                    instance,
                    view.next_seq(),
                    vec![event],
                    vec![trigger],
                    ExecutionMetadata::default(),
                )
                .await
            {
                Ok(_) => return Ok(outcome),
                Err(e) if e.is_conflict() || e.is_retryable() => {
                    debug!(
                        target: "durafan::runtime",
                        instance_id = %instance,
                        task_id,
                        attempt,
                        error = %e,
                        "completion append lost a race; re-reading history"
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProviderError::conflict(
            "record_result",
            format!(
                "instance {instance}: gave up recording task {task_id} after {} conflicts",
                self.options.max_commit_retries + 1
            ),
        )
        .into())
    }
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.options.worker_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        let mut worker_handles = Vec::with_capacity(concurrency);

        for worker_idx in 0..concurrency {
            let rt = self.clone();
            let shutdown = shutdown.clone();
            // Generate unique worker ID: work-{index}-{runtime_id}
            let worker_id = format!("work-{}-{}", worker_idx, rt.runtime_id);
            let handle = tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match rt.store.dequeue(QueueKind::Worker, rt.options.activity_lease).await {
                        Ok(Some(leased)) => rt.process_work_message(leased, &worker_id).await,
                        Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                        Err(e) => {
                            warn!(target: "durafan::runtime", worker_id = %worker_id, error = %e, "worker dequeue failed");
                            tokio::time::sleep(rt.options.dispatcher_idle_sleep).await;
                        }
                    }
                }
            });
            worker_handles.push(handle);
        }

        worker_handles
    }

    async fn process_work_message(&self, leased: LeasedItem, worker_id: &str) {
        let token = leased.lock_token.clone();
        let renewal = spawn_lease_renewal_task(
            self.store.clone(),
            QueueKind::Worker,
            token.clone(),
            self.options.activity_lease,
            self.options.lease_renewal_buffer,
            self.shutdown_flag.clone(),
        );
        let result = self
            .activity_dispatcher
            .on_message(&leased.item, leased.attempt_count)
            .await;
        renewal.abort();

        let instance = leased.item.instance();
        match result {
            Ok(ActivityOutcome::TimedOut) => {}
            Ok(outcome) => {
                tracing::trace!(target: "durafan::runtime", instance_id = %instance, worker_id = %worker_id, ?outcome, "activity message handled");
                if let Err(e) = self.store.ack(QueueKind::Worker, &token).await {
                    warn!(target: "durafan::runtime", instance_id = %instance, worker_id = %worker_id, error = %e, "worker ack failed");
                }
            }
            Err(e) => {
                warn!(
                    target: "durafan::runtime",
                    instance_id = %instance,
                    worker_id = %worker_id,
                    attempt = leased.attempt_count,
                    error = %e,
                    "activity message failed; abandoning for redelivery"
                );
                let delay = backoff(leased.attempt_count);
                if let Err(e) = self.store.abandon(QueueKind::Worker, &token, Some(delay)).await {
                    warn!(target: "durafan::runtime", instance_id = %instance, error = %e, "worker abandon failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::providers::in_memory::InMemoryProvider;
    use crate::providers::{HistoryStore, InstanceRecord};

    fn execute(task_id: TaskId, name: &str) -> WorkItem {
        WorkItem::ActivityExecute {
            instance: "i".to_string(),
            task_id,
            name: name.to_string(),
            input: "x".to_string(),
        }
    }

    async fn seeded_with_task(name: &str) -> Arc<InMemoryProvider> {
        let store = Arc::new(InMemoryProvider::new());
        store
            .start_instance(
                InstanceRecord::new("i", "O", ""),
                vec![
                    Event::OrchestratorStarted {
                        name: "O".to_string(),
                        input: String::new(),
                    },
                    Event::ActivityScheduled {
                        task_id: 0,
                        name: name.to_string(),
                        input: "x".to_string(),
                    },
                ],
                vec![],
            )
            .await
            .unwrap();
        store
    }

    fn echo_registry() -> Arc<ActivityRegistry> {
        Arc::new(
            ActivityRegistry::builder()
                .register("Echo", |ctx: ActivityContext, input: String| async move {
                    Ok(format!("{input}@{}", ctx.attempt()))
                })
                .register("Slow", |_ctx, _input| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(String::new())
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn test_result_recorded_once() {
        let store = seeded_with_task("Echo").await;
        let dispatcher = ActivityDispatcher::new(store.clone(), echo_registry(), RuntimeOptions::default());
        assert_eq!(dispatcher.on_message(&execute(0, "Echo"), 1).await.unwrap(), ActivityOutcome::Completed);
        assert_eq!(dispatcher.on_message(&execute(0, "Echo"), 2).await.unwrap(), ActivityOutcome::Duplicate);

        let history = store.read("i").await.unwrap();
        assert_eq!(
            history.last(),
            Some(&Event::ActivityCompleted {
                task_id: 0,
                result: "x@1".to_string()
            })
        );
        assert_eq!(store.queue_depth(QueueKind::Orchestrator).await, 1);
    }

    #[tokio::test]
    async fn test_unregistered_activity_records_failure() {
        let store = seeded_with_task("Nope").await;
        let dispatcher = ActivityDispatcher::new(store.clone(), echo_registry(), RuntimeOptions::default());
        assert_eq!(dispatcher.on_message(&execute(0, "Nope"), 1).await.unwrap(), ActivityOutcome::Failed);
        let history = store.read("i").await.unwrap();
        assert_eq!(
            history.last(),
            Some(&Event::ActivityFailed {
                task_id: 0,
                error: "unregistered activity: Nope".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_poison_message_is_failed_without_running() {
        let store = seeded_with_task("Echo").await;
        let options = RuntimeOptions {
            max_activity_attempts: 3,
            ..Default::default()
        };
        let dispatcher = ActivityDispatcher::new(store.clone(), echo_registry(), options);
        assert_eq!(dispatcher.on_message(&execute(0, "Echo"), 4).await.unwrap(), ActivityOutcome::Failed);
        let history = store.read("i").await.unwrap();
        assert!(matches!(history.last(), Some(Event::ActivityFailed { error, .. }) if error.contains("max attempts")));
    }

    #[tokio::test]
    async fn test_timeout_writes_nothing() {
        let store = seeded_with_task("Slow").await;
        let options = RuntimeOptions {
            activity_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let dispatcher = ActivityDispatcher::new(store.clone(), echo_registry(), options);
        assert_eq!(dispatcher.on_message(&execute(0, "Slow"), 1).await.unwrap(), ActivityOutcome::TimedOut);
        assert_eq!(store.read("i").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_result_for_terminated_instance_is_ignored() {
        let store = seeded_with_task("Echo").await;
        store
            .append(
                "i",
                2,
                vec![Event::OrchestratorTerminated {
                    reason: "stop".to_string(),
                }],
            )
            .await
            .unwrap();
        let dispatcher = ActivityDispatcher::new(store.clone(), echo_registry(), RuntimeOptions::default());
        assert_eq!(dispatcher.on_message(&execute(0, "Echo"), 1).await.unwrap(), ActivityOutcome::Ignored);
        assert_eq!(store.read("i").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unscheduled_task_is_ignored() {
        let store = seeded_with_task("Echo").await;
        let dispatcher = ActivityDispatcher::new(store.clone(), echo_registry(), RuntimeOptions::default());
        assert_eq!(dispatcher.on_message(&execute(7, "Echo"), 1).await.unwrap(), ActivityOutcome::Ignored);
        assert_eq!(store.read("i").await.unwrap().len(), 2);
        assert_eq!(store.queue_depth(QueueKind::Orchestrator).await, 0);
    }
}
