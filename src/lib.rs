//! Replay-driven durable orchestration engine.
//!
//! Orchestrations are ordinary `async` functions that call activities through an
//! [`OrchestrationContext`]. Every activity call is recorded in an append-only
//! history of [`Event`]s; on each turn the orchestration is re-executed from the
//! top and already-recorded results are handed back synchronously, so progress
//! survives restarts and activities can fan out in parallel while results are
//! joined in call order.
//!
//! - Data model: [`Event`], [`Action`], [`TaskId`]
//! - Replay driver: [`run_turn`] (wrapped by [`runtime::replay::replay`])
//! - Fan-out/fan-in: [`OrchestrationContext::schedule_activity`] and
//!   [`OrchestrationContext::join`]
//! - Hosting: [`Runtime`] (dispatchers), [`Client`] (start/status/terminate)
//! - Storage: [`providers::in_memory::InMemoryProvider`],
//!   [`providers::sqlite::SqliteProvider`]
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod samples;

pub use client::Client;
pub use error::Error;
pub use crate::futures::{ActivityFuture, JoinFuture};
pub use providers::{InstanceRecord, InstanceStatus};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{ActivityContext, ActivityHandler, OrchestrationHandler, Runtime, RuntimeOptions};

/// Deterministic sequence number of an activity call within one instance.
/// The Nth activity call made by orchestration code receives `TaskId = N`.
pub type TaskId = u64;

// Payload codec for typed helpers. Plain JSON strings travel raw so string
// payloads stay human readable in history.
pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub struct Json;

    impl Json {
        pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

/// Append-only history entries. The ordered sequence of events is the sole
/// source of truth for replay; an event's sequence number is its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    /// Instance created for the named orchestration with its input.
    OrchestratorStarted { name: String, input: String },
    /// Activity call number `task_id` was scheduled.
    ActivityScheduled { task_id: TaskId, name: String, input: String },
    /// Activity call `task_id` returned a result.
    ActivityCompleted { task_id: TaskId, result: String },
    /// Activity call `task_id` returned an error.
    ActivityFailed { task_id: TaskId, error: String },
    /// Orchestration returned its output.
    OrchestratorCompleted { output: String },
    /// Orchestration faulted or returned an error.
    OrchestratorFailed { error: String },
    /// Terminated through the client; later results are ignored.
    OrchestratorTerminated { reason: String },
}

impl Event {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::ActivityScheduled { task_id, .. }
            | Event::ActivityCompleted { task_id, .. }
            | Event::ActivityFailed { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// Completion-like events: at most one per task id.
    pub fn is_completion(&self) -> bool {
        matches!(self, Event::ActivityCompleted { .. } | Event::ActivityFailed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. } | Event::OrchestratorTerminated { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::OrchestratorStarted { .. } => "OrchestratorStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            Event::OrchestratorFailed { .. } => "OrchestratorFailed",
            Event::OrchestratorTerminated { .. } => "OrchestratorTerminated",
        }
    }
}

/// Decisions produced by a replay turn. The scheduler materializes them into
/// history events and activity messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ScheduleActivity { task_id: TaskId, name: String, input: String },
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    /// Calls recorded in history: task id -> (name, input).
    scheduled: BTreeMap<TaskId, (String, String)>,
    /// Recorded (or locally resolved) results by task id.
    results: BTreeMap<TaskId, Result<String, String>>,
    consumed: BTreeSet<TaskId>,
    next_task_id: TaskId,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance: &str, history: &[Event]) -> Self {
        let mut scheduled = BTreeMap::new();
        let mut results = BTreeMap::new();
        for event in history {
            match event {
                Event::ActivityScheduled { task_id, name, input } => {
                    scheduled.insert(*task_id, (name.clone(), input.clone()));
                }
                Event::ActivityCompleted { task_id, result } => {
                    results.insert(*task_id, Ok(result.clone()));
                }
                Event::ActivityFailed { task_id, error } => {
                    results.insert(*task_id, Err(error.clone()));
                }
                _ => {}
            }
        }
        Self {
            instance: instance.to_string(),
            scheduled,
            results,
            consumed: BTreeSet::new(),
            next_task_id: 0,
            actions: Vec::new(),
            nondeterminism: None,
        }
    }

    fn next_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    fn is_replaying(&self) -> bool {
        (self.next_task_id as usize) < self.scheduled.len()
            || self.results.keys().any(|id| !self.consumed.contains(id))
    }

    fn has_outstanding(&self) -> bool {
        (0..self.next_task_id).any(|id| !self.results.contains_key(&id))
    }
}

/// Handle given to orchestration code for scheduling activities and logging.
///
/// Cloning is cheap; all clones share the same replay state for one turn.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context that replays against `history`.
    pub fn new(instance: impl AsRef<str>, history: &[Event]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.as_ref(), history))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while the code is re-executing steps whose outcome is already in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Schedule an activity call. The returned future resolves with the
    /// recorded result once the activity has completed.
    ///
    /// Task ids are assigned at call time, so calls issued before awaiting any
    /// of them (fan-out) are numbered in issue order.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        let task_id = inner.next_task_id();
        let mismatch = match inner.scheduled.get(&task_id) {
            Some((recorded_name, recorded_input)) if recorded_name != &name || recorded_input != &input => Some(format!(
                "nondeterministic: task {task_id} was recorded as {recorded_name}('{recorded_input}') but the orchestration now calls {name}('{input}')"
            )),
            Some(_) => None,
            None => {
                inner.actions.push(Action::ScheduleActivity { task_id, name, input });
                None
            }
        };
        if inner.nondeterminism.is_none() {
            inner.nondeterminism = mismatch;
        }
        drop(inner);
        ActivityFuture {
            ctx: self.clone(),
            task_id,
        }
    }

    /// Schedule an activity with a serde-encoded input.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> ActivityFuture {
        match codec::Json::encode(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(e) => {
                // Consume the task id so later calls keep their numbering.
                let mut inner = self.lock();
                let task_id = inner.next_task_id();
                inner.results.insert(task_id, Err(format!("encode input: {e}")));
                drop(inner);
                ActivityFuture {
                    ctx: self.clone(),
                    task_id,
                }
            }
        }
    }

    /// Fan-in: resolves when every future has a result, preserving call order.
    pub fn join(&self, futures: Vec<ActivityFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::info!(target: "durafan::orchestration", instance_id = %self.instance_id(), "{}", message.as_ref());
        }
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::warn!(target: "durafan::orchestration", instance_id = %self.instance_id(), "{}", message.as_ref());
        }
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::error!(target: "durafan::orchestration", instance_id = %self.instance_id(), "{}", message.as_ref());
        }
    }

    pub(crate) fn take_result(&self, task_id: TaskId) -> Option<Result<String, String>> {
        let mut inner = self.lock();
        let result = inner.results.get(&task_id).cloned()?;
        inner.consumed.insert(task_id);
        Some(result)
    }
}

/// Outcome status of a single replay turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// Suspended on at least one unresolved activity call.
    Running,
    Completed(String),
    Failed(String),
}

/// Result of [`run_turn`]: new actions plus the orchestration status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub actions: Vec<Action>,
    pub status: TurnStatus,
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Execute orchestration code once from the top against `history`.
///
/// The orchestration future is polled a single time with a no-op waker:
/// durable futures never wake, they are either resolved from history or
/// pending until a later turn. Recorded results are consumed synchronously,
/// unresolved calls become [`Action::ScheduleActivity`] entries.
pub fn run_turn<F, Fut>(instance: &str, history: &[Event], orchestrator: F) -> TurnResult
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, history);
    let polled = catch_unwind(AssertUnwindSafe(|| {
        let fut = orchestrator(ctx.clone());
        let mut fut = std::pin::pin!(fut);
        let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
        fut.as_mut().poll(&mut cx)
    }));

    let mut inner = ctx.lock();
    let actions = std::mem::take(&mut inner.actions);

    let polled = match polled {
        Ok(p) => p,
        Err(payload) => {
            return TurnResult {
                actions: Vec::new(),
                status: TurnStatus::Failed(format!("orchestration panicked: {}", panic_message(&*payload))),
            };
        }
    };

    if let Some(error) = inner.nondeterminism.take() {
        return TurnResult {
            actions: Vec::new(),
            status: TurnStatus::Failed(error),
        };
    }

    match polled {
        Poll::Ready(Ok(output)) => {
            let calls = inner.next_task_id;
            if let Some(orphan) = inner.scheduled.keys().find(|id| **id >= calls) {
                return TurnResult {
                    actions: Vec::new(),
                    status: TurnStatus::Failed(format!(
                        "nondeterministic: history schedules task {orphan} but the orchestration completed after {calls} activity calls"
                    )),
                };
            }
            // Calls issued but never awaited still have to run before the
            // instance can complete.
            if inner.has_outstanding() {
                return TurnResult {
                    actions,
                    status: TurnStatus::Running,
                };
            }
            TurnResult {
                actions: Vec::new(),
                status: TurnStatus::Completed(output),
            }
        }
        Poll::Ready(Err(error)) => TurnResult {
            actions: Vec::new(),
            status: TurnStatus::Failed(error),
        },
        Poll::Pending => {
            if !inner.has_outstanding() {
                return TurnResult {
                    actions: Vec::new(),
                    status: TurnStatus::Failed("orchestration suspended without outstanding activities".to_string()),
                };
            }
            TurnResult {
                actions,
                status: TurnStatus::Running,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(task_id: TaskId, name: &str, input: &str) -> Event {
        Event::ActivityScheduled {
            task_id,
            name: name.to_string(),
            input: input.to_string(),
        }
    }

    fn completed(task_id: TaskId, result: &str) -> Event {
        Event::ActivityCompleted {
            task_id,
            result: result.to_string(),
        }
    }

    fn started() -> Event {
        Event::OrchestratorStarted {
            name: "Test".to_string(),
            input: String::new(),
        }
    }

    #[test]
    fn first_turn_schedules_first_call_only() {
        let result = run_turn("i", &[started()], |ctx| async move {
            let a = ctx.schedule_activity("A", "1").await?;
            let b = ctx.schedule_activity("B", a).await?;
            Ok(b)
        });
        assert_eq!(result.status, TurnStatus::Running);
        assert_eq!(
            result.actions,
            vec![Action::ScheduleActivity {
                task_id: 0,
                name: "A".to_string(),
                input: "1".to_string()
            }]
        );
    }

    #[test]
    fn recorded_results_are_replayed_without_new_actions() {
        let history = vec![started(), scheduled(0, "A", "1"), completed(0, "one")];
        let result = run_turn("i", &history, |ctx| async move {
            let a = ctx.schedule_activity("A", "1").await?;
            let b = ctx.schedule_activity("B", a).await?;
            Ok(b)
        });
        assert_eq!(result.status, TurnStatus::Running);
        assert_eq!(
            result.actions,
            vec![Action::ScheduleActivity {
                task_id: 1,
                name: "B".to_string(),
                input: "one".to_string()
            }]
        );
    }

    #[test]
    fn fan_out_schedules_every_call_before_join() {
        let result = run_turn("i", &[started()], |ctx| async move {
            let calls = vec![
                ctx.schedule_activity("A", "x"),
                ctx.schedule_activity("A", "x"),
                ctx.schedule_activity("B", "y"),
            ];
            let out = ctx.join(calls).await;
            Ok(format!("{}", out.len()))
        });
        let ids: Vec<TaskId> = result
            .actions
            .iter()
            .map(|Action::ScheduleActivity { task_id, .. }| *task_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn failed_activity_surfaces_as_err() {
        let history = vec![
            started(),
            scheduled(0, "A", ""),
            Event::ActivityFailed {
                task_id: 0,
                error: "boom".to_string(),
            },
        ];
        let result = run_turn("i", &history, |ctx| async move {
            match ctx.schedule_activity("A", "").await {
                Ok(_) => Ok("unexpected".to_string()),
                Err(e) => Ok(format!("handled:{e}")),
            }
        });
        assert_eq!(result.status, TurnStatus::Completed("handled:boom".to_string()));
    }

    #[test]
    fn changed_call_is_reported_as_nondeterminism() {
        let history = vec![started(), scheduled(0, "A", "1")];
        let result = run_turn("i", &history, |ctx| async move { ctx.schedule_activity("Other", "1").await });
        match result.status {
            TurnStatus::Failed(e) => assert!(e.starts_with("nondeterministic"), "{e}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn completing_before_recorded_calls_is_nondeterminism() {
        let history = vec![started(), scheduled(0, "A", "1"), completed(0, "r")];
        let result = run_turn("i", &history, |_ctx| async move { Ok("done".to_string()) });
        assert!(matches!(result.status, TurnStatus::Failed(ref e) if e.contains("task 0")));
    }

    #[test]
    fn returning_with_unawaited_call_keeps_running() {
        let result = run_turn("i", &[started()], |ctx| async move {
            let _ignored = ctx.schedule_activity("A", "1");
            Ok("done".to_string())
        });
        assert_eq!(result.status, TurnStatus::Running);
        assert_eq!(
            result.actions,
            vec![Action::ScheduleActivity {
                task_id: 0,
                name: "A".to_string(),
                input: "1".to_string()
            }]
        );

        let history = vec![started(), scheduled(0, "A", "1"), completed(0, "a")];
        let result = run_turn("i", &history, |ctx| async move {
            let _ignored = ctx.schedule_activity("A", "1");
            Ok("done".to_string())
        });
        assert_eq!(result.status, TurnStatus::Completed("done".to_string()));
    }

    #[test]
    fn replay_with_unresolved_unawaited_call_keeps_running() {
        let history = vec![
            started(),
            scheduled(0, "A", "1"),
            scheduled(1, "B", "2"),
            completed(1, "b"),
        ];
        let result = run_turn("i", &history, |ctx| async move {
            let _ignored = ctx.schedule_activity("A", "1");
            ctx.schedule_activity("B", "2").await
        });
        assert_eq!(result.status, TurnStatus::Running);
        assert!(result.actions.is_empty());
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refuses to serialize"))
        }
    }

    #[test]
    fn typed_schedule_encodes_input() {
        let result = run_turn("i", &[started()], |ctx| async move {
            ctx.schedule_activity_typed("Sum", &vec![1u32, 2, 3]).await
        });
        assert_eq!(result.status, TurnStatus::Running);
        assert_eq!(
            result.actions,
            vec![Action::ScheduleActivity {
                task_id: 0,
                name: "Sum".to_string(),
                input: "[1,2,3]".to_string()
            }]
        );
    }

    #[test]
    fn typed_schedule_encode_failure_consumes_task_id() {
        let result = run_turn("i", &[started()], |ctx| async move {
            let broken = ctx.schedule_activity_typed("Broken", &Unencodable).await;
            let err = broken.expect_err("encoding should fail");
            assert!(err.starts_with("encode input:"), "{err}");
            assert!(err.contains("refuses to serialize"), "{err}");
            ctx.schedule_activity("Next", "x").await
        });
        assert_eq!(result.status, TurnStatus::Running);
        assert_eq!(
            result.actions,
            vec![Action::ScheduleActivity {
                task_id: 1,
                name: "Next".to_string(),
                input: "x".to_string()
            }]
        );

        let history = vec![started(), scheduled(1, "Next", "x"), completed(1, "ok")];
        let result = run_turn("i", &history, |ctx| async move {
            let _ = ctx.schedule_activity_typed("Broken", &Unencodable).await;
            ctx.schedule_activity("Next", "x").await
        });
        assert_eq!(result.status, TurnStatus::Completed("ok".to_string()));
    }

    #[test]
    fn panic_becomes_failure() {
        let result = run_turn("i", &[started()], |_ctx| async move {
            if true {
                panic!("kaboom");
            }
            Ok(String::new())
        });
        assert_eq!(
            result.status,
            TurnStatus::Failed("orchestration panicked: kaboom".to_string())
        );
    }

    #[test]
    fn suspending_on_foreign_future_fails() {
        let result = run_turn("i", &[started()], |_ctx| async move {
            ::futures::future::pending::<()>().await;
            Ok(String::new())
        });
        assert!(matches!(result.status, TurnStatus::Failed(ref e) if e.contains("without outstanding")));
    }

    #[test]
    fn replay_state_reports_replaying_until_history_is_consumed() {
        let history = vec![started(), scheduled(0, "A", ""), completed(0, "r")];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _ = run_turn("i", &history, move |ctx| async move {
            seen_in.lock().unwrap().push(ctx.is_replaying());
            let _ = ctx.schedule_activity("A", "").await;
            seen_in.lock().unwrap().push(ctx.is_replaying());
            Ok(String::new())
        });
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn typed_codec_passes_plain_strings_raw() {
        assert_eq!(codec::Json::encode(&"hello").unwrap(), "hello");
        assert_eq!(codec::Json::encode(&vec![1u64, 2]).unwrap(), "[1,2]");
        let s: String = codec::Json::decode("plain text").unwrap();
        assert_eq!(s, "plain text");
        let n: u64 = codec::Json::decode("42").unwrap();
        assert_eq!(n, 42);
    }
}
