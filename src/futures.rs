use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::codec::Json;
use crate::{OrchestrationContext, TaskId};

/// Pending result of one activity call.
///
/// Resolves with the recorded `Ok(result)` / `Err(error)` once history holds a
/// completion for its task id; otherwise stays pending for the current turn.
pub struct ActivityFuture {
    pub(crate) ctx: OrchestrationContext,
    pub(crate) task_id: TaskId,
}

impl ActivityFuture {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Decode the activity result with serde.
    pub fn into_typed<Out: DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        async move {
            let raw = self.await?;
            Json::decode::<Out>(&raw)
        }
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.take_result(self.task_id) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Fan-in over a set of activity futures.
///
/// Output order follows the order of the input vector (call order), never
/// completion order.
pub struct JoinFuture {
    pending: Vec<ActivityFuture>,
    results: Vec<Option<Result<String, String>>>,
}

impl JoinFuture {
    pub(crate) fn new(futures: Vec<ActivityFuture>) -> Self {
        let results = futures.iter().map(|_| None).collect();
        Self {
            pending: futures,
            results,
        }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        for (fut, slot) in this.pending.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            if let Poll::Ready(result) = Pin::new(fut).poll(cx) {
                *slot = Some(result);
            }
        }
        if this.results.iter().all(Option::is_some) {
            Poll::Ready(std::mem::take(&mut this.results).into_iter().flatten().collect())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Event, TurnStatus, run_turn};

    fn history_with(results: &[(u64, &str)]) -> Vec<Event> {
        let mut history = vec![Event::OrchestratorStarted {
            name: "J".to_string(),
            input: String::new(),
        }];
        for i in 0..3 {
            history.push(Event::ActivityScheduled {
                task_id: i,
                name: "A".to_string(),
                input: i.to_string(),
            });
        }
        for (task_id, result) in results {
            history.push(Event::ActivityCompleted {
                task_id: *task_id,
                result: result.to_string(),
            });
        }
        history
    }

    fn join_three(history: &[Event]) -> TurnStatus {
        run_turn("j", history, |ctx| async move {
            let calls = (0..3).map(|i| ctx.schedule_activity("A", i.to_string())).collect();
            let results = ctx.join(calls).await;
            let joined: Result<Vec<String>, String> = results.into_iter().collect();
            Ok(joined?.join(","))
        })
        .status
    }

    #[test]
    fn join_waits_for_every_result() {
        let status = join_three(&history_with(&[(2, "c"), (0, "a")]));
        assert_eq!(status, TurnStatus::Running);
    }

    #[test]
    fn join_orders_by_call_not_completion() {
        let status = join_three(&history_with(&[(2, "c"), (0, "a"), (1, "b")]));
        assert_eq!(status, TurnStatus::Completed("a,b,c".to_string()));
    }

    #[test]
    fn empty_join_is_immediately_ready() {
        let result = run_turn("j", &[], |ctx| async move {
            let results = ctx.join(Vec::new()).await;
            Ok(results.len().to_string())
        });
        assert_eq!(result.status, TurnStatus::Completed("0".to_string()));
    }

    #[test]
    fn typed_result_decodes() {
        let mut history = history_with(&[]);
        history.truncate(2);
        history.push(Event::ActivityCompleted {
            task_id: 0,
            result: "[\"x\",\"y\"]".to_string(),
        });
        let result = run_turn("j", &history, |ctx| async move {
            let files: Vec<String> = ctx.schedule_activity("A", "0").into_typed().await?;
            Ok(files.len().to_string())
        });
        assert_eq!(result.status, TurnStatus::Completed("2".to_string()));
    }
}
