use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Event, TurnResult, TurnStatus};

/// Replay one turn of a registered orchestration against its history.
///
/// The input comes from the `OrchestratorStarted` event, so the handler sees
/// exactly what the instance was started with on every replay.
pub fn replay(instance: &str, handler: Arc<dyn OrchestrationHandler>, history: &[Event]) -> TurnResult {
    let Some(Event::OrchestratorStarted { input, .. }) = history.first() else {
        return TurnResult {
            actions: Vec::new(),
            status: TurnStatus::Failed("history does not begin with OrchestratorStarted".to_string()),
        };
    };
    let input = input.clone();
    let result = crate::run_turn(instance, history, move |ctx| async move { handler.invoke(ctx, input).await });

    tracing::trace!(
        target: "durafan::runtime::replay",
        instance_id = %instance,
        history_len = history.len(),
        new_actions = result.actions.len(),
        status = ?result.status,
        "replayed turn"
    );
    result
}
