//! Sequential activity chaining: three greetings, one after the other.

use crate::OrchestrationContext;
use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};

pub const THREE_GREETINGS: &str = "ThreeGreetings";
pub const ALPHA: &str = "Alpha";
pub const BRAVO: &str = "Bravo";
pub const CHARLIE: &str = "Charlie";

pub fn greeting(speaker: &str, city: &str) -> String {
    format!("{speaker} says hello to {city}!")
}

/// Calls Alpha, Bravo and Charlie in order and returns their outputs as a
/// JSON array.
pub async fn three_greetings(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    let mut outputs = Vec::with_capacity(3);
    for (activity, city) in [(ALPHA, "Tokyo"), (BRAVO, "Seattle"), (CHARLIE, "London")] {
        let greeting = ctx.schedule_activity(activity, city).await?;
        ctx.trace_info(format!("{activity} returned: {greeting}"));
        outputs.push(greeting);
    }
    serde_json::to_string(&outputs).map_err(|e| e.to_string())
}

pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    [ALPHA, BRAVO, CHARLIE].into_iter().fold(builder, |builder, speaker| {
        builder.register(speaker, move |ctx, city: String| async move {
            ctx.trace_info(format!("greeting {city}"));
            Ok(greeting(speaker, &city))
        })
    })
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register(THREE_GREETINGS, three_greetings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, TurnStatus, run_turn};

    #[test]
    fn greeting_format() {
        assert_eq!(greeting("Alpha", "Tokyo"), "Alpha says hello to Tokyo!");
    }

    #[test]
    fn schedules_one_activity_per_turn() {
        let mut history = vec![Event::OrchestratorStarted {
            name: THREE_GREETINGS.into(),
            input: String::new(),
        }];
        let first = run_turn("g", &history, |ctx| three_greetings(ctx, String::new()));
        assert_eq!(first.status, TurnStatus::Running);
        assert_eq!(first.actions.len(), 1);

        history.push(Event::ActivityScheduled {
            task_id: 0,
            name: ALPHA.into(),
            input: "Tokyo".into(),
        });
        history.push(Event::ActivityCompleted {
            task_id: 0,
            result: greeting(ALPHA, "Tokyo"),
        });
        let second = run_turn("g", &history, |ctx| three_greetings(ctx, String::new()));
        assert_eq!(second.status, TurnStatus::Running);
        let crate::Action::ScheduleActivity { task_id, name, input } = &second.actions[0];
        assert_eq!((*task_id, name.as_str(), input.as_str()), (1, BRAVO, "Seattle"));
    }
}
