use std::collections::{BTreeMap, BTreeSet};

use crate::providers::InstanceStatus;
use crate::{Event, TaskId};

/// Reader for extracting metadata from orchestration history
///
/// Scans the history once so callers can ask about the instance's start,
/// terminal state and per-task progress without re-walking events.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    /// Orchestration name (from OrchestratorStarted)
    pub orchestration_name: Option<String>,

    /// Original input (from OrchestratorStarted)
    pub orchestration_input: Option<String>,

    /// Terminal status and its output/error/reason, if the history has ended
    pub terminal: Option<(InstanceStatus, String)>,

    scheduled: BTreeMap<TaskId, String>,
    completed: BTreeSet<TaskId>,
    len: usize,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut view = Self {
            len: history.len(),
            ..Self::default()
        };
        for event in history {
            match event {
                Event::OrchestratorStarted { name, input } => {
                    view.orchestration_name = Some(name.clone());
                    view.orchestration_input = Some(input.clone());
                }
                Event::ActivityScheduled { task_id, name, .. } => {
                    view.scheduled.insert(*task_id, name.clone());
                }
                Event::ActivityCompleted { task_id, .. } | Event::ActivityFailed { task_id, .. } => {
                    view.completed.insert(*task_id);
                }
                Event::OrchestratorCompleted { output } => {
                    view.terminal = Some((InstanceStatus::Completed, output.clone()));
                }
                Event::OrchestratorFailed { error } => {
                    view.terminal = Some((InstanceStatus::Failed, error.clone()));
                }
                Event::OrchestratorTerminated { reason } => {
                    view.terminal = Some((InstanceStatus::Terminated, reason.clone()));
                }
            }
        }
        view
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Next sequence number, i.e. the history length.
    pub fn next_seq(&self) -> u64 {
        self.len as u64
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal_status(&self) -> Option<InstanceStatus> {
        self.terminal.as_ref().map(|(status, _)| *status)
    }

    pub fn is_scheduled(&self, task_id: TaskId) -> bool {
        self.scheduled.contains_key(&task_id)
    }

    pub fn is_completed(&self, task_id: TaskId) -> bool {
        self.completed.contains(&task_id)
    }
}
