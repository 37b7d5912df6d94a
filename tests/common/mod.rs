#![allow(dead_code)]

pub mod tracing_capture;

use durafan::Event;
use durafan::RuntimeOptions;
use durafan::providers::Provider;
use durafan::providers::in_memory::InMemoryProvider;
use durafan::providers::sqlite::SqliteProvider;
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Options tuned for tests: tight polling, short leases.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        orchestrator_lease: Duration::from_secs(5),
        activity_lease: Duration::from_secs(5),
        ..RuntimeOptions::default()
    }
}

pub fn in_memory_store() -> StdArc<dyn Provider> {
    StdArc::new(InMemoryProvider::new()) as StdArc<dyn Provider>
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_url = sqlite_url(&td);
    let store = StdArc::new(SqliteProvider::new(&db_url).await.unwrap()) as StdArc<dyn Provider>;
    (store, td)
}

pub fn sqlite_url(td: &TempDir) -> String {
    format!("sqlite:{}?mode=rwc", td.path().join("test.db").display())
}

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_scheduled(hist: &[Event], name: &str) -> usize {
    hist.iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { name: n, .. } if n == name))
        .count()
}

pub fn count_completions(hist: &[Event]) -> usize {
    hist.iter().filter(|e| e.is_completion()).count()
}

/// History must contain at most one completion per scheduled task and no
/// completion without its schedule.
pub fn assert_history_well_formed(hist: &[Event]) {
    let mut scheduled = std::collections::BTreeSet::new();
    let mut completed = std::collections::BTreeSet::new();
    assert!(
        matches!(hist.first(), Some(Event::OrchestratorStarted { .. })),
        "history must start with OrchestratorStarted: {hist:?}"
    );
    for event in hist {
        match event {
            Event::ActivityScheduled { task_id, .. } => assert!(scheduled.insert(*task_id), "task {task_id} scheduled twice"),
            Event::ActivityCompleted { task_id, .. } | Event::ActivityFailed { task_id, .. } => {
                assert!(scheduled.contains(task_id), "task {task_id} completed before scheduling");
                assert!(completed.insert(*task_id), "task {task_id} completed twice");
            }
            _ => {}
        }
    }
    assert!(
        hist.iter().filter(|e| e.is_terminal()).count() <= 1,
        "more than one terminal event: {hist:?}"
    );
}
