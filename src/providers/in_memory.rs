use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{
    ExecutionMetadata, HistoryStore, InstanceRecord, LeasedItem, Provider, ProviderError, QueueKind, WorkItem,
    WorkQueue, check_append,
};
use crate::Event;

struct InstanceState {
    record: InstanceRecord,
    history: Vec<Event>,
}

struct QueuedMessage {
    item: WorkItem,
    visible_at: Instant,
    lock: Option<(String, Instant)>,
    attempt_count: u32,
}

impl QueuedMessage {
    fn new(item: WorkItem) -> Self {
        Self {
            item,
            visible_at: Instant::now(),
            lock: None,
            attempt_count: 0,
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        self.visible_at <= now && self.lock.as_ref().is_none_or(|(_, until)| *until <= now)
    }

    fn holds(&self, token: &str, now: Instant) -> bool {
        matches!(&self.lock, Some((t, until)) if t == token && *until > now)
    }
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceState>,
    orchestrator: Vec<QueuedMessage>,
    worker: Vec<QueuedMessage>,
}

impl State {
    fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<QueuedMessage> {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator,
            QueueKind::Worker => &mut self.worker,
        }
    }

    fn push(&mut self, item: WorkItem) {
        let now = Instant::now();
        let kind = item.queue();
        let queue = self.queue_mut(kind);
        // A visible, unleased trigger for the same instance already covers this one.
        if kind == QueueKind::Orchestrator
            && queue
                .iter()
                .any(|m| m.item == item && m.lock.is_none() && m.visible_at <= now)
        {
            return;
        }
        queue.push(QueuedMessage::new(item));
    }

    fn append_checked(
        &mut self,
        operation: &str,
        instance: &str,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let state = self
            .instances
            .get_mut(instance)
            .ok_or_else(|| ProviderError::not_found(operation, format!("instance {instance} not found")))?;
        check_append(operation, instance, &state.history, expected_seq, &events)?;
        state.history.extend(events);
        Ok(state.history.len() as u64)
    }
}

/// Process-local provider backed by a single mutex.
///
/// Every operation takes the lock once, so commits are trivially atomic.
/// Contents are lost when the provider is dropped.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages (leased or not) in a queue.
    pub async fn queue_depth(&self, kind: QueueKind) -> usize {
        let mut state = self.state.lock().await;
        state.queue_mut(kind).len()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance)
            .map(|s| s.history.clone())
            .unwrap_or_default())
    }

    async fn append(&self, instance: &str, expected_seq: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut state = self.state.lock().await;
        state.append_checked("append", instance, expected_seq, events)
    }

    async fn create_instance(&self, record: InstanceRecord, initial: Vec<Event>) -> Result<(), ProviderError> {
        self.start_instance(record, initial, Vec::new()).await
    }

    async fn instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.instances.get(instance).map(|s| s.record.clone()))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.instances.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl WorkQueue for InMemoryProvider {
    async fn enqueue(&self, item: WorkItem) -> Result<(), ProviderError> {
        tracing::debug!(target: "durafan::providers::in_memory", instance = %item.instance(), ?item, "enqueue");
        self.state.lock().await.push(item);
        Ok(())
    }

    async fn dequeue(&self, kind: QueueKind, lease: Duration) -> Result<Option<LeasedItem>, ProviderError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(msg) = state.queue_mut(kind).iter_mut().find(|m| m.is_available(now)) else {
            return Ok(None);
        };
        let token = uuid::Uuid::new_v4().to_string();
        msg.lock = Some((token.clone(), now + lease));
        msg.attempt_count += 1;
        Ok(Some(LeasedItem {
            item: msg.item.clone(),
            lock_token: token,
            attempt_count: msg.attempt_count,
        }))
    }

    async fn ack(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(kind);
        match queue.iter().position(|m| m.holds(lock_token, now)) {
            Some(pos) => {
                queue.remove(pos);
                Ok(())
            }
            None => Err(ProviderError::not_found(
                "ack",
                format!("no live {} lease for token {lock_token}", kind.as_str()),
            )),
        }
    }

    async fn abandon(&self, kind: QueueKind, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let msg = state
            .queue_mut(kind)
            .iter_mut()
            .find(|m| m.holds(lock_token, now))
            .ok_or_else(|| ProviderError::not_found("abandon", format!("no live lease for token {lock_token}")))?;
        msg.lock = None;
        msg.visible_at = now + delay.unwrap_or_default();
        Ok(())
    }

    async fn renew_lease(&self, kind: QueueKind, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let msg = state
            .queue_mut(kind)
            .iter_mut()
            .find(|m| m.holds(lock_token, now))
            .ok_or_else(|| ProviderError::not_found("renew_lease", format!("no live lease for token {lock_token}")))?;
        msg.lock = Some((lock_token.to_string(), now + extend_for));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn start_instance(
        &self,
        record: InstanceRecord,
        initial: Vec<Event>,
        work_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(&record.instance_id) {
            return Err(ProviderError::already_exists(
                "start_instance",
                format!("instance {} already exists", record.instance_id),
            ));
        }
        check_append("start_instance", &record.instance_id, &[], 0, &initial)?;
        state.instances.insert(
            record.instance_id.clone(),
            InstanceState {
                record,
                history: initial,
            },
        );
        for item in work_items {
            state.push(item);
        }
        Ok(())
    }

    async fn commit(
        &self,
        instance: &str,
        expected_seq: u64,
        events: Vec<Event>,
        work_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<u64, ProviderError> {
        let mut state = self.state.lock().await;
        let len = state.append_checked("commit", instance, expected_seq, events)?;
        if let Some(s) = state.instances.get_mut(instance) {
            s.record.apply(&metadata);
        }
        for item in work_items {
            state.push(item);
        }
        Ok(len)
    }
}
