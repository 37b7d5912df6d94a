use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::codec::Json;
use crate::error::Error;
use crate::providers::{
    ExecutionMetadata, InstanceRecord, InstanceStatus, Provider, ProviderError, ProviderErrorKind, WorkItem,
};
use crate::runtime::{HistoryManager, OrchestrationRegistry};
use crate::runtime::dispatchers::backoff;
use crate::Event;

/// Thin client for control-plane operations.
///
/// Communicates with the runtime exclusively through the shared provider:
/// starting an instance writes its first event and enqueues a trigger, the
/// dispatchers pick it up from there.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
}

impl Client {
    /// Create a client bound to a provider. Only orchestrations present in
    /// `orchestrations` can be started.
    pub fn new(store: Arc<dyn Provider>, orchestrations: OrchestrationRegistry) -> Self {
        Self { store, orchestrations }
    }

    /// Start an orchestration under a fresh instance id and return that id.
    ///
    /// # Errors
    ///
    /// `InvalidOrchestration` when the name is not registered.
    pub async fn start(&self, orchestration: &str, input: impl Into<String>) -> Result<String, Error> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start an orchestration under a caller-chosen instance id.
    ///
    /// # Errors
    ///
    /// `InvalidOrchestration` when the name is not registered, `AlreadyExists`
    /// when the id is taken.
    pub async fn start_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), Error> {
        if !self.orchestrations.has(orchestration) {
            return Err(Error::InvalidOrchestration(orchestration.to_string()));
        }
        let input = input.into();
        let record = InstanceRecord::new(instance, orchestration, input.clone());
        let started = Event::OrchestratorStarted {
            name: orchestration.to_string(),
            input,
        };
        let trigger = WorkItem::OrchestratorTrigger {
            instance: instance.to_string(),
        };
        match self.store.start_instance(record, vec![started], vec![trigger]).await {
            Ok(()) => {
                tracing::info!(target: "durafan::client", instance_id = %instance, orchestration = %orchestration, "orchestration started");
                Ok(())
            }
            Err(e) if e.kind == ProviderErrorKind::AlreadyExists => Err(Error::AlreadyExists(instance.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Start an orchestration with typed input (serialized to JSON).
    ///
    /// # Errors
    ///
    /// `Codec` if the input cannot be encoded, otherwise as [`Client::start`].
    pub async fn start_typed<In: Serialize>(&self, orchestration: &str, input: &In) -> Result<String, Error> {
        let payload = Json::encode(input).map_err(Error::Codec)?;
        self.start(orchestration, payload).await
    }

    /// Current status projection of an instance.
    ///
    /// # Errors
    ///
    /// `NotFound` when the instance does not exist.
    pub async fn status(&self, instance: &str) -> Result<InstanceRecord, Error> {
        self.store
            .instance(instance)
            .await?
            .ok_or_else(|| Error::NotFound(instance.to_string()))
    }

    /// Full event history of an instance.
    ///
    /// # Errors
    ///
    /// `NotFound` when the instance does not exist.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, Error> {
        let history = self.store.read(instance).await?;
        if history.is_empty() {
            return Err(Error::NotFound(instance.to_string()));
        }
        Ok(history)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, Error> {
        Ok(self.store.list_instances().await?)
    }

    /// Terminate a running instance. Pending activity results arriving
    /// afterwards are discarded. Terminating a finished instance is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` when the instance does not exist.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), Error> {
        let reason = reason.into();
        for attempt in 0..16u32 {
            let history = self.store.read(instance).await?;
            let view = HistoryManager::from_history(&history);
            if view.is_empty() {
                return Err(Error::NotFound(instance.to_string()));
            }
            if view.is_terminal() {
                return Ok(());
            }
            match self
                .store
                .commit(
                    instance,
                    view.next_seq(),
                    vec![Event::OrchestratorTerminated { reason: reason.clone() }],
                    Vec::new(),
                    ExecutionMetadata::finished(InstanceStatus::Terminated, reason.clone()),
                )
                .await
            {
                Ok(_) => {
                    tracing::info!(target: "durafan::client", instance_id = %instance, reason = %reason, "orchestration terminated");
                    return Ok(());
                }
                Err(e) if e.is_conflict() || e.is_retryable() => tokio::time::sleep(backoff(attempt)).await,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProviderError::conflict("terminate", format!("instance {instance}: too many conflicting writers")).into())
    }

    /// Poll until the instance reaches a terminal status.
    ///
    /// # Errors
    ///
    /// `Timeout` if it is still running after `timeout`, `NotFound` if it does not exist.
    pub async fn wait_for_orchestration(&self, instance: &str, timeout: Duration) -> Result<InstanceRecord, Error> {
        let poll = async {
            let mut delay = Duration::from_millis(5);
            loop {
                let record = self.status(instance).await?;
                if record.status.is_terminal() {
                    return Ok::<_, Error>(record);
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(100));
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Orchestration names this client may start.
    pub fn orchestrations(&self) -> Vec<String> {
        self.orchestrations.list_names()
    }
}
