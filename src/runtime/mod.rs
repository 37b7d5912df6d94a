//! Runtime hosting the orchestration scheduler and activity dispatchers.
//!
//! [`Runtime::start_with_store`] spawns two pools of background workers:
//! orchestration workers lease triggers and run scheduler turns, work workers
//! lease activity messages and execute the registered handlers. Both talk to
//! the world only through the [`Provider`].
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::OrchestrationContext;
use crate::client::Client;
use crate::error::Error;
use crate::providers::Provider;

mod activity;
pub mod dispatchers;
pub mod registry;
pub mod replay;
mod state_helpers;

pub use activity::{ActivityContext, ActivityHandler, FnActivity};
pub use dispatchers::orchestration::{OrchestrationScheduler, SchedulerOutcome};
pub use dispatchers::worker::{ActivityDispatcher, ActivityOutcome};
pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use state_helpers::HistoryManager;

/// Configuration for the runtime and its dispatchers.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep: Duration,
    /// Number of concurrent orchestration workers.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    /// Lease taken on orchestrator triggers.
    pub orchestrator_lease: Duration,
    /// Lease taken on activity messages; renewed while the activity runs.
    pub activity_lease: Duration,
    /// Renew this long before a lease of 15s or more would expire.
    pub lease_renewal_buffer: Duration,
    /// Upper bound on one activity invocation. On expiry the message is
    /// neither acked nor abandoned, so its lease lapses and it is redelivered.
    pub activity_timeout: Option<Duration>,
    /// Deliveries after which an activity message is recorded as failed.
    pub max_activity_attempts: u32,
    /// Re-read-and-retry budget for commits that lose an optimistic race.
    pub max_commit_retries: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            orchestrator_lease: Duration::from_secs(30),
            activity_lease: Duration::from_secs(30),
            lease_renewal_buffer: Duration::from_secs(5),
            activity_timeout: Some(Duration::from_secs(300)),
            max_activity_attempts: 10,
            max_commit_retries: 8,
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process host for orchestrations and activities.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    scheduler: Arc<OrchestrationScheduler>,
    activity_dispatcher: Arc<ActivityDispatcher>,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    /// Start a new runtime backed by a private in-memory SQLite store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be created.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Result<Arc<Self>, Error> {
        let store = crate::providers::sqlite::SqliteProvider::new_in_memory()
            .await
            .map_err(|e| Error::Provider(crate::providers::ProviderError::permanent("open", e.to_string())))?;
        Ok(Self::start_with_store(Arc::new(store), activity_registry, orchestration_registry).await)
    }

    /// Start a new runtime with a custom `Provider` implementation.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activity_registry, orchestration_registry, RuntimeOptions::default()).await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let scheduler = Arc::new(OrchestrationScheduler::new(
            store.clone(),
            orchestration_registry.clone(),
            options.clone(),
        ));
        let activity_dispatcher = Arc::new(ActivityDispatcher::new(store.clone(), activity_registry, options.clone()));
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            store,
            orchestrations: orchestration_registry,
            scheduler,
            activity_dispatcher,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let orchestration_workers = runtime.clone().start_orchestration_dispatcher();
        let activity_workers = runtime.clone().start_work_dispatcher();
        {
            let mut joins = runtime.joins.lock().await;
            joins.extend(orchestration_workers);
            joins.extend(activity_workers);
        }

        tracing::debug!(
            target: "durafan::runtime",
            runtime_id = %runtime.runtime_id,
            orchestrations = ?runtime.orchestrations.list_names(),
            "runtime started"
        );
        runtime
    }

    /// Client bound to this runtime's store and orchestration registry.
    pub fn client(&self) -> Client {
        Client::new(self.store.clone(), self.orchestrations.clone())
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Stop polling and abort every dispatcher worker.
    ///
    /// Turns and activity invocations still in progress are cancelled at
    /// their next await point, so nothing they would have written is
    /// committed after this returns. Their messages stay leased and are
    /// redelivered once the leases lapse.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for j in joins.iter() {
            j.abort();
        }
        for j in joins.drain(..) {
            let _ = j.await;
        }
        tracing::debug!(target: "durafan::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }
}
