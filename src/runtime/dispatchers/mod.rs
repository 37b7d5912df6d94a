//! Background dispatchers for the runtime
//!
//! - `orchestration`: leases orchestrator triggers and runs scheduler turns
//! - `worker`: leases activity messages and records their results

pub mod orchestration;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::providers::{Provider, QueueKind};

/// Calculate the renewal interval based on lease length and buffer settings.
///
/// # Logic
/// - If lease >= 15s: renew at (lease - buffer), at least every second
/// - If lease < 15s: renew at 0.5 x lease (buffer ignored)
pub(crate) fn calculate_renewal_interval(lease: Duration, buffer: Duration) -> Duration {
    if lease >= Duration::from_secs(15) {
        let buffer = buffer.min(lease);
        lease
            .checked_sub(buffer)
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    } else {
        (lease / 2).max(Duration::from_millis(10))
    }
}

/// Exponential backoff for retries: 10ms, 20ms, 40ms ... capped at 640ms.
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(10u64.saturating_mul(1 << attempt.min(6)))
}

/// Spawn a background task that keeps a lease alive until aborted.
pub(crate) fn spawn_lease_renewal_task(
    store: Arc<dyn Provider>,
    kind: QueueKind,
    token: String,
    lease: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lease, buffer);

    tracing::trace!(
        target: "durafan::runtime::dispatchers",
        queue = kind.as_str(),
        lock_token = %token,
        lease_ms = %lease.as_millis(),
        renewal_interval_ms = %renewal_interval.as_millis(),
        "Spawning lease renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // Skip first immediate tick

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match store.renew_lease(kind, &token, lease).await {
                Ok(()) => {
                    tracing::trace!(
                        target: "durafan::runtime::dispatchers",
                        queue = kind.as_str(),
                        lock_token = %token,
                        "Lease renewed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "durafan::runtime::dispatchers",
                        queue = kind.as_str(),
                        lock_token = %token,
                        error = %e,
                        "Failed to renew lease; stopping renewal"
                    );
                    break;
                }
            }
        }
    })
}
