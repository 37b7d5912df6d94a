//! Sample orchestrations used by the demo binary and the end-to-end tests.
//!
//! - [`greetings`]: `ThreeGreetings`, three activities chained in sequence
//! - [`backup`]: `BackupSiteContent`, fan-out over a directory with fan-in of byte counts

use std::sync::Arc;

use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};

pub mod backup;
pub mod greetings;

pub use backup::{BlobSink, FsBlobSink};

/// Register every sample activity. `sink` receives the files copied by `CopyFileToBlob`.
pub fn register_activities(builder: ActivityRegistryBuilder, sink: Arc<dyn BlobSink>) -> ActivityRegistryBuilder {
    backup::register_activities(greetings::register_activities(builder), sink)
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    backup::register_orchestrations(greetings::register_orchestrations(builder))
}
