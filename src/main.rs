use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use durafan::providers::Provider;
use durafan::providers::sqlite::SqliteProvider;
use durafan::samples::{self, FsBlobSink, backup, greetings};
use durafan::{ActivityRegistry, InstanceRecord, OrchestrationRegistry, Runtime};

const DATA_DIR: &str = "./durafan-data";
const WAIT: Duration = Duration::from_secs(60);

fn print_status(record: &InstanceRecord) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    durafan::logging::init_tracing();

    let backup_root = std::env::args().nth(1);
    let data_dir = PathBuf::from(DATA_DIR);
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;

    // History persists across runs
    let db_url = format!("sqlite:{}/durafan.db?mode=rwc", data_dir.display());
    let store = SqliteProvider::new(&db_url)
        .await
        .with_context(|| format!("opening {db_url}"))?;
    let store = Arc::new(store) as Arc<dyn Provider>;

    let sink = Arc::new(FsBlobSink::new(data_dir.join("blobs")));
    let activities = samples::register_activities(ActivityRegistry::builder(), sink)
        .build_result()
        .map_err(anyhow::Error::msg)?;
    let orchestrations = samples::register_orchestrations(OrchestrationRegistry::builder())
        .build_result()
        .map_err(anyhow::Error::msg)?;

    let rt = Runtime::start_with_store(store, Arc::new(activities), orchestrations).await;
    let client = rt.client();

    let greeting_id = client.start(greetings::THREE_GREETINGS, "").await?;
    let record = client.wait_for_orchestration(&greeting_id, WAIT).await?;
    print_status(&record)?;

    if let Some(root) = backup_root {
        let backup_id = client.start(backup::BACKUP_SITE_CONTENT, root).await?;
        let record = client.wait_for_orchestration(&backup_id, WAIT).await?;
        print_status(&record)?;
    }

    rt.shutdown().await;
    Ok(())
}
