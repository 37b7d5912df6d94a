//! Fan-out/fan-in: copy every file below a directory into a blob sink and
//! report the total number of bytes copied.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::OrchestrationContext;
use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};

pub const BACKUP_SITE_CONTENT: &str = "BackupSiteContent";
pub const GET_FILE_LIST: &str = "GetFileList";
pub const COPY_FILE_TO_BLOB: &str = "CopyFileToBlob";

/// Destination for backed-up file contents.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Stream `reader` into the blob at `path`, returning the bytes written.
    async fn write(&self, path: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> std::io::Result<u64>;
}

/// Blob sink backed by a local directory.
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    async fn write(&self, path: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> std::io::Result<u64> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&target).await?;
        tokio::io::copy(reader, &mut file).await
    }
}

/// Blob name for a local file: `backups/` followed by the path with any
/// drive or root prefix removed and `\` separators turned into `/`.
pub fn blob_path(path: &str) -> String {
    let mut rest = path;
    let bytes = rest.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        rest = &rest[2..];
    }
    let rest = rest.trim_start_matches(['/', '\\']);
    format!("backups/{}", rest.replace('\\', "/"))
}

/// Every regular file below `root`, recursively, sorted.
pub async fn list_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path().to_string_lossy().into_owned());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Lists the files under the input directory, copies them all in parallel
/// and returns the total byte count.
pub async fn backup_site_content(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let root = match input.trim() {
        "" => ".".to_string(),
        trimmed => trimmed.to_string(),
    };

    let files: Vec<String> = ctx.schedule_activity(GET_FILE_LIST, root.clone()).into_typed().await?;
    crate::durable_info!(ctx, files = files.len(), root = %root, "file list received");

    let copies = files
        .into_iter()
        .map(|file| ctx.schedule_activity(COPY_FILE_TO_BLOB, file))
        .collect();
    let mut total: u64 = 0;
    for result in ctx.join(copies).await {
        let bytes = result?;
        let copied = bytes
            .parse::<u64>()
            .map_err(|e| format!("invalid byte count '{bytes}': {e}"))?;
        total = total
            .checked_add(copied)
            .ok_or_else(|| format!("byte total overflows u64 after adding {copied} to {total}"))?;
    }
    ctx.trace_info(format!("backed up {total} bytes"));
    Ok(total.to_string())
}

pub fn register_activities(builder: ActivityRegistryBuilder, sink: Arc<dyn BlobSink>) -> ActivityRegistryBuilder {
    builder
        .register_typed::<String, Vec<String>, _, _>(GET_FILE_LIST, |ctx, root| async move {
            let files = list_files(Path::new(&root))
                .await
                .map_err(|e| format!("failed to list {root}: {e}"))?;
            ctx.trace_info(format!("found {} files", files.len()));
            Ok(files)
        })
        .register_typed::<String, u64, _, _>(COPY_FILE_TO_BLOB, move |ctx, file| {
            let sink = sink.clone();
            async move {
                let target = blob_path(&file);
                let mut source = tokio::fs::File::open(&file)
                    .await
                    .map_err(|e| format!("failed to open {file}: {e}"))?;
                let bytes = sink
                    .write(&target, &mut source)
                    .await
                    .map_err(|e| format!("failed to copy {file} to {target}: {e}"))?;
                ctx.trace_info(format!("copied {file} to {target} ({bytes} bytes)"));
                Ok(bytes)
            }
        })
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register(BACKUP_SITE_CONTENT, backup_site_content)
}
