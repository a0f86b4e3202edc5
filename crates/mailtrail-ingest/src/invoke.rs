use anyhow::{Context, Result, bail};
use mailtrail_proto::{BatchResponse, QueueBatch, decode_batch_json, encode_json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::info;

use crate::args::BatchSource;
use crate::core::{EventStore, Pipeline};

/// Runs one invocation over a batch document and prints the response JSON.
///
/// The guard's configuration error is the only failure returned; everything
/// per-message has already been logged by the dispatcher.
pub async fn run_invocation<S: EventStore>(
    pipeline: &Pipeline<S>,
    source: &BatchSource,
    max_batch_bytes: u64,
) -> Result<BatchResponse> {
    pipeline
        .check_config()
        .context("invocation aborted by configuration guard")?;

    let batch = read_batch(source, max_batch_bytes).await?;
    info!("invocation starting: messages={}", batch.len());

    let response = pipeline
        .invoke(&batch)
        .await
        .context("invocation aborted by configuration guard")?;

    let mut encoded = encode_json(&response)?;
    encoded.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&encoded).await.context("failed to write response")?;
    stdout.flush().await.context("failed to flush stdout")?;

    Ok(response)
}

async fn read_batch(
    source: &BatchSource,
    max_batch_bytes: u64,
) -> Result<QueueBatch> {
    let raw = match source {
        BatchSource::Stdin => read_limited(tokio::io::stdin(), max_batch_bytes)
            .await
            .context("failed to read batch from stdin")?,
        BatchSource::File(path) => {
            let file = tokio::fs::File::open(path).await.with_context(|| {
                format!("failed to open batch file {}", path.display())
            })?;
            read_limited(file, max_batch_bytes).await.with_context(|| {
                format!("failed to read batch file {}", path.display())
            })?
        }
    };

    decode_batch_json(&raw).context("failed to decode batch document")
}

async fn read_limited<R: AsyncRead + Unpin>(
    reader: R,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    reader.take(max_bytes.saturating_add(1)).read_to_end(&mut raw).await?;
    if raw.len() as u64 > max_bytes {
        bail!("batch too large: max {max_bytes} bytes");
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use mailtrail_proto::{QueueBatch, QueueMessage, encode_json};
    use uuid::Uuid;

    use super::*;
    use crate::core::normalizer::samples;
    use crate::core::store::memory::MemoryEventStore;
    use crate::core::{Pipeline, PipelineSettings};

    async fn write_batch(batch: &QueueBatch) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("mailtrail-batch-{}.json", Uuid::now_v7()));
        tokio::fs::write(&path, encode_json(batch).unwrap()).await.unwrap();
        path
    }

    fn pipeline(
        store: &Arc<MemoryEventStore>,
        table_name: Option<&str>,
    ) -> Pipeline<MemoryEventStore> {
        Pipeline::new(
            store.clone(),
            PipelineSettings {
                table_name: table_name.map(str::to_string),
                ..PipelineSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn invokes_batch_file() {
        let store = Arc::new(MemoryEventStore::new());
        let path = write_batch(&QueueBatch::new(vec![
            QueueMessage::new("q-0", samples::body("Complaint", "msg-1")),
            QueueMessage::new("q-1", samples::body("DeliveryDelay", "msg-2")),
        ]))
        .await;

        let response = run_invocation(
            &pipeline(&store, Some("email_events")),
            &BatchSource::File(path.clone()),
            1024 * 1024,
        )
        .await
        .unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert!(response.is_success());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn guard_failure_is_returned_for_empty_batch() {
        let store = Arc::new(MemoryEventStore::new());
        let path = write_batch(&QueueBatch::default()).await;

        let result =
            run_invocation(&pipeline(&store, None), &BatchSource::File(path.clone()), 1024)
                .await;
        let _ = tokio::fs::remove_file(&path).await;

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("table name is not configured"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn guard_failure_wins_over_unreadable_batch() {
        let store = Arc::new(MemoryEventStore::new());
        let missing = std::env::temp_dir()
            .join(format!("mailtrail-missing-{}.json", Uuid::now_v7()));

        let err = run_invocation(
            &pipeline(&store, None),
            &BatchSource::File(missing),
            1024,
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("table name is not configured"));
    }

    #[tokio::test]
    async fn oversized_batch_is_refused() {
        let store = Arc::new(MemoryEventStore::new());
        let path = write_batch(&QueueBatch::new(vec![QueueMessage::new(
            "q-0",
            samples::body("Send", "msg-1"),
        )]))
        .await;

        let result = run_invocation(
            &pipeline(&store, Some("email_events")),
            &BatchSource::File(path.clone()),
            16,
        )
        .await;
        let _ = tokio::fs::remove_file(&path).await;

        assert!(result.is_err());
        assert_eq!(store.len(), 0);
    }
}
