use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use mailtrail_proto::{
    ACK, BatchResponse, FrameKind, Header, decode_batch_json,
    decode_header_json, encode_json, read_frame_async, write_frame_async,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use uuid::Uuid;

use super::store::EventStore;
use crate::app::AppState;

const MAX_HEADER_LEN: u32 = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runs the TCP ingest loop and spawns one task per accepted client.
///
/// The loop exits only when the shared shutdown token is cancelled; accept
/// errors are logged and retried.
pub async fn run_tcp_server<S: EventStore>(
    listener: TcpListener,
    state: AppState<S>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("tcp server listening: addr={addr}");
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("tcp server stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        let backoff = accept_backoff(&err);
                        warn!("tcp accept failed: error={err}, retry_in={backoff:?}");
                        tokio::select! {
                            _ = state.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, state).await {
                        warn!("client ingest failed: peer={}, error={}", peer, err);
                    }
                });
            }
        }
    }

    Ok(())
}

/// Connection-level failures are retried at once; anything else (descriptor
/// exhaustion, kernel buffers) waits before the next accept.
fn accept_backoff(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// Handles a single framed client request.
///
/// Supported kinds:
/// - `heartbeat`: ACK only
/// - `event_batch`: one pipeline invocation, answered with a `batch_result`
///   frame
async fn handle_client<S: EventStore>(
    mut stream: TcpStream,
    state: AppState<S>,
) -> Result<()> {
    let (header_bytes, body) =
        read_frame_async(&mut stream, MAX_HEADER_LEN, state.max_batch_bytes)
            .await
            .context("failed to read frame")?;

    let header =
        decode_header_json(&header_bytes).context("failed to decode header")?;

    match header.kind {
        FrameKind::Heartbeat => {
            stream.write_all(ACK).await.context("failed to write ACK")?;
            info!(
                "heartbeat accepted: source={}",
                header.source.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        FrameKind::EventBatch => {
            let batch_id = header
                .batch_id
                .clone()
                .unwrap_or_else(|| Uuid::now_v7().to_string());
            let response = invoke_batch(&state, &batch_id, &body).await;

            let reply = Header {
                kind: FrameKind::BatchResult,
                source: None,
                batch_id: Some(batch_id.clone()),
            };
            write_frame_async(
                &mut stream,
                &encode_json(&reply)?,
                &encode_json(&response)?,
            )
            .await
            .context("failed to write batch result")?;

            info!(
                "batch answered: batch_id={}, source={}, status_code={}, item_failures={}",
                batch_id,
                header.source.as_deref().unwrap_or("-"),
                response.status_code,
                response.batch_item_failures.len()
            );
            Ok(())
        }
        FrameKind::BatchResult => {
            anyhow::bail!("unexpected `batch_result` frame from client")
        }
    }
}

async fn invoke_batch<S: EventStore>(
    state: &AppState<S>,
    batch_id: &str,
    body: &[u8],
) -> BatchResponse {
    let batch = match decode_batch_json(body) {
        Ok(batch) => batch,
        Err(err) => {
            warn!("batch rejected: batch_id={batch_id}, error={err}");
            return BatchResponse::bad_request(err.to_string());
        }
    };

    match state.pipeline.invoke(&batch).await {
        Ok(response) => response,
        Err(err) => BatchResponse::fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mailtrail_proto::{
        ACK, FrameKind, Header, QueueBatch, QueueMessage, decode_header_json,
        decode_response_json, encode_json, read_frame_async, write_frame_async,
    };
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    use super::{ACCEPT_BACKOFF, accept_backoff, run_tcp_server};
    use crate::app::AppState;
    use crate::core::normalizer::samples;
    use crate::core::pipeline::{Pipeline, PipelineSettings};
    use crate::core::store::memory::MemoryEventStore;

    async fn start(
        table_name: Option<&str>,
    ) -> (std::net::SocketAddr, Arc<MemoryEventStore>, CancellationToken) {
        let store = Arc::new(MemoryEventStore::new());
        let settings = PipelineSettings {
            table_name: table_name.map(str::to_string),
            ..PipelineSettings::default()
        };
        let state = AppState {
            pipeline: Arc::new(Pipeline::new(store.clone(), settings)),
            max_batch_bytes: 1024 * 1024,
            shutdown: CancellationToken::new(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown.clone();
        tokio::spawn(run_tcp_server(listener, state));
        (addr, store, shutdown)
    }

    async fn send(
        addr: std::net::SocketAddr,
        kind: FrameKind,
        body: &[u8],
    ) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = Header {
            kind,
            source: Some("test".to_string()),
            batch_id: Some("b-1".to_string()),
        };
        write_frame_async(&mut stream, &encode_json(&header).unwrap(), body)
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn batch_frame_is_invoked_and_answered() {
        let (addr, store, shutdown) = start(Some("email_events")).await;
        let batch = QueueBatch::new(vec![
            QueueMessage::new("q-0", samples::body("Send", "msg-1")),
            QueueMessage::new("q-1", "not json"),
        ]);

        let mut stream =
            send(addr, FrameKind::EventBatch, &encode_json(&batch).unwrap()).await;
        let (header, body) =
            read_frame_async(&mut stream, 1024, 1024).await.unwrap();

        let header = decode_header_json(&header).unwrap();
        assert_eq!(header.kind, FrameKind::BatchResult);
        assert_eq!(header.batch_id.as_deref(), Some("b-1"));
        let response = decode_response_json(&body).unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(store.len(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn missing_table_answers_fatal_without_writes() {
        let (addr, store, shutdown) = start(None).await;
        let batch = QueueBatch::new(vec![QueueMessage::new(
            "q-0",
            samples::body("Send", "msg-1"),
        )]);

        let mut stream =
            send(addr, FrameKind::EventBatch, &encode_json(&batch).unwrap()).await;
        let (_, body) = read_frame_async(&mut stream, 1024, 1024).await.unwrap();

        let response = decode_response_json(&body).unwrap();
        assert_eq!(response.status_code, 500);
        assert!(response.error.unwrap().contains("table name"));
        assert_eq!(store.len(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn undecodable_batch_is_a_bad_request() {
        let (addr, store, shutdown) = start(Some("email_events")).await;

        let mut stream = send(addr, FrameKind::EventBatch, b"{\"Records\": 7}").await;
        let (_, body) = read_frame_async(&mut stream, 1024, 1024).await.unwrap();

        let response = decode_response_json(&body).unwrap();
        assert_eq!(response.status_code, 400);
        assert_eq!(store.len(), 0);

        shutdown.cancel();
    }

    #[test]
    fn accept_errors_are_retried_not_fatal() {
        let aborted = std::io::Error::from(std::io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), std::time::Duration::ZERO);

        let exhausted = std::io::Error::other("too many open files");
        assert_eq!(accept_backoff(&exhausted), ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let (addr, _store, shutdown) = start(Some("email_events")).await;

        let mut stream = send(addr, FrameKind::Heartbeat, b"").await;
        let mut ack = [0_u8; 3];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, ACK);

        shutdown.cancel();
    }
}
