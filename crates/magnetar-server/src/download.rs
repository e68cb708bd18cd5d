use crate::rpc::SnapshotRequest;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use magnetar_store::{ImageStore, StoreError};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// Bridge from the provider's blocking writer to a streaming HTTP body
struct ChannelWriter {
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "response body closed")
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Streaming snapshot download
///
/// `POST /snapshots/download` with `{"id": "<snapshot>"}`. The snapshot is
/// resolved before headers commit; a send failure after that truncates
/// the body.
pub(crate) async fn download_snapshot(
    State(store): State<Arc<ImageStore>>,
    body: Bytes,
) -> Response {
    let request: SnapshotRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("malformed request: {}", err))
                .into_response();
        }
    };

    if request.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "need an id".to_string()).into_response();
    }

    // Resolve first so errors still map to a status code
    if let Err(err) = store.get_snapshot(&request.id).await {
        let status = match err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::NotSnapshot { .. }
            | StoreError::NotValid { .. }
            | StoreError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return (status, err.to_string()).into_response();
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let id = request.id.clone();
    tokio::spawn(async move {
        let writer = Box::new(ChannelWriter { tx: tx.clone() });
        if let Err(err) = store.send_snapshot(&id, writer).await {
            warn!("Snapshot send for '{}' failed mid-stream: {}", id, err);
            let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
