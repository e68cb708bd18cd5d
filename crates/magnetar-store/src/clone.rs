use crate::error::{Result, StoreError};
use crate::types::default_zfs_options;
use magnetar_zfs::{Dataset, DatasetProvider};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

struct CloneRequest {
    source: String,
    dest: String,
    response: oneshot::Sender<Result<Dataset>>,
}

/// Single-writer clone serializer
///
/// All snapshot-to-volume clones for guest disks go through one worker
/// task in strict FIFO order, keeping clone metadata churn off the
/// provider's concurrent paths.
pub(crate) struct CloneWorker {
    queue: mpsc::Sender<CloneRequest>,
}

impl CloneWorker {
    pub fn new(
        provider: Arc<dyn DatasetProvider>,
        quit: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tracker.spawn(run_loop(provider, quit, rx));
        Self { queue: tx }
    }

    /// Clone `source` (a snapshot) into `dest` and wait for the result
    pub async fn clone_to(&self, source: &str, dest: &str) -> Result<Dataset> {
        let (tx, rx) = oneshot::channel();
        let request = CloneRequest {
            source: source.to_string(),
            dest: dest.to_string(),
            response: tx,
        };
        if self.queue.send(request).await.is_err() {
            return Err(StoreError::internal("clone worker stopped"));
        }
        rx.await
            .unwrap_or_else(|_| Err(StoreError::internal("clone worker stopped")))
    }
}

async fn run_loop(
    provider: Arc<dyn DatasetProvider>,
    quit: CancellationToken,
    mut rx: mpsc::Receiver<CloneRequest>,
) {
    loop {
        tokio::select! {
            _ = quit.cancelled() => {
                debug!("Clone worker shutting down");
                return;
            }
            request = rx.recv() => {
                let Some(request) = request else { return };
                debug!("Cloning {} to {}", request.source, request.dest);
                let result = run_clone(&provider, &request.source, &request.dest).await;
                let _ = request.response.send(result);
            }
        }
    }
}

async fn run_clone(
    provider: &Arc<dyn DatasetProvider>,
    source: &str,
    dest: &str,
) -> Result<Dataset> {
    let snapshot = provider.get_dataset(source).await?;
    let clone = provider
        .clone_snapshot(&snapshot.name, dest, &default_zfs_options())
        .await?;
    Ok(clone)
}
