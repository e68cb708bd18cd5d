use crate::error::{Result, StoreError};
use crate::store::IMAGES_BUCKET;
use crate::types::{Image, ImageStatus};
use futures::StreamExt;
use magnetar_catalog::Catalog;
use magnetar_zfs::DatasetProvider;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

/// Information needed to fetch and import one image
#[derive(Debug, Clone)]
pub(crate) struct FetchRequest {
    /// Image id; also the cache file name
    pub name: String,
    /// Download URL on the image service
    pub source: String,
    /// Dataset the snapshot stream is received into
    pub dest: String,
}

/// The outcome a fetch broadcasts to its waiters
pub(crate) type FetchResult = Result<Image>;

type Waiter = oneshot::Sender<FetchResult>;
type QueuedRequest = (FetchRequest, Waiter);

struct FetcherShared {
    provider: Arc<dyn DatasetProvider>,
    catalog: Arc<Catalog>,
    client: reqwest::Client,
    temp_dir: PathBuf,
    /// Requests currently being serviced, keyed by image id. Only held
    /// for O(1) operations; never across I/O.
    in_flight: Mutex<HashMap<String, Vec<Waiter>>>,
    permits: Semaphore,
    quit: CancellationToken,
    tracker: TaskTracker,
}

/// Coalescing, bounded-concurrency image fetcher
///
/// Concurrent requests for the same image id share one download and
/// import; at most `concurrency` fetches run at once. Admission is a
/// bounded queue consumed by a single dispatcher task.
pub(crate) struct Fetcher {
    queue: mpsc::Sender<QueuedRequest>,
}

impl Fetcher {
    pub fn new(
        provider: Arc<dyn DatasetProvider>,
        catalog: Arc<Catalog>,
        temp_dir: PathBuf,
        concurrency: usize,
        max_pending: usize,
        quit: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let (tx, rx) = mpsc::channel(max_pending.max(1));
        let shared = Arc::new(FetcherShared {
            provider,
            catalog,
            client: reqwest::Client::new(),
            temp_dir,
            in_flight: Mutex::new(HashMap::new()),
            permits: Semaphore::new(concurrency),
            quit,
            tracker: tracker.clone(),
        });

        tracker.spawn(dispatch_loop(shared, rx));

        Self { queue: tx }
    }

    /// Submit a request and block until its shared outcome arrives
    pub async fn fetch(&self, req: FetchRequest) -> FetchResult {
        let (tx, rx) = oneshot::channel();
        debug!("Queueing fetch request for '{}'", req.name);
        if self.queue.send((req, tx)).await.is_err() {
            return Err(StoreError::FetcherStopped);
        }
        rx.await.unwrap_or(Err(StoreError::FetcherStopped))
    }
}

/// Single dispatcher: coalesces admitted requests and starts fetch tasks
async fn dispatch_loop(shared: Arc<FetcherShared>, mut rx: mpsc::Receiver<QueuedRequest>) {
    loop {
        tokio::select! {
            _ = shared.quit.cancelled() => {
                // Stop admitting, then fail whatever was already queued
                rx.close();
                while let Some((req, tx)) = rx.recv().await {
                    debug!("Failing queued fetch for '{}': shutting down", req.name);
                    let _ = tx.send(Err(StoreError::FetcherStopped));
                }
                return;
            }
            queued = rx.recv() => {
                let Some((req, tx)) = queued else { return };
                process(&shared, req, tx);
            }
        }
    }
}

/// Either join an in-flight fetch for the same image or start a new one
fn process(shared: &Arc<FetcherShared>, req: FetchRequest, tx: Waiter) {
    let mut in_flight = shared.in_flight.lock().unwrap();
    if let Some(waiters) = in_flight.get_mut(&req.name) {
        debug!("Coalescing fetch request for '{}'", req.name);
        waiters.push(tx);
        return;
    }
    debug!("Starting fetch for '{}'", req.name);
    in_flight.insert(req.name.clone(), vec![tx]);
    shared.tracker.spawn(run_fetch(shared.clone(), req));
}

/// Hand the outcome to every waiter registered for this image
fn complete(shared: &FetcherShared, name: &str, result: FetchResult) {
    let waiters = shared.in_flight.lock().unwrap().remove(name);
    for tx in waiters.unwrap_or_default() {
        let _ = tx.send(result.clone());
    }
}

async fn run_fetch(shared: Arc<FetcherShared>, req: FetchRequest) {
    // One permit for the whole download + import
    let _permit = tokio::select! {
        _ = shared.quit.cancelled() => {
            complete(&shared, &req.name, Err(StoreError::FetcherStopped));
            return;
        }
        permit = shared.permits.acquire() => match permit {
            Ok(p) => p,
            Err(_) => {
                complete(&shared, &req.name, Err(StoreError::FetcherStopped));
                return;
            }
        },
    };

    let result = fetch_image(&shared, &req).await;
    if let Err(ref err) = result {
        warn!("Fetch for '{}' failed: {}", req.name, err);
    }
    complete(&shared, &req.name, result);
}

/// Download (unless cached), import, and record one image
async fn fetch_image(shared: &FetcherShared, req: &FetchRequest) -> FetchResult {
    let pending = Image {
        id: req.name.clone(),
        status: ImageStatus::Pending,
        ..Default::default()
    };
    shared.catalog.put_record(IMAGES_BUCKET, &req.name, &pending)?;

    let result = download_and_import(shared, req).await;
    if result.is_err() {
        // The record is only meaningful while a fetch can still succeed
        if let Err(err) = shared.catalog.delete(IMAGES_BUCKET, &req.name) {
            warn!("Could not remove pending record for '{}': {}", req.name, err);
        }
    }
    result
}

async fn download_and_import(shared: &FetcherShared, req: &FetchRequest) -> FetchResult {
    let cached = shared.temp_dir.join(&req.name);

    if tokio::fs::metadata(&cached).await.is_ok() {
        debug!("Using cached image file for '{}'", req.name);
    } else {
        download(shared, req, &cached).await?;
    }

    import(shared, req, &cached).await
}

/// Fetch the image bytes to `dest`, atomically via a temp file
async fn download(shared: &FetcherShared, req: &FetchRequest, dest: &Path) -> Result<()> {
    let temp_path = shared
        .temp_dir
        .join(format!("{}.{}", req.name, Uuid::new_v4().simple()));

    debug!("Downloading '{}' from {}", req.name, req.source);
    let result = download_to(shared, &req.source, &temp_path, dest).await;
    if result.is_err() {
        if let Err(err) = tokio::fs::remove_file(&temp_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Could not remove temp file {}: {}",
                    temp_path.display(),
                    err
                );
            }
        }
    }
    result
}

async fn download_to(
    shared: &FetcherShared,
    source: &str,
    temp_path: &Path,
    dest: &Path,
) -> Result<()> {
    let response = shared
        .client
        .get(source)
        .send()
        .await
        .map_err(|e| StoreError::internal(format!("request to {} failed: {}", source, e)))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(StoreError::UnexpectedHttpCode {
            expected: 200,
            code: response.status().as_u16(),
            url: source.to_string(),
        });
    }

    let mut file = tokio::fs::File::create(temp_path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| StoreError::internal(format!("download body failed: {}", e)))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(temp_path, dest).await?;
    Ok(())
}

/// Open a cached image file, transparently uncompressing gzip
///
/// Peeks at the leading bytes the way content-type detection does; only
/// the gzip magic matters for snapshot streams.
fn open_image_reader(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = std::fs::File::open(path)?;
    let mut buffered = BufReader::with_capacity(512, file);
    let head = buffered.fill_buf()?;
    let gzipped = head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b;
    if gzipped {
        Ok(Box::new(flate2::read::GzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Receive the cached stream into a dataset and commit the image record
async fn import(shared: &FetcherShared, req: &FetchRequest, cached: &Path) -> FetchResult {
    debug!("Importing '{}' into {}", req.name, req.dest);

    let path = cached.to_path_buf();
    let reader = tokio::task::spawn_blocking(move || open_image_reader(&path))
        .await
        .map_err(|e| StoreError::internal(format!("import task failed: {}", e)))??;

    let dataset = shared.provider.receive_snapshot(reader, &req.dest).await?;

    if let Err(err) = tokio::fs::remove_file(cached).await {
        warn!("Could not remove cache file {}: {}", cached.display(), err);
    }

    let snapshots = shared.provider.snapshots(&dataset.name).await?;
    let snapshot = snapshots.first().ok_or_else(|| {
        StoreError::internal(format!("imported dataset {} has no snapshot", dataset.name))
    })?;

    let image = Image {
        id: req.name.clone(),
        volume: dataset.name.clone(),
        snapshot: snapshot.name.clone(),
        size: snapshot.volsize / 1024 / 1024,
        status: ImageStatus::Complete,
    };
    shared.catalog.put_record(IMAGES_BUCKET, &req.name, &image)?;

    Ok(image)
}
