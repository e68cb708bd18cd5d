use crate::{Config, ImageStore};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use magnetar_zfs::MockProvider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const TEST_POOL: &str = "test";

/// An engine wired to a mock provider and a tempdir-backed catalog
pub(crate) struct TestStore {
    pub store: Arc<ImageStore>,
    pub provider: Arc<MockProvider>,
    _tempdir: tempfile::TempDir,
}

pub(crate) async fn test_store(pool_avail: u64, image_server: &str) -> TestStore {
    let tempdir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(TEST_POOL, pool_avail));

    let mut config = Config::new(image_server, TEST_POOL);
    config.image_dir = Some(tempdir.path().to_path_buf());
    config.num_fetchers = 4;

    let store = ImageStore::create(config, provider.clone())
        .await
        .unwrap();

    TestStore {
        store: Arc::new(store),
        provider,
        _tempdir: tempdir,
    }
}

#[derive(Clone)]
struct ImageServiceState {
    images: Arc<HashMap<String, Vec<u8>>>,
    downloads: Arc<AtomicUsize>,
    delay: Duration,
}

/// A local stand-in for the remote image catalog
///
/// Serves `GET /images/<id>/download` from a fixed map and counts the
/// downloads it actually performed, so tests can assert coalescing.
pub(crate) struct MockImageService {
    pub host: String,
    downloads: Arc<AtomicUsize>,
}

impl MockImageService {
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

async fn serve_download(
    Path(id): Path<String>,
    State(state): State<ImageServiceState>,
) -> axum::response::Response {
    match state.images.get(&id) {
        Some(bytes) => {
            state.downloads.fetch_add(1, Ordering::SeqCst);
            // Hold the response open long enough for requests to overlap
            tokio::time::sleep(state.delay).await;
            bytes.clone().into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub(crate) async fn mock_image_service(
    images: HashMap<String, Vec<u8>>,
    delay: Duration,
) -> MockImageService {
    let downloads = Arc::new(AtomicUsize::new(0));
    let state = ImageServiceState {
        images: Arc::new(images),
        downloads: downloads.clone(),
        delay,
    };
    let app = Router::new()
        .route("/images/{id}/download", get(serve_download))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockImageService {
        host: addr.to_string(),
        downloads,
    }
}

/// A raw image stream as the mock provider understands it
pub(crate) fn image_payload(tag: &str, volsize: u64) -> Vec<u8> {
    MockProvider::image_stream(tag, volsize)
}

/// The same stream, gzip-compressed
pub(crate) fn gzip_payload(tag: &str, volsize: u64) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&image_payload(tag, volsize)).unwrap();
    encoder.finish().unwrap()
}
