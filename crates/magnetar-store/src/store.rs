use crate::clone::CloneWorker;
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::{default_zfs_options, Image, ImageStatus, Volume};
use magnetar_catalog::Catalog;
use magnetar_zfs::{DatasetOptions, DatasetProvider, ZfsErrorKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Catalog bucket holding image records
pub(crate) const IMAGES_BUCKET: &str = "images";

/// The image store engine
///
/// Owns the temp directory and every dataset rooted at `<pool>/images`;
/// guest datasets under `<pool>/guests` are created and destroyed here
/// but not otherwise mutated.
pub struct ImageStore {
    pub(crate) config: Config,
    pub(crate) provider: Arc<dyn DatasetProvider>,
    pub(crate) catalog: Arc<Catalog>,
    fetcher: Fetcher,
    pub(crate) cloner: CloneWorker,
    quit: CancellationToken,
    tracker: TaskTracker,
}

impl ImageStore {
    /// Create an image store: ensure the image dataset and temp directory
    /// exist, open the catalog, reconcile it against the pool, and start
    /// the background workers.
    pub async fn create(config: Config, provider: Arc<dyn DatasetProvider>) -> Result<Self> {
        let images_dataset = config.images_dataset();
        match provider.get_dataset(&images_dataset).await {
            Ok(_) => {}
            Err(err) if err.kind == ZfsErrorKind::NotFound => {
                info!("Creating image dataset {}", images_dataset);
                provider
                    .create_filesystem(&images_dataset, &DatasetOptions::new())
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        let temp_dir = config.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
            StoreError::internal(format!(
                "could not create temp dir {}: {}",
                temp_dir.display(),
                e
            ))
        })?;

        let catalog = Arc::new(Catalog::open(config.catalog_path())?);

        let quit = CancellationToken::new();
        let tracker = TaskTracker::new();
        let fetcher = Fetcher::new(
            provider.clone(),
            catalog.clone(),
            temp_dir,
            config.concurrency(),
            config.max_pending,
            quit.clone(),
            tracker.clone(),
        );
        let cloner = CloneWorker::new(provider.clone(), quit.clone(), tracker.clone());

        let store = Self {
            config,
            provider,
            catalog,
            fetcher,
            cloner,
            quit,
            tracker,
        };
        store.reconcile().await?;
        Ok(store)
    }

    /// Reconcile catalog records against dataset state
    ///
    /// A crash can leave a `pending` record without a dataset, or a record
    /// whose datasets were destroyed out from under it. Promote `pending`
    /// records whose import actually finished; drop the rest.
    pub async fn reconcile(&self) -> Result<()> {
        let mut records: Vec<Image> = Vec::new();
        self.catalog.for_each(IMAGES_BUCKET, |_, value| {
            records.push(serde_json::from_slice(value)?);
            Ok(())
        })?;

        for image in records {
            let volume = if image.volume.is_empty() {
                format!("{}/{}", self.config.images_dataset(), image.id)
            } else {
                image.volume.clone()
            };

            let dataset = match self.provider.get_dataset(&volume).await {
                Ok(ds) => Some(ds),
                Err(err) if err.kind == ZfsErrorKind::NotFound => None,
                Err(err) => return Err(err.into()),
            };

            match (image.status, dataset) {
                (ImageStatus::Pending, Some(dataset)) => {
                    let snapshots = self.provider.snapshots(&dataset.name).await?;
                    if let Some(snapshot) = snapshots.first() {
                        info!("Promoting pending image '{}' to complete", image.id);
                        let promoted = Image {
                            id: image.id.clone(),
                            volume: dataset.name.clone(),
                            snapshot: snapshot.name.clone(),
                            size: snapshot.volsize / 1024 / 1024,
                            status: ImageStatus::Complete,
                        };
                        self.catalog
                            .put_record(IMAGES_BUCKET, &image.id, &promoted)?;
                    } else {
                        warn!("Dropping pending image '{}': no snapshot", image.id);
                        self.catalog.delete(IMAGES_BUCKET, &image.id)?;
                    }
                }
                (ImageStatus::Pending, None) => {
                    warn!("Dropping pending image '{}': dataset missing", image.id);
                    self.catalog.delete(IMAGES_BUCKET, &image.id)?;
                }
                (ImageStatus::Complete, None) => {
                    warn!("Dropping image '{}': dataset missing", image.id);
                    self.catalog.delete(IMAGES_BUCKET, &image.id)?;
                }
                (ImageStatus::Complete, Some(_)) => {}
            }
        }
        Ok(())
    }

    /// Run until `token` is cancelled, then stop every worker
    ///
    /// Returns only after the dispatcher, clone worker, and any in-flight
    /// fetch tasks have finished; callers may then tear down the process.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Image store running: pool '{}', image server '{}'",
            self.config.zpool, self.config.image_server
        );
        token.cancelled().await;

        info!("Image store shutting down");
        self.quit.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Image store stopped");
        Ok(())
    }

    /// Read an image record, failing NotFound when absent
    pub(crate) async fn image_record(&self, id: &str) -> Result<Image> {
        self.catalog
            .get_record::<Image>(IMAGES_BUCKET, id)?
            .ok_or_else(|| StoreError::not_found(format!("image not found: {}", id)))
    }

    /// Fetch an image from the image service, reusing any local copy
    ///
    /// Concurrent requests for the same id share one download; every
    /// caller gets the same outcome.
    pub async fn request_image(&self, id: &str) -> Result<Image> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        match self.catalog.get_record::<Image>(IMAGES_BUCKET, id)? {
            Some(image) if image.status == ImageStatus::Complete => return Ok(image),
            _ => {}
        }

        let request = FetchRequest {
            name: id.to_string(),
            source: format!("http://{}/images/{}/download", self.config.image_server, id),
            dest: format!("{}/{}", self.config.images_dataset(), id),
        };
        self.fetcher.fetch(request).await?;

        // Read back what the fetch committed
        self.image_record(id).await
    }

    /// List every image record, any status
    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        self.catalog.for_each(IMAGES_BUCKET, |_, value| {
            images.push(serde_json::from_slice(value)?);
            Ok(())
        })?;
        Ok(images)
    }

    /// Get one image record
    pub async fn get_image(&self, id: &str) -> Result<Image> {
        self.image_record(id).await
    }

    /// Delete an image: its snapshot, its volume, then its record
    pub async fn delete_image(&self, id: &str) -> Result<Image> {
        let image = self.image_record(id).await?;

        for name in [&image.snapshot, &image.volume] {
            if name.is_empty() {
                continue;
            }
            match self.provider.get_dataset(name).await {
                Ok(dataset) => self.provider.destroy(&dataset.name, false).await?,
                Err(err) if err.kind == ZfsErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.catalog.delete(IMAGES_BUCKET, id)?;
        Ok(image)
    }

    /// Clone an image's snapshot into a writable volume at `dest`
    pub async fn clone_image(&self, id: &str, dest: &str) -> Result<Volume> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }
        if dest.is_empty() {
            return Err(StoreError::invalid_argument("need a dest"));
        }

        let image = self.image_record(id).await?;
        let clone = self
            .provider
            .clone_snapshot(&image.snapshot, dest, &default_zfs_options())
            .await?;
        Ok(Volume::from_dataset(&clone))
    }

    /// Full dataset path for an API-level id
    pub(crate) fn pool_path(&self, id: &str) -> String {
        if id.is_empty() {
            self.config.zpool.clone()
        } else {
            format!("{}/{}", self.config.zpool, id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        gzip_payload, image_payload, mock_image_service, test_store, TEST_POOL,
    };
    use crate::types::ImageStatus;
    use std::collections::HashMap;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    async fn store_with_image(id: &str) -> (crate::testutil::TestStore, crate::testutil::MockImageService) {
        let mut images = HashMap::new();
        images.insert(id.to_string(), image_payload("base", 64 * MIB));
        let service = mock_image_service(images, Duration::from_millis(0)).await;
        let fixture = test_store(1 << 30, &service.host).await;
        (fixture, service)
    }

    #[tokio::test]
    async fn test_request_image_imports_and_records() {
        let (fixture, service) = store_with_image("img-1").await;

        let image = fixture.store.request_image("img-1").await.unwrap();
        assert_eq!(image.id, "img-1");
        assert_eq!(image.status, ImageStatus::Complete);
        assert_eq!(image.volume, format!("{}/images/img-1", TEST_POOL));
        assert_eq!(image.snapshot, format!("{}/images/img-1@base", TEST_POOL));
        assert_eq!(image.size, 64);
        assert_eq!(service.downloads(), 1);

        assert!(fixture.provider.exists("test/images/img-1").await);
        assert!(fixture.provider.exists("test/images/img-1@base").await);

        // A second request is served from the catalog
        let again = fixture.store.request_image("img-1").await.unwrap();
        assert_eq!(again, image);
        assert_eq!(service.downloads(), 1);
    }

    #[tokio::test]
    async fn test_request_image_coalesces_concurrent_requests() {
        let mut images = HashMap::new();
        images.insert("img-1".to_string(), image_payload("base", 64 * MIB));
        let service = mock_image_service(images, Duration::from_millis(200)).await;
        let fixture = test_store(1 << 30, &service.host).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = fixture.store.clone();
            handles.push(tokio::spawn(async move {
                store.request_image("img-1").await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(service.downloads(), 1);
        for image in &results {
            assert_eq!(image, &results[0]);
            assert_eq!(image.status, ImageStatus::Complete);
        }
    }

    #[tokio::test]
    async fn test_request_image_gzip() {
        let mut images = HashMap::new();
        images.insert("gzip-img".to_string(), gzip_payload("base", 32 * MIB));
        let service = mock_image_service(images, Duration::from_millis(0)).await;
        let fixture = test_store(1 << 30, &service.host).await;

        let image = fixture.store.request_image("gzip-img").await.unwrap();
        assert_eq!(image.status, ImageStatus::Complete);
        assert_eq!(image.size, 32);
    }

    #[tokio::test]
    async fn test_request_image_unknown_id_fails_with_http_code() {
        let (fixture, _service) = store_with_image("img-1").await;

        let err = fixture.store.request_image("nope").await.unwrap_err();
        match err {
            StoreError::UnexpectedHttpCode { expected, code, .. } => {
                assert_eq!(expected, 200);
                assert_eq!(code, 404);
            }
            other => panic!("expected UnexpectedHttpCode, got {:?}", other),
        }

        // The transient pending record is gone
        let err = fixture.store.get_image("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_request_image_empty_id() {
        let (fixture, _service) = store_with_image("img-1").await;
        let err = fixture.store.request_image("").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_list_and_get_images() {
        let (fixture, _service) = store_with_image("img-1").await;

        assert!(fixture.store.list_images().await.unwrap().is_empty());

        fixture.store.request_image("img-1").await.unwrap();

        let images = fixture.store.list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "img-1");

        let image = fixture.store.get_image("img-1").await.unwrap();
        assert_eq!(image.id, "img-1");

        let err = fixture.store.get_image("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_image_removes_datasets_and_record() {
        let (fixture, _service) = store_with_image("img-1").await;
        let image = fixture.store.request_image("img-1").await.unwrap();

        let deleted = fixture.store.delete_image("img-1").await.unwrap();
        assert_eq!(deleted.id, image.id);

        assert!(!fixture.provider.exists(&image.snapshot).await);
        assert!(!fixture.provider.exists(&image.volume).await);
        let err = fixture.store.get_image("img-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        // Deleting again reports the record missing
        let err = fixture.store.delete_image("img-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_clone_image() {
        let (fixture, _service) = store_with_image("img-1").await;
        fixture.store.request_image("img-1").await.unwrap();

        let err = fixture.store.clone_image("img-1", "").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));

        let err = fixture
            .store
            .clone_image("missing", "test/images/c1")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let volume = fixture
            .store
            .clone_image("img-1", "test/images/c1")
            .await
            .unwrap();
        assert_eq!(volume.id, "test/images/c1");
        assert_eq!(volume.size, 64);
        assert_eq!(volume.device, "/dev/zvol/test/images/c1");
        assert!(fixture.provider.exists("test/images/c1").await);
    }

    #[tokio::test]
    async fn test_reconcile_promotes_and_prunes() {
        let (fixture, _service) = store_with_image("img-1").await;

        // A pending record whose import actually finished
        fixture
            .provider
            .receive_snapshot(
                Box::new(std::io::Cursor::new(image_payload("base", 16 * MIB))),
                "test/images/done",
            )
            .await
            .unwrap();
        let pending_done = Image {
            id: "done".to_string(),
            status: ImageStatus::Pending,
            ..Default::default()
        };
        fixture
            .store
            .catalog
            .put_record(IMAGES_BUCKET, "done", &pending_done)
            .unwrap();

        // A pending record with nothing behind it
        let orphan = Image {
            id: "orphan".to_string(),
            status: ImageStatus::Pending,
            ..Default::default()
        };
        fixture
            .store
            .catalog
            .put_record(IMAGES_BUCKET, "orphan", &orphan)
            .unwrap();

        fixture.store.reconcile().await.unwrap();

        let promoted = fixture.store.get_image("done").await.unwrap();
        assert_eq!(promoted.status, ImageStatus::Complete);
        assert_eq!(promoted.volume, "test/images/done");
        assert_eq!(promoted.snapshot, "test/images/done@base");
        assert_eq!(promoted.size, 16);

        let err = fixture.store.get_image("orphan").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_fetches() {
        let (fixture, _service) = store_with_image("img-1").await;

        let token = CancellationToken::new();
        let store = fixture.store.clone();
        let run_token = token.clone();
        let run_handle = tokio::spawn(async move { store.run(run_token).await });

        token.cancel();
        run_handle.await.unwrap().unwrap();

        let err = fixture.store.request_image("img-1").await.unwrap_err();
        assert!(matches!(err, StoreError::FetcherStopped));
    }
}
