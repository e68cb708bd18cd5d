use std::path::PathBuf;

/// Image store configuration
///
/// Defaults reproduce the agent's production layout: everything lives
/// under `/<zpool>/images` on the pool's mountpoint.
#[derive(Debug, Clone)]
pub struct Config {
    /// host:port of the image catalog HTTP server
    pub image_server: String,
    /// Pool name; all managed datasets live under it
    pub zpool: String,
    /// Simultaneous active fetches (0 = max(5, CPU count))
    pub num_fetchers: usize,
    /// Bound on the fetch admission queue (0 = minimal buffering)
    pub max_pending: usize,
    /// Override for the image directory root (catalog file + temp dir);
    /// defaults to `/<zpool>/images`
    pub image_dir: Option<PathBuf>,
}

impl Config {
    pub fn new(image_server: impl Into<String>, zpool: impl Into<String>) -> Self {
        Self {
            image_server: image_server.into(),
            zpool: zpool.into(),
            num_fetchers: 0,
            max_pending: 0,
            image_dir: None,
        }
    }

    /// Parent dataset of imported image volumes: `<zpool>/images`
    pub(crate) fn images_dataset(&self) -> String {
        format!("{}/images", self.zpool)
    }

    /// Parent dataset of guest disks: `<zpool>/guests`
    pub(crate) fn guests_dataset(&self) -> String {
        format!("{}/guests", self.zpool)
    }

    /// Host directory holding the catalog file and download scratch space
    pub(crate) fn image_dir(&self) -> PathBuf {
        self.image_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/{}/images", self.zpool)))
    }

    /// Download scratch directory
    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.image_dir().join("temp")
    }

    /// Catalog database file
    pub(crate) fn catalog_path(&self) -> PathBuf {
        self.image_dir().join(".images.db")
    }

    /// Number of simultaneous active fetches
    pub(crate) fn concurrency(&self) -> usize {
        if self.num_fetchers > 0 {
            self.num_fetchers
        } else {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cpus.max(5)
        }
    }
}
