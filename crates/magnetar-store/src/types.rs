use magnetar_zfs::{Dataset, DatasetOptions};
use serde::{Deserialize, Serialize};

/// Import state of an image record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    /// A fetch is (or was) in progress for this image
    #[default]
    Pending,
    /// The image volume and snapshot exist in the pool
    Complete,
}

/// Durable catalog entry for an imported disk image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// Dataset path of the imported volume
    #[serde(default)]
    pub volume: String,
    /// Dataset path of the volume's single imported snapshot
    #[serde(default)]
    pub snapshot: String,
    /// MiB, derived from the snapshot volsize
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub status: ImageStatus,
}

/// A snapshot as reported at the API boundary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// MiB written since the previous snapshot
    #[serde(default)]
    pub size: u64,
}

impl Snapshot {
    pub fn from_dataset(ds: &Dataset) -> Self {
        Self {
            id: ds.name.clone(),
            size: ds.written / 1024 / 1024,
        }
    }
}

/// A zvol as reported at the API boundary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    /// MiB
    #[serde(default)]
    pub size: u64,
    /// Block device path under /dev/zvol
    #[serde(default)]
    pub device: String,
}

impl Volume {
    pub fn from_dataset(ds: &Dataset) -> Self {
        Self {
            id: ds.name.clone(),
            size: ds.volsize / 1024 / 1024,
            device: device_for_dataset(&ds.name),
        }
    }
}

/// A guest and its requested disks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

/// One disk in a guest's disk list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Image id to clone the disk from; empty for a blank disk
    #[serde(default)]
    pub image: String,
    /// MiB; filled from the image record when `image` is set
    #[serde(default)]
    pub size: u64,
    /// Dataset path chosen by the engine
    #[serde(default)]
    pub volume: String,
    /// Block device path handed to the guest
    #[serde(default)]
    pub source: String,
}

/// Block device path for a zvol dataset
pub fn device_for_dataset(name: &str) -> String {
    format!("/dev/zvol/{}", name)
}

/// Properties applied to every engine-created volume and clone
pub(crate) fn default_zfs_options() -> DatasetOptions {
    let mut opts = DatasetOptions::new();
    opts.insert("compression".to_string(), "lz4".to_string());
    opts
}
