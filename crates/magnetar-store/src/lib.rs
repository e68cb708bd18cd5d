//! Magnetar Store - image acquisition and lifecycle engine
//!
//! This crate provides:
//! - The coalescing, bounded-concurrency image fetch pipeline
//! - The single-writer clone serializer
//! - Image, snapshot, volume, and guest disk operations
//! - Space accounting and catalog/dataset reconciliation

mod clone;
mod config;
mod error;
mod fetch;
mod guest;
mod snapshot;
mod store;
#[cfg(test)]
mod testutil;
mod types;
mod volume;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, StoreError};
pub use store::ImageStore;
pub use types::{device_for_dataset, Disk, Guest, Image, ImageStatus, Snapshot, Volume};
