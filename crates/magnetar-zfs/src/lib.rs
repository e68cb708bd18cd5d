//! Magnetar ZFS - dataset provider abstraction
//!
//! This crate provides:
//! - The `DatasetProvider` trait consumed by the image store engine
//! - `ZfsProvider`, shelling out to the `zfs` CLI
//! - `MockProvider`, an in-memory implementation for development and tests
//! - Typed error kinds so callers never match on ZFS error text

mod command;
pub mod error;
pub mod mock;
pub mod provider;
pub mod zfs;

pub use error::{Result, ZfsError, ZfsErrorKind};
pub use mock::MockProvider;
pub use provider::{Dataset, DatasetKind, DatasetOptions, DatasetProvider};
pub use zfs::ZfsProvider;
