//! Magnetar Server - HTTP surface of the image store
//!
//! This crate provides:
//! - The JSON-RPC 1.0 dispatcher at `POST /_magnetar_rpc`
//! - The raw snapshot streaming endpoint at `POST /snapshots/download`

mod download;
mod rpc;
mod server;

pub use server::{ApiServer, Config};
