//! Transfer backend seam
//!
//! The registry drives the embedded swarm engine and the external daemon
//! through this one trait.

use crate::error::Result;
use crate::types::{Backend, TransferSnapshot};
use async_trait::async_trait;
use std::path::PathBuf;

/// What a backend needs to begin a transfer
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source_uri: String,
    pub display_name: String,
    /// Already-created destination directory
    pub destination: PathBuf,
    /// Output filename override, where the backend supports one
    pub filename: Option<String>,
    /// Caller-side identifier carried through to events and logs
    pub correlation_id: String,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    fn kind(&self) -> Backend;

    /// Begin a transfer. The returned snapshot's `id` is the task id.
    async fn start(&self, request: &StartRequest) -> Result<TransferSnapshot>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    async fn cancel(&self, id: &str) -> Result<()>;

    async fn snapshot(&self, id: &str) -> Result<TransferSnapshot>;
}
