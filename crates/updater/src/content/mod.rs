//! Content delivery client boundary
//!
//! The updater core never talks to the delivery service directly. A
//! [`ContentTransport`] authenticates and yields a [`Connection`]; the
//! connection hands out a [`ContentClient`] for listing depots, resolving
//! manifests and opening [`DownloadHandle`]s, which stream files to disk and
//! report [`TransferEvent`]s into a channel owned by the caller.
//!
//! [`http`] contains a reference implementation over a static JSON layout.

pub mod http;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ContentError, LoginError};
use crate::session::Credentials;

pub use http::HttpTransport;
pub use types::*;

/// Result type for content backend calls
pub type ContentResult<T> = std::result::Result<T, ContentError>;

/// Authenticating entry point of a backend
#[async_trait]
pub trait ContentTransport: Send + Sync {
    /// Log on, retrying internally at most `max_attempts` times.
    /// `auth_code` is a one-time second-factor code when the caller has one.
    async fn connect(
        &self,
        credentials: &Credentials,
        auth_code: Option<&str>,
        max_attempts: u32,
    ) -> std::result::Result<Arc<dyn Connection>, LoginError>;
}

/// One authenticated connection
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// The connection dropped or the service rejected it after logon
    fn is_faulted(&self) -> bool;

    fn os_identifier(&self) -> OsIdentifier;

    /// Content client fetching up to `workers` files in parallel
    fn content_client(&self, workers: usize) -> Arc<dyn ContentClient>;

    /// Tear the connection down; calling it twice is harmless
    async fn shutdown(&self);
}

/// Depot/manifest queries and download creation
#[async_trait]
pub trait ContentClient: Send + Sync {
    async fn list_depots(&self, app_id: AppId) -> ContentResult<Vec<Depot>>;

    async fn resolve_manifest_id(
        &self,
        app_id: AppId,
        depot_id: DepotId,
        branch: &str,
        branch_password: Option<&str>,
    ) -> ContentResult<ManifestId>;

    async fn workshop_item_details(&self, item_id: WorkshopItemId) -> ContentResult<WorkshopItemDetails>;

    async fn get_manifest(
        &self,
        app_id: AppId,
        depot_id: DepotId,
        manifest_id: ManifestId,
    ) -> ContentResult<Manifest>;

    async fn open_download(&self, request: OpenDownload) -> ContentResult<Arc<dyn DownloadHandle>>;
}

/// A prepared transfer of one manifest into one directory
#[async_trait]
pub trait DownloadHandle: Send + Sync {
    fn total_file_count(&self) -> usize;

    fn total_file_size(&self) -> u64;

    /// Fraction of bytes written, in `[0, 1]`
    fn total_progress(&self) -> f64;

    /// Verify `destination`, fetch whatever is missing or stale, and push
    /// events into `events`. Returns `ContentError::Cancelled` once `cancel`
    /// fires.
    async fn download_to_folder(
        &self,
        destination: &Path,
        events: TransferEventSender,
        cancel: CancellationToken,
    ) -> ContentResult<()>;

    /// Release resources; the handle must not be used afterwards
    fn dispose(&self);
}
