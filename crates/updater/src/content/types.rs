//! Value types exchanged with a content delivery backend

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type AppId = u32;
pub type DepotId = u32;
pub type WorkshopItemId = u64;

/// Identifier of one immutable manifest (snapshot of a depot or workshop item)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub u64);

impl std::fmt::Display for ManifestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Depot advertised by an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depot {
    pub id: DepotId,
    pub name: String,
}

impl Depot {
    pub fn new<S: Into<String>>(id: DepotId, name: S) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// One file listed by a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the install directory, separators as published
    pub file_name: String,
    pub total_size: u64,
    /// Base64 of the little-endian xxHash64 digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xxhash64: Option<String>,
}

impl ManifestFile {
    pub fn new<S: Into<String>>(file_name: S, total_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            total_size,
            xxhash64: None,
        }
    }
}

/// Complete file list of one manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: ManifestId,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.total_size).sum()
    }
}

/// Remote state of a workshop item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopItemDetails {
    pub manifest_id: ManifestId,
    /// Unix seconds of the last publish
    pub time_updated: u64,
}

/// Operating system the session downloads content for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OsIdentifier(pub String);

impl Default for OsIdentifier {
    fn default() -> Self {
        OsIdentifier("windows".to_string())
    }
}

impl std::fmt::Display for OsIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a download handle should fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    Depot {
        app_id: AppId,
        depot_id: DepotId,
        branch: String,
        branch_password: Option<String>,
    },
    Workshop {
        item_id: WorkshopItemId,
    },
}

impl std::fmt::Display for ContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentSource::Depot {
                app_id,
                depot_id,
                branch,
                ..
            } => write!(f, "app {}, depot {} ({})", app_id, depot_id, branch),
            ContentSource::Workshop { item_id } => write!(f, "item {}", item_id),
        }
    }
}

/// Arguments of [`ContentClient::open_download`](super::ContentClient::open_download)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDownload {
    pub source: ContentSource,
    /// Explicit manifest, or the latest one when `None`
    pub manifest_id: Option<ManifestId>,
    pub os: OsIdentifier,
}

/// Events a download handle pushes while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A local file was checked against the manifest
    FileVerified {
        file: ManifestFile,
        requires_download: bool,
    },
    /// Local verification is over; these files will be fetched
    VerificationCompleted {
        queued_files: usize,
        queued_bytes: u64,
    },
    /// One file was written to disk
    FileDownloaded { file_name: String, size: u64 },
    /// Every queued file was written
    DownloadComplete,
}

/// Orchestrator-owned channel a handle reports into
pub type TransferEventSender = mpsc::UnboundedSender<TransferEvent>;
