//! Scripted in-memory content backend for unit tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::content::*;
use crate::error::{ContentError, LoginError, LoginFailureReason};
use crate::session::Credentials;
use crate::util::lock;

/// How one mocked download behaves
#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub files: Vec<(String, u64)>,
    /// Time spent per file
    pub step: Duration,
    /// Fail after the first file with this message
    pub fail_with: Option<String>,
    /// Keep writing files after the token fires
    pub ignore_cancel: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            files: vec![("data.bin".to_string(), 10)],
            step: Duration::from_millis(10),
            fail_with: None,
            ignore_cancel: false,
        }
    }
}

impl Script {
    pub fn slow(step: Duration) -> Self {
        Self {
            step,
            ..Self::default()
        }
    }

    pub fn stubborn(step: Duration) -> Self {
        Self {
            step,
            ignore_cancel: true,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct MockState {
    login_failure: Mutex<Option<LoginError>>,
    login_delay: Mutex<Duration>,
    required_auth_code: Mutex<Option<String>>,
    auth_codes: Mutex<Vec<Option<String>>>,
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
    connection: Mutex<Option<Arc<MockConnection>>>,
    depots: Mutex<Vec<Depot>>,
    list_depots_fails: AtomicBool,
    workshop: Mutex<HashMap<WorkshopItemId, WorkshopItemDetails>>,
    manifests: Mutex<HashMap<ManifestId, Manifest>>,
    manifest_requests: AtomicUsize,
    scripts: Mutex<HashMap<String, Script>>,
    started: Mutex<Vec<String>>,
    disposed: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Test handle over the shared mock state
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn ContentTransport> {
        Arc::new(MockTransport {
            state: self.state.clone(),
        })
    }

    pub fn fail_login(&self, error: LoginError) {
        *lock(&self.state.login_failure) = Some(error);
    }

    /// Reject every logon that does not carry `code`
    pub fn require_auth_code(&self, code: &str) {
        *lock(&self.state.required_auth_code) = Some(code.to_string());
    }

    /// Auth codes received by each connect call, in order
    pub fn auth_codes(&self) -> Vec<Option<String>> {
        lock(&self.state.auth_codes).clone()
    }

    pub fn set_login_delay(&self, delay: Duration) {
        *lock(&self.state.login_delay) = delay;
    }

    pub fn fault_connection(&self) {
        if let Some(connection) = lock(&self.state.connection).as_ref() {
            connection.faulted.store(true, Ordering::SeqCst);
        }
    }

    pub fn set_depots(&self, depots: Vec<Depot>) {
        *lock(&self.state.depots) = depots;
    }

    pub fn fail_list_depots(&self) {
        self.state.list_depots_fails.store(true, Ordering::SeqCst);
    }

    pub fn set_workshop_item(&self, item_id: WorkshopItemId, time_updated: u64) {
        lock(&self.state.workshop).insert(
            item_id,
            WorkshopItemDetails {
                manifest_id: ManifestId(item_id),
                time_updated,
            },
        );
    }

    pub fn set_manifest(&self, manifest: Manifest) {
        lock(&self.state.manifests).insert(manifest.id, manifest);
    }

    /// Behaviour of the download whose source renders as `key` ("depot 1", "item 7")
    pub fn script(&self, key: &str, script: Script) {
        lock(&self.state.scripts).insert(key.to_string(), script);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    pub fn manifest_requests(&self) -> usize {
        self.state.manifest_requests.load(Ordering::SeqCst)
    }

    /// Keys of downloads that started transferring, in start order
    pub fn started(&self) -> Vec<String> {
        lock(&self.state.started).clone()
    }

    pub fn disposed(&self) -> Vec<String> {
        lock(&self.state.disposed).clone()
    }

    /// Highest number of transfers running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    state: Arc<MockState>,
}

#[async_trait]
impl ContentTransport for MockTransport {
    async fn connect(
        &self,
        _credentials: &Credentials,
        auth_code: Option<&str>,
        _max_attempts: u32,
    ) -> Result<Arc<dyn Connection>, LoginError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.auth_codes).push(auth_code.map(str::to_string));
        let delay = *lock(&self.state.login_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.state.login_failure).clone() {
            return Err(error);
        }
        if let Some(expected) = lock(&self.state.required_auth_code).as_deref() {
            if auth_code != Some(expected) {
                return Err(LoginError::new(LoginFailureReason::AuthCodeRequired, "AuthCodeRequired"));
            }
        }

        let connection = Arc::new(MockConnection {
            state: self.state.clone(),
            connected: AtomicBool::new(true),
            faulted: AtomicBool::new(false),
        });
        *lock(&self.state.connection) = Some(connection.clone());
        Ok(connection)
    }
}

struct MockConnection {
    state: Arc<MockState>,
    connected: AtomicBool,
    faulted: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    fn os_identifier(&self) -> OsIdentifier {
        OsIdentifier::default()
    }

    fn content_client(&self, _workers: usize) -> Arc<dyn ContentClient> {
        Arc::new(MockClient {
            state: self.state.clone(),
        })
    }

    async fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockClient {
    state: Arc<MockState>,
}

fn source_key(source: &ContentSource) -> String {
    match source {
        ContentSource::Depot { depot_id, .. } => format!("depot {}", depot_id),
        ContentSource::Workshop { item_id } => format!("item {}", item_id),
    }
}

#[async_trait]
impl ContentClient for MockClient {
    async fn list_depots(&self, _app_id: AppId) -> ContentResult<Vec<Depot>> {
        if self.state.list_depots_fails.load(Ordering::SeqCst) {
            return Err(ContentError::Backend("depot listing unavailable".to_string()));
        }
        Ok(lock(&self.state.depots).clone())
    }

    async fn resolve_manifest_id(
        &self,
        _app_id: AppId,
        depot_id: DepotId,
        _branch: &str,
        _branch_password: Option<&str>,
    ) -> ContentResult<ManifestId> {
        Ok(ManifestId(depot_id as u64 * 10))
    }

    async fn workshop_item_details(&self, item_id: WorkshopItemId) -> ContentResult<WorkshopItemDetails> {
        Ok(lock(&self.state.workshop)
            .get(&item_id)
            .copied()
            .unwrap_or(WorkshopItemDetails {
                manifest_id: ManifestId(item_id),
                time_updated: 0,
            }))
    }

    async fn get_manifest(
        &self,
        _app_id: AppId,
        _depot_id: DepotId,
        manifest_id: ManifestId,
    ) -> ContentResult<Manifest> {
        self.state.manifest_requests.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.manifests)
            .get(&manifest_id)
            .cloned()
            .ok_or_else(|| ContentError::NotFound {
                what: format!("manifest {}", manifest_id),
            })
    }

    async fn open_download(&self, request: OpenDownload) -> ContentResult<Arc<dyn DownloadHandle>> {
        let key = source_key(&request.source);
        let script = lock(&self.state.scripts).get(&key).cloned().unwrap_or_default();
        Ok(Arc::new(MockHandle {
            state: self.state.clone(),
            key,
            script,
            written: AtomicUsize::new(0),
        }))
    }
}

struct MockHandle {
    state: Arc<MockState>,
    key: String,
    script: Script,
    written: AtomicUsize,
}

/// Decrements the active-transfer counter even when the task is aborted
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DownloadHandle for MockHandle {
    fn total_file_count(&self) -> usize {
        self.script.files.len()
    }

    fn total_file_size(&self) -> u64 {
        self.script.files.iter().map(|(_, size)| size).sum()
    }

    fn total_progress(&self) -> f64 {
        let total = self.script.files.len();
        if total == 0 {
            return 1.0;
        }
        self.written.load(Ordering::SeqCst) as f64 / total as f64
    }

    async fn download_to_folder(
        &self,
        destination: &Path,
        events: TransferEventSender,
        cancel: CancellationToken,
    ) -> ContentResult<()> {
        lock(&self.state.started).push(self.key.clone());
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.state.active);

        for (name, size) in &self.script.files {
            let _ = events.send(TransferEvent::FileVerified {
                file: ManifestFile::new(name.clone(), *size),
                requires_download: true,
            });
        }
        let _ = events.send(TransferEvent::VerificationCompleted {
            queued_files: self.script.files.len(),
            queued_bytes: self.total_file_size(),
        });

        for (name, size) in &self.script.files {
            if self.script.ignore_cancel {
                tokio::time::sleep(self.script.step).await;
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ContentError::Cancelled),
                    _ = tokio::time::sleep(self.script.step) => {}
                }
            }

            let path = destination.join(name);
            tokio::fs::write(&path, vec![0u8; *size as usize])
                .await
                .map_err(|e| ContentError::io(&path, e))?;
            self.written.fetch_add(1, Ordering::SeqCst);
            let _ = events.send(TransferEvent::FileDownloaded {
                file_name: name.clone(),
                size: *size,
            });

            if let Some(message) = &self.script.fail_with {
                return Err(ContentError::Backend(message.clone()));
            }
        }

        let _ = events.send(TransferEvent::DownloadComplete);
        Ok(())
    }

    fn dispose(&self) {
        lock(&self.state.disposed).push(self.key.clone());
    }
}
