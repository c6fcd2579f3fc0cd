//! Reference content backend over HTTP and a static JSON layout
//!
//! Layout relative to the configured base URL:
//!
//! | Request | Response |
//! |---------|----------|
//! | `POST auth/logon` | `{session_token, auth_token?, os?}` |
//! | `GET apps/{app}/depots` | `[{id, name}]` |
//! | `GET apps/{app}/depots/{depot}/branches/{branch}` | `{manifest_id}` |
//! | `GET workshop/{item}` | `{manifest_id, time_updated}` |
//! | `GET apps/{app}/depots/{depot}/manifests/{manifest}` | `{id, files}` |
//! | `GET depots/{depot}/manifests/{manifest}/files/{path..}` | file bytes |
//!
//! Credentialed logon bodies carry `username`, `password`, `api_key`, the
//! stored `auth_token` and an optional one-time `auth_code`.
//!
//! Branch passwords travel in the `X-Branch-Password` header. Every request
//! after logon carries the session token as a bearer token.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures::{StreamExt, stream};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};
use url::Url;
use xxhash_rust::xxh64::Xxh64;

use super::{
    AppId, Connection, ContentClient, ContentResult, ContentSource, ContentTransport, Depot, DepotId,
    DownloadHandle, Manifest, ManifestFile, ManifestId, OpenDownload, OsIdentifier, TransferEvent,
    TransferEventSender, WorkshopItemDetails, WorkshopItemId,
};
use crate::config::UpdaterConfig;
use crate::error::{ContentError, LoginError, LoginFailureReason, UpdaterError};
use crate::session::Credentials;

pub const BRANCH_PASSWORD_HEADER: &str = "X-Branch-Password";

/// Base64 of the little-endian xxHash64 digest, as manifests publish it
pub fn xxhash64_base64(hash: u64) -> String {
    base64::engine::general_purpose::STANDARD.encode(hash.to_le_bytes())
}

#[derive(Debug, Deserialize)]
struct LogonResponse {
    session_token: String,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    os: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LogonFailure {
    #[serde(default)]
    result: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    manifest_id: ManifestId,
}

/// Authenticates against the HTTP backend
pub struct HttpTransport {
    client: Client,
    base: Url,
    config: Arc<UpdaterConfig>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("base", &self.base.as_str()).finish()
    }
}

impl HttpTransport {
    pub fn new(config: &UpdaterConfig) -> crate::error::Result<Self> {
        let mut cdn_url = config.cdn_url.trim().to_string();
        if !cdn_url.ends_with('/') {
            cdn_url.push('/');
        }
        let base = Url::parse(&cdn_url).map_err(|e| UpdaterError::Configuration {
            message: format!("invalid content URL '{}': {}", config.cdn_url, e),
            field: Some("cdn_url".to_string()),
            suggestion: Some("Use an absolute http(s) URL such as http://127.0.0.1:8080/".to_string()),
        })?;
        if base.cannot_be_a_base() {
            return Err(UpdaterError::Configuration {
                message: format!("content URL '{}' cannot be used as a base", config.cdn_url),
                field: Some("cdn_url".to_string()),
                suggestion: None,
            });
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .cookie_store(true)
            .build()
            .map_err(|source| ContentError::Http {
                url: base.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            base,
            config: Arc::new(config.clone()),
        })
    }

    fn auth_artifact(&self, credentials: &Credentials) -> Option<PathBuf> {
        let username = credentials.username()?;
        let dir = self.config.auth_dir.as_ref()?;
        Some(dir.join(format!("{}.key", username)))
    }

    async fn logon_once(
        &self,
        credentials: &Credentials,
        auth_code: Option<&str>,
    ) -> Result<LogonResponse, LoginError> {
        let url = self
            .base
            .join("auth/logon")
            .map_err(|e| LoginError::new(LoginFailureReason::Transport, e.to_string()))?;
        let artifact = self.auth_artifact(credentials);
        let stored_token = match &artifact {
            Some(path) => fs::read_to_string(path).await.ok().map(|t| t.trim().to_string()),
            None => None,
        };

        let body = match credentials {
            Credentials::Anonymous => serde_json::json!({ "anonymous": true }),
            Credentials::Credentialed {
                username,
                secret,
                api_key,
            } => serde_json::json!({
                "username": username,
                "password": secret,
                "api_key": api_key,
                "auth_token": stored_token,
                "auth_code": auth_code,
            }),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LoginError::new(LoginFailureReason::Transport, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<LogonResponse>()
                .await
                .map_err(|e| LoginError::new(LoginFailureReason::Transport, format!("malformed logon response: {}", e)));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let failure = response.json::<LogonFailure>().await.unwrap_or_default();
            let reason = match failure.result.as_str() {
                "InvalidPassword" if stored_token.is_some() => LoginFailureReason::StaleAuthArtifacts,
                "AuthCodeRequired" | "TwoFactorCodeMismatch" => LoginFailureReason::AuthCodeRequired,
                _ => LoginFailureReason::InvalidCredentials,
            };
            let message = failure
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| {
                    if failure.result.is_empty() {
                        status.to_string()
                    } else {
                        failure.result.clone()
                    }
                });
            return Err(LoginError::new(reason, message));
        }

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LoginError::new(
                LoginFailureReason::Transport,
                format!("logon returned {}", status),
            ));
        }

        Err(LoginError::new(
            LoginFailureReason::InvalidCredentials,
            format!("logon returned {}", status),
        ))
    }

    async fn store_auth_token(&self, credentials: &Credentials, token: &str) {
        let Some(path) = self.auth_artifact(credentials) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!("Could not create auth artifact directory {}: {}", parent.display(), e);
                return;
            }
        }
        match fs::write(&path, token).await {
            Ok(()) => debug!("Stored auth artifact at {}", path.display()),
            Err(e) => warn!("Could not store auth artifact at {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl ContentTransport for HttpTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
        auth_code: Option<&str>,
        max_attempts: u32,
    ) -> Result<Arc<dyn Connection>, LoginError> {
        let attempts = max_attempts.max(1);
        let delays: Vec<Duration> = (0..attempts - 1)
            .map(|attempt| self.config.get_retry_delay(attempt as usize))
            .collect();

        let result = RetryIf::spawn(
            delays,
            move || self.logon_once(credentials, auth_code),
            |e: &LoginError| e.reason == LoginFailureReason::Transport,
        )
        .instrument(debug_span!("logon", user = credentials.display_name()))
        .await;

        let response = result.map_err(|e| {
            if e.reason == LoginFailureReason::Transport && attempts > 1 {
                LoginError::new(
                    LoginFailureReason::TooManyAttempts,
                    format!("{} logon attempts failed, last error: {}", attempts, e.message),
                )
            } else {
                e
            }
        })?;

        if let Some(token) = &response.auth_token {
            self.store_auth_token(credentials, token).await;
        }

        info!("Logged on to {} as {}", self.base, credentials.display_name());
        Ok(Arc::new(HttpConnection {
            api: Api {
                client: self.client.clone(),
                base: self.base.clone(),
                token: response.session_token,
                config: self.config.clone(),
                faulted: Arc::new(AtomicBool::new(false)),
            },
            os: response.os.map(OsIdentifier).unwrap_or_default(),
            connected: AtomicBool::new(true),
        }))
    }
}

/// Authenticated request plumbing shared by clients and handles
#[derive(Debug, Clone)]
struct Api {
    client: Client,
    base: Url,
    token: String,
    config: Arc<UpdaterConfig>,
    /// Set when the service rejects the session token
    faulted: Arc<AtomicBool>,
}

impl Api {
    fn endpoint<S: AsRef<str>>(&self, segments: &[S]) -> ContentResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ContentError::Decode {
                url: self.base.to_string(),
                message: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments.iter().map(|s| s.as_ref()));
        Ok(url)
    }

    fn retry_delays(&self) -> Vec<Duration> {
        (0..self.config.request_retries)
            .map(|attempt| self.config.get_retry_delay(attempt))
            .collect()
    }

    fn check_status(&self, url: &Url, response: Response, what: &str) -> ContentResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("Session rejected by {} ({})", url, status);
            self.faulted.store(true, Ordering::SeqCst);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ContentError::NotFound {
                what: what.to_string(),
            });
        }
        Err(ContentError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[String],
        branch_password: Option<&str>,
        what: &str,
    ) -> ContentResult<T> {
        let url = self.endpoint(segments)?;

        RetryIf::spawn(
            self.retry_delays(),
            move || {
                let url = url.clone();
                let mut request = self.client.get(url.clone()).bearer_auth(&self.token);
                if let Some(password) = branch_password {
                    request = request.header(BRANCH_PASSWORD_HEADER, password);
                }
                async move {
                    let response = request.send().await.map_err(|source| ContentError::Http {
                        url: url.to_string(),
                        source,
                    })?;
                    let response = self.check_status(&url, response, what)?;
                    response.json::<T>().await.map_err(|e| ContentError::Decode {
                        url: url.to_string(),
                        message: e.to_string(),
                    })
                }
            },
            ContentError::is_transient,
        )
        .await
    }
}

struct HttpConnection {
    api: Api,
    os: OsIdentifier,
    connected: AtomicBool,
}

#[async_trait]
impl Connection for HttpConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_faulted(&self) -> bool {
        self.api.faulted.load(Ordering::SeqCst)
    }

    fn os_identifier(&self) -> OsIdentifier {
        self.os.clone()
    }

    fn content_client(&self, workers: usize) -> Arc<dyn ContentClient> {
        Arc::new(HttpContentClient {
            api: self.api.clone(),
            workers: workers.max(1),
        })
    }

    async fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Closed HTTP session on {}", self.api.base);
        }
    }
}

/// Depot and manifest queries against the HTTP backend
pub struct HttpContentClient {
    api: Api,
    workers: usize,
}

#[async_trait]
impl ContentClient for HttpContentClient {
    async fn list_depots(&self, app_id: AppId) -> ContentResult<Vec<Depot>> {
        let segments = ["apps".to_string(), app_id.to_string(), "depots".to_string()];
        self.api
            .get_json(&segments, None, &format!("depot list of app {}", app_id))
            .await
    }

    async fn resolve_manifest_id(
        &self,
        app_id: AppId,
        depot_id: DepotId,
        branch: &str,
        branch_password: Option<&str>,
    ) -> ContentResult<ManifestId> {
        let segments = [
            "apps".to_string(),
            app_id.to_string(),
            "depots".to_string(),
            depot_id.to_string(),
            "branches".to_string(),
            branch.to_string(),
        ];
        let response: BranchResponse = self
            .api
            .get_json(
                &segments,
                branch_password,
                &format!("branch '{}' of depot {}", branch, depot_id),
            )
            .await?;
        Ok(response.manifest_id)
    }

    async fn workshop_item_details(&self, item_id: WorkshopItemId) -> ContentResult<WorkshopItemDetails> {
        let segments = ["workshop".to_string(), item_id.to_string()];
        self.api
            .get_json(&segments, None, &format!("workshop item {}", item_id))
            .await
    }

    async fn get_manifest(
        &self,
        app_id: AppId,
        depot_id: DepotId,
        manifest_id: ManifestId,
    ) -> ContentResult<Manifest> {
        let segments = [
            "apps".to_string(),
            app_id.to_string(),
            "depots".to_string(),
            depot_id.to_string(),
            "manifests".to_string(),
            manifest_id.to_string(),
        ];
        self.api
            .get_json(&segments, None, &format!("manifest {} of depot {}", manifest_id, depot_id))
            .await
    }

    async fn open_download(&self, request: OpenDownload) -> ContentResult<Arc<dyn DownloadHandle>> {
        let (app_id, depot_id, manifest_id) = match &request.source {
            ContentSource::Depot {
                app_id,
                depot_id,
                branch,
                branch_password,
            } => {
                let manifest_id = match request.manifest_id {
                    Some(id) => id,
                    None => {
                        self.resolve_manifest_id(*app_id, *depot_id, branch, branch_password.as_deref())
                            .await?
                    }
                };
                (*app_id, *depot_id, manifest_id)
            }
            ContentSource::Workshop { item_id } => {
                let workshop_app = self.api.config.workshop_app_id;
                let manifest_id = match request.manifest_id {
                    Some(id) => id,
                    None => self.workshop_item_details(*item_id).await?.manifest_id,
                };
                (workshop_app, workshop_app, manifest_id)
            }
        };

        let manifest = self.get_manifest(app_id, depot_id, manifest_id).await?;
        debug!(
            "Opened {} ({} files, {} bytes) for {}",
            request.source,
            manifest.files.len(),
            manifest.total_size(),
            request.os
        );

        Ok(Arc::new(HttpDownloadHandle {
            api: self.api.clone(),
            depot_id,
            total_size: manifest.total_size(),
            manifest,
            workers: self.workers,
            written: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }))
    }
}

/// Files at least this large are hashed in fixed-size chunks instead of in memory
const STREAMING_THRESHOLD: u64 = 50_000_000;
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Base64 xxHash64 of a local file of `size` bytes
async fn hash_local_file(path: &Path, size: u64, streaming_threshold: u64) -> ContentResult<String> {
    if size < streaming_threshold {
        let data = fs::read(path).await.map_err(|e| ContentError::io(path, e))?;
        return tokio::task::spawn_blocking(move || {
            let mut hasher = Xxh64::new(0);
            hasher.update(&data);
            xxhash64_base64(hasher.digest())
        })
        .await
        .map_err(|e| ContentError::Backend(format!("hash computation failed: {}", e)));
    }

    debug!("Using streaming verification for {} ({} bytes)", path.display(), size);
    let mut file = fs::File::open(path).await.map_err(|e| ContentError::io(path, e))?;
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    let mut hasher = Xxh64::new(0);
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| ContentError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(xxhash64_base64(hasher.digest()))
}

/// Resolve a manifest file name below `root`, dropping empty, `.` and `..` parts
fn local_path(root: &Path, file_name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in file_name.split(['/', '\\']) {
        if !part.is_empty() && part != "." && part != ".." {
            path.push(part);
        }
    }
    path
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Transfer of one manifest into a directory
pub struct HttpDownloadHandle {
    api: Api,
    depot_id: DepotId,
    manifest: Manifest,
    total_size: u64,
    workers: usize,
    written: AtomicU64,
    disposed: AtomicBool,
}

impl HttpDownloadHandle {
    /// Whether the local copy of `file` matches the manifest
    async fn verify_local(&self, path: &Path, file: &ManifestFile) -> ContentResult<bool> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(ContentError::io(path, e)),
        };
        if !metadata.is_file() || metadata.len() != file.total_size {
            return Ok(false);
        }

        let Some(expected) = &file.xxhash64 else {
            return Ok(true);
        };
        let actual = hash_local_file(path, metadata.len(), STREAMING_THRESHOLD).await?;

        debug!("Verified {}: expected={}, actual={}", file.file_name, expected, actual);
        Ok(&actual == expected)
    }

    fn file_url(&self, file_name: &str) -> ContentResult<Url> {
        let mut segments = vec![
            "depots".to_string(),
            self.depot_id.to_string(),
            "manifests".to_string(),
            self.manifest.id.to_string(),
            "files".to_string(),
        ];
        segments.extend(
            file_name
                .split(['/', '\\'])
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        self.api.endpoint(&segments)
    }

    async fn fetch_file(
        &self,
        destination: &Path,
        file: &ManifestFile,
        cancel: &CancellationToken,
    ) -> ContentResult<u64> {
        let url = self.file_url(&file.file_name)?;
        let response = self
            .api
            .client
            .get(url.clone())
            .bearer_auth(&self.api.token)
            .send()
            .await
            .map_err(|source| ContentError::Http {
                url: url.to_string(),
                source,
            })?;
        let response = self.api.check_status(&url, response, &format!("file '{}'", file.file_name))?;

        let path = local_path(destination, &file.file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ContentError::io(parent, e))?;
        }
        let temp_path = part_path(&path);
        let mut out = fs::File::create(&temp_path)
            .await
            .map_err(|e| ContentError::io(&temp_path, e))?;

        let mut hasher = Xxh64::new(0);
        let mut received = 0u64;
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(out);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(ContentError::Cancelled);
                }
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|source| ContentError::Http {
                url: url.to_string(),
                source,
            })?;
            hasher.update(&chunk);
            out.write_all(&chunk)
                .await
                .map_err(|e| ContentError::io(&temp_path, e))?;
            received += chunk.len() as u64;
        }

        out.flush().await.map_err(|e| ContentError::io(&temp_path, e))?;
        drop(out);

        if received != file.total_size {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ContentError::Decode {
                url: url.to_string(),
                message: format!("expected {} bytes, received {}", file.total_size, received),
            });
        }
        if let Some(expected) = &file.xxhash64 {
            let actual = xxhash64_base64(hasher.digest());
            if &actual != expected {
                let _ = fs::remove_file(&temp_path).await;
                return Err(ContentError::ChecksumMismatch {
                    file: file.file_name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| ContentError::io(&path, e))?;
        Ok(received)
    }

    async fn fetch_with_retry(
        &self,
        destination: &Path,
        file: &ManifestFile,
        cancel: &CancellationToken,
    ) -> ContentResult<u64> {
        RetryIf::spawn(
            self.api.retry_delays(),
            move || self.fetch_file(destination, file, cancel),
            ContentError::is_transient,
        )
        .await
    }
}

#[async_trait]
impl DownloadHandle for HttpDownloadHandle {
    fn total_file_count(&self) -> usize {
        self.manifest.files.len()
    }

    fn total_file_size(&self) -> u64 {
        self.total_size
    }

    fn total_progress(&self) -> f64 {
        if self.total_size == 0 {
            return 1.0;
        }
        (self.written.load(Ordering::Relaxed) as f64 / self.total_size as f64).min(1.0)
    }

    async fn download_to_folder(
        &self,
        destination: &Path,
        events: TransferEventSender,
        cancel: CancellationToken,
    ) -> ContentResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ContentError::Backend("download handle already disposed".to_string()));
        }
        fs::create_dir_all(destination)
            .await
            .map_err(|e| ContentError::io(destination, e))?;

        let mut queued = Vec::new();
        for file in &self.manifest.files {
            if cancel.is_cancelled() {
                return Err(ContentError::Cancelled);
            }
            let path = local_path(destination, &file.file_name);
            let up_to_date = self.verify_local(&path, file).await?;
            if up_to_date {
                self.written.fetch_add(file.total_size, Ordering::Relaxed);
            } else {
                queued.push(file.clone());
            }
            let _ = events.send(TransferEvent::FileVerified {
                file: file.clone(),
                requires_download: !up_to_date,
            });
        }

        let _ = events.send(TransferEvent::VerificationCompleted {
            queued_files: queued.len(),
            queued_bytes: queued.iter().map(|f| f.total_size).sum(),
        });

        let cancel = &cancel;
        let mut downloads = stream::iter(queued)
            .map(|file| async move {
                self.fetch_with_retry(destination, &file, cancel).await?;
                Ok::<_, ContentError>(file)
            })
            .buffer_unordered(self.workers);

        while let Some(result) = downloads.next().await {
            let file = result?;
            self.written.fetch_add(file.total_size, Ordering::Relaxed);
            let _ = events.send(TransferEvent::FileDownloaded {
                file_name: file.file_name,
                size: file.total_size,
            });
        }

        let _ = events.send(TransferEvent::DownloadComplete);
        Ok(())
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Disposed download of manifest {}", self.manifest.id);
        }
    }
}
