//! Download orchestrator
//!
//! [`Updater`] is the caller-facing surface of the core. It owns the session
//! manager, the output log and the active-job board, and drives depot
//! (single-target), workshop item and batch workshop updates on top of the
//! shared transfer routine in [`transfer`].

mod batch;
mod job;
mod transfer;


use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UpdaterConfig;
use crate::content::{
    AppId, ContentSource, ContentTransport, HttpTransport, Manifest, OpenDownload, WorkshopItemId,
};
use crate::differ;
use crate::error::{ContentError, FileOperation, LoginError, Result, UpdaterError};
use crate::metrics::{UpdateMetrics, UpdateMetricsSnapshot};
use crate::progress::{EventKind, OutputLog, ProgressCallback, ProgressEvent};
use crate::resolver::{self, DepotTarget, FeatureFlags};
use crate::session::{
    AuthCodeProvider, ConnectedSession, ConnectionState, CredentialSource, SessionManager, SessionStatus,
};
use crate::util::{format_elapsed, format_elapsed_minutes, lock};

pub use batch::{BatchReport, ItemReport, ItemResult, ModStatus, WorkshopItem, batch_progress, check_disjoint};
pub use job::{DownloadJob, JobBoard, JobId, JobSnapshot, JobState, JobTarget};

use transfer::{ProgressGauge, Transfer, TransferMode};

/// Result of a top-level update call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Success,
    Error,
    LoginFailed,
    Cancelled,
}

impl UpdateOutcome {
    /// Stable numeric code (also the CLI exit code)
    pub fn code(self) -> i32 {
        match self {
            UpdateOutcome::Success => 0,
            UpdateOutcome::Error => 1,
            UpdateOutcome::LoginFailed => 2,
            UpdateOutcome::Cancelled => 3,
        }
    }
}

/// Cancellation tokens of the top-level operations currently running
#[derive(Default)]
struct OperationTokens {
    live: Mutex<HashMap<u64, CancellationToken>>,
    next: AtomicU64,
}

impl OperationTokens {
    /// Register a fresh token for a new operation
    fn begin(&self) -> Operation<'_> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        lock(&self.live).insert(id, token.clone());
        Operation {
            tokens: self,
            id,
            token,
        }
    }

    fn cancel_all(&self) -> usize {
        let live = lock(&self.live);
        for token in live.values() {
            token.cancel();
        }
        live.len()
    }
}

struct Operation<'a> {
    tokens: &'a OperationTokens,
    id: u64,
    token: CancellationToken,
}

impl Operation<'_> {
    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        lock(&self.tokens.live).remove(&self.id);
    }
}

/// Keeps `is_downloading` true for the lifetime of a batch run
struct OverrideGuard<'a>(&'a AtomicBool);

impl<'a> OverrideGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates depot and workshop updates
pub struct Updater {
    config: UpdaterConfig,
    session: SessionManager,
    credentials: Arc<dyn CredentialSource>,
    log: OutputLog,
    board: Arc<JobBoard>,
    metrics: Arc<UpdateMetrics>,
    gauge: ProgressGauge,
    operations: OperationTokens,
    batch_override: AtomicBool,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("config", &self.config)
            .field("state", &self.session.state())
            .field("active_jobs", &self.board.len())
            .finish()
    }
}

impl Updater {
    pub fn new(
        config: UpdaterConfig,
        transport: Arc<dyn ContentTransport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        config.validate()?;

        let log = OutputLog::new();
        let metrics = Arc::new(UpdateMetrics::default());
        Ok(Self {
            session: SessionManager::new(transport, &config, log.clone()),
            board: Arc::new(JobBoard::new(log.clone(), metrics.clone())),
            config,
            credentials,
            log,
            metrics,
            gauge: ProgressGauge::default(),
            operations: OperationTokens::default(),
            batch_override: AtomicBool::new(false),
        })
    }

    /// Updater backed by the reference HTTP content backend
    pub fn with_http(config: UpdaterConfig, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Self::new(config, Arc::new(transport), credentials)
    }

    /// Ask `provider` for a one-time code when a credentialed logon requires one
    pub fn with_auth_code_provider(mut self, provider: Arc<dyn AuthCodeProvider>) -> Self {
        self.session = self.session.with_auth_code_provider(provider);
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// The ordered output log shared by every operation
    pub fn log(&self) -> &OutputLog {
        &self.log
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.log.subscribe()
    }

    pub fn add_progress_callback(&self, callback: ProgressCallback) {
        self.log.add_callback(callback);
    }

    pub fn metrics(&self) -> UpdateMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Connect (or reuse the live session) with the current credentials
    pub async fn connect(&self) -> std::result::Result<ConnectedSession, LoginError> {
        let credentials = self.credentials.credentials();
        self.session.connect(&credentials).await
    }

    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Any job live, a logon in progress, or a batch run active
    pub fn is_downloading(&self) -> bool {
        !self.board.is_empty() || self.session.is_logging_in() || self.batch_override.load(Ordering::SeqCst)
    }

    /// Last published overall percentage
    pub fn progress(&self) -> f64 {
        self.gauge.get()
    }

    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        self.board.snapshots()
    }

    /// Cancel every running top-level operation
    pub fn cancel(&self) {
        self.log.output(None, "Update Cancelled.");
        let cancelled = self.operations.cancel_all();
        info!("Cancellation requested for {} operation(s)", cancelled);
    }

    /// Resolve the server depots for `flags` and download them into `install_dir`
    pub async fn update_server(&self, flags: FeatureFlags, install_dir: &Path) -> UpdateOutcome {
        let app_id = self.config.server_app_id;
        let operation = self.operations.begin();
        let token = operation.token();
        self.log.output(None, "Starting Update...");
        self.log
            .output(None, "Please don't cancel the download, this might take a while...");

        let session = match self.connect().await {
            Ok(session) => session,
            Err(_) => return UpdateOutcome::LoginFailed,
        };
        if token.is_cancelled() {
            return UpdateOutcome::Cancelled;
        }

        let depots = match session.client().list_depots(app_id).await {
            Ok(depots) => depots,
            Err(e) => {
                warn!("Listing depots of app {} failed: {}", app_id, e);
                self.log.output(
                    None,
                    " /!\\ Something went wrong while getting the depots list. Check login/password and your internet connection.",
                );
                self.log
                    .output(None, "Alternatively, clear the auth artifact folder and try again.");
                return UpdateOutcome::Error;
            }
        };

        if depots.is_empty() {
            self.log.output(
                None,
                " /!\\ Could not retrieve depots list. Please retry later or check your internet connection.",
            );
            self.log
                .output(None, "Alternatively, clear the auth artifact folder and try again.");
            return UpdateOutcome::Error;
        }

        let targets = match resolver::resolve_with(app_id, &depots, &flags, |line| {
            self.log.output(None, line)
        }) {
            Ok(targets) => targets,
            Err(e) => {
                self.report_error(None, &UpdaterError::from(e));
                return UpdateOutcome::Error;
            }
        };

        if is_blank(install_dir) || token.is_cancelled() {
            return UpdateOutcome::Cancelled;
        }
        if let Err(e) = ensure_dir(install_dir).await {
            self.report_error(None, &e);
            return UpdateOutcome::Error;
        }

        let outcome = self
            .run_targets(&session, app_id, &targets, install_dir, token)
            .await;
        if outcome == UpdateOutcome::Success {
            self.log.output(None, "All Done ! ");
        }
        outcome
    }

    /// Download `targets` one after the other into `path`, stopping at the
    /// first failure
    pub async fn run_single_target_update(
        &self,
        app_id: AppId,
        targets: &[DepotTarget],
        path: &Path,
    ) -> UpdateOutcome {
        if is_blank(path) {
            return UpdateOutcome::Cancelled;
        }
        if let Err(e) = ensure_dir(path).await {
            self.report_error(None, &e);
            return UpdateOutcome::Error;
        }

        let operation = self.operations.begin();
        let session = match self.connect().await {
            Ok(session) => session,
            Err(_) => return UpdateOutcome::LoginFailed,
        };

        self.run_targets(&session, app_id, targets, path, operation.token())
            .await
    }

    /// Sequential depot loop shared by server and explicit target updates
    async fn run_targets(
        &self,
        session: &ConnectedSession,
        app_id: AppId,
        targets: &[DepotTarget],
        path: &Path,
        token: &CancellationToken,
    ) -> UpdateOutcome {
        let started = Instant::now();
        let transfer = self.transfer(TransferMode::Single);

        for (index, target) in targets.iter().enumerate() {
            if token.is_cancelled() {
                return UpdateOutcome::Cancelled;
            }
            let result = self
                .download_depot(session, &transfer, app_id, target, (index + 1, targets.len()), path, token)
                .await;

            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return UpdateOutcome::Cancelled,
                Err(e) => {
                    self.report_error(None, &e);
                    return UpdateOutcome::Error;
                }
            }
        }

        self.log
            .output(None, format!("Done in {}", format_elapsed(started.elapsed())));
        UpdateOutcome::Success
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_depot(
        &self,
        session: &ConnectedSession,
        transfer: &Transfer<'_>,
        app_id: AppId,
        target: &DepotTarget,
        (position, count): (usize, usize),
        path: &Path,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut job = self.board.create(
            JobTarget::Depot {
                app_id,
                target: target.clone(),
            },
            path,
            token.clone(),
        );
        ensure_connected(session, &mut job)?;

        let client = session.client();
        let manifest_id = client
            .resolve_manifest_id(app_id, target.depot_id, &target.branch, target.branch_password.as_deref())
            .await
            .map_err(|e| fail_job(&mut job, e))?;

        self.log.output(
            Some(job.id()),
            format!(
                "Attempting to start download of app {}, depot {}  ({}/{})... ",
                app_id, target.depot_id, position, count
            ),
        );

        let handle = client
            .open_download(OpenDownload {
                source: ContentSource::Depot {
                    app_id,
                    depot_id: target.depot_id,
                    branch: target.branch.clone(),
                    branch_password: target.branch_password.clone(),
                },
                manifest_id: Some(manifest_id),
                os: session.os().clone(),
            })
            .await
            .map_err(|e| fail_job(&mut job, e))?;

        transfer.run(&mut job, handle).await
    }

    /// Update one workshop item into `path`
    pub async fn run_single_mod_update(&self, item_id: WorkshopItemId, path: &Path) -> UpdateOutcome {
        if is_blank(path) {
            return UpdateOutcome::Cancelled;
        }
        if let Err(e) = ensure_dir(path).await {
            self.report_error(None, &e);
            return UpdateOutcome::Error;
        }

        let operation = self.operations.begin();
        let session = match self.connect().await {
            Ok(session) => session,
            Err(_) => return UpdateOutcome::LoginFailed,
        };

        let started = Instant::now();
        self.log
            .output(None, format!("Fetching mod {} infos... ", item_id));

        match self
            .download_item(&session, item_id, path, operation.token(), TransferMode::Single)
            .await
        {
            Ok(()) => {
                self.log.output(
                    None,
                    format!("Download completed, it took {}", format_elapsed_minutes(started.elapsed())),
                );
                UpdateOutcome::Success
            }
            Err(e) => {
                let outcome = if e.is_cancelled() {
                    UpdateOutcome::Cancelled
                } else {
                    self.report_error(None, &e);
                    UpdateOutcome::Error
                };
                if self.board.is_empty() {
                    self.session.shutdown().await;
                }
                outcome
            }
        }
    }

    /// Prune (credentialed sessions only) then download one workshop item
    async fn download_item(
        &self,
        session: &ConnectedSession,
        item_id: WorkshopItemId,
        path: &Path,
        token: &CancellationToken,
        mode: TransferMode,
    ) -> Result<()> {
        let mut job = self
            .board
            .create(JobTarget::Workshop { item_id }, path, token.clone());
        ensure_connected(session, &mut job)?;

        let client = session.client();
        let mut manifest_id = None;

        if !session.is_anonymous() {
            if mode == TransferMode::Batch {
                self.log
                    .output(Some(job.id()), format!("   Getting manifest for {}", item_id));
            }
            let details = client
                .workshop_item_details(item_id)
                .await
                .map_err(|e| fail_job(&mut job, e))?;
            let workshop_app = self.config.workshop_app_id;
            let manifest = client
                .get_manifest(workshop_app, workshop_app, details.manifest_id)
                .await
                .map_err(|e| fail_job(&mut job, e))?;
            if mode == TransferMode::Batch {
                self.log
                    .output(Some(job.id()), format!("   Manifest retrieved {}", item_id));
            }

            job.transition(JobState::Verifying)?;
            self.prune_destination(&job, &manifest, mode).await;
            manifest_id = Some(details.manifest_id);
        }

        let indent = if mode == TransferMode::Batch { "    " } else { "" };
        self.log.output(
            Some(job.id()),
            format!("{}Attempting to start download of item {}... ", indent, item_id),
        );

        let handle = client
            .open_download(OpenDownload {
                source: ContentSource::Workshop { item_id },
                manifest_id,
                os: session.os().clone(),
            })
            .await
            .map_err(|e| fail_job(&mut job, e))?;

        self.transfer(mode).run(&mut job, handle).await
    }

    async fn prune_destination(&self, job: &DownloadJob, manifest: &Manifest, mode: TransferMode) {
        let indent = if mode == TransferMode::Batch { "    " } else { "" };
        self.log.output(
            Some(job.id()),
            format!("{}Checking for unnecessary files in target directory...", indent),
        );

        let report = differ::prune(job.destination(), manifest).await;
        self.metrics.record_files_pruned(report.deleted.len() as u64);
        debug!("Pruned {} file(s) from {}", report.deleted.len(), job.destination().display());

        for (path, reason) in &report.failed {
            self.log.output(
                Some(job.id()),
                format!("{}Could not delete {}: {}", indent, path.display(), reason),
            );
        }
    }

    fn transfer(&self, mode: TransferMode) -> Transfer<'_> {
        Transfer {
            log: &self.log,
            gauge: &self.gauge,
            poll_interval: self.config.poll_interval,
            mode,
        }
    }

    /// Log an error once: an `Error` event rendered with its inner cause
    fn report_error(&self, job: Option<JobId>, error: &UpdaterError) {
        error!(category = error.category(), "{}", error);
        self.log.emit(
            job,
            EventKind::Error {
                message: error.to_string(),
            },
            error.log_line(),
        );
    }
}

/// Fail `job` with a backend error and wrap it for the caller
fn fail_job(job: &mut DownloadJob, source: ContentError) -> UpdaterError {
    if matches!(source, ContentError::Cancelled) {
        if let Err(e) = job.transition(JobState::Cancelled) {
            return e;
        }
        return UpdaterError::cancelled(format!("{} cancelled", job.target()));
    }
    if let Err(e) = job.fail(source.to_string()) {
        return e;
    }
    UpdaterError::TransferFailed {
        job: job.target().to_string(),
        source,
    }
}

fn ensure_connected(session: &ConnectedSession, job: &mut DownloadJob) -> Result<()> {
    if session.is_connected() {
        return Ok(());
    }
    job.fail("session is not connected")?;
    Err(UpdaterError::NotConnected {
        job: job.target().to_string(),
    })
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}

async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| UpdaterError::file_system(path, FileOperation::CreateDir, e))
}
