//! Download jobs, their state machine and the active-job board

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::content::{AppId, WorkshopItemId};
use crate::error::{Result, UpdaterError};
use crate::metrics::UpdateMetrics;
use crate::progress::{EventKind, OutputLog};
use crate::resolver::DepotTarget;
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What a job downloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    Depot { app_id: AppId, target: DepotTarget },
    Workshop { item_id: WorkshopItemId },
}

impl std::fmt::Display for JobTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobTarget::Depot { app_id, target } => {
                write!(f, "app {}, depot {}", app_id, target.depot_id)
            }
            JobTarget::Workshop { item_id } => write!(f, "item {}", item_id),
        }
    }
}

/// Lifecycle of a job
///
/// `Pending -> [Verifying ->] Downloading -> Completed`, and any
/// non-terminal state may move straight to `Cancelled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Verifying,
    Downloading,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (from, Cancelled | Failed) => !from.is_terminal(),
            (Pending, Verifying) | (Pending, Downloading) | (Verifying, Downloading) => true,
            (Downloading, Completed) => true,
            _ => false,
        }
    }
}

/// Point-in-time view of a live job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub target: String,
    pub destination: PathBuf,
    pub state: JobState,
    pub file_count: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

/// Registry of jobs that have not reached a terminal state
pub struct JobBoard {
    active: Mutex<BTreeMap<JobId, JobSnapshot>>,
    next_id: AtomicU64,
    log: OutputLog,
    metrics: Arc<UpdateMetrics>,
}

impl std::fmt::Debug for JobBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBoard").field("active", &self.len()).finish()
    }
}

impl JobBoard {
    pub fn new(log: OutputLog, metrics: Arc<UpdateMetrics>) -> Self {
        Self {
            active: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            log,
            metrics,
        }
    }

    /// Register a new `Pending` job
    pub fn create(
        self: &Arc<Self>,
        target: JobTarget,
        destination: &Path,
        cancel: CancellationToken,
    ) -> DownloadJob {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = DownloadJob {
            id,
            target,
            destination: destination.to_path_buf(),
            cancel,
            file_count: 0,
            total_bytes: 0,
            downloaded_bytes: 0,
            state: JobState::Pending,
            error: None,
            board: self.clone(),
        };

        lock(&self.active).insert(id, job.snapshot());
        self.metrics.record_job_started();
        self.announce(&job);
        debug!("Registered {} for {}", id, job.target);
        job
    }

    /// Number of live jobs
    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        lock(&self.active).values().cloned().collect()
    }

    fn update(&self, job: &DownloadJob) {
        let mut active = lock(&self.active);
        if job.state.is_terminal() {
            active.remove(&job.id);
        } else {
            active.insert(job.id, job.snapshot());
        }
    }

    fn announce(&self, job: &DownloadJob) {
        self.log.emit(
            Some(job.id),
            EventKind::StateChanged {
                target: job.target.to_string(),
                state: job.state,
            },
            format!("{} {:?}", job.target, job.state),
        );
    }
}

/// One depot or workshop item transfer into one directory
pub struct DownloadJob {
    id: JobId,
    target: JobTarget,
    destination: PathBuf,
    cancel: CancellationToken,
    file_count: usize,
    total_bytes: u64,
    downloaded_bytes: u64,
    state: JobState,
    error: Option<String>,
    board: Arc<JobBoard>,
}

impl std::fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadJob")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .field("downloaded_bytes", &self.downloaded_bytes)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl DownloadJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn target(&self) -> &JobTarget {
        &self.target
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            target: self.target.to_string(),
            destination: self.destination.clone(),
            state: self.state,
            file_count: self.file_count,
            total_bytes: self.total_bytes,
            downloaded_bytes: self.downloaded_bytes,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(UpdaterError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        match next {
            JobState::Completed => self.board.metrics.record_job_completed(self.downloaded_bytes),
            JobState::Cancelled => self.board.metrics.record_job_cancelled(),
            JobState::Failed => self.board.metrics.record_job_failed(),
            _ => {}
        }
        self.board.update(self);
        self.board.announce(self);
        Ok(())
    }

    /// Move to `Failed` and keep `message` as the job's error
    pub fn fail<S: Into<String>>(&mut self, message: S) -> Result<()> {
        self.error = Some(message.into());
        self.transition(JobState::Failed)
    }

    pub(crate) fn set_totals(&mut self, file_count: usize, total_bytes: u64) {
        self.file_count = file_count;
        self.total_bytes = total_bytes;
        self.board.update(self);
    }

    pub(crate) fn add_downloaded(&mut self, bytes: u64) {
        self.downloaded_bytes = self.downloaded_bytes.saturating_add(bytes);
        self.board.update(self);
    }
}

impl Drop for DownloadJob {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!("{} for {} dropped while {:?}", self.id, self.target, self.state);
            lock(&self.board.active).remove(&self.id);
        }
    }
}
