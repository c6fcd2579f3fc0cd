//! Batch workshop updates with a bounded worker pool

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info};

use super::job::JobState;
use super::transfer::TransferMode;
use super::{OverrideGuard, UpdateOutcome, Updater};
use crate::content::WorkshopItemId;
use crate::error::{FileOperation, Result, UpdaterError};
use crate::progress::EventKind;
use crate::session::ConnectedSession;
use crate::util::{format_elapsed_minutes, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModStatus {
    #[default]
    NotComplete,
    UpToDate,
    Updating,
}

/// A workshop item the caller keeps in sync on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopItem {
    pub workshop_id: WorkshopItemId,
    pub path: PathBuf,
    /// Managed by hand; never downloaded by batch updates
    #[serde(default)]
    pub is_local: bool,
    /// Unix seconds of the last successful local update
    #[serde(default)]
    pub local_last_updated: Option<u64>,
    /// Unix seconds of the last remote publish
    #[serde(default)]
    pub remote_last_updated: Option<u64>,
    #[serde(default)]
    pub status: ModStatus,
}

impl WorkshopItem {
    pub fn new<P: Into<PathBuf>>(workshop_id: WorkshopItemId, path: P) -> Self {
        Self {
            workshop_id,
            path: path.into(),
            is_local: false,
            local_last_updated: None,
            remote_last_updated: None,
            status: ModStatus::NotComplete,
        }
    }

    /// Both timestamps are known and the local copy is not older
    pub fn is_up_to_date(&self) -> bool {
        matches!(
            (self.local_last_updated, self.remote_last_updated),
            (Some(local), Some(remote)) if local >= remote
        )
    }
}

/// What happened to one item of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    /// Already up to date, no job was started
    Skipped,
    Completed,
    Cancelled,
    Failed(String),
}

impl ItemResult {
    /// Terminal job state, `None` when no job ran
    pub fn job_state(&self) -> Option<JobState> {
        match self {
            ItemResult::Skipped => None,
            ItemResult::Completed => Some(JobState::Completed),
            ItemResult::Cancelled => Some(JobState::Cancelled),
            ItemResult::Failed(_) => Some(JobState::Failed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item: WorkshopItem,
    pub result: ItemResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub outcome: UpdateOutcome,
    /// One entry per attempted item, in completion order
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    fn empty(outcome: UpdateOutcome) -> Self {
        Self {
            outcome,
            items: Vec::new(),
        }
    }

    pub fn get(&self, workshop_id: WorkshopItemId) -> Option<&ItemReport> {
        self.items.iter().find(|r| r.item.workshop_id == workshop_id)
    }

    /// Copy the updated status and timestamps back into `items`
    pub fn apply(&self, items: &mut [WorkshopItem]) {
        for item in items.iter_mut() {
            if let Some(report) = self.get(item.workshop_id) {
                item.status = report.item.status;
                item.local_last_updated = report.item.local_last_updated;
            }
        }
    }
}

/// Overall batch percentage after `finished` of `total` items
///
/// The historical formula `finished * total / 100` is kept unless
/// `normalized` is set.
pub fn batch_progress(finished: usize, total: usize, normalized: bool) -> f64 {
    if normalized {
        if total == 0 {
            100.0
        } else {
            finished as f64 / total as f64 * 100.0
        }
    } else {
        finished as f64 * total as f64 / 100.0
    }
}

fn lexical(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Reject batches where two items would write into the same directory tree
pub fn check_disjoint(items: &[WorkshopItem]) -> Result<()> {
    let paths: Vec<PathBuf> = items.iter().map(|i| lexical(&i.path)).collect();
    for (i, first) in paths.iter().enumerate() {
        for second in &paths[i + 1..] {
            if first.starts_with(second) || second.starts_with(first) {
                return Err(UpdaterError::OverlappingDestinations {
                    first: first.clone(),
                    second: second.clone(),
                });
            }
        }
    }
    Ok(())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Updater {
    /// Update every non-local item with at most `batch_workers` items in
    /// flight. A failing item does not stop the others.
    pub async fn run_batch_mod_update(&self, items: Vec<WorkshopItem>) -> BatchReport {
        let queue: Vec<WorkshopItem> = items.into_iter().filter(|i| !i.is_local).collect();
        if let Err(e) = check_disjoint(&queue) {
            self.report_error(None, &e);
            return BatchReport::empty(UpdateOutcome::Error);
        }

        let operation = self.operations.begin();
        let session = match self.connect().await {
            Ok(session) => session,
            Err(_) => return BatchReport::empty(UpdateOutcome::LoginFailed),
        };

        self.log.output(None, "Adding mods to download list...");

        let total = queue.len();
        let workers = self.config.batch_workers.min(total).max(1);
        let normalized = self.config.normalized_batch_progress;
        let _override = OverrideGuard::new(&self.batch_override);
        info!("Updating {} workshop item(s) with {} worker(s)", total, workers);

        let queue = Mutex::new(queue.into_iter().collect::<VecDeque<_>>());
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<ItemReport>();

        let pool = join_all((0..workers).map(|worker| {
            let report_tx = report_tx.clone();
            let queue = &queue;
            let session = &session;
            let token = operation.token().clone();
            async move {
                loop {
                    let next = lock(queue).pop_front();
                    let Some(item) = next else { break };
                    let report = self.update_item(session, item, &token).await;
                    if report_tx.send(report).is_err() {
                        break;
                    }
                }
                debug!("Batch worker {} drained", worker);
            }
            .instrument(debug_span!("batch_worker", worker))
        }));
        drop(report_tx);

        let collector = async {
            let mut finished = 0;
            let mut reports = Vec::with_capacity(total);
            while let Some(report) = report_rx.recv().await {
                finished += 1;
                let percent = batch_progress(finished, total, normalized);
                self.gauge.set(percent);
                self.log.emit(
                    None,
                    EventKind::Progress { percent },
                    format!(
                        "   Thread {} complete  ({} / {})",
                        report.item.workshop_id, finished, total
                    ),
                );
                reports.push(report);
            }
            reports
        };

        self.log.output(None, "Almost there...");
        let (_, reports) = tokio::join!(pool, collector);

        self.log.output(None, "Mods updated !");
        BatchReport {
            outcome: UpdateOutcome::Success,
            items: reports,
        }
    }

    async fn update_item(
        &self,
        session: &ConnectedSession,
        mut item: WorkshopItem,
        token: &CancellationToken,
    ) -> ItemReport {
        let id = item.workshop_id;

        if let Err(e) = fs::create_dir_all(&item.path).await {
            let error = UpdaterError::file_system(&item.path, FileOperation::CreateDir, e);
            self.report_error(None, &error);
            item.status = ModStatus::NotComplete;
            return ItemReport {
                item,
                result: ItemResult::Failed(error.to_string()),
            };
        }

        if token.is_cancelled() {
            item.status = ModStatus::NotComplete;
            return ItemReport {
                item,
                result: ItemResult::Cancelled,
            };
        }

        self.log.output(None, format!("   Starting {}", id));

        if item.is_up_to_date() {
            item.status = ModStatus::UpToDate;
            self.metrics.record_item_skipped();
            self.log
                .output(None, format!("   Mod{} already up to date. Ignoring...", id));
            return ItemReport {
                item,
                result: ItemResult::Skipped,
            };
        }

        let started = Instant::now();
        item.status = ModStatus::Updating;
        let path = item.path.clone();

        let result = match self
            .download_item(session, id, &path, token, TransferMode::Batch)
            .await
        {
            Ok(()) => {
                item.status = ModStatus::UpToDate;
                item.local_last_updated = Some(now_unix());
                self.log.output(
                    None,
                    format!(
                        "    Download {} completed, it took {}",
                        id,
                        format_elapsed_minutes(started.elapsed())
                    ),
                );
                ItemResult::Completed
            }
            Err(e) if e.is_cancelled() => {
                item.status = ModStatus::NotComplete;
                ItemResult::Cancelled
            }
            Err(e) => {
                self.report_error(None, &e);
                item.status = ModStatus::NotComplete;
                ItemResult::Failed(e.to_string())
            }
        };

        ItemReport { item, result }
    }
}
