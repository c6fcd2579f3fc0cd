//! Counters for update jobs
//!
//! Every job started by the orchestrator records its start and terminal state
//! here, so a caller can inspect totals across single and batch runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Job and byte counters, safe to update from concurrent jobs
#[derive(Debug, Default)]
pub struct UpdateMetrics {
    pub jobs_started: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub items_skipped: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub files_pruned: AtomicU64,
}

impl UpdateMetrics {
    pub fn record_job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed job and the bytes it wrote
    pub fn record_job_completed(&self, bytes: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a workshop item skipped because it was already up to date
    pub fn record_item_skipped(&self) {
        self.items_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_files_pruned(&self, count: u64) {
        self.files_pruned.fetch_add(count, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> UpdateMetricsSnapshot {
        UpdateMetricsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            files_pruned: self.files_pruned.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of [`UpdateMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub items_skipped: u64,
    pub bytes_downloaded: u64,
    pub files_pruned: u64,
}

impl UpdateMetricsSnapshot {
    /// Share of started jobs that completed (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.jobs_started == 0 {
            0.0
        } else {
            self.jobs_completed as f64 / self.jobs_started as f64
        }
    }

    /// Jobs that have not reached a terminal state yet
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_started
            .saturating_sub(self.jobs_completed + self.jobs_failed + self.jobs_cancelled)
    }
}
