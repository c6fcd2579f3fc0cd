//! The download + poll routine shared by single-target and batch updates

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{Instrument, debug, info_span, warn};

use super::job::{DownloadJob, JobState};
use crate::content::{DownloadHandle, TransferEvent};
use crate::error::{ContentError, Result, UpdaterError};
use crate::progress::{EventKind, OutputLog};
use crate::util::format_size;

/// Last published overall percentage
#[derive(Debug, Default)]
pub(crate) struct ProgressGauge(AtomicU64);

impl ProgressGauge {
    pub fn set(&self, percent: f64) {
        self.0.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// How a transfer reports itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferMode {
    /// One job at a time; drives the overall gauge and logs periodic progress
    Single,
    /// One of several concurrent jobs; lines are indented, gauge untouched
    Batch,
}

impl TransferMode {
    fn indent(self) -> &'static str {
        match self {
            TransferMode::Single => "",
            TransferMode::Batch => "    ",
        }
    }
}

pub(crate) struct Transfer<'a> {
    pub log: &'a OutputLog,
    pub gauge: &'a ProgressGauge,
    pub poll_interval: Duration,
    pub mode: TransferMode,
}

enum Wake {
    Finished(std::result::Result<std::result::Result<(), ContentError>, JoinError>),
    CancelRequested,
}

impl Transfer<'_> {
    /// Run `handle` into the job's destination until it finishes, fails or
    /// the job's token is cancelled. The handle is always disposed.
    pub async fn run(&self, job: &mut DownloadJob, handle: Arc<dyn DownloadHandle>) -> Result<()> {
        let result = self.drive(job, handle.clone()).await;
        handle.dispose();
        result
    }

    async fn drive(&self, job: &mut DownloadJob, handle: Arc<dyn DownloadHandle>) -> Result<()> {
        if job.cancel_token().is_cancelled() {
            return self.cancelled(job);
        }

        job.set_totals(handle.total_file_count(), handle.total_file_size());
        if job.state() != JobState::Downloading {
            job.transition(JobState::Downloading)?;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let token = job.cancel_token().clone();
        let destination = job.destination().to_path_buf();
        let worker = handle.clone();
        let span = info_span!("transfer", job = %job.id(), target = %job.target());
        let mut task = tokio::spawn(
            async move { worker.download_to_folder(&destination, events_tx, token).await }.instrument(span),
        );

        self.line(job, "OK.");
        self.line(
            job,
            format!(
                "Downloading {} files with total size of {}...",
                handle.total_file_count(),
                format_size(handle.total_file_size())
            ),
        );
        if self.mode == TransferMode::Single {
            self.gauge.set(0.0);
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let token = job.cancel_token().clone();
        let wake = loop {
            tokio::select! {
                biased;
                joined = &mut task => break Wake::Finished(joined),
                _ = token.cancelled() => break Wake::CancelRequested,
                Some(event) = events_rx.recv() => self.on_event(job, handle.as_ref(), event),
                _ = ticker.tick() => self.tick(job, handle.as_ref()),
            }
        };

        let joined = match wake {
            Wake::Finished(joined) => joined,
            Wake::CancelRequested => {
                self.line(job, "Task cancellation requested");
                match timeout(self.poll_interval, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("{} did not stop within {:?}, aborting", job.target(), self.poll_interval);
                        task.abort();
                        Ok(Err(ContentError::Cancelled))
                    }
                }
            }
        };

        while let Ok(event) = events_rx.try_recv() {
            self.on_event(job, handle.as_ref(), event);
        }

        match joined {
            Ok(Ok(())) => {
                self.tick(job, handle.as_ref());
                job.transition(JobState::Completed)?;
                debug!("{} completed ({} bytes)", job.target(), job.downloaded_bytes());
                Ok(())
            }
            Ok(Err(ContentError::Cancelled)) => self.cancelled(job),
            Ok(Err(source)) => {
                job.fail(source.to_string())?;
                Err(UpdaterError::TransferFailed {
                    job: job.target().to_string(),
                    source,
                })
            }
            Err(join_error) => {
                let source = ContentError::Backend(format!("transfer task ended abnormally: {}", join_error));
                job.fail(source.to_string())?;
                Err(UpdaterError::TransferFailed {
                    job: job.target().to_string(),
                    source,
                })
            }
        }
    }

    fn cancelled(&self, job: &mut DownloadJob) -> Result<()> {
        job.transition(JobState::Cancelled)?;
        self.log.emit(
            Some(job.id()),
            EventKind::Cancelled,
            format!("{}Task Cancelled", self.mode.indent()),
        );
        if self.mode == TransferMode::Single {
            self.gauge.set(0.0);
        }
        Err(UpdaterError::cancelled(format!("{} cancelled", job.target())))
    }

    fn tick(&self, job: &DownloadJob, handle: &dyn DownloadHandle) {
        if self.mode != TransferMode::Single {
            return;
        }
        let percent = handle.total_progress() * 100.0;
        self.gauge.set(percent);
        self.log.emit(
            Some(job.id()),
            EventKind::Progress { percent },
            format!("Progress {:05.2}%", percent),
        );
    }

    fn on_event(&self, job: &mut DownloadJob, handle: &dyn DownloadHandle, event: TransferEvent) {
        let indent = self.mode.indent();
        match event {
            TransferEvent::FileVerified { file, requires_download } => {
                if requires_download {
                    let message = format!(
                        "{}File verified : {} ({})",
                        indent,
                        file.file_name,
                        format_size(file.total_size)
                    );
                    self.log.emit(
                        Some(job.id()),
                        EventKind::FileVerified {
                            file_name: file.file_name,
                            size: file.total_size,
                        },
                        message,
                    );
                }
            }
            TransferEvent::VerificationCompleted { queued_files, queued_bytes } => {
                self.log.emit(
                    Some(job.id()),
                    EventKind::VerificationCompleted { queued_files, queued_bytes },
                    format!(
                        "{}Verification completed, {} files queued for download. ({} bytes)",
                        indent, queued_files, queued_bytes
                    ),
                );
            }
            TransferEvent::FileDownloaded { file_name, size } => {
                job.add_downloaded(size);
                let percent = handle.total_progress() * 100.0;
                if self.mode == TransferMode::Single {
                    self.gauge.set(percent);
                }
                let message = format!(
                    "{}Progress {:05.2}% ({} / {})",
                    indent,
                    percent,
                    format_size(job.downloaded_bytes()),
                    format_size(job.total_bytes())
                );
                self.log.emit(
                    Some(job.id()),
                    EventKind::FileDownloaded {
                        file_name,
                        size,
                        downloaded: job.downloaded_bytes(),
                        total: job.total_bytes(),
                    },
                    message,
                );
            }
            TransferEvent::DownloadComplete => {
                self.log.emit(
                    Some(job.id()),
                    EventKind::DownloadComplete,
                    format!("{}Download completed", indent),
                );
            }
        }
    }

    fn line<S: AsRef<str>>(&self, job: &DownloadJob, message: S) {
        self.log
            .output(Some(job.id()), format!("{}{}", self.mode.indent(), message.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_gauge_round_trips_percent() {
        let gauge = ProgressGauge::default();
        assert_eq!(gauge.get(), 0.0);
        gauge.set(42.5);
        assert_eq!(gauge.get(), 42.5);
    }

    #[test]
    fn test_batch_lines_are_indented() {
        assert_eq!(TransferMode::Batch.indent(), "    ");
        assert_eq!(TransferMode::Single.indent(), "");
    }
}
