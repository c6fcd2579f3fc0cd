//! Progress events and the ordered output log
//!
//! Every state transition, transfer event and error produced by the core ends up
//! here as a [`ProgressEvent`]. Events are appended to the [`OutputLog`] in the
//! order they were emitted, broadcast to subscribers, and forwarded to any
//! registered [`ProgressCallback`]s.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::orchestrator::{JobId, JobState};
use crate::util::lock;

/// Progress callback for update operations
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Plain log line not tied to a transfer event
    Output,
    /// A local file was checked and must be downloaded
    FileVerified { file_name: String, size: u64 },
    /// Local verification finished for one job
    VerificationCompleted { queued_files: usize, queued_bytes: u64 },
    /// One file finished downloading
    FileDownloaded {
        file_name: String,
        size: u64,
        downloaded: u64,
        total: u64,
    },
    /// New overall percentage
    Progress { percent: f64 },
    /// The handle reported the end of its transfer
    DownloadComplete,
    /// A job observed cancellation
    Cancelled,
    /// A job or operation failed
    Error { message: String },
    /// A job moved to a new state (not part of the human transcript)
    StateChanged { target: String, state: JobState },
}

impl EventKind {
    /// Whether the event belongs to the human-readable transcript
    pub fn is_transcript(&self) -> bool {
        !matches!(self, EventKind::StateChanged { .. })
    }
}

/// One ordered event of the output stream
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: Option<JobId>,
    pub timestamp: SystemTime,
    pub kind: EventKind,
    /// Rendered human-readable line
    pub message: String,
}

/// Trait for progress reporting with more granular control
pub trait ProgressReporter: Send + Sync {
    fn on_output(&self, _job: Option<JobId>, _message: &str) {}
    fn on_file_verified(&self, _job: Option<JobId>, _file_name: &str, _size: u64) {}
    fn on_verification_completed(&self, _job: Option<JobId>, _queued_files: usize, _queued_bytes: u64) {}
    fn on_file_downloaded(&self, _job: Option<JobId>, _file_name: &str, _downloaded: u64, _total: u64) {}
    fn on_progress(&self, _job: Option<JobId>, _percent: f64) {}
    fn on_download_complete(&self, _job: Option<JobId>) {}
    fn on_cancelled(&self, _job: Option<JobId>) {}
    fn on_error(&self, _job: Option<JobId>, _message: &str) {}
    fn on_state_changed(&self, _job: Option<JobId>, _target: &str, _state: JobState) {}
}

/// Extension trait to convert ProgressReporter to ProgressCallback
pub trait IntoProgressCallback {
    fn into_callback(self) -> ProgressCallback;
}

impl<T: ProgressReporter + 'static> IntoProgressCallback for T {
    fn into_callback(self) -> ProgressCallback {
        Arc::new(move |event| {
            let job = event.job_id;
            match event.kind {
                EventKind::Output => self.on_output(job, &event.message),
                EventKind::FileVerified { file_name, size } => {
                    self.on_file_verified(job, &file_name, size);
                }
                EventKind::VerificationCompleted { queued_files, queued_bytes } => {
                    self.on_verification_completed(job, queued_files, queued_bytes);
                }
                EventKind::FileDownloaded { file_name, downloaded, total, .. } => {
                    self.on_file_downloaded(job, &file_name, downloaded, total);
                }
                EventKind::Progress { percent } => self.on_progress(job, percent),
                EventKind::DownloadComplete => self.on_download_complete(job),
                EventKind::Cancelled => self.on_cancelled(job),
                EventKind::Error { message } => self.on_error(job, &message),
                EventKind::StateChanged { target, state } => {
                    self.on_state_changed(job, &target, state);
                }
            }
        })
    }
}

/// Simple console progress reporter implementation
///
/// Prints the same lines the output log records. Per-file lines and state
/// changes are only printed in verbose mode.
#[derive(Debug, Default)]
pub struct ConsoleProgressReporter {
    pub verbose: bool,
}

impl ConsoleProgressReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn on_output(&self, _job: Option<JobId>, message: &str) {
        println!("{}", message);
    }

    fn on_file_verified(&self, _job: Option<JobId>, file_name: &str, size: u64) {
        if self.verbose {
            println!("File verified : {} ({})", file_name, crate::util::format_size(size));
        }
    }

    fn on_verification_completed(&self, _job: Option<JobId>, queued_files: usize, queued_bytes: u64) {
        println!(
            "Verification completed, {} files queued for download. ({} bytes)",
            queued_files, queued_bytes
        );
    }

    fn on_file_downloaded(&self, _job: Option<JobId>, file_name: &str, downloaded: u64, total: u64) {
        if self.verbose {
            println!(
                "{} ({} / {})",
                file_name,
                crate::util::format_size(downloaded),
                crate::util::format_size(total)
            );
        }
    }

    fn on_progress(&self, _job: Option<JobId>, percent: f64) {
        println!("Progress {:05.2}%", percent);
    }

    fn on_download_complete(&self, _job: Option<JobId>) {
        println!("Download completed");
    }

    fn on_cancelled(&self, _job: Option<JobId>) {
        println!("Task Cancelled");
    }

    fn on_error(&self, _job: Option<JobId>, message: &str) {
        eprintln!("{}", message);
    }

    fn on_state_changed(&self, job: Option<JobId>, target: &str, state: JobState) {
        if self.verbose {
            if let Some(job) = job {
                println!("[{}] {} -> {:?}", job, target, state);
            }
        }
    }
}

/// Null progress reporter that does nothing
#[derive(Debug, Default)]
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {}

/// Composite progress reporter that forwards events to multiple reporters
pub struct CompositeProgressReporter {
    reporters: Vec<Box<dyn ProgressReporter>>,
}

impl std::fmt::Debug for CompositeProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeProgressReporter")
            .field("reporters_count", &self.reporters.len())
            .finish()
    }
}

impl CompositeProgressReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn add_reporter<R: ProgressReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for CompositeProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for CompositeProgressReporter {
    fn on_output(&self, job: Option<JobId>, message: &str) {
        for reporter in &self.reporters {
            reporter.on_output(job, message);
        }
    }

    fn on_file_verified(&self, job: Option<JobId>, file_name: &str, size: u64) {
        for reporter in &self.reporters {
            reporter.on_file_verified(job, file_name, size);
        }
    }

    fn on_verification_completed(&self, job: Option<JobId>, queued_files: usize, queued_bytes: u64) {
        for reporter in &self.reporters {
            reporter.on_verification_completed(job, queued_files, queued_bytes);
        }
    }

    fn on_file_downloaded(&self, job: Option<JobId>, file_name: &str, downloaded: u64, total: u64) {
        for reporter in &self.reporters {
            reporter.on_file_downloaded(job, file_name, downloaded, total);
        }
    }

    fn on_progress(&self, job: Option<JobId>, percent: f64) {
        for reporter in &self.reporters {
            reporter.on_progress(job, percent);
        }
    }

    fn on_download_complete(&self, job: Option<JobId>) {
        for reporter in &self.reporters {
            reporter.on_download_complete(job);
        }
    }

    fn on_cancelled(&self, job: Option<JobId>) {
        for reporter in &self.reporters {
            reporter.on_cancelled(job);
        }
    }

    fn on_error(&self, job: Option<JobId>, message: &str) {
        for reporter in &self.reporters {
            reporter.on_error(job, message);
        }
    }

    fn on_state_changed(&self, job: Option<JobId>, target: &str, state: JobState) {
        for reporter in &self.reporters {
            reporter.on_state_changed(job, target, state);
        }
    }
}

/// Capacity of the broadcast channel; slow subscribers lag instead of blocking emitters
const BROADCAST_CAPACITY: usize = 1024;

/// Append-only, ordered record of everything the core reported
///
/// Cheap to clone; all clones share the same log.
#[derive(Clone)]
pub struct OutputLog {
    inner: Arc<OutputLogInner>,
}

struct OutputLogInner {
    /// Held for a whole `emit` so append, broadcast and callbacks share one order
    order: Mutex<()>,
    events: Mutex<Vec<ProgressEvent>>,
    sender: broadcast::Sender<ProgressEvent>,
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl std::fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLog")
            .field("events", &lock(&self.inner.events).len())
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(OutputLogInner {
                order: Mutex::new(()),
                events: Mutex::new(Vec::new()),
                sender,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.sender.subscribe()
    }

    /// Register a callback invoked for every event emitted from now on
    pub fn add_callback(&self, callback: ProgressCallback) {
        lock(&self.inner.callbacks).push(callback);
    }

    /// Record an event, then publish it to subscribers and callbacks.
    ///
    /// Concurrent emits are serialized, so every consumer sees the log order.
    /// Callbacks must not emit on the same log.
    pub fn emit<S: Into<String>>(&self, job_id: Option<JobId>, kind: EventKind, message: S) {
        let event = ProgressEvent {
            job_id,
            timestamp: SystemTime::now(),
            kind,
            message: message.into(),
        };

        let _order = lock(&self.inner.order);
        lock(&self.inner.events).push(event.clone());
        let _ = self.inner.sender.send(event.clone());

        let callbacks = lock(&self.inner.callbacks).clone();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Append a plain output line
    pub fn output<S: Into<String>>(&self, job_id: Option<JobId>, message: S) {
        self.emit(job_id, EventKind::Output, message);
    }

    /// Snapshot of every event recorded so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.inner.events).clone()
    }

    /// The human-readable transcript, one entry per line
    pub fn lines(&self) -> Vec<String> {
        lock(&self.inner.events)
            .iter()
            .filter(|e| e.kind.is_transcript())
            .map(|e| e.message.clone())
            .collect()
    }

    /// The transcript joined with newlines
    pub fn render(&self) -> String {
        self.lines().join("\n")
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_null_progress_reporter() {
        let callback = NullProgressReporter.into_callback();
        callback(ProgressEvent {
            job_id: None,
            timestamp: SystemTime::now(),
            kind: EventKind::Progress { percent: 42.0 },
            message: "Progress 42.00%".to_string(),
        });
    }

    #[test]
    fn test_output_log_keeps_order_and_hides_state_changes() {
        let log = OutputLog::new();
        log.output(None, "Starting Update...");
        log.emit(
            Some(JobId(1)),
            EventKind::StateChanged {
                target: "depot 233781".to_string(),
                state: JobState::Downloading,
            },
            "",
        );
        log.emit(Some(JobId(1)), EventKind::DownloadComplete, "Download completed");

        assert_eq!(log.len(), 3);
        assert_eq!(log.lines(), vec!["Starting Update...", "Download completed"]);
        assert_eq!(log.render(), "Starting Update...\nDownload completed");
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let log = OutputLog::new();
        let mut receiver = log.subscribe();

        log.output(None, "Connected !");

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Output);
        assert_eq!(event.message, "Connected !");
    }

    #[test]
    fn test_callbacks_see_log_order_under_concurrent_emits() {
        let log = OutputLog::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        log.add_callback(Arc::new(move |event: ProgressEvent| {
            // Widen the window between the append and the callback
            std::thread::yield_now();
            lock(&*sink).push(event.message);
        }));

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for line in 0..200 {
                        log.output(None, format!("writer {} line {}", writer, line));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let recorded: Vec<String> = log.events().into_iter().map(|e| e.message).collect();
        assert_eq!(recorded.len(), 1600);
        assert_eq!(*lock(&*seen), recorded);
    }

    #[test]
    fn test_callbacks_and_reporters() {
        #[derive(Default)]
        struct CountingReporter {
            errors: Arc<AtomicUsize>,
            outputs: Arc<AtomicUsize>,
        }

        impl ProgressReporter for CountingReporter {
            fn on_output(&self, _job: Option<JobId>, _message: &str) {
                self.outputs.fetch_add(1, Ordering::SeqCst);
            }

            fn on_error(&self, _job: Option<JobId>, _message: &str) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reporter = CountingReporter::default();
        let errors = reporter.errors.clone();
        let outputs = reporter.outputs.clone();

        let log = OutputLog::new();
        log.add_callback(
            CompositeProgressReporter::new()
                .add_reporter(reporter)
                .add_reporter(NullProgressReporter)
                .into_callback(),
        );

        log.output(None, "Adding mods to download list...");
        log.emit(
            None,
            EventKind::Error {
                message: "boom".to_string(),
            },
            "Error: boom",
        );

        assert_eq!(outputs.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
