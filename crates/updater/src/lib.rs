//! Updater Library
//!
//! Keeps a dedicated game server install and its workshop mods in sync with a
//! content delivery service. It handles authenticated sessions, depot
//! selection from feature flags, sequential depot downloads, bounded
//! concurrent workshop batches, cooperative cancellation and pruning of files
//! that are no longer part of a manifest.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use updater::{
//!     ConsoleProgressReporter, EnvCredentials, FeatureFlags, IntoProgressCallback,
//!     UpdateOutcome, Updater, UpdaterConfig,
//! };
//!
//! # async fn example() -> updater::Result<()> {
//! let config = UpdaterConfig::from_env();
//! let updater = Updater::with_http(config, Arc::new(EnvCredentials))?;
//! updater.add_progress_callback(ConsoleProgressReporter::new(false).into_callback());
//!
//! let flags = FeatureFlags {
//!     using_gm_dlc: true,
//!     ..FeatureFlags::default()
//! };
//! let outcome = updater.update_server(flags, Path::new("/srv/arma3")).await;
//! assert_eq!(outcome, UpdateOutcome::Success);
//!
//! let outcome = updater.run_single_mod_update(450814997, Path::new("/srv/mods/@cba")).await;
//! println!("exit code {}", outcome.code());
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Pluggable backends**: the core only sees the [`content`] traits; an HTTP reference backend is included
//! - **Session reuse**: one authenticated connection per credential identity, reconnected when faulted
//! - **Depot resolution**: shared content, executables and creator DLC selected from [`FeatureFlags`]
//! - **Batch updates**: workshop items downloaded by a bounded worker pool, failures isolated per item
//! - **Cancellation**: every operation observes one shared cancel request within a poll interval
//! - **Pruning**: files missing from the manifest are deleted from credentialed installs
//! - **Ordered output**: every line and state change is recorded in an [`OutputLog`]

pub mod config;
pub mod content;
pub mod differ;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod resolver;
pub mod session;
pub mod util;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use config::{EnvCredentials, UpdaterConfig, UpdaterConfigBuilder};
pub use error::{
    ContentError, ErrorSeverity, LoginError, LoginFailureReason, ResolveError, Result, UpdaterError,
};
pub use metrics::{UpdateMetrics, UpdateMetricsSnapshot};
pub use orchestrator::{
    BatchReport, ItemReport, ItemResult, JobState, ModStatus, UpdateOutcome, Updater, WorkshopItem,
};
pub use progress::{
    CompositeProgressReporter, ConsoleProgressReporter, EventKind, IntoProgressCallback,
    NullProgressReporter, OutputLog, ProgressCallback, ProgressEvent, ProgressReporter,
};
pub use resolver::{DepotTarget, FeatureFlags};
pub use session::{AuthCodeProvider, ConnectionState, CredentialSource, Credentials, SessionStatus};
