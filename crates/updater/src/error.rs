//! Error types for the updater core with context and recovery information

use std::error::Error as _;
use std::path::PathBuf;
use thiserror::Error;

use crate::content::AppId;
use crate::orchestrator::JobState;

/// Top-level errors produced by the updater core
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// Authentication was rejected or the transport failed while connecting
    #[error("Login failed: {0}")]
    LoginFailed(#[from] LoginError),

    /// A required depot could not be resolved for the requested app/branch
    #[error("Depot resolution failed: {0}")]
    ResolveFailed(#[from] ResolveError),

    /// I/O or protocol error while transferring one specific job
    #[error("Transfer of {job} failed")]
    TransferFailed {
        job: String,
        #[source]
        source: ContentError,
    },

    /// Operation cancelled by the user
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Content service call failed outside of a running transfer
    #[error(transparent)]
    Content(#[from] ContentError),

    /// A download was requested without a live session
    #[error("No connected session, refusing to start {job}")]
    NotConnected { job: String },

    /// File system errors with path context
    #[error("File operation failed on '{path}' ({operation})")]
    FileSystem {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Two batch items would write into the same directory tree
    #[error("Batch destinations overlap: '{first}' and '{second}'")]
    OverlappingDestinations { first: PathBuf, second: PathBuf },

    /// A job was asked to move to a state its state machine does not allow
    #[error("Invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    /// Configuration errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        suggestion: Option<String>,
    },
}

/// Why a logon attempt was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureReason {
    /// Username, password or API key rejected
    InvalidCredentials,
    /// Password rejected while device-bound auth artifacts exist locally.
    /// The artifacts are probably expired; the caller may suggest deleting them.
    StaleAuthArtifacts,
    /// A second factor was required and not supplied
    AuthCodeRequired,
    /// The service could not be reached or dropped the connection
    Transport,
    /// Every allowed logon attempt failed
    TooManyAttempts,
}

impl std::fmt::Display for LoginFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginFailureReason::InvalidCredentials => write!(f, "invalid credentials"),
            LoginFailureReason::StaleAuthArtifacts => write!(f, "stale auth artifacts"),
            LoginFailureReason::AuthCodeRequired => write!(f, "auth code required"),
            LoginFailureReason::Transport => write!(f, "transport error"),
            LoginFailureReason::TooManyAttempts => write!(f, "too many logon attempts"),
        }
    }
}

/// Login error returned by the session manager, never thrown across the boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct LoginError {
    pub reason: LoginFailureReason,
    pub message: String,
}

impl LoginError {
    pub fn new<S: Into<String>>(reason: LoginFailureReason, message: S) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Whether the caller should suggest clearing local auth artifacts
    pub fn suggests_clearing_auth(&self) -> bool {
        self.reason == LoginFailureReason::StaleAuthArtifacts
    }
}

/// Depot resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Depot '{name}' not found")]
    DepotNotFound { name: String },

    #[error("No depots available for app {app_id}")]
    NoDepots { app_id: AppId },
}

/// Errors raised by a content delivery backend
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("HTTP request to '{url}' failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to '{url}' returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Could not decode response from '{url}': {message}")]
    Decode { url: String, message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Checksum mismatch for '{file}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error on '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("{0}")]
    Backend(String),
}

impl ContentError {
    pub fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        ContentError::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient failures worth another request
    pub fn is_transient(&self) -> bool {
        match self {
            ContentError::Http { source, .. } => {
                source.is_timeout()
                    || source.is_connect()
                    || source.status().is_none_or(|s| s.is_server_error())
            }
            ContentError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Types of file operations for error context
#[derive(Debug, Clone, PartialEq)]
pub enum FileOperation {
    Read,
    Write,
    Delete,
    CreateDir,
    ListDir,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "reading"),
            FileOperation::Write => write!(f, "writing"),
            FileOperation::Delete => write!(f, "deleting"),
            FileOperation::CreateDir => write!(f, "creating directory"),
            FileOperation::ListDir => write!(f, "listing directory"),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

impl UpdaterError {
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        UpdaterError::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn file_system<P: Into<PathBuf>>(
        path: P,
        operation: FileOperation,
        source: std::io::Error,
    ) -> Self {
        UpdaterError::FileSystem {
            path: path.into(),
            operation,
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            UpdaterError::Cancelled { .. }
                | UpdaterError::TransferFailed {
                    source: ContentError::Cancelled,
                    ..
                }
                | UpdaterError::Content(ContentError::Cancelled)
        )
    }

    /// Check if error is recoverable (worth retrying the whole operation)
    pub fn is_recoverable(&self) -> bool {
        match self {
            UpdaterError::LoginFailed(e) => e.reason == LoginFailureReason::Transport,
            UpdaterError::ResolveFailed(_) => false,
            UpdaterError::TransferFailed { source, .. } => source.is_transient(),
            UpdaterError::Cancelled { .. } => false,
            UpdaterError::Content(source) => source.is_transient(),
            UpdaterError::NotConnected { .. } => true,
            UpdaterError::FileSystem { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            UpdaterError::OverlappingDestinations { .. } => false,
            UpdaterError::InvalidTransition { .. } => false,
            UpdaterError::Configuration { .. } => false,
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            UpdaterError::LoginFailed(_) => "login_failed",
            UpdaterError::ResolveFailed(_) => "resolve_failed",
            UpdaterError::TransferFailed { .. } => "transfer_failed",
            UpdaterError::Cancelled { .. } => "cancelled",
            UpdaterError::Content(_) => "content",
            UpdaterError::NotConnected { .. } => "not_connected",
            UpdaterError::FileSystem { .. } => "file_system",
            UpdaterError::OverlappingDestinations { .. } => "overlapping_destinations",
            UpdaterError::InvalidTransition { .. } => "invalid_transition",
            UpdaterError::Configuration { .. } => "configuration",
        }
    }

    /// Get severity level for error prioritization
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            UpdaterError::LoginFailed(_) => ErrorSeverity::High,
            UpdaterError::ResolveFailed(_) => ErrorSeverity::High,
            UpdaterError::TransferFailed { .. } => ErrorSeverity::Medium,
            UpdaterError::Cancelled { .. } => ErrorSeverity::Low,
            UpdaterError::Content(_) => ErrorSeverity::Medium,
            UpdaterError::NotConnected { .. } => ErrorSeverity::Medium,
            UpdaterError::FileSystem { .. } => ErrorSeverity::High,
            UpdaterError::OverlappingDestinations { .. } => ErrorSeverity::High,
            UpdaterError::InvalidTransition { .. } => ErrorSeverity::Critical,
            UpdaterError::Configuration { .. } => ErrorSeverity::High,
        }
    }

    /// Get user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            UpdaterError::LoginFailed(e) if e.suggests_clearing_auth() => Some(
                "If the username and password are correct, delete the stored auth artifacts for this user and log in again",
            ),
            UpdaterError::LoginFailed(_) => Some("Check login/password and your internet connection"),
            UpdaterError::ResolveFailed(_) => {
                Some("The depot list may be incomplete, retry later or check the selected DLCs")
            }
            UpdaterError::OverlappingDestinations { .. } => {
                Some("Give every workshop item its own, non-nested directory")
            }
            UpdaterError::Configuration { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }

    /// Create a detailed error report for debugging
    pub fn detailed_report(&self) -> String {
        let mut report = format!("Error: {}\n", self);
        report.push_str(&format!("Category: {}\n", self.category()));
        report.push_str(&format!("Severity: {:?}\n", self.severity()));
        report.push_str(&format!("Recoverable: {}\n", self.is_recoverable()));

        if let Some(suggestion) = self.suggestion() {
            report.push_str(&format!("Suggestion: {}\n", suggestion));
        }

        if let Some(source) = self.source() {
            report.push_str(&format!("Root cause: {}\n", source));
        }

        report
    }

    /// One-line rendering used by the output log: message plus inner cause
    pub fn log_line(&self) -> String {
        match self.source() {
            Some(inner) => format!("Error: {} Inner Exception: {}", self, inner),
            None => format!("Error: {}", self),
        }
    }
}

/// Error severity levels for prioritization
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_cancelled_is_distinct_from_transfer_failure() {
        let cancelled = UpdaterError::cancelled("user request");
        let failed = UpdaterError::TransferFailed {
            job: "depot 233782".to_string(),
            source: ContentError::Backend("connection reset".to_string()),
        };

        assert!(cancelled.is_cancelled());
        assert!(!failed.is_cancelled());
        assert_eq!(cancelled.category(), "cancelled");
        assert_eq!(failed.category(), "transfer_failed");
    }

    #[test]
    fn test_stale_auth_suggestion() {
        let error = UpdaterError::from(LoginError::new(
            LoginFailureReason::StaleAuthArtifacts,
            "InvalidPassword",
        ));

        assert!(error.suggestion().unwrap().contains("auth artifacts"));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_log_line_includes_inner_cause() {
        let error = UpdaterError::TransferFailed {
            job: "item 450814997".to_string(),
            source: ContentError::Status {
                url: "http://cdn/file".to_string(),
                status: 503,
            },
        };

        let line = error.log_line();
        assert!(line.starts_with("Error: Transfer of item 450814997 failed"));
        assert!(line.contains("Inner Exception: Request to 'http://cdn/file' returned status 503"));
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_detailed_report() {
        let error = UpdaterError::ResolveFailed(ResolveError::DepotNotFound {
            name: "Arma 3 Server Creator DLC - GM".to_string(),
        });

        let report = error.detailed_report();
        assert!(report.contains("Category: resolve_failed"));
        assert!(report.contains("Severity: High"));
        assert!(report.contains("Recoverable: false"));
        assert!(report.contains("Suggestion:"));
    }
}
