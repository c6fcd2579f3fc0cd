//! Session manager: logon, fault detection, reconnect and shutdown
//!
//! At most one session exists at a time. It is created by [`SessionManager::connect`],
//! replaced when it faults or the caller's identity changes, and destroyed by
//! [`SessionManager::shutdown`]. Jobs only ever see a read-only
//! [`ConnectedSession`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::content::{Connection, ContentClient, ContentTransport, OsIdentifier};
use crate::error::{LoginError, LoginFailureReason};
use crate::progress::OutputLog;
use crate::util::lock;

/// Identity used to log on
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Credentialed {
        username: String,
        secret: String,
        api_key: Option<String>,
    },
}

impl Credentials {
    pub fn credentialed<U: Into<String>, S: Into<String>>(username: U, secret: S) -> Self {
        Credentials::Credentialed {
            username: username.into(),
            secret: secret.into(),
            api_key: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Credentialed { username, .. } => Some(username),
        }
    }

    /// Name shown in log lines
    pub fn display_name(&self) -> &str {
        self.username().unwrap_or("anonymous")
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Credentialed { username, api_key, .. } => f
                .debug_struct("Credentialed")
                .field("username", username)
                .field("secret", &"<redacted>")
                .field("api_key", &api_key.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Supplies decrypted credentials on demand
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> Credentials;
}

impl CredentialSource for Credentials {
    fn credentials(&self) -> Credentials {
        self.clone()
    }
}

/// Supplies a one-time second-factor code when logon asks for one.
///
/// Returning `None` gives up and the logon fails with
/// [`LoginFailureReason::AuthCodeRequired`].
#[async_trait]
pub trait AuthCodeProvider: Send + Sync {
    async fn auth_code(&self, username: &str) -> Option<String>;
}

#[async_trait]
impl AuthCodeProvider for String {
    async fn auth_code(&self, _username: &str) -> Option<String> {
        Some(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Non-blocking view of the live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub connected: bool,
    pub faulted: bool,
}

/// The single live session owned by the manager
struct Session {
    credentials: Credentials,
    connection: Arc<dyn Connection>,
    client: Arc<dyn ContentClient>,
    os: OsIdentifier,
}

impl Session {
    fn is_healthy(&self) -> bool {
        self.connection.is_connected() && !self.connection.is_faulted()
    }

    fn handle(&self) -> ConnectedSession {
        ConnectedSession {
            connection: self.connection.clone(),
            client: self.client.clone(),
            os: self.os.clone(),
            anonymous: self.credentials.is_anonymous(),
        }
    }
}

/// Read-only handle on an authenticated session, shared by jobs
#[derive(Clone)]
pub struct ConnectedSession {
    connection: Arc<dyn Connection>,
    client: Arc<dyn ContentClient>,
    os: OsIdentifier,
    anonymous: bool,
}

impl std::fmt::Debug for ConnectedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSession")
            .field("os", &self.os)
            .field("anonymous", &self.anonymous)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ConnectedSession {
    pub fn client(&self) -> &Arc<dyn ContentClient> {
        &self.client
    }

    pub fn os(&self) -> &OsIdentifier {
        &self.os
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected() && !self.connection.is_faulted()
    }
}

/// Clears the logging-in flag when a connect call ends, however it ends
struct LoggingInGuard<'a>(&'a AtomicBool);

impl<'a> LoggingInGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoggingInGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the session and serializes connect/shutdown
pub struct SessionManager {
    transport: Arc<dyn ContentTransport>,
    max_logon_attempts: u32,
    content_workers: usize,
    auth_dir: Option<PathBuf>,
    auth_codes: Option<Arc<dyn AuthCodeProvider>>,
    log: OutputLog,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Mirror of the live connection so `status()` never waits on `session`
    live: Mutex<Option<Arc<dyn Connection>>>,
    logging_in: AtomicBool,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn ContentTransport>, config: &UpdaterConfig, log: OutputLog) -> Self {
        Self {
            transport,
            max_logon_attempts: config.max_logon_attempts,
            content_workers: config.content_workers,
            auth_dir: config.auth_dir.clone(),
            auth_codes: None,
            log,
            session: tokio::sync::Mutex::new(None),
            live: Mutex::new(None),
            logging_in: AtomicBool::new(false),
        }
    }

    pub fn with_auth_code_provider(mut self, provider: Arc<dyn AuthCodeProvider>) -> Self {
        self.auth_codes = Some(provider);
        self
    }

    /// Return a ready session, logging on first when there is none, it
    /// faulted, or `credentials` names a different identity
    pub async fn connect(&self, credentials: &Credentials) -> Result<ConnectedSession, LoginError> {
        let _logging_in = LoggingInGuard::new(&self.logging_in);
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_ref() {
            if session.is_healthy() && session.credentials == *credentials {
                debug!("Reusing live session for {}", credentials.display_name());
                return Ok(session.handle());
            }
        }

        if let Some(stale) = slot.take() {
            debug!(
                "Replacing session for {} (healthy: {})",
                stale.credentials.display_name(),
                stale.is_healthy()
            );
            self.teardown(stale).await;
        }

        self.log.output(
            None,
            format!("Connecting to the content service as {}", credentials.display_name()),
        );
        info!("Logging on as {}", credentials.display_name());

        let connection = match self.logon(credentials).await {
            Ok(connection) if connection.is_connected() => connection,
            Ok(connection) => {
                connection.shutdown().await;
                let error = LoginError::new(
                    LoginFailureReason::Transport,
                    "connection closed right after logon",
                );
                self.report_login_failure(credentials, &error);
                return Err(error);
            }
            Err(error) => {
                self.report_login_failure(credentials, &error);
                return Err(error);
            }
        };

        let session = Session {
            credentials: credentials.clone(),
            os: connection.os_identifier(),
            client: connection.content_client(self.content_workers),
            connection: connection.clone(),
        };
        let handle = session.handle();

        *lock(&self.live) = Some(connection);
        *slot = Some(session);

        self.log.output(None, "Connected !");
        info!("Connected as {} ({})", credentials.display_name(), handle.os());
        Ok(handle)
    }

    /// Log on once, then once more with a provider code if the service asks for one
    async fn logon(&self, credentials: &Credentials) -> Result<Arc<dyn Connection>, LoginError> {
        let error = match self.transport.connect(credentials, None, self.max_logon_attempts).await {
            Err(error) if error.reason == LoginFailureReason::AuthCodeRequired => error,
            other => return other,
        };
        let (Some(provider), Some(username)) = (&self.auth_codes, credentials.username()) else {
            return Err(error);
        };

        self.log.output(None, format!("An auth code is required for {}", username));
        let Some(code) = provider.auth_code(username).await else {
            debug!("No auth code supplied for {}", username);
            return Err(error);
        };
        self.transport
            .connect(credentials, Some(&code), self.max_logon_attempts)
            .await
    }

    fn report_login_failure(&self, credentials: &Credentials, error: &LoginError) {
        self.log.output(None, format!("Failed! Error: {}", error));
        warn!("Logon as {} failed: {}", credentials.display_name(), error);

        if error.suggests_clearing_auth() {
            let location = self
                .auth_dir
                .as_ref()
                .map(|dir| format!("'{}'", dir.display()))
                .unwrap_or_else(|| "the auth artifact directory".to_string());
            self.log.output(
                None,
                format!(
                    "Your auth artifacts for {} may be outdated. If the username and password are correct, delete them from {} and try again.",
                    credentials.display_name(),
                    location
                ),
            );
        }
    }

    /// Tear the session down; does nothing when there is none
    pub async fn shutdown(&self) {
        let mut slot = self.session.lock().await;
        match slot.take() {
            Some(session) => self.teardown(session).await,
            None => debug!("Shutdown requested without a live session"),
        }
    }

    async fn teardown(&self, session: Session) {
        self.log.output(None, "Disconnecting...");
        session.connection.shutdown().await;
        *lock(&self.live) = None;
        self.log.output(None, "Disconnected.");
        info!("Session for {} closed", session.credentials.display_name());
    }

    /// Connected/faulted flags of the live connection, without blocking
    pub fn status(&self) -> SessionStatus {
        match lock(&self.live).as_ref() {
            Some(connection) => SessionStatus {
                connected: connection.is_connected(),
                faulted: connection.is_faulted(),
            },
            None => SessionStatus::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_logging_in() {
            return ConnectionState::Connecting;
        }
        let status = self.status();
        if status.faulted {
            ConnectionState::Faulted
        } else if status.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// True for the whole duration of a `connect` call
    pub fn is_logging_in(&self) -> bool {
        self.logging_in.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    fn manager(backend: &MockBackend) -> (SessionManager, OutputLog) {
        let log = OutputLog::new();
        let config = UpdaterConfig {
            auth_dir: Some(PathBuf::from("/var/lib/updater/auth")),
            ..UpdaterConfig::default()
        };
        (SessionManager::new(backend.transport(), &config, log.clone()), log)
    }

    #[tokio::test]
    async fn test_connect_reuses_healthy_session() {
        let backend = MockBackend::new();
        let (manager, log) = manager(&backend);

        let first = manager.connect(&Credentials::Anonymous).await.unwrap();
        let second = manager.connect(&Credentials::Anonymous).await.unwrap();

        assert!(first.is_anonymous());
        assert!(second.is_connected());
        assert_eq!(backend.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            log.lines(),
            vec!["Connecting to the content service as anonymous", "Connected !"]
        );
    }

    #[tokio::test]
    async fn test_faulted_session_is_replaced() {
        let backend = MockBackend::new();
        let (manager, _log) = manager(&backend);

        manager.connect(&Credentials::Anonymous).await.unwrap();
        backend.fault_connection();
        assert_eq!(manager.state(), ConnectionState::Faulted);

        manager.connect(&Credentials::Anonymous).await.unwrap();
        assert_eq!(backend.connect_count(), 2);
        assert_eq!(backend.shutdown_count(), 1);
        assert!(manager.status().connected);
    }

    #[tokio::test]
    async fn test_identity_change_reconnects() {
        let backend = MockBackend::new();
        let (manager, _log) = manager(&backend);

        manager.connect(&Credentials::Anonymous).await.unwrap();
        let session = manager
            .connect(&Credentials::credentialed("server-admin", "hunter2"))
            .await
            .unwrap();

        assert!(!session.is_anonymous());
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_auth_failure_is_reported() {
        let backend = MockBackend::new();
        backend.fail_login(LoginError::new(
            LoginFailureReason::StaleAuthArtifacts,
            "InvalidPassword",
        ));
        let (manager, log) = manager(&backend);

        let error = manager
            .connect(&Credentials::credentialed("server-admin", "hunter2"))
            .await
            .unwrap_err();

        assert!(error.suggests_clearing_auth());
        assert!(!manager.is_logging_in());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let lines = log.lines();
        assert_eq!(lines[1], "Failed! Error: stale auth artifacts: InvalidPassword");
        assert!(lines[2].contains("/var/lib/updater/auth"));
    }

    #[tokio::test]
    async fn test_auth_code_retry_uses_provider_code() {
        let backend = MockBackend::new();
        backend.require_auth_code("F7K2Q");
        let (manager, log) = manager(&backend);
        let manager = manager.with_auth_code_provider(Arc::new("F7K2Q".to_string()));

        let session = manager
            .connect(&Credentials::credentialed("server-admin", "hunter2"))
            .await
            .unwrap();

        assert!(session.is_connected());
        assert_eq!(backend.auth_codes(), vec![None, Some("F7K2Q".to_string())]);
        assert_eq!(
            log.lines(),
            vec![
                "Connecting to the content service as server-admin",
                "An auth code is required for server-admin",
                "Connected !",
            ]
        );
    }

    #[tokio::test]
    async fn test_auth_code_retried_only_once() {
        let backend = MockBackend::new();
        backend.require_auth_code("F7K2Q");
        let (manager, log) = manager(&backend);
        let manager = manager.with_auth_code_provider(Arc::new("000000".to_string()));

        let error = manager
            .connect(&Credentials::credentialed("server-admin", "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(error.reason, LoginFailureReason::AuthCodeRequired);
        assert_eq!(backend.connect_count(), 2);
        assert!(log.lines().contains(&"Failed! Error: auth code required: AuthCodeRequired".to_string()));
    }

    #[tokio::test]
    async fn test_auth_code_required_without_provider_fails() {
        let backend = MockBackend::new();
        backend.require_auth_code("F7K2Q");
        let (manager, _log) = manager(&backend);

        let error = manager
            .connect(&Credentials::credentialed("server-admin", "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(error.reason, LoginFailureReason::AuthCodeRequired);
        assert_eq!(backend.auth_codes(), vec![None]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let backend = MockBackend::new();
        let (manager, log) = manager(&backend);

        manager.shutdown().await;
        manager.connect(&Credentials::Anonymous).await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;

        assert_eq!(backend.shutdown_count(), 1);
        assert_eq!(manager.status(), SessionStatus::default());
        let lines = log.lines();
        assert_eq!(&lines[2..], ["Disconnecting...", "Disconnected."]);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let credentials = Credentials::Credentialed {
            username: "server-admin".to_string(),
            secret: "hunter2".to_string(),
            api_key: Some("key".to_string()),
        };

        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("server-admin"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("\"key\""));
    }
}
