//! Notify-once-until-healthy alerting.
//!
//! The persisted state is a flag file: present means an alert went out for
//! the current incident, absent means idle. An outage incident is cleared by
//! the next reachable health check. A stuck-study incident stays until the
//! server comes back from an outage or a sweep finds nothing pending.

use crate::config::FilesenderConfig;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_LIMIT: usize = 400;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncidentCause {
    Unreachable,
    Stuck,
}

impl IncidentCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::Stuck => "stuck",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unreachable" => Some(Self::Unreachable),
            "stuck" => Some(Self::Stuck),
            _ => None,
        }
    }
}

/// `cause` is `None` for flag files written without one; those clear like an
/// outage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationState {
    Idle,
    Notified {
        at: Option<DateTime<Utc>>,
        incident: Option<String>,
        cause: Option<IncidentCause>,
    },
}

impl NotificationState {
    pub fn is_notified(&self) -> bool {
        matches!(self, Self::Notified { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Alert(IncidentCause, String),
    /// The server answered a health check.
    Healthy,
    /// The server came back from an outage, or a completed sweep left nothing
    /// pending.
    Resolved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Send,
    Suppress,
    Clear,
    Stay,
}

pub fn transition(state: &NotificationState, signal: &Signal) -> Transition {
    match (state, signal) {
        (NotificationState::Idle, Signal::Alert(..)) => Transition::Send,
        (NotificationState::Notified { .. }, Signal::Alert(..)) => Transition::Suppress,
        (
            NotificationState::Notified {
                cause: Some(IncidentCause::Stuck),
                ..
            },
            Signal::Healthy,
        ) => Transition::Stay,
        (NotificationState::Notified { .. }, Signal::Healthy | Signal::Resolved) => {
            Transition::Clear
        }
        (NotificationState::Idle, Signal::Healthy | Signal::Resolved) => Transition::Stay,
    }
}

pub struct FlagFileStore {
    path: PathBuf,
}

impl FlagFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An unreadable flag file still counts as notified.
    pub fn load(&self) -> NotificationState {
        match fs::read_to_string(&self.path) {
            Ok(content) => parse_flag(&content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => NotificationState::Idle,
            Err(err) => {
                warn!(
                    "[NOTIFY] state-read-failed file={} err={err}",
                    self.path.display()
                );
                NotificationState::Notified {
                    at: None,
                    incident: None,
                    cause: None,
                }
            }
        }
    }

    pub fn mark(
        &self,
        at: DateTime<Utc>,
        incident: &str,
        cause: IncidentCause,
    ) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        writeln!(tmp, "notified_at={}", at.to_rfc3339())?;
        writeln!(tmp, "incident={incident}")?;
        writeln!(tmp, "cause={}", cause.as_str())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Returns whether a flag was removed.
    pub fn clear(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn parse_flag(content: &str) -> NotificationState {
    let mut at = None;
    let mut incident = None;
    let mut cause = None;
    for line in content.lines() {
        match line.trim().split_once('=') {
            Some(("notified_at", value)) => {
                at = DateTime::parse_from_rfc3339(value.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
            Some(("incident", value)) if !value.trim().is_empty() => {
                incident = Some(value.trim().to_string());
            }
            Some(("cause", value)) => cause = IncidentCause::parse(value.trim()),
            _ => {}
        }
    }
    NotificationState::Notified {
        at,
        incident,
        cause,
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to write alert file: {0}")]
    AlertFile(io::Error),
    #[error("failed to start mail command: {0}")]
    Spawn(io::Error),
    #[error("mail command timed out after {0:?}")]
    Timeout(Duration),
    #[error("mail command exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
}

impl NotifyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlertFile(_) => "alert-file",
            Self::Spawn(_) => "spawn",
            Self::Timeout(_) => "timeout",
            Self::Exit { .. } => "exit-status",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn send(&self, alert_file: &Path, message: &str) -> Result<(), NotifyError>;
}

/// Sends the alert file through the FileSender command line client.
pub struct FilesenderNotifier {
    config: FilesenderConfig,
    runtime: Arc<Runtime>,
    timeout: Duration,
}

impl FilesenderNotifier {
    pub fn new(config: FilesenderConfig, runtime: Arc<Runtime>) -> Self {
        Self {
            config,
            runtime,
            timeout: SEND_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Notifier for FilesenderNotifier {
    fn send(&self, alert_file: &Path, message: &str) -> Result<(), NotifyError> {
        let mut command = Command::new(&self.config.python);
        command
            .arg(&self.config.script)
            .arg(alert_file)
            .arg("-r")
            .arg(&self.config.recipient)
            .arg("-s")
            .arg(&self.config.subject)
            .arg("-m")
            .arg(message)
            .arg("-u")
            .arg(&self.config.username)
            .arg("-a")
            .arg(&self.config.api_key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.timeout;
        let output = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, command.output()).await })
            .map_err(|_| NotifyError::Timeout(timeout))?
            .map_err(NotifyError::Spawn)?;

        if output.status.success() {
            return Ok(());
        }
        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        Err(NotifyError::Exit {
            code: output.status.code(),
            stderr,
        })
    }
}

#[derive(Debug)]
pub enum AlertOutcome {
    Sent { incident: String },
    Suppressed,
    Failed(NotifyError),
    Cleared,
    Unchanged,
}

impl AlertOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Suppressed => "suppressed",
            Self::Failed(_) => "failed",
            Self::Cleared => "cleared",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Drives the persisted notification state from alert and recovery signals.
pub struct AlertGate<'a> {
    store: FlagFileStore,
    alert_file: PathBuf,
    notifier: &'a dyn Notifier,
}

impl<'a> AlertGate<'a> {
    pub fn new(store: FlagFileStore, alert_file: PathBuf, notifier: &'a dyn Notifier) -> Self {
        Self {
            store,
            alert_file,
            notifier,
        }
    }

    pub fn state(&self) -> NotificationState {
        self.store.load()
    }

    pub fn observe(&self, signal: &Signal, now: DateTime<Utc>) -> AlertOutcome {
        let state = self.store.load();
        match (transition(&state, signal), signal) {
            (Transition::Send, Signal::Alert(cause, message)) => self.send(*cause, message, now),
            (Transition::Suppress, Signal::Alert(_, message)) => {
                info!("[NOTIFY] alert-suppressed already-notified message={message:?}");
                AlertOutcome::Suppressed
            }
            (Transition::Clear, _) => match self.store.clear() {
                Ok(_) => {
                    info!("[NOTIFY] state-cleared signal={signal:?}");
                    AlertOutcome::Cleared
                }
                Err(err) => {
                    error!(
                        "[NOTIFY] state-clear-failed file={} err={err}",
                        self.store.path().display()
                    );
                    AlertOutcome::Unchanged
                }
            },
            _ => AlertOutcome::Unchanged,
        }
    }

    fn send(&self, cause: IncidentCause, message: &str, now: DateTime<Utc>) -> AlertOutcome {
        if let Err(err) = write_alert_file(&self.alert_file, message, now) {
            let err = NotifyError::AlertFile(err);
            error!("[NOTIFY] send-failed code={} err={err}", err.code());
            return AlertOutcome::Failed(err);
        }

        if let Err(err) = self.notifier.send(&self.alert_file, message) {
            error!("[NOTIFY] send-failed code={} err={err}", err.code());
            return AlertOutcome::Failed(err);
        }

        let incident = nanoid!(12);
        if let Err(err) = self.store.mark(now, &incident, cause) {
            error!(
                "[NOTIFY] state-mark-failed file={} err={err}",
                self.store.path().display()
            );
        }
        info!(
            "[NOTIFY] admin-notified incident={incident} cause={}",
            cause.as_str()
        );
        AlertOutcome::Sent { incident }
    }
}

fn write_alert_file(path: &Path, message: &str, now: DateTime<Utc>) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("[{}] {message}\n", now.to_rfc3339()))
}
