use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const ENV_ORTHANC_URL: &str = "ORTHANC_URL";
pub const ENV_ORTHANC_USERNAME: &str = "ORTHANC_USERNAME";
pub const ENV_ORTHANC_PASSWORD: &str = "ORTHANC_PASSWORD";
pub const ENV_HOME_DIR: &str = "HOME_DIR";
pub const ENV_STATE_DIR: &str = "WATCHDOG_STATE_DIR";
pub const ENV_DB_URL: &str = "WATCHDOG_DB_URL";
pub const ENV_ORTHANC_CONFIG: &str = "WATCHDOG_ORTHANC_CONFIG";
pub const ENV_ARCHIVE_AFTER_DAYS: &str = "WATCHDOG_ARCHIVE_AFTER_DAYS";
pub const ENV_ARCHIVE_DIR: &str = "WATCHDOG_ARCHIVE_DIR";
pub const ENV_FORWARD_MODALITY: &str = "WATCHDOG_FORWARD_MODALITY";
pub const ENV_INTERVAL_SECS: &str = "WATCHDOG_INTERVAL_SECS";
pub const ENV_HEALTH_ATTEMPTS: &str = "WATCHDOG_HEALTH_ATTEMPTS";
pub const ENV_HEALTH_RETRY_DELAY_SECS: &str = "WATCHDOG_HEALTH_RETRY_DELAY_SECS";
pub const ENV_RETRIGGER_GRACE_SECS: &str = "WATCHDOG_RETRIGGER_GRACE_SECS";
pub const ENV_RESTART_WINDOW_SECS: &str = "WATCHDOG_RESTART_WINDOW_SECS";
pub const ENV_CHANGES_POLL_SECS: &str = "WATCHDOG_CHANGES_POLL_SECS";
pub const ENV_FILESENDER_USERNAME: &str = "FILESENDER_USERNAME";
pub const ENV_FILESENDER_API_KEY: &str = "FILESENDER_API_KEY";
pub const ENV_FILESENDER_RECIPIENT: &str = "FILESENDER_RECIPIENT";
pub const ENV_FILESENDER_SCRIPT: &str = "FILESENDER_SCRIPT";
pub const ENV_FILESENDER_PYTHON: &str = "FILESENDER_PYTHON";
pub const ENV_LOG: &str = "WATCHDOG_LOG";

pub const DEFAULT_ARCHIVE_AFTER_DAYS: u64 = 30;
pub const DEFAULT_ARCHIVE_DIR: &str = "/var/lib/orthanc/archive";
pub const DEFAULT_FORWARD_MODALITY: &str = "processing";
pub const DEFAULT_INTERVAL_SECS: u64 = 120;
pub const DEFAULT_HEALTH_ATTEMPTS: u32 = 3;
pub const DEFAULT_HEALTH_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_RETRIGGER_GRACE_SECS: u64 = 20;
pub const DEFAULT_RESTART_WINDOW_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_CHANGES_POLL_SECS: u64 = 10;
pub const DEFAULT_FILESENDER_SCRIPT: &str = "/app/switchfilesender/filesender_cli/filesender.py";
pub const DEFAULT_FILESENDER_PYTHON: &str = "python3";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const ALERT_SUBJECT: &str = "Orthanc Watcher: System Alert";

const STATE_FILE_NAME: &str = "notification_state.txt";
const ALERT_FILE_NAME: &str = "admin_alert.txt";
const CURSOR_FILE_NAME: &str = "changes.cursor";
const LOG_FILE_NAME: &str = "watchdog.log";
const DB_FILE_NAME: &str = "watchdog.db";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "config-missing",
            Self::Invalid { .. } => "config-invalid",
        }
    }
}

/// Reads a variable through `lookup`, treating blank values as unset.
fn lookup_trimmed<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn require<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_trimmed(lookup, name).ok_or(ConfigError::Missing(name))
}

fn lookup_u64<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("expected a non-negative integer, got {raw:?}"),
        }),
        None => Ok(default),
    }
}

fn lookup_secs<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_u64(lookup, name, default).map(Duration::from_secs)
}

pub fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct OrthancConfig {
    pub base_url: Url,
    pub credentials: Option<Credentials>,
}

impl OrthancConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = require(&lookup, ENV_ORTHANC_URL)?;
        let base_url = parse_base_url(&raw)?;
        let credentials = match (
            lookup_trimmed(&lookup, ENV_ORTHANC_USERNAME),
            lookup(ENV_ORTHANC_PASSWORD),
        ) {
            (Some(username), password) => Some(Credentials {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, _) => None,
        };
        Ok(Self {
            base_url,
            credentials,
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
        name: ENV_ORTHANC_URL,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ConfigError::Invalid {
            name: ENV_ORTHANC_URL,
            reason: format!("unsupported url {raw}"),
        });
    }
    Ok(url)
}

/// Where the watchdog keeps its own files.
#[derive(Clone, Debug)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub db_url: String,
}

impl StatePaths {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_dir = match lookup_trimmed(&lookup, ENV_STATE_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => match lookup_trimmed(&lookup, ENV_HOME_DIR) {
                Some(home) => Path::new(&home).join("logs").join("watcher"),
                None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            },
        };
        let db_url = lookup_trimmed(&lookup, ENV_DB_URL).unwrap_or_else(|| {
            format!("sqlite://{}", state_dir.join(DB_FILE_NAME).to_string_lossy())
        });
        Self { state_dir, db_url }
    }

    pub fn notification_state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn alert_file(&self) -> PathBuf {
        self.state_dir.join(ALERT_FILE_NAME)
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.state_dir.join(CURSOR_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE_NAME)
    }
}

#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub archive_after_days: u64,
    pub archive_dir: PathBuf,
    pub forward_modality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OrthancArchiveSettings {
    archive_after_days: Option<u64>,
    archive_directory: Option<String>,
}

impl ArchiveConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_settings = lookup_trimmed(&lookup, ENV_ORTHANC_CONFIG)
            .map(|path| read_orthanc_settings(Path::new(&path)))
            .unwrap_or_default();

        let archive_after_days = lookup_u64(
            &lookup,
            ENV_ARCHIVE_AFTER_DAYS,
            file_settings
                .archive_after_days
                .unwrap_or(DEFAULT_ARCHIVE_AFTER_DAYS),
        )?;
        let archive_dir = lookup_trimmed(&lookup, ENV_ARCHIVE_DIR)
            .or(file_settings.archive_directory)
            .unwrap_or_else(|| DEFAULT_ARCHIVE_DIR.to_string());

        // Explicitly empty disables forwarding, unset keeps the default target.
        let forward_modality = match lookup(ENV_FORWARD_MODALITY) {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().to_string()),
            None => Some(DEFAULT_FORWARD_MODALITY.to_string()),
        };

        Ok(Self {
            archive_after_days,
            archive_dir: PathBuf::from(archive_dir),
            forward_modality,
        })
    }
}

fn read_orthanc_settings(path: &Path) -> OrthancArchiveSettings {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("[CONFIG] orthanc-config-unreadable path={} err={err}", path.display());
            return OrthancArchiveSettings::default();
        }
    };
    match parse_orthanc_settings(&raw) {
        Ok(settings) => settings,
        Err(err) => {
            warn!("[CONFIG] orthanc-config-invalid path={} err={err}", path.display());
            OrthancArchiveSettings::default()
        }
    }
}

// The server's configuration format allows `//` comment lines, which plain
// JSON does not.
fn parse_orthanc_settings(raw: &str) -> Result<OrthancArchiveSettings, serde_json::Error> {
    let stripped: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n");
    serde_json::from_str(&stripped)
}

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub interval: Duration,
    pub health_attempts: u32,
    pub health_retry_delay: Duration,
    pub retrigger_grace: Duration,
    pub restart_window: Duration,
}

impl WatcherConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        require(&lookup, ENV_HOME_DIR)?;
        let (health_attempts, health_retry_delay) = health_policy(&lookup)?;
        Ok(Self {
            interval: lookup_secs(&lookup, ENV_INTERVAL_SECS, DEFAULT_INTERVAL_SECS)?,
            health_attempts,
            health_retry_delay,
            retrigger_grace: lookup_secs(
                &lookup,
                ENV_RETRIGGER_GRACE_SECS,
                DEFAULT_RETRIGGER_GRACE_SECS,
            )?,
            restart_window: lookup_secs(
                &lookup,
                ENV_RESTART_WINDOW_SECS,
                DEFAULT_RESTART_WINDOW_SECS,
            )?,
        })
    }
}

/// Attempts (at least one) and the delay between them.
pub fn health_policy<F>(lookup: F) -> Result<(u32, Duration), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let attempts = lookup_u64(&lookup, ENV_HEALTH_ATTEMPTS, u64::from(DEFAULT_HEALTH_ATTEMPTS))?;
    let delay = lookup_secs(
        &lookup,
        ENV_HEALTH_RETRY_DELAY_SECS,
        DEFAULT_HEALTH_RETRY_DELAY_SECS,
    )?;
    Ok((u32::try_from(attempts.max(1)).unwrap_or(u32::MAX), delay))
}

pub fn changes_poll_interval<F>(lookup: F) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_secs(&lookup, ENV_CHANGES_POLL_SECS, DEFAULT_CHANGES_POLL_SECS)
}

#[derive(Clone)]
pub struct FilesenderConfig {
    pub python: String,
    pub script: PathBuf,
    pub recipient: String,
    pub username: String,
    pub api_key: String,
    pub subject: String,
}

impl std::fmt::Debug for FilesenderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesenderConfig")
            .field("python", &self.python)
            .field("script", &self.script)
            .field("recipient", &self.recipient)
            .field("username", &self.username)
            .field("api_key", &"***")
            .field("subject", &self.subject)
            .finish()
    }
}

impl FilesenderConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = require(&lookup, ENV_FILESENDER_USERNAME)?;
        let api_key = require(&lookup, ENV_FILESENDER_API_KEY)?;
        let recipient =
            lookup_trimmed(&lookup, ENV_FILESENDER_RECIPIENT).unwrap_or_else(|| username.clone());
        Ok(Self {
            python: lookup_trimmed(&lookup, ENV_FILESENDER_PYTHON)
                .unwrap_or_else(|| DEFAULT_FILESENDER_PYTHON.to_string()),
            script: PathBuf::from(
                lookup_trimmed(&lookup, ENV_FILESENDER_SCRIPT)
                    .unwrap_or_else(|| DEFAULT_FILESENDER_SCRIPT.to_string()),
            ),
            recipient,
            username,
            api_key,
            subject: ALERT_SUBJECT.to_string(),
        })
    }
}
