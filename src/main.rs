mod archive;
mod changes;
mod config;
mod forward;
mod health;
mod journal;
mod logging;
mod notify;
mod orthanc;
mod stable;
mod sweep;
#[cfg(test)]
mod testing;
mod watcher;

use crate::changes::{ChangeCursor, ChangeFollower};
use crate::config::{
    ArchiveConfig, ConfigError, FilesenderConfig, OrthancConfig, StatePaths, WatcherConfig,
    changes_poll_interval, health_policy, process_env,
};
use crate::health::{Health, check_health};
use crate::journal::{Journal, JournalError};
use crate::notify::{AlertGate, FilesenderNotifier, FlagFileStore};
use crate::orthanc::{HttpOrthanc, OrthancError};
use crate::stable::StableStudyHandler;
use crate::watcher::Watcher;
use chrono::{DateTime, Utc};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use std::io;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "orthanc-watchdog",
    about = "Archive/forward handler and health watcher for an Orthanc server",
    disable_version_flag = true
)]
struct Cli {
    /// Print the release tag and exit.
    #[arg(short = 'V', long = "version", action = ArgAction::SetTrue)]
    version: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the health watcher loop.
    Watch {
        #[arg(long)]
        interval_secs: Option<u64>,
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Check server reachability once.
    Check,
    /// Forward and, when old enough, archive one stable study.
    OnStable { study_id: String },
    /// Follow the server's change log and handle every stable study.
    FollowChanges {
        #[arg(long)]
        poll_secs: Option<u64>,
        #[arg(long)]
        max_iterations: Option<u64>,
        #[arg(long)]
        since: Option<u64>,
    },
    /// Show recent journal entries.
    Events {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        component: Option<String>,
    },
    /// Print the release tag.
    Version,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("orthanc: {0}")]
    Orthanc(#[from] OrthancError),
    #[error("journal: {0}")]
    Journal(#[from] JournalError),
    #[error("runtime: {0}")]
    Runtime(#[from] io::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Config(err) => err.code(),
            Self::Orthanc(err) => err.code(),
            Self::Journal(err) => err.code(),
            Self::Runtime(_) => "runtime",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if cli.version {
        print_version();
        process::exit(0);
    }

    let result = match cli.command {
        Some(Commands::Watch {
            interval_secs,
            max_iterations,
        }) => run_watch_cli(interval_secs, max_iterations),
        Some(Commands::Check) => run_check_cli(),
        Some(Commands::OnStable { study_id }) => run_on_stable_cli(&study_id),
        Some(Commands::FollowChanges {
            poll_secs,
            max_iterations,
            since,
        }) => run_follow_cli(poll_secs, max_iterations, since),
        Some(Commands::Events { limit, component }) => run_events_cli(limit, component.as_deref()),
        Some(Commands::Version) => {
            print_version();
            Ok(0)
        }
        None => {
            let _ = Cli::command().print_help();
            Ok(2)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("command-failed code={} err={err}", err.code());
            eprintln!("error: {err}");
            process::exit(err.exit_code());
        }
    }
}

fn print_version() {
    println!("v{}", env!("CARGO_PKG_VERSION"));
}

fn runtime() -> Result<Arc<Runtime>, CliError> {
    Ok(Arc::new(Runtime::new()?))
}

fn run_watch_cli(interval_secs: Option<u64>, max_iterations: Option<u64>) -> Result<i32, CliError> {
    let paths = StatePaths::from_lookup(process_env);
    logging::init(Some(&paths.log_file()));

    let orthanc = OrthancConfig::from_lookup(process_env)?;
    let mut watcher_config = WatcherConfig::from_lookup(process_env)?;
    if let Some(secs) = interval_secs {
        watcher_config.interval = Duration::from_secs(secs);
    }
    let filesender = FilesenderConfig::from_lookup(process_env)?;

    let runtime = runtime()?;
    let api = HttpOrthanc::new(&orthanc, runtime.clone())?;
    let journal = Journal::open_or_memory(&paths.db_url, runtime.clone())?;
    let notifier = FilesenderNotifier::new(filesender, runtime);
    let gate = AlertGate::new(
        FlagFileStore::new(paths.notification_state_file()),
        paths.alert_file(),
        &notifier,
    );

    Watcher::new(&api, &watcher_config, gate, &journal).run(max_iterations);
    Ok(0)
}

fn run_check_cli() -> Result<i32, CliError> {
    logging::init(None);
    let orthanc = OrthancConfig::from_lookup(process_env)?;
    let (attempts, delay) = health_policy(process_env)?;
    let api = HttpOrthanc::new(&orthanc, runtime()?)?;

    let health = check_health(&api, attempts, delay);
    match &health {
        Health::Reachable(info) => println!(
            "reachable name={} version={}",
            info.name.as_deref().unwrap_or("unknown"),
            info.version.as_deref().unwrap_or("unknown")
        ),
        Health::Unreachable {
            attempts,
            last_error,
        } => println!("unreachable attempts={attempts} err={last_error}"),
    }
    Ok(if health.is_reachable() { 0 } else { 1 })
}

fn run_on_stable_cli(study_id: &str) -> Result<i32, CliError> {
    let paths = StatePaths::from_lookup(process_env);
    logging::init(Some(&paths.log_file()));

    let orthanc = OrthancConfig::from_lookup(process_env)?;
    let archive = ArchiveConfig::from_lookup(process_env)?;

    let runtime = runtime()?;
    let api = HttpOrthanc::new(&orthanc, runtime.clone())?;
    let journal = Journal::open_or_memory(&paths.db_url, runtime)?;

    let report = StableStudyHandler::new(&api, &archive, &journal)
        .handle(study_id, Utc::now().naive_utc());
    Ok(if report.is_success() { 0 } else { 1 })
}

fn run_follow_cli(
    poll_secs: Option<u64>,
    max_iterations: Option<u64>,
    since: Option<u64>,
) -> Result<i32, CliError> {
    let paths = StatePaths::from_lookup(process_env);
    logging::init(Some(&paths.log_file()));

    let orthanc = OrthancConfig::from_lookup(process_env)?;
    let archive = ArchiveConfig::from_lookup(process_env)?;
    let poll = match poll_secs {
        Some(secs) => Duration::from_secs(secs),
        None => changes_poll_interval(process_env)?,
    };

    let runtime = runtime()?;
    let api = HttpOrthanc::new(&orthanc, runtime.clone())?;
    let journal = Journal::open_or_memory(&paths.db_url, runtime)?;

    let follower = ChangeFollower::new(
        &api,
        StableStudyHandler::new(&api, &archive, &journal),
        ChangeCursor::new(paths.cursor_file()),
        poll,
    );
    follower.run(since, max_iterations)?;
    Ok(0)
}

fn run_events_cli(limit: u32, component: Option<&str>) -> Result<i32, CliError> {
    logging::init(None);
    let paths = StatePaths::from_lookup(process_env);
    let journal = Journal::open(&paths.db_url, runtime()?)?;

    for event in journal.recent(limit, component)? {
        let ts = DateTime::<Utc>::from_timestamp(event.ts, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| event.ts.to_string());
        println!(
            "#{} {ts} {} {} {} study={} meta={}",
            event.id,
            event.component,
            event.action,
            event.status,
            event.study_id.as_deref().unwrap_or("-"),
            event.meta
        );
    }
    Ok(0)
}
