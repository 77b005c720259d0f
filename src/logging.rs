use crate::config::{DEFAULT_LOG_FILTER, ENV_LOG};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Installs the global subscriber. With `log_file`, every line also goes to
/// that file; if it cannot be opened logging stays on stderr only.
pub fn init(log_file: Option<&Path>) {
    let filter =
        EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match log_file.and_then(open_log_file) {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(io::stderr.and(Mutex::new(file)))
            .try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
    // A second init (tests, repeated calls) keeps the first subscriber.
    let _ = result;
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = fs::create_dir_all(parent) {
            eprintln!("log-dir-create-failed path={} err={err}", parent.display());
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log-file-open-failed path={} err={err}", path.display());
            None
        }
    }
}
