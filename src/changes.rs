use crate::orthanc::{OrthancApi, OrthancError};
use crate::stable::{HandlerReport, StableStudyHandler};
use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

const PAGE_LIMIT: u32 = 100;

/// Last processed change sequence, persisted so a restart resumes where the
/// previous run stopped.
pub struct ChangeCursor {
    path: PathBuf,
}

impl ChangeCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> io::Result<Option<u64>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, seq: u64) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{seq}")?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PollReport {
    pub next: u64,
    pub done: bool,
    pub handled: Vec<HandlerReport>,
}

/// Feeds `StableStudy` events from the server's change log into the
/// stable-study handler.
pub struct ChangeFollower<'a> {
    api: &'a dyn OrthancApi,
    handler: StableStudyHandler<'a>,
    cursor: ChangeCursor,
    poll_interval: Duration,
}

impl<'a> ChangeFollower<'a> {
    pub fn new(
        api: &'a dyn OrthancApi,
        handler: StableStudyHandler<'a>,
        cursor: ChangeCursor,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            handler,
            cursor,
            poll_interval,
        }
    }

    /// Explicit `since`, then the saved cursor, then the server's newest
    /// sequence so old history is not replayed.
    pub fn start_seq(&self, since: Option<u64>) -> Result<u64, OrthancError> {
        if let Some(since) = since {
            return Ok(since);
        }
        match self.cursor.load() {
            Ok(Some(seq)) => return Ok(seq),
            Ok(None) => {}
            Err(err) => warn!("[CHANGES] cursor-unreadable err={err}"),
        }
        let last = self.api.last_change_seq()?;
        info!("[CHANGES] starting-from-latest seq={last}");
        Ok(last)
    }

    pub fn poll_once(&self, since: u64) -> Result<PollReport, OrthancError> {
        let page = self.api.changes(since, PAGE_LIMIT)?;
        let mut handled = Vec::new();
        for change in page.changes.iter().filter(|c| c.is_stable_study()) {
            info!("[CHANGES] stable-study seq={} study={}", change.seq, change.id);
            let report = self.handler.handle(&change.id, Utc::now().naive_utc());
            if !report.is_success() {
                warn!("[CHANGES] handler-failed seq={} study={}", change.seq, report.study_id);
            }
            handled.push(report);
        }

        let next = if page.changes.is_empty() {
            since
        } else {
            page.last.max(since)
        };
        if next != since {
            if let Err(err) = self.cursor.save(next) {
                warn!("[CHANGES] cursor-save-failed seq={next} err={err}");
            }
        }

        Ok(PollReport {
            next,
            done: page.done,
            handled,
        })
    }

    pub fn run(&self, since: Option<u64>, max_iterations: Option<u64>) -> Result<(), OrthancError> {
        let mut seq = self.start_seq(since)?;
        let mut iterations: u64 = 0;

        loop {
            iterations = iterations.saturating_add(1);
            let idle = match self.poll_once(seq) {
                Ok(report) => {
                    if !report.handled.is_empty() {
                        info!(
                            "[CHANGES] page-done next={} handled={}",
                            report.next,
                            report.handled.len()
                        );
                    }
                    seq = report.next;
                    report.done
                }
                Err(err) => {
                    error!("[CHANGES] poll-failed seq={seq} code={} err={err}", err.code());
                    true
                }
            };

            if let Some(limit) = max_iterations {
                if iterations >= limit {
                    break;
                }
            }
            if idle {
                thread::sleep(self.poll_interval);
            }
        }

        Ok(())
    }
}
