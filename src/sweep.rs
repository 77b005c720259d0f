use crate::orthanc::{OrthancApi, OrthancError, Study, description_rewrite};
use regex::Regex;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| Regex::new(r"([\w.-]+@[\w.-]+\.\w+)").unwrap())
}

fn password_regex() -> &'static Regex {
    static PASSWORD_RE: OnceLock<Regex> = OnceLock::new();
    PASSWORD_RE.get_or_init(|| Regex::new(r"pw\s*=\s*([^\s]+)").unwrap())
}

/// A description carrying both a recipient address and a `pw=` token marks a
/// study still waiting for credential-based dispatch.
pub fn description_is_pending(description: &str) -> bool {
    email_regex().is_match(description) && password_regex().is_match(description)
}

pub fn is_pending(study: &Study) -> bool {
    study.is_stable && description_is_pending(&study.description())
}

/// Lists every stable study still waiting for dispatch. Studies that vanish
/// or fail to load mid-scan are skipped.
pub fn find_pending_studies(api: &dyn OrthancApi) -> Result<Vec<Study>, OrthancError> {
    let ids = api.list_studies()?;
    let mut pending = Vec::new();
    for id in ids {
        match api.study(&id) {
            Ok(Some(study)) if is_pending(&study) => pending.push(study),
            Ok(_) => {}
            Err(err) => warn!("[SWEEP] study-lookup-failed study={id} err={err}"),
        }
    }
    Ok(pending)
}

pub fn retrigger(api: &dyn OrthancApi, study: &Study) -> Result<(), OrthancError> {
    api.modify_study(&study.id, &description_rewrite(&study.description()))
        .map(|_| ())
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    /// Set when the sweep was skipped because the server just restarted.
    pub skipped_uptime: Option<Duration>,
    pub found: Vec<String>,
    pub retriggered: Vec<String>,
    pub failed: Vec<(String, OrthancError)>,
    pub still_pending: Vec<String>,
}

impl SweepReport {
    pub fn needs_alert(&self) -> bool {
        !self.still_pending.is_empty()
    }

    pub fn alert_message(&self) -> String {
        format!(
            "After cleanup, {} studies are still pending. Manual intervention may be required.",
            self.still_pending.len()
        )
    }
}

pub struct Sweeper<'a> {
    api: &'a dyn OrthancApi,
    grace: Duration,
}

impl<'a> Sweeper<'a> {
    pub fn new(api: &'a dyn OrthancApi, grace: Duration) -> Self {
        Self { api, grace }
    }

    /// Retriggers every pending study once, waits the grace period and counts
    /// what is still pending. `recent_uptime` carries the uptime of a server
    /// inside its restart window; such a server gets no sweep.
    pub fn run(&self, recent_uptime: Option<Duration>) -> Result<SweepReport, OrthancError> {
        if let Some(uptime) = recent_uptime {
            info!(
                "[SWEEP] skipped-recent-restart uptime_secs={}",
                uptime.as_secs()
            );
            return Ok(SweepReport {
                skipped_uptime: Some(uptime),
                ..SweepReport::default()
            });
        }

        let candidates = find_pending_studies(self.api)?;
        let mut report = SweepReport {
            found: candidates.iter().map(|s| s.id.clone()).collect(),
            ..SweepReport::default()
        };
        if candidates.is_empty() {
            info!("[SWEEP] no-pending-studies");
            return Ok(report);
        }

        info!("[SWEEP] retrigger-start count={}", candidates.len());
        for study in &candidates {
            match retrigger(self.api, study) {
                Ok(()) => {
                    info!("[SWEEP] retriggered study={}", study.id);
                    report.retriggered.push(study.id.clone());
                }
                Err(err) => {
                    warn!("[SWEEP] retrigger-failed study={} err={err}", study.id);
                    report.failed.push((study.id.clone(), err));
                }
            }
        }

        thread::sleep(self.grace);

        report.still_pending = find_pending_studies(self.api)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if report.still_pending.is_empty() {
            info!("[SWEEP] all-retriggered count={}", report.found.len());
        } else {
            warn!(
                "[SWEEP] still-pending count={} studies={}",
                report.still_pending.len(),
                report.still_pending.join(",")
            );
        }
        Ok(report)
    }
}
