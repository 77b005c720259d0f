use crate::config::WatcherConfig;
use crate::health::{Health, check_health, parse_startup_time, recent_restart};
use crate::journal::Journal;
use crate::notify::{AlertGate, AlertOutcome, IncidentCause, Signal};
use crate::orthanc::{OrthancApi, OrthancError};
use crate::sweep::{SweepReport, Sweeper};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;
use std::thread;
use tracing::{error, info};

const COMPONENT: &str = "watcher";

pub const UNREACHABLE_MESSAGE: &str = "Orthanc is not reachable. Docker Compose should have already attempted a restart. Please check manually.";

#[derive(Debug)]
pub struct IterationReport {
    pub reachable: bool,
    pub health_alert: AlertOutcome,
    pub sweep: Option<SweepReport>,
    pub sweep_alert: Option<AlertOutcome>,
}

pub struct Watcher<'a> {
    api: &'a dyn OrthancApi,
    config: &'a WatcherConfig,
    gate: AlertGate<'a>,
    journal: &'a Journal,
    last_reachable: Option<bool>,
    /// Set when this process saw the server come back; stands in for a
    /// startup time the server does not report.
    observed_startup: Option<NaiveDateTime>,
}

impl<'a> Watcher<'a> {
    pub fn new(
        api: &'a dyn OrthancApi,
        config: &'a WatcherConfig,
        gate: AlertGate<'a>,
        journal: &'a Journal,
    ) -> Self {
        Self {
            api,
            config,
            gate,
            journal,
            last_reachable: None,
            observed_startup: None,
        }
    }

    pub fn run(&mut self, max_iterations: Option<u64>) {
        let mut iterations: u64 = 0;
        info!(
            "[WATCHER] started interval_secs={} attempts={} notified={}",
            self.config.interval.as_secs(),
            self.config.health_attempts,
            self.gate.state().is_notified()
        );

        loop {
            iterations = iterations.saturating_add(1);
            info!("[WATCHER] tick iteration={iterations}");

            match self.run_iteration(Utc::now()) {
                Ok(report) => info!(
                    "[WATCHER] iteration-done iteration={iterations} reachable={} health_alert={} sweep_alert={} pending={}",
                    report.reachable,
                    report.health_alert.code(),
                    report.sweep_alert.as_ref().map_or("none", AlertOutcome::code),
                    report.sweep.as_ref().map_or(0, |s| s.still_pending.len())
                ),
                Err(err) => {
                    error!(
                        "[WATCHER] iteration-failed iteration={iterations} code={} err={err}",
                        err.code()
                    );
                    self.journal.record(
                        COMPONENT,
                        "iteration-failed",
                        "error",
                        None,
                        json!({ "iteration": iterations, "error": err.to_string() }),
                    );
                }
            }

            if let Some(limit) = max_iterations {
                if iterations >= limit {
                    break;
                }
            }

            thread::sleep(self.config.interval);
        }
    }

    /// Health check, notification transition, then the stuck-study sweep when
    /// the server answered.
    pub fn run_iteration(&mut self, now: DateTime<Utc>) -> Result<IterationReport, OrthancError> {
        let health = check_health(
            self.api,
            self.config.health_attempts,
            self.config.health_retry_delay,
        );

        let info = match health {
            Health::Unreachable {
                attempts,
                last_error,
            } => {
                self.last_reachable = Some(false);
                self.journal.record(
                    COMPONENT,
                    "unreachable",
                    "error",
                    None,
                    json!({ "attempts": attempts, "error": last_error.to_string() }),
                );
                let outcome = self.alert(IncidentCause::Unreachable, UNREACHABLE_MESSAGE, now);
                return Ok(IterationReport {
                    reachable: false,
                    health_alert: outcome,
                    sweep: None,
                    sweep_alert: None,
                });
            }
            Health::Reachable(info) => info,
        };

        let back_online = self.last_reachable == Some(false);
        if back_online {
            info!("[WATCHER] server-back-online");
            self.observed_startup = Some(now.naive_utc());
        }
        self.last_reachable = Some(true);

        let signal = if back_online {
            Signal::Resolved
        } else {
            Signal::Healthy
        };
        let health_alert = self.gate.observe(&signal, now);
        if matches!(health_alert, AlertOutcome::Cleared) {
            info!("[WATCHER] recovered notification-state-cleared");
            self.journal
                .record(COMPONENT, "recovered", "ok", None, json!({}));
        } else {
            info!("[WATCHER] server-running-normally");
        }

        let startup = info
            .startup_time
            .as_deref()
            .and_then(parse_startup_time)
            .or(self.observed_startup);
        let uptime =
            startup.and_then(|s| recent_restart(s, now.naive_utc(), self.config.restart_window));

        let sweep = Sweeper::new(self.api, self.config.retrigger_grace).run(uptime)?;
        self.record_sweep(&sweep);

        let sweep_alert = if sweep.needs_alert() {
            Some(self.alert(IncidentCause::Stuck, &sweep.alert_message(), now))
        } else if sweep.skipped_uptime.is_none() {
            let outcome = self.gate.observe(&Signal::Resolved, now);
            if matches!(outcome, AlertOutcome::Cleared) {
                info!("[WATCHER] pending-studies-resolved notification-state-cleared");
                self.journal
                    .record(COMPONENT, "stuck-resolved", "ok", None, json!({}));
            }
            Some(outcome)
        } else {
            None
        };

        Ok(IterationReport {
            reachable: true,
            health_alert,
            sweep: Some(sweep),
            sweep_alert,
        })
    }

    fn alert(&self, cause: IncidentCause, message: &str, now: DateTime<Utc>) -> AlertOutcome {
        let outcome = self
            .gate
            .observe(&Signal::Alert(cause, message.to_string()), now);
        let meta = match &outcome {
            AlertOutcome::Sent { incident } => json!({
                "incident": incident,
                "cause": cause.as_str(),
                "message": message,
            }),
            AlertOutcome::Failed(err) => json!({
                "cause": cause.as_str(),
                "message": message,
                "code": err.code(),
                "error": err.to_string(),
            }),
            _ => json!({ "cause": cause.as_str(), "message": message }),
        };
        let status = if matches!(outcome, AlertOutcome::Failed(_)) {
            "error"
        } else {
            "ok"
        };
        self.journal
            .record("notify", outcome.code(), status, None, meta);
        outcome
    }

    fn record_sweep(&self, sweep: &SweepReport) {
        for study in &sweep.retriggered {
            self.journal
                .record("sweep", "retriggered", "ok", Some(study), json!({}));
        }
        for (study, err) in &sweep.failed {
            self.journal.record(
                "sweep",
                "retrigger-failed",
                "error",
                Some(study),
                json!({ "error": err.to_string() }),
            );
        }
        if let Some(uptime) = sweep.skipped_uptime {
            self.journal.record(
                "sweep",
                "skipped-recent-restart",
                "ok",
                None,
                json!({ "uptime_secs": uptime.as_secs() }),
            );
        } else if !sweep.found.is_empty() {
            self.journal.record(
                "sweep",
                "summary",
                if sweep.still_pending.is_empty() { "ok" } else { "error" },
                None,
                json!({
                    "found": sweep.found.len(),
                    "retriggered": sweep.retriggered.len(),
                    "still_pending": sweep.still_pending.len(),
                }),
            );
        }
    }
}
