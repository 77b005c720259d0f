use crate::archive::{
    ArchiveError, ArchiveOutcome, Archiver, UploadTime, is_archive_eligible, resolve_upload_time,
};
use crate::config::ArchiveConfig;
use crate::forward::{ForwardOutcome, forward_study};
use crate::journal::Journal;
use crate::orthanc::OrthancApi;
use chrono::NaiveDateTime;
use serde_json::json;
use tracing::{error, info, warn};

const COMPONENT_FORWARD: &str = "forward";
const COMPONENT_ARCHIVE: &str = "archive";

#[derive(Debug)]
pub enum ArchiveStep {
    StudyMissing,
    NoUploadDate,
    NotEligible { upload: UploadTime },
    Done(ArchiveOutcome),
    Failed(ArchiveError),
}

impl ArchiveStep {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::StudyMissing => "study-missing",
            Self::NoUploadDate => "no-upload-date",
            Self::NotEligible { .. } => "not-eligible",
            Self::Done(ArchiveOutcome::Archived { .. }) => "archived",
            Self::Done(ArchiveOutcome::AlreadyArchived { .. }) => "already-archived",
            Self::Failed(err) => err.code(),
        }
    }
}

#[derive(Debug)]
pub struct HandlerReport {
    pub study_id: String,
    /// `None` when forwarding is disabled.
    pub forward: Option<ForwardOutcome>,
    pub archive: ArchiveStep,
}

impl HandlerReport {
    pub fn is_success(&self) -> bool {
        let forward_ok = self
            .forward
            .as_ref()
            .is_none_or(|outcome| outcome.is_success() || *outcome == ForwardOutcome::StudyMissing);
        forward_ok && !self.archive.is_failure()
    }
}

/// Runs the forward step and the archive step for a study that just became
/// stable. The two steps never short-circuit each other.
pub struct StableStudyHandler<'a> {
    api: &'a dyn OrthancApi,
    config: &'a ArchiveConfig,
    journal: &'a Journal,
}

impl<'a> StableStudyHandler<'a> {
    pub fn new(api: &'a dyn OrthancApi, config: &'a ArchiveConfig, journal: &'a Journal) -> Self {
        Self {
            api,
            config,
            journal,
        }
    }

    pub fn handle(&self, study_id: &str, now: NaiveDateTime) -> HandlerReport {
        let forward = self
            .config
            .forward_modality
            .as_deref()
            .map(|modality| self.forward(modality, study_id));
        let archive = self.archive(study_id, now);

        let report = HandlerReport {
            study_id: study_id.to_string(),
            forward,
            archive,
        };
        info!(
            "[ARCHIVE] stable-study-handled study={study_id} forward={} archive={} ok={}",
            report.forward.as_ref().map_or("disabled", ForwardOutcome::code),
            report.archive.code(),
            report.is_success()
        );
        report
    }

    fn forward(&self, modality: &str, study_id: &str) -> ForwardOutcome {
        let outcome = forward_study(self.api, modality, study_id);
        let meta = match &outcome {
            ForwardOutcome::Forwarded { instances } => {
                json!({ "modality": modality, "instances": instances })
            }
            ForwardOutcome::Incomplete { instances, failed } => json!({
                "modality": modality,
                "instances": instances,
                "failed": failed,
            }),
            ForwardOutcome::Failed(err) => {
                json!({ "modality": modality, "error": err.to_string() })
            }
            ForwardOutcome::StudyMissing | ForwardOutcome::EmptyResponse => {
                json!({ "modality": modality })
            }
        };
        let status = if outcome.is_success() { "ok" } else { "error" };
        self.journal
            .record(COMPONENT_FORWARD, outcome.code(), status, Some(study_id), meta);
        outcome
    }

    fn archive(&self, study_id: &str, now: NaiveDateTime) -> ArchiveStep {
        let step = self.evaluate_archive(study_id, now);
        match &step {
            ArchiveStep::Done(ArchiveOutcome::Archived {
                path,
                instances,
                sha256,
            }) => self.journal.record(
                COMPONENT_ARCHIVE,
                "archived",
                "ok",
                Some(study_id),
                json!({
                    "path": path.display().to_string(),
                    "instances": instances,
                    "sha256": sha256,
                }),
            ),
            ArchiveStep::Done(ArchiveOutcome::AlreadyArchived { path }) => self.journal.record(
                COMPONENT_ARCHIVE,
                "already-archived",
                "ok",
                Some(study_id),
                json!({ "path": path.display().to_string() }),
            ),
            ArchiveStep::Failed(err) => self.journal.record(
                COMPONENT_ARCHIVE,
                "archive-failed",
                "error",
                Some(study_id),
                json!({ "code": err.code(), "error": err.to_string() }),
            ),
            ArchiveStep::NotEligible { upload } => self.journal.record(
                COMPONENT_ARCHIVE,
                "not-eligible",
                "ok",
                Some(study_id),
                json!({
                    "uploaded": upload.at.to_string(),
                    "source": upload.source.as_str(),
                    "threshold_days": self.config.archive_after_days,
                }),
            ),
            ArchiveStep::StudyMissing | ArchiveStep::NoUploadDate => {}
        }
        step
    }

    fn evaluate_archive(&self, study_id: &str, now: NaiveDateTime) -> ArchiveStep {
        let study = match self.api.study(study_id) {
            Ok(Some(study)) => study,
            Ok(None) => {
                warn!("[ARCHIVE] study-missing study={study_id}");
                return ArchiveStep::StudyMissing;
            }
            Err(err) => {
                error!("[ARCHIVE] lookup-failed study={study_id} err={err}");
                return ArchiveStep::Failed(err.into());
            }
        };

        let upload = match resolve_upload_time(self.api, &study) {
            Ok(Some(upload)) => upload,
            Ok(None) => {
                warn!("[ARCHIVE] no-upload-date study={study_id}");
                return ArchiveStep::NoUploadDate;
            }
            Err(err) => {
                error!("[ARCHIVE] upload-date-failed study={study_id} err={err}");
                return ArchiveStep::Failed(err.into());
            }
        };

        if !is_archive_eligible(upload.at, now, self.config.archive_after_days) {
            info!(
                "[ARCHIVE] not-eligible study={study_id} uploaded={} source={} threshold_days={}",
                upload.at,
                upload.source.as_str(),
                self.config.archive_after_days
            );
            return ArchiveStep::NotEligible { upload };
        }

        let archiver = Archiver::new(self.api, &self.config.archive_dir);
        match archiver.archive_study(&study, upload.at) {
            Ok(outcome) => ArchiveStep::Done(outcome),
            Err(err) => ArchiveStep::Failed(err),
        }
    }
}
