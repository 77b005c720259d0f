use crate::orthanc::{OrthancApi, OrthancError, study_exists};
use tracing::{error, info};

/// Result of pushing one study to the downstream processing node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded { instances: u64 },
    StudyMissing,
    Incomplete { instances: u64, failed: u64 },
    EmptyResponse,
    Failed(OrthancError),
}

impl ForwardOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Forwarded { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Forwarded { .. } => "forwarded",
            Self::StudyMissing => "study-missing",
            Self::Incomplete { .. } => "incomplete",
            Self::EmptyResponse => "empty-response",
            Self::Failed(_) => "failed",
        }
    }
}

pub fn forward_study(api: &dyn OrthancApi, modality: &str, study_id: &str) -> ForwardOutcome {
    info!("[FORWARD] forward-start study={study_id} modality={modality}");

    match study_exists(api, study_id) {
        Ok(true) => {}
        Ok(false) => {
            error!("[FORWARD] study-missing study={study_id}");
            return ForwardOutcome::StudyMissing;
        }
        Err(err) => {
            error!("[FORWARD] lookup-failed study={study_id} err={err}");
            return ForwardOutcome::Failed(err);
        }
    }

    let outcome = match api.store_to_modality(modality, &[study_id.to_string()]) {
        Ok(Some(report))
            if report.failed_instances_count == 0 && report.instances_count > 0 =>
        {
            ForwardOutcome::Forwarded {
                instances: report.instances_count,
            }
        }
        Ok(Some(report)) => ForwardOutcome::Incomplete {
            instances: report.instances_count,
            failed: report.failed_instances_count,
        },
        Ok(None) => ForwardOutcome::EmptyResponse,
        Err(err) => ForwardOutcome::Failed(err),
    };

    match &outcome {
        ForwardOutcome::Forwarded { instances } => {
            info!("[FORWARD] forwarded study={study_id} modality={modality} instances={instances}");
        }
        ForwardOutcome::Incomplete { instances, failed } => {
            error!(
                "[FORWARD] forward-incomplete study={study_id} failed={failed} instances={instances}"
            );
        }
        ForwardOutcome::EmptyResponse => {
            error!("[FORWARD] forward-empty-response study={study_id}");
        }
        ForwardOutcome::Failed(err) => {
            error!("[FORWARD] forward-failed study={study_id} code={} err={err}", err.code());
        }
        ForwardOutcome::StudyMissing => {}
    }

    outcome
}
