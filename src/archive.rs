use crate::orthanc::{OrthancApi, OrthancError, RECEPTION_DATE_METADATA, Study};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const RECEPTION_FORMAT: &str = "%Y%m%dT%H%M%S";
const RECEPTION_FORMAT_FRACTIONAL: &str = "%Y%m%dT%H%M%S%.f";
const STUDY_DATE_FORMAT: &str = "%Y%m%d";
const UNKNOWN: &str = "UNKNOWN";
const STAGING_SUBDIR: &str = "DICOM";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("server error: {0}")]
    Orthanc(#[from] OrthancError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive {path} written but study deletion failed: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: OrthancError,
    },
}

impl ArchiveError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Orthanc(_) => "server",
            Self::Io(_) => "io",
            Self::Zip(_) => "zip",
            Self::Delete { .. } => "delete-failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadTimeSource {
    ReceptionDate,
    StudyDate,
}

impl UploadTimeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReceptionDate => "reception-date",
            Self::StudyDate => "study-date",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadTime {
    pub at: NaiveDateTime,
    pub source: UploadTimeSource,
}

/// Parses the server's reception timestamp, with or without fractional
/// seconds.
pub fn parse_reception_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_matches('"');
    let format = if raw.contains('.') {
        RECEPTION_FORMAT_FRACTIONAL
    } else {
        RECEPTION_FORMAT
    };
    NaiveDateTime::parse_from_str(raw, format).ok()
}

pub fn parse_study_date(raw: &str) -> Option<NaiveDateTime> {
    NaiveDate::parse_from_str(raw.trim(), STUDY_DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Reception date first, then the coarser study date.
pub fn resolve_upload_time(
    api: &dyn OrthancApi,
    study: &Study,
) -> Result<Option<UploadTime>, OrthancError> {
    if let Some(raw) = api.study_metadata(&study.id, RECEPTION_DATE_METADATA)? {
        match parse_reception_timestamp(&raw) {
            Some(at) => {
                return Ok(Some(UploadTime {
                    at,
                    source: UploadTimeSource::ReceptionDate,
                }));
            }
            None => {
                warn!(
                    "[ARCHIVE] reception-date-unparsable study={} raw={raw:?}",
                    study.id
                );
            }
        }
    }

    Ok(study
        .study_date()
        .as_deref()
        .and_then(parse_study_date)
        .map(|at| UploadTime {
            at,
            source: UploadTimeSource::StudyDate,
        }))
}

/// Strictly older than the threshold: a study exactly at the cutoff is kept.
pub fn is_archive_eligible(uploaded: NaiveDateTime, now: NaiveDateTime, max_age_days: u64) -> bool {
    let days = i64::try_from(max_age_days).unwrap_or(i64::MAX);
    match TimeDelta::try_days(days).and_then(|age| now.checked_sub_signed(age)) {
        Some(cutoff) => uploaded < cutoff,
        None => false,
    }
}

/// Keeps a name component inside the archive directory.
pub fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '^' => '_',
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') => c,
            _ => '-',
        })
        .collect();
    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn archive_file_name(
    patient_id: &str,
    study_date: &str,
    uploaded: NaiveDate,
    study_id: &str,
) -> String {
    format!(
        "{}_study{}_uploaded{}_{}.zip",
        sanitize_component(patient_id),
        sanitize_component(study_date),
        uploaded.format(STUDY_DATE_FORMAT),
        sanitize_component(study_id)
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived {
        path: PathBuf,
        instances: usize,
        sha256: String,
    },
    /// A previous run already wrote the archive; only the deletion was
    /// repeated.
    AlreadyArchived { path: PathBuf },
}

pub struct Archiver<'a> {
    api: &'a dyn OrthancApi,
    dir: &'a Path,
}

impl<'a> Archiver<'a> {
    pub fn new(api: &'a dyn OrthancApi, dir: &'a Path) -> Self {
        Self { api, dir }
    }

    pub fn archive_path(&self, study: &Study, uploaded: NaiveDateTime) -> PathBuf {
        let patient = study.patient_id().unwrap_or_else(|| UNKNOWN.to_string());
        let study_date = study.study_date().unwrap_or_else(|| UNKNOWN.to_string());
        self.dir.join(archive_file_name(
            &patient,
            &study_date,
            uploaded.date(),
            &study.id,
        ))
    }

    /// Writes the study's files into one zip and removes the study from the
    /// server once the zip is complete on disk. An existing archive is never
    /// rewritten.
    pub fn archive_study(
        &self,
        study: &Study,
        uploaded: NaiveDateTime,
    ) -> Result<ArchiveOutcome, ArchiveError> {
        fs::create_dir_all(self.dir)?;
        let path = self.archive_path(study, uploaded);

        if path.is_file() {
            info!(
                "[ARCHIVE] already-archived study={} file={}",
                study.id,
                path.display()
            );
            self.delete_remote(&study.id, &path)?;
            return Ok(ArchiveOutcome::AlreadyArchived { path });
        }

        info!(
            "[ARCHIVE] archive-start study={} patient={}",
            study.id,
            study.patient_id().as_deref().unwrap_or(UNKNOWN)
        );

        let partial = partial_path(&path);
        let instances = match self.write_archive(&study.id, &partial) {
            Ok(count) => count,
            Err(err) => {
                remove_partial(&partial);
                error!(
                    "[ARCHIVE] archive-failed study={} code={} err={err}",
                    study.id,
                    err.code()
                );
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&partial, &path) {
            remove_partial(&partial);
            error!("[ARCHIVE] archive-rename-failed study={} err={err}", study.id);
            return Err(err.into());
        }

        let sha256 = file_sha256(&path)?;
        info!(
            "[ARCHIVE] archive-created study={} file={} instances={instances}",
            study.id,
            path.display()
        );

        self.delete_remote(&study.id, &path)?;
        Ok(ArchiveOutcome::Archived {
            path,
            instances,
            sha256,
        })
    }

    fn write_archive(&self, study_id: &str, partial: &Path) -> Result<usize, ArchiveError> {
        let staging = tempfile::Builder::new()
            .prefix("orthanc-archive-")
            .tempdir()?;
        let dicom_dir = staging.path().join(STAGING_SUBDIR);
        fs::create_dir(&dicom_dir)?;

        let instances = self.api.study_instances(study_id)?;
        info!(
            "[ARCHIVE] downloading study={study_id} instances={}",
            instances.len()
        );

        let mut entries = Vec::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            let data = self.api.instance_file(&instance.id)?;
            let name = format!("IMG_{index:04}.dcm");
            fs::write(dicom_dir.join(&name), data)?;
            entries.push(name);
        }

        let file = File::create(partial)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for name in &entries {
            writer.start_file(format!("{STAGING_SUBDIR}/{name}"), options)?;
            let mut source = File::open(dicom_dir.join(name))?;
            io::copy(&mut source, &mut writer)?;
        }
        let file = writer.finish()?;
        file.sync_all()?;

        Ok(entries.len())
    }

    fn delete_remote(&self, study_id: &str, path: &Path) -> Result<(), ArchiveError> {
        match self.api.delete_study(study_id) {
            Ok(()) => {
                info!("[ARCHIVE] study-deleted study={study_id}");
                Ok(())
            }
            Err(source) => {
                error!("[ARCHIVE] study-delete-failed study={study_id} err={source}");
                Err(ArchiveError::Delete {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("[ARCHIVE] partial-removed file={}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            "[ARCHIVE] partial-remove-failed file={} err={err}",
            path.display()
        ),
    }
}

fn file_sha256(path: &Path) -> Result<String, ArchiveError> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
