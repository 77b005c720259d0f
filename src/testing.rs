//! In-memory test doubles for the host server and the mail command.

use crate::notify::{Notifier, NotifyError};
use crate::orthanc::{
    Change, ChangesPage, InstanceRef, OrthancApi, OrthancError, StoreReport, Study, SystemInfo,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct FakeStudy {
    study: Study,
    reception: Option<String>,
    instances: Vec<(String, Vec<u8>)>,
}

struct Inner {
    system_queue: VecDeque<Result<SystemInfo, OrthancError>>,
    system_default: Result<SystemInfo, OrthancError>,
    system_calls: usize,
    studies: BTreeMap<String, FakeStudy>,
    list_error: Option<OrthancError>,
    store_result: Result<Option<StoreReport>, OrthancError>,
    stored: Vec<(String, String)>,
    downloads: usize,
    fail_download_at: Option<usize>,
    deleted: Vec<String>,
    delete_error: Option<OrthancError>,
    modified: Vec<(String, Value)>,
    modify_error: Option<OrthancError>,
    resolve_on_modify: bool,
    changes: Vec<Change>,
    last_seq: u64,
}

pub struct FakeOrthanc {
    inner: Mutex<Inner>,
}

impl FakeOrthanc {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                system_queue: VecDeque::new(),
                system_default: Ok(SystemInfo::default()),
                system_calls: 0,
                studies: BTreeMap::new(),
                list_error: None,
                store_result: Ok(Some(StoreReport {
                    instances_count: 1,
                    failed_instances_count: 0,
                })),
                stored: Vec::new(),
                downloads: 0,
                fail_download_at: None,
                deleted: Vec::new(),
                delete_error: None,
                modified: Vec::new(),
                modify_error: None,
                resolve_on_modify: false,
                changes: Vec::new(),
                last_seq: 0,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard)
    }

    /// Adds a stable study with one instance per entry in `files`.
    pub fn add_study(&self, id: &str, files: &[&[u8]]) {
        let mut main = HashMap::new();
        main.insert("StudyDate".to_string(), json!("20240101"));
        main.insert("StudyDescription".to_string(), json!(""));
        let mut patient = HashMap::new();
        patient.insert("PatientID".to_string(), json!(format!("P-{id}")));
        let study = Study {
            id: id.to_string(),
            is_stable: true,
            main_dicom_tags: main,
            patient_main_dicom_tags: patient,
        };
        let instances = files
            .iter()
            .enumerate()
            .map(|(i, data)| (format!("{id}-i{i}"), data.to_vec()))
            .collect();
        self.with(|inner| {
            inner.studies.insert(
                id.to_string(),
                FakeStudy {
                    study,
                    reception: None,
                    instances,
                },
            );
        });
    }

    fn edit_study(&self, id: &str, f: impl FnOnce(&mut FakeStudy)) {
        self.with(|inner| {
            if let Some(study) = inner.studies.get_mut(id) {
                f(study);
            }
        });
    }

    pub fn set_description(&self, id: &str, description: &str) {
        self.edit_study(id, |s| {
            s.study
                .main_dicom_tags
                .insert("StudyDescription".into(), json!(description));
        });
    }

    pub fn set_stable(&self, id: &str, stable: bool) {
        self.edit_study(id, |s| s.study.is_stable = stable);
    }

    pub fn set_reception(&self, id: &str, reception: Option<&str>) {
        self.edit_study(id, |s| s.reception = reception.map(str::to_string));
    }

    pub fn set_study_date(&self, id: &str, date: &str) {
        self.edit_study(id, |s| {
            s.study
                .main_dicom_tags
                .insert("StudyDate".into(), json!(date));
        });
    }

    pub fn set_patient_id(&self, id: &str, patient: &str) {
        self.edit_study(id, |s| {
            s.study
                .patient_main_dicom_tags
                .insert("PatientID".into(), json!(patient));
        });
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.with(|inner| {
            inner.system_default = if reachable {
                Ok(SystemInfo::default())
            } else {
                Err(OrthancError::Transport("connection refused".into()))
            };
        });
    }

    pub fn set_system(&self, result: Result<SystemInfo, OrthancError>) {
        self.with(|inner| inner.system_default = result);
    }

    pub fn push_system(&self, result: Result<SystemInfo, OrthancError>) {
        self.with(|inner| inner.system_queue.push_back(result));
    }

    pub fn system_calls(&self) -> usize {
        self.with(|inner| inner.system_calls)
    }

    pub fn fail_list(&self, err: OrthancError) {
        self.with(|inner| inner.list_error = Some(err));
    }

    pub fn set_store_report(&self, report: Option<StoreReport>) {
        self.with(|inner| inner.store_result = Ok(report));
    }

    pub fn fail_store(&self, err: OrthancError) {
        self.with(|inner| inner.store_result = Err(err));
    }

    pub fn stored(&self) -> Vec<(String, String)> {
        self.with(|inner| inner.stored.clone())
    }

    pub fn downloads(&self) -> usize {
        self.with(|inner| inner.downloads)
    }

    /// Makes the n-th (zero based) instance download fail.
    pub fn fail_download_at(&self, n: usize) {
        self.with(|inner| inner.fail_download_at = Some(n));
    }

    pub fn deleted(&self) -> Vec<String> {
        self.with(|inner| inner.deleted.clone())
    }

    pub fn fail_delete(&self, err: OrthancError) {
        self.with(|inner| inner.delete_error = Some(err));
    }

    pub fn modified(&self) -> Vec<(String, Value)> {
        self.with(|inner| inner.modified.clone())
    }

    pub fn fail_modify(&self, err: OrthancError) {
        self.with(|inner| inner.modify_error = Some(err));
    }

    /// When set, a modify call makes the study disappear, as if the server
    /// finished processing it.
    pub fn resolve_on_modify(&self, resolve: bool) {
        self.with(|inner| inner.resolve_on_modify = resolve);
    }

    pub fn push_change(&self, change_type: &str, resource_type: &str, id: &str) {
        self.with(|inner| {
            inner.last_seq += 1;
            let seq = inner.last_seq;
            inner.changes.push(Change {
                change_type: change_type.to_string(),
                id: id.to_string(),
                resource_type: resource_type.to_string(),
                seq,
            });
        });
    }
}

impl OrthancApi for FakeOrthanc {
    fn system(&self) -> Result<SystemInfo, OrthancError> {
        self.with(|inner| {
            inner.system_calls += 1;
            inner
                .system_queue
                .pop_front()
                .unwrap_or_else(|| inner.system_default.clone())
        })
    }

    fn list_studies(&self) -> Result<Vec<String>, OrthancError> {
        self.with(|inner| match &inner.list_error {
            Some(err) => Err(err.clone()),
            None => Ok(inner.studies.keys().cloned().collect()),
        })
    }

    fn study(&self, id: &str) -> Result<Option<Study>, OrthancError> {
        self.with(|inner| Ok(inner.studies.get(id).map(|s| s.study.clone())))
    }

    fn study_metadata(&self, id: &str, name: &str) -> Result<Option<String>, OrthancError> {
        self.with(|inner| {
            if name != crate::orthanc::RECEPTION_DATE_METADATA {
                return Ok(None);
            }
            Ok(inner.studies.get(id).and_then(|s| s.reception.clone()))
        })
    }

    fn study_instances(&self, id: &str) -> Result<Vec<InstanceRef>, OrthancError> {
        self.with(|inner| match inner.studies.get(id) {
            Some(study) => Ok(study
                .instances
                .iter()
                .map(|(id, _)| InstanceRef { id: id.clone() })
                .collect()),
            None => Err(OrthancError::Status {
                status: 404,
                body: "Unknown resource".into(),
            }),
        })
    }

    fn instance_file(&self, id: &str) -> Result<Vec<u8>, OrthancError> {
        self.with(|inner| {
            let index = inner.downloads;
            inner.downloads += 1;
            if inner.fail_download_at == Some(index) {
                return Err(OrthancError::Timeout);
            }
            inner
                .studies
                .values()
                .flat_map(|s| s.instances.iter())
                .find(|(instance_id, _)| instance_id == id)
                .map(|(_, data)| data.clone())
                .ok_or(OrthancError::Status {
                    status: 404,
                    body: "Unknown resource".into(),
                })
        })
    }

    fn modify_study(&self, id: &str, request: &Value) -> Result<Value, OrthancError> {
        self.with(|inner| {
            if let Some(err) = &inner.modify_error {
                return Err(err.clone());
            }
            inner.modified.push((id.to_string(), request.clone()));
            if inner.resolve_on_modify {
                inner.studies.remove(id);
            }
            Ok(json!({ "ID": format!("{id}-modified") }))
        })
    }

    fn delete_study(&self, id: &str) -> Result<(), OrthancError> {
        self.with(|inner| {
            if let Some(err) = &inner.delete_error {
                return Err(err.clone());
            }
            inner.studies.remove(id);
            inner.deleted.push(id.to_string());
            Ok(())
        })
    }

    fn store_to_modality(
        &self,
        modality: &str,
        resources: &[String],
    ) -> Result<Option<StoreReport>, OrthancError> {
        self.with(|inner| {
            for resource in resources {
                inner.stored.push((modality.to_string(), resource.clone()));
            }
            inner.store_result.clone()
        })
    }

    fn changes(&self, since: u64, limit: u32) -> Result<ChangesPage, OrthancError> {
        self.with(|inner| {
            let pending: Vec<Change> = inner
                .changes
                .iter()
                .filter(|c| c.seq > since)
                .take(limit as usize)
                .cloned()
                .collect();
            let last = pending.last().map(|c| c.seq).unwrap_or(since);
            Ok(ChangesPage {
                done: last >= inner.last_seq,
                last,
                changes: pending,
            })
        })
    }

    fn last_change_seq(&self) -> Result<u64, OrthancError> {
        self.with(|inner| Ok(inner.last_seq))
    }
}

/// Records every alert instead of running the mail command.
pub struct RecordingNotifier {
    sent: Mutex<Vec<(PathBuf, String)>>,
    failures: Mutex<VecDeque<NotifyError>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_next(&self, err: NotifyError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, alert_file: &Path, message: &str) -> Result<(), NotifyError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent
            .lock()
            .unwrap()
            .push((alert_file.to_path_buf(), message.to_string()));
        Ok(())
    }
}
