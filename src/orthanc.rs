use crate::config::{Credentials, OrthancConfig};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use url::Url;

const SYSTEM_TIMEOUT: Duration = Duration::from_secs(10);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 512;

pub const RECEPTION_DATE_METADATA: &str = "ReceptionDate";
pub const CHANGE_STABLE_STUDY: &str = "StableStudy";
pub const RESOURCE_STUDY: &str = "Study";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrthancError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl OrthancError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Status { .. } => "http-status",
            Self::Decode(_) => "decode",
            Self::InvalidUrl(_) => "invalid-url",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub startup_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Study {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub is_stable: bool,
    #[serde(default)]
    pub main_dicom_tags: HashMap<String, Value>,
    #[serde(default)]
    pub patient_main_dicom_tags: HashMap<String, Value>,
}

impl Study {
    fn tag(tags: &HashMap<String, Value>, name: &str) -> Option<String> {
        tags.get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn patient_id(&self) -> Option<String> {
        Self::tag(&self.patient_main_dicom_tags, "PatientID")
            .or_else(|| Self::tag(&self.main_dicom_tags, "PatientID"))
    }

    pub fn study_date(&self) -> Option<String> {
        Self::tag(&self.main_dicom_tags, "StudyDate")
    }

    pub fn description(&self) -> String {
        self.main_dicom_tags
            .get("StudyDescription")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct InstanceRef {
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct StoreReport {
    #[serde(default)]
    pub instances_count: u64,
    #[serde(default)]
    pub failed_instances_count: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    pub change_type: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub resource_type: String,
    pub seq: u64,
}

impl Change {
    pub fn is_stable_study(&self) -> bool {
        self.change_type == CHANGE_STABLE_STUDY && self.resource_type == RESOURCE_STUDY
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ChangesPage {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub last: u64,
}

/// The subset of the host server's REST API the watchdog relies on.
pub trait OrthancApi: Send + Sync {
    /// `GET /system`; any non-200 answer is an error.
    fn system(&self) -> Result<SystemInfo, OrthancError>;
    fn list_studies(&self) -> Result<Vec<String>, OrthancError>;
    /// `Ok(None)` when the study no longer exists.
    fn study(&self, id: &str) -> Result<Option<Study>, OrthancError>;
    fn study_metadata(&self, id: &str, name: &str) -> Result<Option<String>, OrthancError>;
    fn study_instances(&self, id: &str) -> Result<Vec<InstanceRef>, OrthancError>;
    fn instance_file(&self, id: &str) -> Result<Vec<u8>, OrthancError>;
    fn modify_study(&self, id: &str, request: &Value) -> Result<Value, OrthancError>;
    fn delete_study(&self, id: &str) -> Result<(), OrthancError>;
    /// `Ok(None)` when the server answered with an empty body.
    fn store_to_modality(
        &self,
        modality: &str,
        resources: &[String],
    ) -> Result<Option<StoreReport>, OrthancError>;
    fn changes(&self, since: u64, limit: u32) -> Result<ChangesPage, OrthancError>;
    fn last_change_seq(&self) -> Result<u64, OrthancError>;
}

pub fn study_exists(api: &dyn OrthancApi, id: &str) -> Result<bool, OrthancError> {
    api.study(id).map(|study| study.is_some())
}

/// Payload for `POST /studies/{id}/modify` that rewrites the description with
/// its current value, which makes the server reprocess the study.
pub fn description_rewrite(description: &str) -> Value {
    json!({
        "Replace": { "StudyDescription": description },
        "Force": true,
    })
}

pub struct HttpOrthanc {
    base: Url,
    credentials: Option<Credentials>,
    client: Client,
    runtime: Arc<Runtime>,
}

impl HttpOrthanc {
    pub fn new(config: &OrthancConfig, runtime: Arc<Runtime>) -> Result<Self, OrthancError> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| OrthancError::Transport(e.to_string()))?;
        Ok(Self {
            base: config.base_url.clone(),
            credentials: config.credentials.clone(),
            client,
            runtime,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, OrthancError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| OrthancError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<(StatusCode, Vec<u8>), OrthancError> {
        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        self.runtime.block_on(async move {
            let response = request.send().await.map_err(OrthancError::from_reqwest)?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(OrthancError::from_reqwest)?;
            Ok((status, bytes.to_vec()))
        })
    }

    fn send_ok(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Vec<u8>, OrthancError> {
        let (status, bytes) = self.send(method, url, body, timeout)?;
        if status.is_success() {
            Ok(bytes)
        } else {
            Err(status_error(status, &bytes))
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        timeout: Duration,
    ) -> Result<T, OrthancError> {
        let bytes = self.send_ok(Method::GET, url, None, timeout)?;
        serde_json::from_slice(&bytes).map_err(|e| OrthancError::Decode(e.to_string()))
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> OrthancError {
    let mut text = String::from_utf8_lossy(body).trim().to_string();
    if text.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    OrthancError::Status {
        status: status.as_u16(),
        body: text,
    }
}

fn absent_on_404<T>(result: Result<T, OrthancError>) -> Result<Option<T>, OrthancError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

impl OrthancApi for HttpOrthanc {
    fn system(&self) -> Result<SystemInfo, OrthancError> {
        let url = self.endpoint(&["system"])?;
        let (status, bytes) = self.send(Method::GET, url, None, SYSTEM_TIMEOUT)?;
        if status != StatusCode::OK {
            return Err(status_error(status, &bytes));
        }
        // Reachability only depends on the status code.
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }

    fn list_studies(&self) -> Result<Vec<String>, OrthancError> {
        let url = self.endpoint(&["studies"])?;
        self.get_json(url, COMMAND_TIMEOUT)
    }

    fn study(&self, id: &str) -> Result<Option<Study>, OrthancError> {
        let url = self.endpoint(&["studies", id])?;
        absent_on_404(self.get_json(url, LOOKUP_TIMEOUT))
    }

    fn study_metadata(&self, id: &str, name: &str) -> Result<Option<String>, OrthancError> {
        let url = self.endpoint(&["studies", id, "metadata", name])?;
        let bytes = absent_on_404(self.send_ok(Method::GET, url, None, LOOKUP_TIMEOUT))?;
        Ok(bytes.map(|raw| {
            String::from_utf8_lossy(&raw)
                .trim()
                .trim_matches('"')
                .to_string()
        }))
    }

    fn study_instances(&self, id: &str) -> Result<Vec<InstanceRef>, OrthancError> {
        let url = self.endpoint(&["studies", id, "instances"])?;
        self.get_json(url, COMMAND_TIMEOUT)
    }

    fn instance_file(&self, id: &str) -> Result<Vec<u8>, OrthancError> {
        let url = self.endpoint(&["instances", id, "file"])?;
        self.send_ok(Method::GET, url, None, TRANSFER_TIMEOUT)
    }

    fn modify_study(&self, id: &str, request: &Value) -> Result<Value, OrthancError> {
        let url = self.endpoint(&["studies", id, "modify"])?;
        let bytes = self.send_ok(Method::POST, url, Some(request), COMMAND_TIMEOUT)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| OrthancError::Decode(e.to_string()))
    }

    fn delete_study(&self, id: &str) -> Result<(), OrthancError> {
        let url = self.endpoint(&["studies", id])?;
        self.send_ok(Method::DELETE, url, None, COMMAND_TIMEOUT)
            .map(|_| ())
    }

    fn store_to_modality(
        &self,
        modality: &str,
        resources: &[String],
    ) -> Result<Option<StoreReport>, OrthancError> {
        let url = self.endpoint(&["modalities", modality, "store"])?;
        let payload = json!({ "Resources": resources });
        let bytes = self.send_ok(Method::POST, url, Some(&payload), TRANSFER_TIMEOUT)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| OrthancError::Decode(e.to_string()))
    }

    fn changes(&self, since: u64, limit: u32) -> Result<ChangesPage, OrthancError> {
        let mut url = self.endpoint(&["changes"])?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_string())
            .append_pair("limit", &limit.to_string());
        self.get_json(url, COMMAND_TIMEOUT)
    }

    fn last_change_seq(&self) -> Result<u64, OrthancError> {
        let mut url = self.endpoint(&["changes"])?;
        url.set_query(Some("last"));
        let page: ChangesPage = self.get_json(url, COMMAND_TIMEOUT)?;
        Ok(page.last)
    }
}
