use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[test]
fn e2e_full_suite() -> AnyResult<()> {
    scenario_on_stable_archives_old_study()?;
    scenario_on_stable_keeps_recent_study()?;
    scenario_unreadable_orthanc_config_is_logged()?;
    scenario_missing_config_exits_with_usage_code()?;
    scenario_check_command()?;
    scenario_watch_unreachable_notifies_once()?;
    scenario_watch_retriggers_pending_study()?;
    scenario_follow_changes()?;
    Ok(())
}

fn scenario_on_stable_archives_old_study() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    server.add_study("st1", "PAT^ONE", "20191231", Some("20200101T101010.5"), "CT");

    let output = env.run(&server, &["on-stable", "st1"])?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let archive = env
        .archive_dir
        .join("PAT_ONE_study20191231_uploaded20200101_st1.zip");
    assert!(archive.exists(), "archive missing: {}", archive.display());
    assert_no_partial_files(&env.archive_dir);
    let requests = server.requests();
    assert!(requests.contains(&"POST /modalities/processing/store".to_string()));
    assert!(requests.contains(&"DELETE /studies/st1".to_string()));
    assert!(!server.has_study("st1"));

    let events = env.run(&server, &["events", "--component", "archive"])?;
    assert!(events.status.success());
    assert!(stdout(&events).contains(" archive archived ok study=st1"));

    // A second event for the same study finds the archive and only deletes.
    server.add_study("st1", "PAT^ONE", "20191231", Some("20200101T101010.5"), "CT");
    server.clear_requests();
    let again = env.run(&server, &["on-stable", "st1"])?;
    assert!(again.status.success(), "stderr: {}", stderr(&again));
    let requests = server.requests();
    assert!(!requests.iter().any(|r| r.starts_with("GET /instances/")));
    assert!(requests.contains(&"DELETE /studies/st1".to_string()));
    Ok(())
}

fn scenario_on_stable_keeps_recent_study() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    let today = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
    server.add_study("st2", "PAT2", "20240101", Some(&today), "MR");
    server.set_store_response(json!({ "InstancesCount": 2, "FailedInstancesCount": 1 }));

    let output = env.run(&server, &["on-stable", "st2"])?;
    assert_eq!(output.status.code(), Some(1), "forward failure must be reported");
    assert!(server.has_study("st2"));
    assert!(!server.requests().iter().any(|r| r.starts_with("DELETE")));
    assert_eq!(fs::read_dir(&env.archive_dir)?.count(), 0);
    Ok(())
}

fn scenario_unreadable_orthanc_config_is_logged() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    let today = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
    server.add_study("st6", "PAT6", "20240101", Some(&today), "CT");
    let missing = env.temp.path().join("missing/orthanc.json");

    let output = env.run_with(
        &server,
        &["on-stable", "st6"],
        &[("WATCHDOG_ORTHANC_CONFIG", missing.as_os_str())],
    )?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("[CONFIG] orthanc-config-unreadable"));
    let log = fs::read_to_string(env.state_dir.join("watchdog.log"))?;
    assert!(log.contains("[CONFIG] orthanc-config-unreadable"));
    assert!(log.contains(&missing.display().to_string()));
    Ok(())
}

fn scenario_missing_config_exits_with_usage_code() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let output = Command::new(&env.bin_path)
        .arg("on-stable")
        .arg("st1")
        .env_remove("ORTHANC_URL")
        .env("WATCHDOG_STATE_DIR", &env.state_dir)
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("ORTHANC_URL must be set"));
    Ok(())
}

fn scenario_check_command() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    let up = env.run(&server, &["check"])?;
    assert!(up.status.success());
    assert!(stdout(&up).starts_with("reachable name=mock"));

    server.set_down(true);
    let down = env.run(&server, &["check"])?;
    assert_eq!(down.status.code(), Some(1));
    assert!(stdout(&down).starts_with("unreachable attempts=2"));
    Ok(())
}

fn scenario_watch_unreachable_notifies_once() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    server.set_down(true);

    let output = env.run(&server, &["watch", "--max-iterations", "3"])?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let calls = env.mock_calls()?;
    assert_eq!(calls.len(), 1, "calls: {calls:?}");
    assert!(calls[0].contains("-s Orthanc Watcher: System Alert"));
    assert!(calls[0].contains("-u admin@example.org -a test-key"));
    let watcher_dir = env.home.join("logs/watcher");
    assert!(watcher_dir.join("notification_state.txt").exists());
    let alert = fs::read_to_string(watcher_dir.join("admin_alert.txt"))?;
    assert!(alert.contains("Orthanc is not reachable"));
    let log = fs::read_to_string(watcher_dir.join("watchdog.log"))?;
    assert!(log.contains("[NOTIFY] alert-suppressed"));
    assert!(!log.contains("test-key"));

    server.set_down(false);
    let recovered = env.run(&server, &["watch", "--max-iterations", "1"])?;
    assert!(recovered.status.success());
    assert!(!watcher_dir.join("notification_state.txt").exists());
    assert_eq!(env.mock_calls()?.len(), 1);
    Ok(())
}

fn scenario_watch_retriggers_pending_study() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    server.add_study("st3", "PAT3", "20240101", None, "Knee to ortho@clinic.ch pw=abc");
    server.add_study("st4", "PAT4", "20240101", None, "routine");

    let output = env.run(&server, &["watch", "--max-iterations", "1"])?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let modified: Vec<String> = server
        .requests()
        .into_iter()
        .filter(|r| r.ends_with("/modify"))
        .collect();
    assert_eq!(modified, vec!["POST /studies/st3/modify".to_string()]);
    let bodies = server.bodies("POST /studies/st3/modify");
    let body: Value = serde_json::from_str(&bodies[0])?;
    assert_eq!(
        body,
        json!({
            "Replace": { "StudyDescription": "Knee to ortho@clinic.ch pw=abc" },
            "Force": true,
        })
    );

    let calls = env.mock_calls()?;
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("After cleanup, 1 studies are still pending"));
    let flag = fs::read_to_string(env.home.join("logs/watcher/notification_state.txt"))?;
    assert!(flag.contains("cause=stuck"));

    // The study stays pending across a restarted watcher: no second mail.
    let again = env.run(&server, &["watch", "--max-iterations", "2"])?;
    assert!(again.status.success(), "stderr: {}", stderr(&again));
    assert_eq!(env.mock_calls()?.len(), 1);
    Ok(())
}

fn scenario_follow_changes() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = MockOrthanc::start();
    let today = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
    server.add_study("st5", "PAT5", "20240101", Some(&today), "CT");
    server.set_changes(json!({
        "Changes": [
            { "ChangeType": "NewSeries", "ID": "se1", "ResourceType": "Series", "Seq": 7 },
            { "ChangeType": "StableStudy", "ID": "st5", "ResourceType": "Study", "Seq": 8 }
        ],
        "Done": true,
        "Last": 8
    }));

    let output = env.run(
        &server,
        &["follow-changes", "--since", "0", "--max-iterations", "1"],
    )?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(
        server
            .requests()
            .contains(&"POST /modalities/processing/store".to_string())
    );
    let cursor = fs::read_to_string(env.state_dir.join("changes.cursor"))?;
    assert_eq!(cursor.trim(), "8");
    Ok(())
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

struct TestEnv {
    temp: TempDir,
    home: PathBuf,
    state_dir: PathBuf,
    archive_dir: PathBuf,
    bin_path: PathBuf,
    mock_script: PathBuf,
    mock_log: PathBuf,
}

impl TestEnv {
    fn new() -> AnyResult<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().to_path_buf();
        let home = root.join("home");
        let archive_dir = root.join("archive");
        fs::create_dir_all(&archive_dir)?;
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        Ok(Self {
            state_dir: root.join("state"),
            home,
            archive_dir,
            bin_path: PathBuf::from(env!("CARGO_BIN_EXE_orthanc-watchdog")),
            mock_script: manifest_dir.join("tests/mock-bin/filesender-mock.sh"),
            mock_log: root.join("filesender.log"),
            temp,
        })
    }

    fn run(&self, server: &MockOrthanc, args: &[&str]) -> AnyResult<Output> {
        self.run_with(server, args, &[])
    }

    fn run_with(
        &self,
        server: &MockOrthanc,
        args: &[&str],
        extra_env: &[(&str, &OsStr)],
    ) -> AnyResult<Output> {
        let mut cmd = Command::new(&self.bin_path);
        cmd.args(args)
            .env("ORTHANC_URL", &server.base)
            .env("HOME_DIR", &self.home)
            .env("WATCHDOG_ARCHIVE_DIR", &self.archive_dir)
            .env("WATCHDOG_FORWARD_MODALITY", "processing")
            .env("WATCHDOG_INTERVAL_SECS", "0")
            .env("WATCHDOG_HEALTH_ATTEMPTS", "2")
            .env("WATCHDOG_HEALTH_RETRY_DELAY_SECS", "0")
            .env("WATCHDOG_RETRIGGER_GRACE_SECS", "0")
            .env("WATCHDOG_CHANGES_POLL_SECS", "0")
            .env("FILESENDER_USERNAME", "admin@example.org")
            .env("FILESENDER_API_KEY", "test-key")
            .env("FILESENDER_PYTHON", "sh")
            .env("FILESENDER_SCRIPT", &self.mock_script)
            .env("FILESENDER_MOCK_LOG", &self.mock_log)
            .env_remove("WATCHDOG_ORTHANC_CONFIG")
            .env_remove("WATCHDOG_DB_URL")
            .env_remove("WATCHDOG_ARCHIVE_AFTER_DAYS");
        // `watch` keeps its files under HOME_DIR; everything else uses the
        // explicit state dir.
        if args.first() != Some(&"watch") {
            cmd.env("WATCHDOG_STATE_DIR", &self.state_dir);
        } else {
            cmd.env_remove("WATCHDOG_STATE_DIR");
        }
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        Ok(cmd.output()?)
    }

    fn mock_calls(&self) -> AnyResult<Vec<String>> {
        if !self.mock_log.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(&self.mock_log)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[derive(Default)]
struct ServerState {
    down: bool,
    studies: BTreeMap<String, Value>,
    reception: BTreeMap<String, String>,
    store_response: Option<Value>,
    changes: Option<Value>,
    requests: Vec<(String, String)>,
}

struct MockOrthanc {
    base: String,
    state: Arc<Mutex<ServerState>>,
}

impl MockOrthanc {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        let state = Arc::new(Mutex::new(ServerState::default()));
        let shared = state.clone();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let (method, path, body) = read_request(&mut stream);
                let (status, payload) = route(&shared, &method, &path, &body);
                respond(&mut stream, status, &payload);
            }
        });

        Self { base, state }
    }

    fn add_study(
        &self,
        id: &str,
        patient: &str,
        study_date: &str,
        reception: Option<&str>,
        description: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        state.studies.insert(
            id.to_string(),
            json!({
                "ID": id,
                "IsStable": true,
                "MainDicomTags": { "StudyDate": study_date, "StudyDescription": description },
                "PatientMainDicomTags": { "PatientID": patient },
            }),
        );
        if let Some(reception) = reception {
            state.reception.insert(id.to_string(), reception.to_string());
        }
    }

    fn has_study(&self, id: &str) -> bool {
        self.state.lock().unwrap().studies.contains_key(id)
    }

    fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    fn set_store_response(&self, response: Value) {
        self.state.lock().unwrap().store_response = Some(response);
    }

    fn set_changes(&self, page: Value) {
        self.state.lock().unwrap().changes = Some(page);
    }

    fn requests(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|(line, _)| line.clone())
            .collect()
    }

    fn bodies(&self, line: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(l, _)| l == line)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }
}

fn route(state: &Mutex<ServerState>, method: &str, path: &str, body: &str) -> (u16, Vec<u8>) {
    let mut state = state.lock().unwrap();
    let (route_path, _query) = path.split_once('?').unwrap_or((path, ""));
    state
        .requests
        .push((format!("{method} {route_path}"), body.to_string()));

    if state.down {
        return (503, b"starting".to_vec());
    }

    let segments: Vec<&str> = route_path.trim_matches('/').split('/').collect();
    let json_body = |value: Value| value.to_string().into_bytes();
    match (method, segments.as_slice()) {
        ("GET", ["system"]) => (200, json_body(json!({ "Name": "mock", "Version": "1.12.3" }))),
        ("GET", ["studies"]) => {
            let ids: Vec<&String> = state.studies.keys().collect();
            (200, json_body(json!(ids)))
        }
        ("GET", ["studies", id]) => match state.studies.get(*id) {
            Some(study) => (200, json_body(study.clone())),
            None => (404, json_body(json!({ "Message": "Unknown resource" }))),
        },
        ("DELETE", ["studies", id]) => match state.studies.remove(*id) {
            Some(_) => (200, json_body(json!({}))),
            None => (404, Vec::new()),
        },
        ("GET", ["studies", id, "metadata", "ReceptionDate"]) => match state.reception.get(*id) {
            Some(value) => (200, value.clone().into_bytes()),
            None => (404, Vec::new()),
        },
        ("GET", ["studies", id, "instances"]) if state.studies.contains_key(*id) => (
            200,
            json_body(json!([{ "ID": format!("{id}-i0") }, { "ID": format!("{id}-i1") }])),
        ),
        ("GET", ["instances", id, "file"]) => (200, format!("DICM-{id}").into_bytes()),
        ("POST", ["studies", id, "modify"]) => {
            (200, json_body(json!({ "ID": format!("{id}-copy") })))
        }
        ("POST", ["modalities", _, "store"]) => {
            let response = state.store_response.clone().unwrap_or_else(|| {
                json!({ "InstancesCount": 2, "FailedInstancesCount": 0 })
            });
            (200, json_body(response))
        }
        ("GET", ["changes"]) => {
            let page = state
                .changes
                .take()
                .unwrap_or_else(|| json!({ "Changes": [], "Done": true, "Last": 0 }));
            (200, json_body(page))
        }
        _ => (404, Vec::new()),
    }
}

fn read_request(stream: &mut TcpStream) -> (String, String, String) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        match stream.read(&mut tmp) {
            Ok(0) | Err(_) => break buf.len(),
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            }
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end.min(buf.len())]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        match stream.read(&mut tmp) {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    let body = String::from_utf8_lossy(&buf[header_end.min(buf.len())..]).to_string();
    let mut first = head.lines().next().unwrap_or_default().split_whitespace();
    let method = first.next().unwrap_or_default().to_string();
    let path = first.next().unwrap_or_default().to_string();
    (method, path, body)
}

fn respond(stream: &mut TcpStream, status: u16, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status} X\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
}

fn assert_no_partial_files(dir: &Path) {
    let partial = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .any(|e| e.file_name().to_string_lossy().ends_with(".partial"));
    assert!(!partial, "partial archive left in {}", dir.display());
}
