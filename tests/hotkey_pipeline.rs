//! End-to-end analyzer pipeline tests.
//!
//! The control-plane API is mocked with an in-process axum server; the
//! packet-capture probe is replaced by a shell script via the `probe_bin`
//! override, so the capture loop, folding, top-K selection and reporting run
//! exactly as in production without needing a live interface.

use std::net::TcpListener as StdTcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use hotkeyoor::analyzer;
use hotkeyoor::config::{InstanceRequest, ObservationRequest};
use hotkeyoor::report::{Client, HotKeyInfo, ReportError};

/// Shared state for the mock control-plane API.
#[derive(Clone)]
struct MockApi {
    /// Bodies of every report POST received.
    bodies: Arc<Mutex<Vec<Value>>>,
    /// Total requests seen.
    hits: Arc<AtomicUsize>,
    /// Response code returned to callers.
    code: i64,
    message: String,
    /// Number of leading requests answered with HTTP 500.
    fail_first: Arc<AtomicUsize>,
}

impl MockApi {
    fn new(code: i64, message: &str) -> Self {
        Self {
            bodies: Arc::new(Mutex::new(Vec::new())),
            hits: Arc::new(AtomicUsize::new(0)),
            code,
            message: message.to_string(),
            fail_first: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    fn received(&self) -> Vec<Value> {
        self.bodies.lock().expect("lock").clone()
    }
}

async fn handle_report(
    State(api): State<MockApi>,
    Json(body): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    api.hits.fetch_add(1, Ordering::SeqCst);

    if api
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "boom"})),
        );
    }

    api.bodies.lock().expect("lock").push(body);

    (
        axum::http::StatusCode::OK,
        Json(serde_json::json!({
            "code": api.code,
            "message": api.message,
            "data": {},
        })),
    )
}

/// Start the mock API, returning its base URL.
async fn start_mock(api: MockApi) -> String {
    let app = Router::new()
        .route("/apis/proxypass/create_analysis_report/", post(handle_report))
        .with_state(api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock api");
    let addr = listener.local_addr().expect("mock api addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock api");
    });

    format!("http://{addr}")
}

/// Bind a listener on a port inside the observable range [6379, 55535].
fn bind_in_range() -> (StdTcpListener, u16) {
    loop {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        if (6379..=55535).contains(&port) {
            return (listener, port);
        }
    }
}

/// A closed port inside the observable range.
fn closed_port_in_range() -> u16 {
    let (listener, port) = bind_in_range();
    drop(listener);
    port
}

fn record_line(port: u16, command: &str, first_arg: &str) -> String {
    format!(
        "2024-01-01 00:00:00.000000 IP 127.0.0.1 50000 -> 127.0.0.1 {port} tcp len 23 \"{command}\" \"{first_arg}\""
    )
}

/// Write a fake probe script that appends the given record lines to its
/// `--output-file` argument and exits with `exit_code`.
fn write_probe_script(dir: &Path, lines: &[String], exit_code: i32) -> PathBuf {
    let mut body = String::from(
        "#!/bin/sh\nout=\"\"\nprev=\"\"\nfor a in \"$@\"; do\n  if [ \"$prev\" = \"--output-file\" ]; then out=\"$a\"; fi\n  prev=\"$a\"\ndone\n: >> \"$out\"\n",
    );

    for line in lines {
        body.push_str(&format!("printf '%s\\n' '{line}' >> \"$out\"\n"));
    }
    body.push_str(&format!("exit {exit_code}\n"));

    let path = dir.join("fake_probe.sh");
    std::fs::write(&path, body).expect("write probe script");

    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");

    path
}

fn request(
    base_url: &str,
    backup_root: &Path,
    probe_bin: PathBuf,
    instances: Vec<InstanceRequest>,
    window_seconds: u64,
) -> ObservationRequest {
    ObservationRequest {
        host_ip: "127.0.0.1".to_string(),
        instances,
        window_seconds,
        cluster_id: 11,
        ticket_id: 22,
        biz_id: 33,
        bk_cloud_id: 0,
        api_base_url: base_url.to_string(),
        api_token: "test-token".to_string(),
        backup_root: backup_root.to_path_buf(),
        probe_bin: Some(probe_bin),
    }
}

// --- Report client behavior ---

#[tokio::test]
async fn report_rejection_is_not_retried() {
    let api = MockApi::new(1001, "bad token");
    let base = start_mock(api.clone()).await;

    let client = Client::new(&base, "tok", 0)
        .expect("client")
        .with_retry(5, Duration::from_millis(10));

    let err = client
        .send(&[sample_info()])
        .await
        .expect_err("rejection must fail");

    match err {
        ReportError::Rejected { code, message } => {
            assert_eq!(code, 1001);
            assert!(message.contains("bad token"));
        }
        other => panic!("expected rejection, got {other}"),
    }

    assert_eq!(api.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn report_retries_transient_failures() {
    let api = MockApi::new(0, "ok").failing_first(2);
    let base = start_mock(api.clone()).await;

    let client = Client::new(&base, "tok", 7)
        .expect("client")
        .with_retry(5, Duration::from_millis(10));

    client.send(&[sample_info()]).await.expect("third attempt succeeds");

    assert_eq!(api.hits.load(Ordering::SeqCst), 3);

    // Token and cloud id are injected at the top level of the body.
    let bodies = api.received();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["db_cloud_token"], "tok");
    assert_eq!(bodies[0]["bk_cloud_id"], 7);
    assert_eq!(bodies[0]["hot_key_infos"][0]["key"], "foo");
}

#[tokio::test]
async fn report_exhausts_attempts_and_fails() {
    let api = MockApi::new(0, "ok").failing_first(100);
    let base = start_mock(api.clone()).await;

    let client = Client::new(&base, "tok", 0)
        .expect("client")
        .with_retry(3, Duration::from_millis(10));

    let err = client
        .send(&[sample_info()])
        .await
        .expect_err("must exhaust attempts");

    assert!(matches!(err, ReportError::Unreachable { attempts: 3, .. }));
    assert_eq!(api.hits.load(Ordering::SeqCst), 3);
}

fn sample_info() -> HotKeyInfo {
    HotKeyInfo {
        ticket_id: 1,
        record_id: 2,
        bk_biz_id: 3,
        cluster_id: 4,
        ins: "127.0.0.1:6379".to_string(),
        key: "foo".to_string(),
        cmd_info: "get:10 ".to_string(),
        exec_count: 10,
        ratio: "100.00".to_string(),
    }
}

// --- Full analyzer pipeline ---

#[tokio::test]
async fn single_hot_key_is_reported() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    let mut lines = Vec::new();
    for _ in 0..9 {
        lines.push(record_line(port, "GET", "foo"));
    }
    lines.push(record_line(port, "SET", "foo"));
    let probe = write_probe_script(dir.path(), &lines, 0);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 7 }],
        5,
    );

    let summary = analyzer::run(req).await.expect("run succeeds");
    assert_eq!(summary.reported.len(), 1);
    assert_eq!(summary.failed.len(), 0);
    assert_eq!(summary.reported[0].all_total_count, 10);

    let bodies = api.received();
    assert_eq!(bodies.len(), 1);

    let infos = bodies[0]["hot_key_infos"].as_array().expect("array");
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0]["key"], "foo");
    assert_eq!(infos[0]["exec_count"], 10);
    assert_eq!(infos[0]["ratio"], "100.00");
    assert_eq!(infos[0]["ins"], format!("127.0.0.1:{port}"));
    assert_eq!(infos[0]["ticket_id"], 22);
    assert_eq!(infos[0]["record_id"], 7);
    assert_eq!(infos[0]["bk_biz_id"], 33);
    assert_eq!(infos[0]["cluster_id"], 11);

    let cmd_info = infos[0]["cmd_info"].as_str().expect("string");
    assert!(cmd_info.contains("get:9"));
    assert!(cmd_info.contains("set:1"));
    assert!(cmd_info.ends_with(' '));
}

#[tokio::test]
async fn window_split_merges_all_probe_outputs() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    // One record per probe invocation; 1250 s splits into 600/600/50.
    let lines = vec![record_line(port, "GET", "k1")];
    let probe = write_probe_script(dir.path(), &lines, 0);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 1 }],
        1250,
    );

    let summary = analyzer::run(req).await.expect("run succeeds");
    assert_eq!(summary.reported[0].all_total_count, 3);

    // Three capture output files were produced and merged into one report.
    let savedir = dir.path().join("dbbak").join("hotkey");
    let outputs = std::fs::read_dir(&savedir)
        .expect("savedir")
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("capture_result_")
        })
        .count();
    assert_eq!(outputs, 3);

    let bodies = api.received();
    assert_eq!(bodies.len(), 1);
    let infos = bodies[0]["hot_key_infos"].as_array().expect("array");
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0]["exec_count"], 3);
}

#[tokio::test]
async fn down_instance_is_soft_failure() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, up_port) = bind_in_range();
    let down_port = closed_port_in_range();

    let lines = vec![record_line(up_port, "GET", "k1")];
    let probe = write_probe_script(dir.path(), &lines, 0);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![
            InstanceRequest {
                port: up_port,
                record_id: 1,
            },
            InstanceRequest {
                port: down_port,
                record_id: 2,
            },
        ],
        5,
    );

    let summary = analyzer::run(req).await.expect("partial success is success");
    assert_eq!(summary.reported.len(), 1);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].0.ends_with(&down_port.to_string()));

    // Only the live instance reported.
    let bodies = api.received();
    assert_eq!(bodies.len(), 1);
    let infos = bodies[0]["hot_key_infos"].as_array().expect("array");
    assert_eq!(infos[0]["ins"], format!("127.0.0.1:{up_port}"));
}

#[tokio::test]
async fn benign_probe_exit_one_keeps_scheduling() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    // The probe writes its record and then exits 1 every run.
    let lines = vec![record_line(port, "GET", "k1")];
    let probe = write_probe_script(dir.path(), &lines, 1);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 1 }],
        1250,
    );

    let summary = analyzer::run(req).await.expect("exit 1 is benign");
    assert_eq!(summary.reported.len(), 1);
    // All three runs still executed.
    assert_eq!(summary.reported[0].all_total_count, 3);
}

#[tokio::test]
async fn hard_probe_failure_aborts_instance() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    let probe = write_probe_script(dir.path(), &[], 2);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 1 }],
        5,
    );

    let err = analyzer::run(req).await.expect_err("all instances failed");
    assert!(err.to_string().contains("probe exited with status 2"));

    // No report was sent.
    assert_eq!(api.hits.load(Ordering::SeqCst), 0);
}

#[test]
fn capture_setup_failure_exits_with_status_two() {
    let dir = tempfile::tempdir().expect("tempdir");

    // A device that cannot be opened must not exit 1: the analyzer reads
    // status 1 as the benign no-traffic condition and would keep scheduling.
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_hotkeyoor"))
        .args([
            "capture",
            "--device",
            "no-such-device-0",
            "--ip",
            "127.0.0.1",
            "--port",
            "6379",
            "--timeout",
            "1",
            "--log-file",
        ])
        .arg(dir.path().join("probe.log"))
        .arg("--output-file")
        .arg(dir.path().join("capture_result.txt"))
        .status()
        .expect("spawn probe binary");

    assert_eq!(status.code(), Some(2));
}

#[tokio::test]
async fn remote_rejection_fails_instance_without_retry() {
    let api = MockApi::new(1001, "bad token");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    let lines = vec![record_line(port, "GET", "k1")];
    let probe = write_probe_script(dir.path(), &lines, 0);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 1 }],
        5,
    );

    let err = analyzer::run(req).await.expect_err("rejection fails the run");
    assert!(err.to_string().contains("bad token"));

    // The rejection was final: exactly one POST.
    assert_eq!(api.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn quiet_instance_sends_no_report() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    let probe = write_probe_script(dir.path(), &[], 0);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 1 }],
        5,
    );

    let summary = analyzer::run(req).await.expect("quiet run succeeds");
    assert_eq!(summary.reported.len(), 1);
    assert_eq!(summary.reported[0].reported_keys, 0);
    assert_eq!(api.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn top_k_caps_report_at_twenty_entries() {
    let api = MockApi::new(0, "ok");
    let base = start_mock(api.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let (_listener, port) = bind_in_range();

    // 25 singleton keys plus one key hit twice.
    let mut lines: Vec<String> = (0..25)
        .map(|i| record_line(port, "GET", &format!("k{i}")))
        .collect();
    lines.push(record_line(port, "GET", "k1"));
    let probe = write_probe_script(dir.path(), &lines, 0);

    let req = request(
        &base,
        dir.path(),
        probe,
        vec![InstanceRequest { port, record_id: 1 }],
        5,
    );

    analyzer::run(req).await.expect("run succeeds");

    let bodies = api.received();
    let infos = bodies[0]["hot_key_infos"].as_array().expect("array");
    assert_eq!(infos.len(), 20);

    // The strictly hottest key must be present; with ascending emission it
    // is the last entry.
    let keys: Vec<&str> = infos.iter().map(|i| i["key"].as_str().expect("key")).collect();
    assert!(keys.contains(&"k1"));
    assert_eq!(infos.last().expect("non-empty")["exec_count"], 2);
}
