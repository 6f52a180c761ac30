//! Integration tests for tubeoffline
//!
//! These tests drive the real HTTP transport and watched reporter against a
//! minimal HTTP/1.1 fixture on a loopback port, so the full path from
//! `start` to a committed file (or a server-side watched flag) is covered.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use tubeoffline::download::{
    AssetStore, CoordinatorEvent, DownloadCoordinator, DownloadStatus, HttpTransport, Transport,
    TransferEvent,
};
use tubeoffline::watch::{
    HttpWatchReporter, PlaybackSample, PositionSource, WatchProgressTracker, WatchReporter, WatchedThreshold,
};
use tubeoffline::{OfflineError, Video};

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// HTTP Fixture
// =============================================================================

#[derive(Clone)]
enum Reply {
    /// 200 with the full body
    Body(Vec<u8>),
    /// Bare status code, empty body
    Status(u16),
    /// Declares `declared` bytes, sends `body`, then closes
    Truncated { declared: usize, body: Vec<u8> },
    /// Declares `declared` bytes, sends `first`, then never finishes
    Stall { declared: usize, first: Vec<u8> },
}

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct TestServer {
    base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl TestServer {
    async fn start(routes: Vec<(&str, Reply)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let routes: Arc<HashMap<String, Reply>> =
            Arc::new(routes.into_iter().map(|(path, reply)| (path.to_string(), reply)).collect());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let routes = Arc::clone(&routes);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);

                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.is_err() {
                        return;
                    }
                    let mut parts = request_line.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();

                    let mut headers = HashMap::new();
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            break;
                        }
                        let line = line.trim_end();
                        if line.is_empty() {
                            break;
                        }
                        if let Some((name, value)) = line.split_once(':') {
                            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                        }
                    }

                    let length: usize = headers
                        .get("content-length")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    let mut body = vec![0u8; length];
                    if length > 0 && reader.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    recorded.lock().unwrap().push(Recorded {
                        method,
                        path: path.clone(),
                        headers,
                        body,
                    });

                    let reply = routes.get(&path).cloned().unwrap_or(Reply::Status(404));
                    let head = |status: u16, length: usize| {
                        format!(
                            "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            status, length
                        )
                    };
                    match reply {
                        Reply::Body(body) => {
                            let _ = write_half.write_all(head(200, body.len()).as_bytes()).await;
                            let _ = write_half.write_all(&body).await;
                        }
                        Reply::Status(code) => {
                            let _ = write_half.write_all(head(code, 0).as_bytes()).await;
                        }
                        Reply::Truncated { declared, body } => {
                            let _ = write_half.write_all(head(200, declared).as_bytes()).await;
                            let _ = write_half.write_all(&body).await;
                        }
                        Reply::Stall { declared, first } => {
                            let _ = write_half.write_all(head(200, declared).as_bytes()).await;
                            let _ = write_half.write_all(&first).await;
                            let _ = write_half.flush().await;
                            sleep(Duration::from_secs(3600)).await;
                        }
                    }
                    let _ = write_half.shutdown().await;
                });
            }
        });

        Self { base_url, requests }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

fn media(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Coordinator Harness
// =============================================================================

struct Harness {
    dir: TempDir,
    coordinator: DownloadCoordinator,
}

impl Harness {
    fn staging(&self) -> std::path::PathBuf {
        self.dir.path().join("transfers")
    }

    fn storage(&self) -> std::path::PathBuf {
        self.dir.path().join("VideoDownloads")
    }
}

fn open_harness(dir: TempDir, base_url: &str, token: &str) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::open(dir.path().join("transfers"), token, tx).expect("open transport");
    let store = AssetStore::load(dir.path().join("VideoDownloads"), dir.path().join("downloads.json"), "mp4");
    let coordinator = DownloadCoordinator::start_up(store, Arc::new(transport), base_url);
    coordinator.spawn_event_loop(rx);
    Harness { dir, coordinator }
}

async fn wait_for_status(coordinator: &DownloadCoordinator, id: &str, wanted: fn(&DownloadStatus) -> bool) {
    let mut snapshots = coordinator.subscribe();
    timeout(WAIT, async {
        loop {
            if wanted(&snapshots.borrow_and_update().status(id)) {
                return;
            }
            snapshots.changed().await.expect("coordinator alive");
        }
    })
    .await
    .expect("status reached in time");
}

fn staging_files(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == extension))
                .count()
        })
        .unwrap_or(0)
}

// =============================================================================
// Download Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_end_to_end() {
    let body = media(200_000);
    let server = TestServer::start(vec![("/media/abc123.mp4", Reply::Body(body.clone()))]).await;
    let harness = open_harness(TempDir::new().unwrap(), &format!("{}/", server.base_url), "s3cret");
    let mut events = harness.coordinator.events();

    harness
        .coordinator
        .start(&Video::new("abc123", "/media/abc123.mp4", "A video"))
        .unwrap();

    let completed = timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                CoordinatorEvent::Completed { asset_id, path, .. } => return (asset_id, path),
                CoordinatorEvent::Failed { error, .. } => panic!("download failed: {}", error),
                _ => continue,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(completed.0, "abc123");
    assert_eq!(completed.1, harness.storage().join("abc123.mp4"));
    assert_eq!(std::fs::read(&completed.1).unwrap(), body);
    assert_eq!(harness.coordinator.status("abc123"), DownloadStatus::Downloaded);
    assert_eq!(harness.coordinator.locate("abc123"), Some(completed.1));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].headers.get("authorization").map(String::as_str), Some("Token s3cret"));

    assert!(HttpTransport::journaled(&harness.staging()).unwrap().is_empty());
    assert_eq!(staging_files(&harness.staging(), "part"), 0);
    assert_eq!(staging_files(&harness.staging(), "download"), 0);

    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(harness.dir.path().join("downloads.json")).unwrap()).unwrap();
    assert_eq!(persisted["downloaded"], serde_json::json!(["abc123"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_error_leaves_not_downloaded() {
    let server = TestServer::start(vec![("/media/gone.mp4", Reply::Status(404))]).await;
    let harness = open_harness(TempDir::new().unwrap(), &server.base_url, "");
    let mut events = harness.coordinator.events();

    harness
        .coordinator
        .start(&Video::new("gone", "/media/gone.mp4", "Missing"))
        .unwrap();

    let error = timeout(WAIT, async {
        loop {
            if let CoordinatorEvent::Failed { error, .. } = events.recv().await.unwrap() {
                return error;
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(error, OfflineError::TransportFailure(ref msg) if msg.contains("404")));
    assert_eq!(harness.coordinator.status("gone"), DownloadStatus::NotDownloaded);
    assert!(server.requests()[0].headers.get("authorization").is_none());
    assert!(HttpTransport::journaled(&harness.staging()).unwrap().is_empty());
    assert_eq!(staging_files(&harness.staging(), "part"), 0);

    // Retry is allowed after a failure.
    assert!(harness
        .coordinator
        .start(&Video::new("gone", "/media/gone.mp4", "Missing"))
        .is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_body_is_a_failure() {
    let server = TestServer::start(vec![(
        "/media/short.mp4",
        Reply::Truncated {
            declared: 10_000,
            body: media(100),
        },
    )])
    .await;
    let harness = open_harness(TempDir::new().unwrap(), &server.base_url, "");

    harness
        .coordinator
        .start(&Video::new("short", "/media/short.mp4", "Short"))
        .unwrap();
    wait_for_status(&harness.coordinator, "short", |s| *s == DownloadStatus::NotDownloaded).await;

    assert!(harness.coordinator.locate("short").is_none());
    assert_eq!(staging_files(&harness.storage(), "mp4"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_transfer_discards_partial_file() {
    let server = TestServer::start(vec![(
        "/media/slow.mp4",
        Reply::Stall {
            declared: 1_000_000,
            first: media(4096),
        },
    )])
    .await;
    let harness = open_harness(TempDir::new().unwrap(), &server.base_url, "");

    harness
        .coordinator
        .start(&Video::new("slow", "/media/slow.mp4", "Slow"))
        .unwrap();
    wait_for_status(&harness.coordinator, "slow", |s| {
        matches!(s, DownloadStatus::Downloading { progress: Some(_) })
    })
    .await;

    harness.coordinator.cancel("slow").unwrap();

    assert_eq!(harness.coordinator.status("slow"), DownloadStatus::NotDownloaded);
    assert!(HttpTransport::journaled(&harness.staging()).unwrap().is_empty());
    assert_eq!(staging_files(&harness.staging(), "part"), 0);
    assert_eq!(staging_files(&harness.storage(), "mp4"), 0);
    assert_eq!(
        harness.coordinator.cancel("slow"),
        Err(OfflineError::NotInProgress("slow".into()))
    );
}

// =============================================================================
// Restart Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_replays_unacknowledged_completion() {
    let body = media(10_000);
    let server = TestServer::start(vec![("/media/late.mp4", Reply::Body(body.clone()))]).await;
    let dir = TempDir::new().unwrap();

    // First process: the transfer finishes but nobody acknowledges it.
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::open(dir.path().join("transfers"), "", tx).unwrap();
        let url = reqwest::Url::parse(&format!("{}/media/late.mp4", server.base_url)).unwrap();
        transport
            .submit(tubeoffline::download::TransferRequest {
                asset_id: "late".into(),
                url,
                title: "Late".into(),
            })
            .unwrap();

        timeout(WAIT, async {
            while let Some(event) = rx.recv().await {
                if matches!(event, TransferEvent::Finished { .. }) {
                    return;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.live_transfers().len(), 1);
    }

    // Second process picks it up from the journal.
    let harness = open_harness(dir, &server.base_url, "");
    wait_for_status(&harness.coordinator, "late", |s| *s == DownloadStatus::Downloaded).await;

    assert_eq!(std::fs::read(harness.coordinator.locate("late").unwrap()).unwrap(), body);
    assert!(HttpTransport::journaled(&harness.staging()).unwrap().is_empty());
    assert_eq!(server.requests().len(), 1, "completion is replayed, not refetched");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_relaunches_running_transfer() {
    let body = media(5_000);
    let server = TestServer::start(vec![("/media/again.mp4", Reply::Body(body.clone()))]).await;
    let dir = TempDir::new().unwrap();

    let staging = dir.path().join("transfers");
    std::fs::create_dir_all(&staging).unwrap();
    let journal = serde_json::json!({
        "version": 1,
        "transfers": [{
            "handle": {"asset_id": "again", "task_id": 42},
            "url": format!("{}/media/again.mp4", server.base_url),
            "title": "Again",
            "submitted_at": "2025-01-01T00:00:00Z",
            "state": {"state": "running"}
        }]
    });
    std::fs::write(staging.join("journal.json"), journal.to_string()).unwrap();
    std::fs::write(staging.join("42.part"), b"stale partial").unwrap();

    let harness = open_harness(dir, &server.base_url, "");
    assert!(harness.coordinator.status("again").is_downloading() || harness.coordinator.locate("again").is_some());

    wait_for_status(&harness.coordinator, "again", |s| *s == DownloadStatus::Downloaded).await;
    assert_eq!(std::fs::read(harness.coordinator.locate("again").unwrap()).unwrap(), body);
    assert_eq!(staging_files(&harness.staging(), "part"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_cancels_transfer_for_stored_asset() {
    let server = TestServer::start(vec![(
        "/media/dup.mp4",
        Reply::Stall {
            declared: 1_000,
            first: media(10),
        },
    )])
    .await;
    let dir = TempDir::new().unwrap();

    // The asset is already committed from an earlier run.
    let storage = dir.path().join("VideoDownloads");
    std::fs::create_dir_all(&storage).unwrap();
    std::fs::write(storage.join("dup.mp4"), b"complete").unwrap();
    std::fs::write(
        dir.path().join("downloads.json"),
        r#"{"version":1,"downloaded":["dup"],"last_saved":null}"#,
    )
    .unwrap();

    let staging = dir.path().join("transfers");
    std::fs::create_dir_all(&staging).unwrap();
    let journal = serde_json::json!({
        "version": 1,
        "transfers": [{
            "handle": {"asset_id": "dup", "task_id": 7},
            "url": format!("{}/media/dup.mp4", server.base_url),
            "title": "Dup",
            "submitted_at": "2025-01-01T00:00:00Z",
            "state": {"state": "running"}
        }]
    });
    std::fs::write(staging.join("journal.json"), journal.to_string()).unwrap();

    let harness = open_harness(dir, &server.base_url, "");

    assert_eq!(harness.coordinator.status("dup"), DownloadStatus::Downloaded);
    assert!(harness.coordinator.active_transfers().is_empty());
    assert!(HttpTransport::journaled(&harness.staging()).unwrap().is_empty());
    assert_eq!(std::fs::read(storage.join("dup.mp4")).unwrap(), b"complete");
}

#[tokio::test]
async fn test_discard_journaled_leaves_other_transfers_alone() {
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("transfers");
    std::fs::create_dir_all(&staging).unwrap();
    let journal = serde_json::json!({
        "version": 1,
        "transfers": [
            {
                "handle": {"asset_id": "drop", "task_id": 3},
                "url": "http://127.0.0.1:9/media/drop.mp4",
                "title": "Drop",
                "submitted_at": "2025-01-01T00:00:00Z",
                "state": {"state": "running"}
            },
            {
                "handle": {"asset_id": "keep", "task_id": 4},
                "url": "http://127.0.0.1:9/media/keep.mp4",
                "title": "Keep",
                "submitted_at": "2025-01-01T00:00:00Z",
                "state": {"state": "running"}
            }
        ]
    });
    std::fs::write(staging.join("journal.json"), journal.to_string()).unwrap();
    std::fs::write(staging.join("3.part"), b"partial").unwrap();
    std::fs::write(staging.join("4.part"), b"partial").unwrap();

    let discarded = HttpTransport::discard_journaled(&staging, "drop").unwrap();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].task_id, 3);
    assert!(!staging.join("3.part").exists());
    assert!(staging.join("4.part").exists(), "other transfers are not relaunched or touched");

    let remaining = HttpTransport::journaled(&staging).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0.asset_id, "keep");

    assert!(HttpTransport::discard_journaled(&staging, "drop").unwrap().is_empty());
    assert!(HttpTransport::discard_journaled(&dir.path().join("missing"), "x").unwrap().is_empty());
}

// =============================================================================
// Watched Reporting Tests
// =============================================================================

#[tokio::test]
async fn test_reporter_wire_format() {
    let server = TestServer::start(vec![("/api/watched/", Reply::Status(200))]).await;
    let reporter = HttpWatchReporter::new(format!("{}/api/watched/", server.base_url), "tok123").unwrap();

    reporter.report_watched("abc123").await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/api/watched/");
    assert_eq!(request.headers.get("content-type").map(String::as_str), Some("application/json"));
    assert_eq!(request.headers.get("authorization").map(String::as_str), Some("Token tok123"));
    assert_eq!(request.body, br#"{"id":"abc123","is_watched":true}"#);
}

#[tokio::test]
async fn test_reporter_surfaces_server_error() {
    let server = TestServer::start(vec![("/api/watched/", Reply::Status(500))]).await;
    let reporter = HttpWatchReporter::new(format!("{}/api/watched/", server.base_url), "tok").unwrap();

    let err = reporter.report_watched("abc").await.unwrap_err();
    assert!(format!("{:#}", err).contains("500"));
}

struct NearTheEnd;

impl PositionSource for NearTheEnd {
    fn sample(&self) -> Option<PlaybackSample> {
        Some(PlaybackSample::new(580.0, 600.0))
    }
}

#[tokio::test]
async fn test_tracker_posts_once_for_played_file() {
    let server = TestServer::start(vec![("/api/watched/", Reply::Status(200))]).await;
    let reporter = Arc::new(HttpWatchReporter::new(format!("{}/api/watched/", server.base_url), "tok").unwrap());
    let tracker = WatchProgressTracker::new(reporter, WatchedThreshold::default(), Duration::from_millis(10));

    let session = tracker
        .begin_for_source("/var/cache/VideoDownloads/vid42.mp4", Arc::new(NearTheEnd))
        .unwrap();

    timeout(WAIT, async {
        while server.requests().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(100)).await;
    session.end().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, br#"{"id":"vid42","is_watched":true}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_played_download_reports_its_own_id() {
    let server = TestServer::start(vec![
        ("/media/vid.42.mp4", Reply::Body(media(4_000))),
        ("/api/watched/", Reply::Status(200)),
    ])
    .await;
    let harness = open_harness(TempDir::new().unwrap(), &server.base_url, "tok");

    harness
        .coordinator
        .start(&Video::new("vid.42", "/media/vid.42.mp4", "Dotted id"))
        .unwrap();
    wait_for_status(&harness.coordinator, "vid.42", |s| *s == DownloadStatus::Downloaded).await;
    let played = harness.coordinator.locate("vid.42").unwrap();
    assert_ne!(played.file_stem().unwrap(), "vid", "dotted ids are stored under a hashed name");

    let reporter = Arc::new(HttpWatchReporter::new(format!("{}/api/watched/", server.base_url), "tok").unwrap());
    let tracker = WatchProgressTracker::new(reporter, WatchedThreshold::default(), Duration::from_millis(10))
        .with_resolver(Arc::new(harness.coordinator.clone()));
    let session = tracker
        .begin_for_source(played.to_str().unwrap(), Arc::new(NearTheEnd))
        .unwrap();
    assert_eq!(session.asset_id(), "vid.42");

    timeout(WAIT, async {
        while !server.requests().iter().any(|r| r.path == "/api/watched/") {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    session.end().await;

    let reports: Vec<_> = server
        .requests()
        .into_iter()
        .filter(|r| r.path == "/api/watched/")
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].body, br#"{"id":"vid.42","is_watched":true}"#);
}
