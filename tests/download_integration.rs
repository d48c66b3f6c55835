//! End-to-end download scenarios against a local mock server.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use booruview_core::config::AppConfig;
use booruview_core::download::{DownloadCallbacks, DownloadManager};
use booruview_core::events::{EventBus, EventKind};
use booruview_core::post::{Post, Rating};
use booruview_core::security::UrlValidator;
use booruview_core::session::Session;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_post(id: u64, url: &str, rating: Rating, tags: &str) -> Post {
    let mut post = Post::with_id(id);
    post.rating = rating;
    post.file_url = Some(url.to_string());
    post.tags = tags.to_string();
    post
}

fn test_manager(server: &MockServer) -> (DownloadManager, EventBus) {
    let mut config = AppConfig::default();
    config.api_url = format!("{}/post.json", server.uri());
    config.download.retry_delay = 0.1;
    config.download.disk_min_free_gb = 0.0;

    let session = Arc::new(Session::new().unwrap());
    let validator = Arc::new(
        UrlValidator::new(["http", "https"], ["127.0.0.1", "localhost"]).block_private_ips(false),
    );
    let bus = EventBus::new();
    let manager = DownloadManager::new(&config, session, validator, bus.clone());
    (manager, bus)
}

/// Collects (kind, post_id) pairs for download lifecycle events.
fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<(EventKind, String)>>> {
    let log: Arc<Mutex<Vec<(EventKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::DownloadStarted,
        EventKind::DownloadProgress,
        EventKind::DownloadCompleted,
        EventKind::DownloadFailed,
        EventKind::DownloadCancelled,
    ] {
        let log = Arc::clone(&log);
        // Tokens intentionally leaked for the test's lifetime.
        std::mem::forget(bus.subscribe(
            kind,
            move |event| {
                let post_id = event.str_field("post_id").unwrap_or("").to_string();
                log.lock().unwrap().push((event.kind, post_id));
            },
            Some("test-recorder"),
        ));
    }
    log
}

async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn full_download_writes_library_file_and_orders_events() {
    let server = MockServer::start().await;
    let body = vec![0xabu8; 1024 * 1024];
    Mock::given(method("GET"))
        .and(path("/12345.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, bus) = test_manager(&server);
    let events = record_events(&bus);

    let completions = Arc::new(AtomicUsize::new(0));
    let completed_path: Arc<Mutex<Option<std::path::PathBuf>>> = Arc::new(Mutex::new(None));
    let callbacks = DownloadCallbacks {
        on_complete: Some({
            let completions = Arc::clone(&completions);
            let completed_path = Arc::clone(&completed_path);
            Arc::new(move |post_id, path| {
                assert_eq!(post_id, "12345");
                completions.fetch_add(1, Ordering::SeqCst);
                *completed_path.lock().unwrap() = Some(path.to_path_buf());
            })
        }),
        ..DownloadCallbacks::default()
    };

    let post = test_post(
        12345,
        &format!("{}/12345.jpg", server.uri()),
        Rating::Safe,
        "blue_sky",
    );
    let token = manager.submit_download(post, lib.path(), callbacks);
    assert!(token.is_some());

    let target = lib.path().join("Safe/12345_blue_sky.jpg");
    assert!(wait_for_file(&target, Duration::from_secs(10)).await);
    // Give terminal bookkeeping a moment after the rename.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(std::fs::metadata(&target).unwrap().len(), 1_048_576);
    assert!(!lib.path().join("Safe/12345_blue_sky.jpg.tmp").exists());
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(
        completed_path.lock().unwrap().as_deref(),
        Some(target.as_path())
    );

    let log = events.lock().unwrap();
    let kinds: Vec<EventKind> = log
        .iter()
        .filter(|(_, id)| id == "12345")
        .map(|(kind, _)| *kind)
        .collect();
    assert_eq!(kinds.first(), Some(&EventKind::DownloadStarted));
    assert_eq!(kinds.last(), Some(&EventKind::DownloadCompleted));
    assert!(
        kinds[1..kinds.len() - 1]
            .iter()
            .all(|k| *k == EventKind::DownloadProgress),
        "between STARTED and COMPLETED only PROGRESS is allowed: {kinds:?}"
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::DownloadCompleted)
            .count(),
        1,
        "exactly one terminal event"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_sends_range_and_completes_file() {
    let server = MockServer::start().await;
    let full: Vec<u8> = (0..1024u32 * 1024).map(|i| (i % 251) as u8).collect();
    let partial_len = 600 * 1024;
    let remainder = full[partial_len..].to_vec();

    // The range request resumes with a 206 carrying the remainder.
    Mock::given(method("GET"))
        .and(path("/12345.jpg"))
        .and(header("Range", format!("bytes={partial_len}-").as_str()))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Length", remainder.len().to_string().as_str())
                .set_body_bytes(remainder),
        )
        .expect(1)
        .mount(&server)
        .await;
    // A plain GET would restart from scratch; it must not happen.
    Mock::given(method("GET"))
        .and(path("/12345.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(full.clone()))
        .expect(0)
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let target_dir = lib.path().join("Safe");
    std::fs::create_dir_all(&target_dir).unwrap();
    // The partial left behind by an interrupted earlier attempt.
    std::fs::write(
        target_dir.join("12345_blue_sky.jpg.tmp"),
        &full[..partial_len],
    )
    .unwrap();

    let (manager, bus) = test_manager(&server);
    let events = record_events(&bus);

    let post = test_post(
        12345,
        &format!("{}/12345.jpg", server.uri()),
        Rating::Safe,
        "blue_sky",
    );
    manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    let target = target_dir.join("12345_blue_sky.jpg");
    assert!(wait_for_file(&target, Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let written = std::fs::read(&target).unwrap();
    assert_eq!(written.len(), full.len());
    assert_eq!(written, full, "resumed file must equal the concatenation");

    let log = events.lock().unwrap();
    let completed = log
        .iter()
        .filter(|(kind, _)| *kind == EventKind::DownloadCompleted)
        .count();
    assert_eq!(completed, 1, "no duplicate COMPLETED event");
}

#[tokio::test(flavor = "multi_thread")]
async fn range_not_satisfiable_treats_partial_as_complete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/7.png"))
        .respond_with(ResponseTemplate::new(416))
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let dir = lib.path().join("Questionable");
    std::fs::create_dir_all(&dir).unwrap();
    let content = b"already complete content".to_vec();
    std::fs::write(dir.join("7_art.png.tmp"), &content).unwrap();

    let (manager, _bus) = test_manager(&server);
    let post = test_post(
        7,
        &format!("{}/7.png", server.uri()),
        Rating::Questionable,
        "art",
    );
    manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    let target = dir.join("7_art.png");
    assert!(wait_for_file(&target, Duration::from_secs(10)).await);
    assert_eq!(std::fs::read(&target).unwrap(), content);
    assert!(!dir.join("7_art.png.tmp").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_byte_response_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/0.gif"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "0")
                .set_body_bytes(Vec::new()),
        )
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, _bus) = test_manager(&server);
    let post = test_post(9, &format!("{}/0.gif", server.uri()), Rating::Safe, "empty");
    manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    let target = lib.path().join("Safe/9_empty.gif");
    assert!(wait_for_file(&target, Duration::from_secs(10)).await);
    assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn not_found_fails_terminally_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/404.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1) // permanent: exactly one attempt
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, bus) = test_manager(&server);
    let events = record_events(&bus);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let callbacks = DownloadCallbacks {
        on_error: Some(Arc::new(move |post_id, message| {
            let _ = tx.send((post_id.to_string(), message.to_string()));
        })),
        ..DownloadCallbacks::default()
    };

    let post = test_post(404, &format!("{}/404.jpg", server.uri()), Rating::Safe, "x");
    manager.submit_download(post, lib.path(), callbacks).unwrap();

    let (post_id, message) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(post_id, "404");
    assert!(message.contains("404"), "got: {message}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = events.lock().unwrap();
    assert!(log.iter().any(|(k, _)| *k == EventKind::DownloadFailed));
    assert!(!log.iter().any(|(k, _)| *k == EventKind::DownloadCompleted));
}

#[tokio::test(flavor = "multi_thread")]
async fn redirect_is_refused_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/moved.jpg"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere.jpg"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/elsewhere.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"secret".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, bus) = test_manager(&server);
    let events = record_events(&bus);

    let post = test_post(3, &format!("{}/moved.jpg", server.uri()), Rating::Safe, "x");
    manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        {
            let log = events.lock().unwrap();
            if log.iter().any(|(k, _)| *k == EventKind::DownloadFailed) {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!lib.path().join("Safe/3_x.jpg").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_submit_returns_none_while_active() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, _bus) = test_manager(&server);

    let url = format!("{}/slow.jpg", server.uri());
    let first = manager.submit_download(
        test_post(11, &url, Rating::Safe, "x"),
        lib.path(),
        DownloadCallbacks::default(),
    );
    assert!(first.is_some());

    let second = manager.submit_download(
        test_post(11, &url, Rating::Safe, "x"),
        lib.path(),
        DownloadCallbacks::default(),
    );
    assert!(second.is_none(), "one active task per post id");

    let status = manager.get_status();
    assert_eq!(status.active, 1);

    // After the first finishes, a new submission is accepted again.
    assert!(wait_for_file(&lib.path().join("Safe/11_x.jpg"), Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // The file now exists, so this completes immediately but is accepted.
    let third = manager.submit_download(
        test_post(11, &url, Rating::Safe, "x"),
        lib.path(),
        DownloadCallbacks::default(),
    );
    assert!(third.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_publishes_cancelled_and_never_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 256 * 1024])
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, bus) = test_manager(&server);
    let events = record_events(&bus);

    let post = test_post(
        21,
        &format!("{}/big.jpg", server.uri()),
        Rating::Explicit,
        "x",
    );
    let token = manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel("user clicked stop");
    assert!(token.is_cancelled());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        {
            let log = events.lock().unwrap();
            if log.iter().any(|(k, _)| *k == EventKind::DownloadCancelled) {
                break;
            }
            assert!(
                !log.iter().any(|(k, _)| *k == EventKind::DownloadCompleted),
                "cancelled download must not complete"
            );
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The final file never appears.
    assert!(!lib.path().join("Explicit/21_x.jpg").exists());
    // Terminal state frees the id for resubmission.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.get_status().active, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_final_file_short_circuits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/here.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .expect(0) // no network traffic at all
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let dir = lib.path().join("Safe");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("33_x.jpg"), b"original").unwrap();

    let (manager, bus) = test_manager(&server);
    let events = record_events(&bus);

    let post = test_post(33, &format!("{}/here.jpg", server.uri()), Rating::Safe, "x");
    manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let log = events.lock().unwrap();
            if log.iter().any(|(k, _)| *k == EventKind::DownloadCompleted) {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(std::fs::read(dir.join("33_x.jpg")).unwrap(), b"original");
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_error_retries_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"eventually".to_vec()))
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, _bus) = test_manager(&server);
    let post = test_post(55, &format!("{}/flaky.jpg", server.uri()), Rating::Safe, "x");
    manager
        .submit_download(post, lib.path(), DownloadCallbacks::default())
        .unwrap();

    let target = lib.path().join("Safe/55_x.jpg");
    assert!(wait_for_file(&target, Duration::from_secs(10)).await);
    assert_eq!(std::fs::read(&target).unwrap(), b"eventually");
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_resume_fetches_descriptor_then_downloads() {
    let server = MockServer::start().await;
    let asset_url = format!("{}/files/77.jpg", server.uri());
    Mock::given(method("GET"))
        .and(path("/post.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": 77, "rating": "s", "tags": "resumed", "file_url": asset_url}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/77.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"resumed body".to_vec()))
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, _bus) = test_manager(&server);
    manager.submit_resume("77", Rating::Safe, lib.path(), DownloadCallbacks::default());

    let target = lib.path().join("Safe/77_resumed.jpg");
    assert!(wait_for_file(&target, Duration::from_secs(10)).await);
    assert_eq!(std::fs::read(&target).unwrap(), b"resumed body");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_all_counts_only_fresh_cancellations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let lib = TempDir::new().unwrap();
    let (manager, _bus) = test_manager(&server);
    let url = format!("{}/a.jpg", server.uri());

    let token = manager
        .submit_download(
            test_post(1, &url, Rating::Safe, "a"),
            lib.path(),
            DownloadCallbacks::default(),
        )
        .unwrap();
    manager
        .submit_download(
            test_post(2, &url, Rating::Safe, "b"),
            lib.path(),
            DownloadCallbacks::default(),
        )
        .unwrap();

    token.cancel("already cancelled");
    let changed = manager.cancel_all("shutdown");
    assert_eq!(changed, 1, "only the un-cancelled token counts");

    manager.shutdown(true, Duration::from_secs(5)).await;
    assert_eq!(manager.get_status().active, 0);
}
