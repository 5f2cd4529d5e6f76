use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use haven::sync::SyncOptions;
use haven::{
    server, FallbackCache, FileClient, FileRecord, ProbeTarget, Prober, ServerState,
    SnapshotSource, SyncOrchestrator,
};
use warp::Filter;

fn options(refresh_interval: Duration) -> SyncOptions {
    SyncOptions {
        refresh_interval,
        probe_timeout: Duration::from_millis(1000),
    }
}

fn orchestrator(url: &str, cache: FallbackCache, refresh_interval: Duration) -> SyncOrchestrator {
    SyncOrchestrator::with_parts(
        FileClient::new(url).unwrap(),
        Prober::new(ProbeTarget::Files).unwrap(),
        cache,
        options(refresh_interval),
    )
    .unwrap()
}

async fn start_server() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("temp dir");
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let (bound, _handle) = server::spawn(addr, dir.path().to_path_buf())
        .await
        .expect("server starts");
    (dir, format!("http://{}", bound))
}

/// Lists `a.txt` and `b.txt` until `failing` is set, then answers 500.
fn flaky_server(failing: Arc<AtomicBool>) -> String {
    let files = warp::path!("api" / "files").map(move || {
        if failing.load(Ordering::SeqCst) {
            return warp::reply::with_status(
                "boom".to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
        warp::reply::with_status(
            r#"[{"name":"a.txt","size":1,"uploadDate":"2024-03-01T10:00:00Z"},
                {"name":"b.txt","size":2,"uploadDate":"2024-03-01T11:00:00Z"}]"#
                .to_string(),
            warp::http::StatusCode::OK,
        )
    });
    let (addr, server) = warp::serve(files).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    format!("http://{}", addr)
}

#[tokio::test]
async fn start_goes_online_and_loads_snapshot() {
    let (_dir, url) = start_server().await;
    FileClient::new(url.clone())
        .unwrap()
        .upload("seed.txt", b"seed".to_vec())
        .await
        .unwrap();

    let cache = FallbackCache::in_memory();
    let mut sync = orchestrator(&url, cache.clone(), Duration::from_secs(60));
    assert_eq!(sync.start().await, ServerState::Online);

    let view = sync.view();
    assert_eq!(view.source, SnapshotSource::Live);
    assert_eq!(view.snapshot.names(), vec!["seed.txt"]);
    assert_eq!(cache.load_all().unwrap().len(), 1);
    assert!(sync.endpoint().reachable);
    sync.shutdown().await;
}

#[tokio::test]
async fn mutations_refresh_immediately() {
    let (_dir, url) = start_server().await;
    let cache = FallbackCache::in_memory();
    let mut sync = orchestrator(&url, cache.clone(), Duration::from_secs(60));
    sync.start().await;

    sync.upload("report.pdf", vec![0u8; 2048]).await.unwrap();
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.get("report.pdf").map(|f| f.size), Some(2048));
    assert_eq!(sync.state(), ServerState::Online);

    sync.delete("report.pdf").await.unwrap();
    assert!(sync.snapshot().is_empty());
    assert!(cache.load_all().unwrap().is_empty());
    sync.shutdown().await;
}

#[tokio::test]
async fn failed_delete_goes_offline_and_keeps_list() {
    let (_dir, url) = start_server().await;
    let mut sync = orchestrator(&url, FallbackCache::in_memory(), Duration::from_secs(60));
    sync.start().await;
    sync.upload("keep.txt", b"x".to_vec()).await.unwrap();
    let before = sync.snapshot();

    let err = sync.delete("missing.txt").await.unwrap_err();
    assert_eq!(err.status(), Some(http::StatusCode::NOT_FOUND));
    assert_eq!(sync.snapshot(), before);
    assert_eq!(sync.view().source, SnapshotSource::Live);
    assert_eq!(sync.state(), ServerState::Offline);
    assert!(!sync.endpoint().reachable);

    // The next successful refresh brings the server back online.
    assert_eq!(sync.refresh().await, ServerState::Online);
    assert_eq!(sync.snapshot(), before);
    sync.shutdown().await;
}

#[tokio::test]
async fn list_failure_keeps_previous_snapshot() {
    let failing = Arc::new(AtomicBool::new(false));
    let url = flaky_server(failing.clone());
    let mut sync = orchestrator(&url, FallbackCache::in_memory(), Duration::from_secs(60));

    assert_eq!(sync.start().await, ServerState::Online);
    assert_eq!(sync.snapshot().names(), vec!["a.txt", "b.txt"]);

    failing.store(true, Ordering::SeqCst);
    assert_eq!(sync.refresh().await, ServerState::Offline);
    let view = sync.view();
    assert_eq!(view.state, ServerState::Offline);
    assert_eq!(view.source, SnapshotSource::Live);
    assert_eq!(view.snapshot.names(), vec!["a.txt", "b.txt"]);
    assert!(!sync.endpoint().reachable);
    sync.shutdown().await;
}

#[tokio::test]
async fn failing_list_without_snapshot_uses_cache() {
    let failing = Arc::new(AtomicBool::new(true));
    let url = flaky_server(failing);
    let cache = FallbackCache::in_memory();
    let cached = vec![
        FileRecord {
            name: "one.txt".into(),
            size: 1,
            upload_date: "2024-01-01T00:00:00Z".into(),
        },
        FileRecord {
            name: "two.txt".into(),
            size: 2,
            upload_date: "2024-01-02T00:00:00Z".into(),
        },
    ];
    cache.replace_all(&cached).unwrap();

    let sync = orchestrator(&url, cache.clone(), Duration::from_secs(60));
    assert_eq!(sync.refresh().await, ServerState::Offline);

    let view = sync.view();
    assert_eq!(view.source, SnapshotSource::Cache);
    assert_eq!(view.snapshot.to_records(), cached);
    assert_eq!(cache.load_all().unwrap(), cached);
}

#[tokio::test]
async fn timer_picks_up_outside_changes() {
    let (_dir, url) = start_server().await;
    let mut sync = orchestrator(&url, FallbackCache::in_memory(), Duration::from_millis(100));
    let mut views = sync.subscribe();
    sync.start().await;
    assert!(sync.snapshot().is_empty());

    FileClient::new(url.clone())
        .unwrap()
        .upload("late.txt", b"late".to_vec())
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            views.changed().await.unwrap();
            if views.borrow().snapshot.contains("late.txt") {
                break;
            }
        }
    })
    .await;
    assert!(seen.is_ok(), "periodic refresh never saw late.txt");
    sync.shutdown().await;
}

#[tokio::test]
async fn timer_recovers_from_offline() {
    let failing = Arc::new(AtomicBool::new(true));
    let url = flaky_server(failing.clone());
    let mut sync = orchestrator(&url, FallbackCache::in_memory(), Duration::from_millis(100));

    // The probe hits the failing listing, so the server looks down.
    assert_eq!(sync.start().await, ServerState::Offline);

    failing.store(false, Ordering::SeqCst);
    let mut views = sync.subscribe();
    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        while views.borrow_and_update().state != ServerState::Online {
            views.changed().await.unwrap();
        }
    })
    .await;
    assert!(recovered.is_ok(), "orchestrator stayed offline");
    assert_eq!(sync.snapshot().len(), 2);

    sync.shutdown().await;
    assert!(!sync.is_running());
}
