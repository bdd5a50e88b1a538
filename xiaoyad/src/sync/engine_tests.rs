use super::*;
use crate::sync::index::INDEX_FILE_NAME;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xiaoya_core::mirror::PROBE_MARKER;
use xiaoya_core::{MirrorSelector, RetryPolicy};

const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
const LAST_MODIFIED_SECS: i64 = 1_445_412_480;

fn anchors(links: &[&str]) -> String {
    links
        .iter()
        .map(|link| format!(r#"<a href="{link}">{link}</a>"#))
        .collect()
}

async fn mount_listing(server: &MockServer, dir: &str, links: &[&str]) {
    Mock::given(method("GET"))
        .and(path(dir))
        .respond_with(ResponseTemplate::new(200).set_body_raw(anchors(links), "text/html"))
        .mount(server)
        .await;
}

async fn mount_file(server: &MockServer, file: &str, body: &str, etag: &str) {
    Mock::given(method("GET"))
        .and(path(file))
        .respond_with(file_response(body, etag))
        .mount(server)
        .await;
}

fn file_response(body: &str, etag: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_raw(body.as_bytes().to_vec(), "application/octet-stream")
        .insert_header("etag", etag)
        .insert_header("last-modified", LAST_MODIFIED)
}

/// `/` lists `movies/`, `other/` and `readme.nfo`; only `movies` is selected.
async fn standard_tree(server: &MockServer) {
    let root = format!(
        "<p>{PROBE_MARKER}</p>{}",
        anchors(&["movies/", "other/", "readme.nfo"])
    );
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(root, "text/html"))
        .mount(server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
        .mount(server)
        .await;
    mount_listing(server, "/movies/", &["A.nfo", "sub/"]).await;
    mount_listing(server, "/movies/sub/", &["B.nfo"]).await;
    mount_listing(server, "/other/", &["deep/"]).await;
    Mock::given(method("GET"))
        .and(path("/other/deep/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/html"))
        .expect(0)
        .mount(server)
        .await;
    mount_file(server, "/readme.nfo", "readme", "\"r1\"").await;
    mount_file(server, "/movies/sub/B.nfo", "bbb", "\"b1\"").await;
}

async fn engine_for(server: &MockServer, download_dir: &Path) -> DownloadEngine {
    engine_for_mirrors(&[server], download_dir).await
}

async fn engine_for_mirrors(servers: &[&MockServer], download_dir: &Path) -> DownloadEngine {
    let selector = MirrorSelector::new(servers.iter().map(|server| server.uri())).unwrap();
    selector.validate().await.unwrap();
    let crawler = MirrorCrawler::new(Arc::new(selector))
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate());
    let index = IndexStore::open(&download_dir.join(INDEX_FILE_NAME))
        .await
        .unwrap();
    DownloadEngine::new(crawler, index, download_dir)
        .with_selected_paths(["/movies/anything"])
        .with_workers(2)
}

#[tokio::test]
async fn downloads_selected_tree_and_records_index() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "aaaa", "\"a1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.files, 3);
    assert_eq!(summary.written, 3);
    assert_eq!(std::fs::read(dir.path().join("movies/A.nfo")).unwrap(), b"aaaa");
    assert_eq!(std::fs::read(dir.path().join("movies/sub/B.nfo")).unwrap(), b"bbb");
    assert_eq!(std::fs::read(dir.path().join("readme.nfo")).unwrap(), b"readme");
    assert!(!dir.path().join("other").exists());

    let record = engine.index().get("/movies/A.nfo").await.unwrap().unwrap();
    assert_eq!(record.size, 4);
    assert_eq!(record.etag, "\"a1\"");
    assert_eq!(record.modified, LAST_MODIFIED_SECS);
    assert_eq!(engine.local_files().await.unwrap().len(), 3);
}

#[tokio::test]
async fn second_run_over_unchanged_remote_writes_nothing() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "aaaa", "\"a1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    engine.sync().await.unwrap();
    let before = engine.local_files().await.unwrap();
    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.written, 0);
    assert_eq!(engine.local_files().await.unwrap(), before);
}

#[tokio::test]
async fn older_remote_does_not_overwrite_cache() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "remote", "\"B\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let existing = FileRecord::file("/movies/A.nfo", 10, LAST_MODIFIED_SECS + 3600, "A");
    engine.index().upsert(&existing).await.unwrap();
    std::fs::create_dir_all(dir.path().join("movies")).unwrap();
    std::fs::write(dir.path().join("movies/A.nfo"), b"local").unwrap();

    engine.sync().await.unwrap();

    assert_eq!(std::fs::read(dir.path().join("movies/A.nfo")).unwrap(), b"local");
    assert_eq!(
        engine.index().get("/movies/A.nfo").await.unwrap().unwrap(),
        existing
    );
}

#[tokio::test]
async fn missing_cached_file_is_downloaded_again() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "aaaa", "\"a1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let same = FileRecord::file("/movies/A.nfo", 4, LAST_MODIFIED_SECS, "\"a1\"");
    engine.index().upsert(&same).await.unwrap();

    engine.sync().await.unwrap();

    assert_eq!(std::fs::read(dir.path().join("movies/A.nfo")).unwrap(), b"aaaa");
}

#[tokio::test]
async fn transient_failure_recovers_in_retry_round() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies/A.nfo"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "aaaa", "\"a1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.retry_rounds, 1);
    assert_eq!(summary.written, 3);
    assert!(dir.path().join("movies/A.nfo").exists());
}

#[tokio::test]
async fn persistent_failure_exhausts_retry_rounds() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    Mock::given(method("GET"))
        .and(path("/movies/A.nfo"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let err = engine.sync().await.unwrap_err();

    assert!(matches!(err, DownloadError::RetriesExhausted { failed: 1 }));
    assert!(err.to_string().starts_with("maximum retry attempts exceeded"));
    assert!(engine.index().get("/movies/A.nfo").await.unwrap().is_none());
}

#[tokio::test]
async fn html_in_place_of_a_file_is_ignored() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    Mock::given(method("GET"))
        .and(path("/movies/A.nfo"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.written, 2);
    assert!(!dir.path().join("movies/A.nfo").exists());
}

#[tokio::test]
async fn failed_listing_aborts_sync() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies/"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    standard_tree(&server).await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let err = engine.sync().await.unwrap_err();
    assert!(matches!(err, DownloadError::Walk { ref path, .. } if path == "/movies"));
}

#[tokio::test]
async fn purge_drops_files_never_seen_remotely() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "aaaa", "\"a1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await.with_purge(true));

    let stale = FileRecord::file("/movies/gone/old.nfo", 3, 1, "");
    engine.index().upsert(&stale).await.unwrap();
    std::fs::create_dir_all(dir.path().join("movies/gone")).unwrap();
    std::fs::write(dir.path().join("movies/gone/old.nfo"), b"old").unwrap();

    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.purged, 1);
    assert!(!dir.path().join("movies/gone").exists());
    assert!(dir.path().join("movies/A.nfo").exists());
    assert!(engine.index().get("/movies/gone/old.nfo").await.unwrap().is_none());
}

async fn seed_cached(engine: &DownloadEngine, dir: &Path, remote: &str) {
    let local = dir.join(remote.trim_start_matches('/'));
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"old").unwrap();
    engine
        .index()
        .upsert(&FileRecord::file(remote, 3, 1, ""))
        .await
        .unwrap();
}

#[tokio::test]
async fn purge_spares_empty_listings_and_unselected_roots() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies/sub/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/plain"))
        .mount(&server)
        .await;
    standard_tree(&server).await;
    mount_file(&server, "/movies/A.nfo", "aaaa", "\"a1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await.with_purge(true));
    for remote in ["/movies/sub/B.nfo", "/other/keep.nfo"] {
        seed_cached(&engine, dir.path(), remote).await;
    }

    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.purged, 0);
    for remote in ["/movies/sub/B.nfo", "/other/keep.nfo"] {
        assert!(engine.index().get(remote).await.unwrap().is_some(), "{remote}");
        assert!(dir.path().join(remote.trim_start_matches('/')).exists(), "{remote}");
    }
}

#[tokio::test]
async fn download_falls_back_to_next_ranked_mirror() {
    let primary = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies/A.nfo"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&primary)
        .await;
    standard_tree(&primary).await;
    let secondary = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(format!("<p>{PROBE_MARKER}</p>"), "text/html")
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&secondary)
        .await;
    mount_file(&secondary, "/movies/A.nfo", "from secondary", "\"s1\"").await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for_mirrors(&[&secondary, &primary], dir.path()).await);
    assert_eq!(
        engine.crawler.mirrors().active()[0].as_str(),
        format!("{}/", primary.uri())
    );

    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.retry_rounds, 0);
    assert_eq!(summary.written, 3);
    assert_eq!(
        std::fs::read(dir.path().join("movies/A.nfo")).unwrap(),
        b"from secondary"
    );
    let record = engine.index().get("/movies/A.nfo").await.unwrap().unwrap();
    assert_eq!(record.etag, "\"s1\"");
}

#[tokio::test]
async fn downloads_never_exceed_the_worker_count() {
    let server = MockServer::start().await;
    let root = format!("<p>{PROBE_MARKER}</p>{}", anchors(&["movies/"]));
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(root, "text/html"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
        .mount(&server)
        .await;
    let files = ["a.nfo", "b.nfo", "c.nfo", "d.nfo"];
    mount_listing(&server, "/movies/", &files).await;
    for file in files {
        Mock::given(method("GET"))
            .and(path(format!("/movies/{file}")))
            .respond_with(file_response(file, "\"v\"").set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;
    }
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let started = Instant::now();
    let summary = engine.sync().await.unwrap();

    assert_eq!(summary.written, 4);
    // Four 200ms downloads over two workers take at least two rounds.
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn worker_count_is_clamped() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    let dir = tempdir().unwrap();
    let engine = engine_for(&server, dir.path()).await;

    assert_eq!(engine.with_workers(64).workers, MAX_WORKERS);
    let engine = engine_for(&server, dir.path()).await;
    assert_eq!(engine.with_workers(0).workers, 1);
}

#[tokio::test]
async fn slow_download_holds_no_index_connection() {
    let server = MockServer::start().await;
    standard_tree(&server).await;
    Mock::given(method("GET"))
        .and(path("/movies/A.nfo"))
        .respond_with(file_response("aaaa", "\"a1\"").set_delay(Duration::from_secs(1)))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_for(&server, dir.path()).await);

    let running = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.sync().await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.index().connections_in_use(), 0);

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.written, 3);
}

#[test]
fn selected_roots_keep_first_segment_only() {
    let roots = selected_roots(["/电影/华语", "动漫", "/"]);
    assert_eq!(roots.len(), 2);
    assert!(roots.contains("电影"));
    assert!(roots.contains("动漫"));
}

#[test]
fn default_workers_is_bounded() {
    let workers = default_workers();
    assert!((1..=MAX_WORKERS).contains(&workers));
}
