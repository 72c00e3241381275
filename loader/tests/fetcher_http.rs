//! Fetcher behaviours the file:// scheme cannot express: retry on 5xx/429,
//! no retry on 404, no retry on integrity failures.

use std::time::Duration;

use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hoard_loader::{Expected, FetchConfig, FetchError, Fetcher};

fn quick_config() -> FetchConfig {
    FetchConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        request_timeout: Duration::from_secs(5),
    }
}

async fn fetcher() -> (tempfile::TempDir, Fetcher) {
    let scratch = tempfile::tempdir().unwrap();
    let fetcher = Fetcher::new(scratch.path(), quick_config());
    (scratch, fetcher)
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let (_scratch, fetcher) = fetcher().await;
    let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
    let local = fetcher.fetch(&url, &Expected::default()).await.unwrap();
    assert_eq!(std::fs::read(local).unwrap(), b"payload");
}

#[tokio::test]
async fn too_many_requests_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;

    let (_scratch, fetcher) = fetcher().await;
    let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
    assert!(fetcher.fetch(&url, &Expected::default()).await.is_ok());
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (_scratch, fetcher) = fetcher().await;
    let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
    assert!(matches!(
        fetcher.fetch(&url, &Expected::default()).await,
        Err(FetchError::NotFound(_))
    ));
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let (_scratch, fetcher) = fetcher().await;
    let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
    match fetcher.fetch(&url, &Expected::default()).await {
        Err(FetchError::Status { status, .. }) => assert_eq!(status.as_u16(), 503),
        other => panic!("expected a status error, got {:?}", other),
    }
}

#[tokio::test]
async fn integrity_failures_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"unexpected".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let (_scratch, fetcher) = fetcher().await;
    let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
    let mut expected = Expected::default();
    expected.checksums.insert("sha256".into(), "ab".repeat(32));
    assert!(matches!(
        fetcher.fetch(&url, &expected).await,
        Err(FetchError::ChecksumMismatch { .. })
    ));
}
