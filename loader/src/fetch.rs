use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use data_encoding::HEXLOWER;
use futures::TryStreamExt;
use md5::Md5;
use rand::Rng;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use url::Url;

use crate::errors::FetchError;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per artifact, first try included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Wall-clock budget for a single request, download included.
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(120),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// What the registry index declared about an artifact, to be verified
/// against the downloaded bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expected {
    /// Digest algorithm name (lowercase) to lowercase hex digest.
    pub checksums: BTreeMap<String, String>,
    pub length: Option<u64>,
}

impl Expected {
    fn fingerprint(&self) -> String {
        let mut out = String::new();
        for (algo, hex) in &self.checksums {
            out.push_str(algo);
            out.push(':');
            out.push_str(hex);
            out.push(';');
        }
        if let Some(length) = self.length {
            out.push_str(&length.to_string());
        }
        out
    }
}

/// Downloads artifacts into the visit's scratch directory.
///
/// Supports http(s) and, like its file-based siblings, file:// urls (which is
/// also what the test suite feeds it). Every successful download is memoised
/// per url+expectation for the lifetime of the visit, so prefetching and
/// re-processing the same artifact never hits the network twice.
pub struct Fetcher {
    http_client: reqwest::Client,
    scratch: PathBuf,
    config: FetchConfig,
    cache: Mutex<HashMap<String, PathBuf>>,
    sequence: AtomicU64,
}

impl Fetcher {
    pub fn new(scratch: impl Into<PathBuf>, config: FetchConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            scratch: scratch.into(),
            config,
            cache: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    /// Fetches `url`, verifies it against `expected`, and returns the local
    /// path of the downloaded file.
    ///
    /// Transient failures are retried with exponential backoff and full
    /// jitter; 404s and integrity failures surface immediately.
    #[instrument(skip_all, fields(url = %url), err)]
    pub async fn fetch(&self, url: &Url, expected: &Expected) -> Result<PathBuf, FetchError> {
        let key = format!("{}\0{}", url, expected.fingerprint());
        if let Some(path) = self.cache.lock().await.get(&key) {
            return Ok(path.clone());
        }

        let mut attempt = 0;
        let path = loop {
            match self.fetch_once(url, expected).await {
                Ok(path) => break path,
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    attempt += 1;
                    let delay = backoff_delay(
                        attempt,
                        self.config.backoff_base,
                        self.config.backoff_cap,
                    );
                    warn!(attempt, delay_ms = delay.as_millis() as u64, %e, "retrying fetch");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.cache.lock().await.insert(key, path.clone());
        Ok(path)
    }

    async fn fetch_once(&self, url: &Url, expected: &Expected) -> Result<PathBuf, FetchError> {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut basename = url_basename(url);
        if basename.is_empty() {
            basename = "download";
        }
        let dest = self.scratch.join(format!("{:06}-{}", n, basename));

        let observed =
            match tokio::time::timeout(self.config.request_timeout, self.download(url, &dest))
                .await
            {
                Err(_) => return Err(FetchError::Timeout(url.clone())),
                Ok(result) => result?,
            };

        verify(url, expected, &observed)?;
        Ok(dest)
    }

    /// Streams the body to `dest` while hashing it.
    async fn download(&self, url: &Url, dest: &Path) -> Result<Observed, FetchError> {
        let reader: Box<dyn AsyncRead + Unpin + Send> = match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    FetchError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "invalid host for file:// scheme",
                    ))
                })?;
                match tokio::fs::File::open(&path).await {
                    Ok(f) => Box::new(f),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(FetchError::NotFound(url.clone()))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ => {
                let resp = self
                    .http_client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| FetchError::Transport {
                        url: url.clone(),
                        source: e,
                    })?;
                let status = resp.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(FetchError::NotFound(url.clone()));
                }
                if !status.is_success() {
                    return Err(FetchError::Status {
                        url: url.clone(),
                        status,
                    });
                }
                Box::new(tokio_util::io::StreamReader::new(
                    resp.bytes_stream().map_err(|e| {
                        let e = e.without_url();
                        warn!(%e, "failed to read response body");
                        std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)
                    }),
                ))
            }
        };

        let mut file = tokio::fs::File::create(dest).await?;
        let mut digests = DigestSink::default();
        let length = {
            let mut hashing =
                tokio_util::io::InspectReader::new(reader, |d| digests.update(d));
            tokio::io::copy(&mut hashing, &mut file).await?
        };
        file.flush().await?;
        Ok(digests.finalize(length))
    }
}

/// All digest algorithms a registry may declare, computed in one pass.
#[derive(Default)]
struct DigestSink {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
}

impl DigestSink {
    fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha512.update(data);
    }

    fn finalize(self, length: u64) -> Observed {
        let mut digests = BTreeMap::new();
        digests.insert("md5", HEXLOWER.encode(&self.md5.finalize()));
        digests.insert("sha1", HEXLOWER.encode(&self.sha1.finalize()));
        digests.insert("sha256", HEXLOWER.encode(&self.sha256.finalize()));
        digests.insert("sha512", HEXLOWER.encode(&self.sha512.finalize()));
        Observed { length, digests }
    }
}

struct Observed {
    length: u64,
    digests: BTreeMap<&'static str, String>,
}

fn verify(url: &Url, expected: &Expected, observed: &Observed) -> Result<(), FetchError> {
    if let Some(expected_length) = expected.length {
        if expected_length != observed.length {
            return Err(FetchError::LengthMismatch {
                url: url.clone(),
                expected: expected_length,
                actual: observed.length,
            });
        }
    }
    for (algo, expected_hex) in &expected.checksums {
        match observed.digests.get(algo.as_str()) {
            Some(actual_hex) => {
                if !actual_hex.eq_ignore_ascii_case(expected_hex) {
                    return Err(FetchError::ChecksumMismatch {
                        url: url.clone(),
                        algo: algo.clone(),
                        expected: expected_hex.to_ascii_lowercase(),
                        actual: actual_hex.clone(),
                    });
                }
            }
            None => warn!(algo, "declared digest algorithm not supported, skipping"),
        }
    }
    Ok(())
}

/// Exponential backoff with full jitter: a uniform draw from zero up to
/// `base * 2^(attempt-1)`, capped.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let ceiling = base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(cap);
    if ceiling.is_zero() {
        return ceiling;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
}

pub(crate) fn url_basename(url: &Url) -> &str {
    url.path()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn file_url(path: &Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    fn scratch_fetcher(scratch: &Path) -> Fetcher {
        let config = FetchConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            ..Default::default()
        };
        Fetcher::new(scratch, config)
    }

    #[tokio::test]
    async fn fetch_verifies_declared_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("artifact.bin");
        std::fs::write(&source, b"hello world\n").unwrap();

        let fetcher = scratch_fetcher(dir.path());
        let mut expected = Expected {
            length: Some(12),
            ..Default::default()
        };
        expected.checksums.insert(
            "sha256".into(),
            // sha256 of "hello world\n"
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447".into(),
        );

        let path = fetcher.fetch(&file_url(&source), &expected).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello world\n");
    }

    #[tokio::test]
    async fn fetch_reports_checksum_mismatch_with_both_digests() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("artifact.bin");
        std::fs::write(&source, b"hello world\n").unwrap();

        let fetcher = scratch_fetcher(dir.path());
        let mut expected = Expected::default();
        expected
            .checksums
            .insert("sha256".into(), "00".repeat(32));

        match fetcher.fetch(&file_url(&source), &expected).await {
            Err(FetchError::ChecksumMismatch {
                algo,
                expected,
                actual,
                ..
            }) => {
                assert_eq!(algo, "sha256");
                assert_eq!(expected, "00".repeat(32));
                assert_eq!(
                    actual,
                    "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
                );
            }
            other => panic!("expected checksum mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn fetch_reports_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("artifact.bin");
        std::fs::write(&source, b"short").unwrap();

        let fetcher = scratch_fetcher(dir.path());
        let expected = Expected {
            length: Some(9999),
            ..Default::default()
        };
        assert!(matches!(
            fetcher.fetch(&file_url(&source), &expected).await,
            Err(FetchError::LengthMismatch {
                expected: 9999,
                actual: 5,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = scratch_fetcher(dir.path());
        let url = file_url(&dir.path().join("nope.tar.gz"));
        assert!(matches!(
            fetcher.fetch(&url, &Expected::default()).await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn successful_fetches_are_memoised_per_visit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("artifact.bin");
        std::fs::write(&source, b"cache me").unwrap();

        let fetcher = scratch_fetcher(dir.path());
        let url = file_url(&source);
        let first = fetcher.fetch(&url, &Expected::default()).await.unwrap();

        // Even with the upstream file gone, the cached copy answers.
        std::fs::remove_file(&source).unwrap();
        let second = fetcher.fetch(&url, &Expected::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(second).unwrap(), b"cache me");
    }

    #[rstest]
    #[case::plain("https://host/dir/pkg-1.0.tar.gz", "pkg-1.0.tar.gz")]
    #[case::trailing_slash("https://host/dir/", "dir")]
    #[case::root("https://host/", "")]
    fn basenames(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(url_basename(&Url::parse(url).unwrap()), expected);
    }

    #[test]
    fn backoff_respects_cap() {
        for attempt in 1..10 {
            let d = backoff_delay(attempt, Duration::from_secs(10), Duration::from_secs(120));
            assert!(d <= Duration::from_secs(120));
        }
    }
}
