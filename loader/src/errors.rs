use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::unpack::ArchiveKind;

/// Errors surfaced by the artifact fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Upstream 404 (or a missing file behind a file:// url). Never retried.
    #[error("{0} not found upstream")]
    NotFound(Url),

    /// A declared digest did not match the downloaded bytes. Never retried.
    #[error("checksum mismatch on {url} ({algo}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: Url,
        algo: String,
        expected: String,
        actual: String,
    },

    /// A declared length did not match the downloaded bytes. Never retried.
    #[error("length mismatch on {url}: expected {expected}, got {actual}")]
    LengthMismatch {
        url: Url,
        expected: u64,
        actual: u64,
    },

    /// Upstream answered with a non-2xx status other than 404.
    #[error("fetching {url}: upstream returned {status}")]
    Status {
        url: Url,
        status: reqwest::StatusCode,
    },

    /// Connection-level failure (DNS, reset, protocol).
    #[error("fetching {url}: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("request for {0} timed out")]
    Timeout(Url),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt may succeed. Integrity failures and 404s are
    /// final; transport errors, timeouts and other upstream statuses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { .. } | FetchError::Transport { .. } | FetchError::Timeout(_) => {
                true
            }
            FetchError::NotFound(_)
            | FetchError::ChecksumMismatch { .. }
            | FetchError::LengthMismatch { .. }
            | FetchError::Io(_) => false,
        }
    }
}

/// Errors surfaced by the unpacker.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Entry path or symlink target would land outside the extraction root.
    #[error("unsafe entry {path:?} in archive")]
    UnsafeArchive { path: PathBuf },

    /// Recognised container whose payload decoding is not built in
    /// (deb/rpm payloads need the external toolchain).
    #[error("no built-in decoder for {0:?} archives")]
    UnsupportedKind(ArchiveKind),

    #[error("cannot infer archive kind of {0:?}")]
    UnknownKind(PathBuf),

    #[error("decoding archive: {0}")]
    Decode(#[from] std::io::Error),
}

/// Errors raised by per-registry adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The origin itself is absent upstream (index endpoint 404).
    #[error("origin not found upstream")]
    NotFound,

    #[error("fetching registry metadata: {0}")]
    Fetch(FetchError),

    /// The registry answered with something unparseable.
    #[error("malformed registry metadata: {0}")]
    Metadata(String),

    /// The adapter contradicted itself (duplicate branches, version
    /// mismatches between index and artifact).
    #[error("inconsistent adapter data: {0}")]
    Inconsistent(String),
}

impl From<FetchError> for AdapterError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound(_) => AdapterError::NotFound,
            other => AdapterError::Fetch(other),
        }
    }
}
