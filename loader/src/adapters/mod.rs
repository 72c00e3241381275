//! Per-registry adapters.
//!
//! Every package manager plugs into the orchestrator through
//! [`PackageAdapter`]: enumerate versions, describe the artifacts behind
//! each, and wrap an ingested directory into a synthetic release. Adapters
//! stay thin; everything artifact-shaped (fetching, unpacking, hashing) is
//! the orchestrator's business.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use hoard_model::{ObjectId, Person, Release, VisitType};

use crate::errors::AdapterError;
use crate::fetch::{url_basename, Expected, Fetcher};

mod aur;
mod cpan;
mod crates;
mod npm;
mod pubdev;

pub use aur::{AurAdapter, AurArtifact};
pub use cpan::CpanAdapter;
pub use crates::{CrateArtifact, CratesAdapter};
pub use npm::NpmAdapter;
pub use pubdev::PubDevAdapter;

/// Stable external fingerprint claimed for one artifact, matched against
/// stored ExtID records to recognise work already done in earlier visits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtIdClaim {
    pub extid_type: String,
    pub extid_version: u32,
    pub extid: Bytes,
}

impl ExtIdClaim {
    /// Claim built from a registry-declared checksum (lowercase hex).
    pub fn from_checksum(extid_type: &str, hex: &str) -> Option<Self> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .ok()?;
        Some(Self {
            extid_type: extid_type.to_string(),
            extid_version: 0,
            extid: bytes.into(),
        })
    }

    /// Claim derived from a rendered manifest, for registries that declare
    /// no usable checksum.
    pub fn from_manifest(extid_type: &str, manifest: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(manifest.as_bytes()).into();
        Self {
            extid_type: extid_type.to_string(),
            extid_version: 0,
            extid: Bytes::copy_from_slice(&digest),
        }
    }

    pub(crate) fn key(&self) -> (String, Bytes) {
        (self.extid_type.clone(), self.extid.clone())
    }
}

/// Everything the orchestrator needs to materialise one artifact of one
/// version.
#[derive(Clone, Debug)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub url: Url,
    pub filename: Option<String>,
    /// Digest algorithm name to lowercase hex, as declared by the registry.
    pub checksums: BTreeMap<String, String>,
    pub length: Option<u64>,
    /// Extrinsic author, when the index names one.
    pub author: Option<Person>,
    /// Extrinsic timestamp, when the index provides one. Never defaulted.
    pub date: Option<DateTime<FixedOffset>>,
    pub extid: Option<ExtIdClaim>,
}

impl PackageInfo {
    /// The filename used for archive-kind inference: declared, or derived
    /// from the url.
    pub fn archive_filename(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| url_basename(&self.url).to_string())
    }

    pub(crate) fn expected(&self) -> Expected {
        Expected {
            checksums: self.checksums.clone(),
            length: self.length,
        }
    }
}

/// The capability set every package-manager-specific loader implements.
#[async_trait]
pub trait PackageAdapter: Send + Sync {
    fn visit_type(&self) -> VisitType;

    /// All published versions, in an adapter-defined order that is stable
    /// between visits.
    async fn get_versions(&self, fetcher: &Fetcher) -> Result<Vec<String>, AdapterError>;

    /// The version `HEAD` should alias, if the registry has such a notion.
    async fn get_default_version(
        &self,
        fetcher: &Fetcher,
    ) -> Result<Option<String>, AdapterError>;

    /// The `(branch name, package info)` pairs for one version. A version
    /// may yield several branches (one per artifact).
    async fn get_package_info(
        &self,
        fetcher: &Fetcher,
        version: &str,
    ) -> Result<Vec<(String, PackageInfo)>, AdapterError>;

    /// Wraps an ingested directory into a release. `None` drops the branch
    /// without counting it as a failure.
    async fn build_release(
        &self,
        info: &PackageInfo,
        unpacked: &Path,
        directory: ObjectId,
    ) -> Result<Option<Release>, AdapterError>;

    /// Whether branches whose ExtID is already stored are carried forward
    /// from the previous snapshot instead of being re-ingested.
    fn reuse_known_artifacts(&self) -> bool {
        true
    }

    /// Whether a version's artifacts may be downloaded concurrently (bounded
    /// by the loader's configured concurrency). Processing stays sequential
    /// either way, so staging order is unaffected.
    fn parallel_fetch(&self) -> bool {
        true
    }
}

/// `releases/<version>`, the shared branch naming convention.
pub fn release_branch(version: &str) -> String {
    format!("releases/{}", version)
}

/// `releases/<version>/<filename>`, for versions yielding several artifacts.
pub fn release_branch_for_file(version: &str, filename: &str) -> String {
    format!("releases/{}/{}", version, filename)
}

/// The standard synthetic release message.
pub fn standard_message(registry: &str, name: &str, version: &str) -> String {
    format!(
        "Synthetic release for {} source package {} version {}\n",
        registry, name, version
    )
}

/// Standard message plus a short description paragraph.
pub fn message_with_description(
    registry: &str,
    name: &str,
    version: &str,
    description: &str,
) -> String {
    format!(
        "Synthetic release for {} source package {} version {}\n\n{}\n",
        registry, name, version, description
    )
}

/// Orders version strings: semver where both sides parse, lexicographic
/// otherwise. Registries with richer rules (debian epochs, opam) bring
/// their own comparator instead.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (
        semver::Version::parse(a).ok(),
        semver::Version::parse(b).ok(),
    ) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Reads a person out of the JSON shapes registries use: either a plain
/// `"Jane <jane@example.com>"` string or a `{name, email}` object.
pub(crate) fn person_from_json(value: &Value) -> Option<Person> {
    match value {
        Value::String(s) if !s.is_empty() => Some(Person::from_fullname(s.clone())),
        Value::Object(map) => {
            let name = map.get("name").and_then(Value::as_str)?;
            let fullname = match map.get("email").and_then(Value::as_str) {
                Some(email) => format!("{} <{}>", name, email),
                None => name.to_string(),
            };
            Some(Person::from_fullname(fullname))
        }
        _ => None,
    }
}

/// Fetches and parses a JSON document (the registry index). A 404 on the
/// index means the origin itself is gone.
pub(crate) async fn fetch_json(fetcher: &Fetcher, url: &Url) -> Result<Value, AdapterError> {
    let path = fetcher.fetch(url, &Expected::default()).await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| AdapterError::Metadata(format!("reading {:?}: {}", path, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AdapterError::Metadata(format!("parsing {}: {}", url, e)))
}

/// Finds the directory holding a marker file: the unpack root itself, or
/// the single top-level directory most tarballs wrap their tree in.
pub(crate) fn project_root(unpacked: &Path, marker: &str) -> Option<PathBuf> {
    if unpacked.join(marker).exists() {
        return Some(unpacked.to_path_buf());
    }
    let mut dirs = std::fs::read_dir(unpacked)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir());
    let candidate = dirs.next()?;
    if dirs.next().is_none() && candidate.join(marker).exists() {
        Some(candidate)
    } else {
        None
    }
}

/// Parses the RFC 3339 timestamps registries put in their indexes.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}
