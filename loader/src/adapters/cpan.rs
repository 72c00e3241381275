use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

use hoard_model::{ObjectId, Person, Release, VisitType};

use crate::adapters::{
    compare_versions, fetch_json, message_with_description, release_branch, standard_message,
    ExtIdClaim, PackageAdapter, PackageInfo,
};
use crate::errors::AdapterError;
use crate::fetch::{url_basename, Fetcher};

const METACPAN_API: &str = "https://fastapi.metacpan.org/v1/release/versions";

/// Loader for CPAN distributions, fed by the metacpan release-versions
/// endpoint. Author and version of the release come from the intrinsic
/// META.json/META.yml; the date comes from the registry index.
pub struct CpanAdapter {
    name: String,
    index_url: Url,
    index: OnceCell<HashMap<String, CpanRelease>>,
}

#[derive(Deserialize, Clone)]
struct CpanRelease {
    version: String,
    download_url: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    author: Option<String>,
}

#[derive(Deserialize)]
struct RawIndex {
    #[serde(default)]
    releases: Vec<CpanRelease>,
}

impl CpanAdapter {
    pub fn new(origin: &Url) -> Result<Self, AdapterError> {
        let name = url_basename(origin).to_string();
        if name.is_empty() {
            return Err(AdapterError::Metadata(format!(
                "cannot derive a distribution name from {}",
                origin
            )));
        }
        let index_url = Url::parse(&format!("{}/{}", METACPAN_API, name))
            .map_err(|e| AdapterError::Metadata(e.to_string()))?;
        Ok(Self::with_index_url(name, index_url))
    }

    /// Constructor taking the index endpoint directly; used by deployments
    /// with a metacpan mirror and by the test suite.
    pub fn with_index_url(name: String, index_url: Url) -> Self {
        Self {
            name,
            index_url,
            index: OnceCell::new(),
        }
    }

    async fn index(
        &self,
        fetcher: &Fetcher,
    ) -> Result<&HashMap<String, CpanRelease>, AdapterError> {
        self.index
            .get_or_try_init(|| async {
                let raw = fetch_json(fetcher, &self.index_url).await?;
                let raw: RawIndex = serde_json::from_value(raw)
                    .map_err(|e| AdapterError::Metadata(format!("cpan index: {}", e)))?;
                Ok(raw
                    .releases
                    .into_iter()
                    .map(|r| (r.version.clone(), r))
                    .collect())
            })
            .await
    }
}

/// metacpan timestamps come without an explicit offset; UTC is documented.
fn parse_cpan_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

/// `META.yml` supersedes `META.json` when a distribution ships both, which
/// mirrors the read order of the original importer.
fn find_meta(unpacked: &Path) -> Option<(PathBuf, bool)> {
    for (marker, is_yaml) in [("META.yml", true), ("META.json", false)] {
        if let Some(root) = super::project_root(unpacked, marker) {
            return Some((root.join(marker), is_yaml));
        }
    }
    None
}

#[async_trait]
impl PackageAdapter for CpanAdapter {
    fn visit_type(&self) -> VisitType {
        VisitType::Cpan
    }

    async fn get_versions(&self, fetcher: &Fetcher) -> Result<Vec<String>, AdapterError> {
        let index = self.index(fetcher).await?;
        let mut versions: Vec<String> = index.keys().cloned().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }

    async fn get_default_version(
        &self,
        fetcher: &Fetcher,
    ) -> Result<Option<String>, AdapterError> {
        Ok(self.get_versions(fetcher).await?.pop())
    }

    async fn get_package_info(
        &self,
        fetcher: &Fetcher,
        version: &str,
    ) -> Result<Vec<(String, PackageInfo)>, AdapterError> {
        let index = self.index(fetcher).await?;
        let release = index.get(version).ok_or_else(|| {
            AdapterError::Inconsistent(format!("version {} missing from cpan index", version))
        })?;

        let url = Url::parse(&release.download_url)
            .map_err(|e| AdapterError::Metadata(format!("download url: {}", e)))?;
        let extid = ExtIdClaim::from_manifest(
            "cpan-manifest-sha256",
            &format!("name {}\nversion {}\nurl {}", self.name, version, url),
        );

        let info = PackageInfo {
            name: self.name.clone(),
            version: version.to_string(),
            filename: Some(url_basename(&url).to_string()),
            checksums: BTreeMap::new(),
            length: None,
            author: release
                .author
                .as_deref()
                .map(|fullname| Person::from_fullname(fullname.to_string())),
            date: release.date.as_deref().and_then(parse_cpan_date),
            extid: Some(extid),
            url,
        };
        Ok(vec![(release_branch(version), info)])
    }

    async fn build_release(
        &self,
        info: &PackageInfo,
        unpacked: &Path,
        directory: ObjectId,
    ) -> Result<Option<Release>, AdapterError> {
        let (meta_path, is_yaml) = find_meta(unpacked).ok_or_else(|| {
            AdapterError::Metadata("distribution without META.json or META.yml".into())
        })?;
        let raw = std::fs::read(&meta_path)
            .map_err(|e| AdapterError::Metadata(format!("reading {:?}: {}", meta_path, e)))?;
        let meta: serde_json::Value = if is_yaml {
            let yaml: serde_yaml::Value = serde_yaml::from_slice(&raw)
                .map_err(|e| AdapterError::Metadata(format!("parsing META.yml: {}", e)))?;
            serde_json::to_value(yaml)
                .map_err(|e| AdapterError::Metadata(format!("META.yml: {}", e)))?
        } else {
            serde_json::from_slice(&raw)
                .map_err(|e| AdapterError::Metadata(format!("parsing META.json: {}", e)))?
        };

        let name = meta
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&info.name)
            .to_string();
        // YAML metas sometimes carry the version as a bare number.
        let version = match meta.get("version") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => info.version.clone(),
        };

        // Intrinsic author data is richer than the index's.
        let author = match meta.get("author") {
            Some(serde_json::Value::String(s)) => Some(Person::from_fullname(s.clone())),
            Some(serde_json::Value::Array(list)) => list
                .first()
                .and_then(serde_json::Value::as_str)
                .map(|s| Person::from_fullname(s.to_string())),
            _ => None,
        }
        .or_else(|| info.author.clone())
        .unwrap_or_else(Person::empty);

        let message = match meta.get("abstract").and_then(serde_json::Value::as_str) {
            Some(description) => message_with_description("Perl", &name, &version, description),
            None => standard_message("Perl", &name, &version),
        };

        Ok(Some(Release {
            name: version.clone().into(),
            message: message.into(),
            author: Some(author),
            date: info.date,
            target: directory,
        }))
    }
}
