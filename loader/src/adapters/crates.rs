use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use url::Url;

use hoard_model::{ObjectId, Person, Release, VisitType};

use crate::adapters::{
    compare_versions, project_root, release_branch_for_file, standard_message, ExtIdClaim,
    PackageAdapter, PackageInfo,
};
use crate::errors::AdapterError;
use crate::fetch::{url_basename, Fetcher};

/// One released `.crate` file, as enumerated by the crates.io lister.
#[derive(Clone, Debug)]
pub struct CrateArtifact {
    pub version: String,
    pub url: String,
    pub filename: String,
    /// Lowercase hex sha256 of the crate file, from the registry index.
    pub sha256: String,
    pub last_update: Option<DateTime<FixedOffset>>,
    pub yanked: bool,
}

/// Loader for crates.io packages. The origin url is the package's api url
/// (`https://crates.io/api/v1/crates/<name>`); the artifact list comes from
/// the lister, checksums included.
pub struct CratesAdapter {
    name: String,
    artifacts: BTreeMap<String, CrateArtifact>,
}

impl CratesAdapter {
    pub fn new(origin: &Url, artifacts: Vec<CrateArtifact>) -> Self {
        Self {
            name: url_basename(origin).to_string(),
            artifacts: artifacts
                .into_iter()
                .map(|a| (a.version.clone(), a))
                .collect(),
        }
    }
}

#[async_trait]
impl PackageAdapter for CratesAdapter {
    fn visit_type(&self) -> VisitType {
        VisitType::Crates
    }

    async fn get_versions(&self, _fetcher: &Fetcher) -> Result<Vec<String>, AdapterError> {
        let mut versions: Vec<String> = self.artifacts.keys().cloned().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }

    async fn get_default_version(
        &self,
        fetcher: &Fetcher,
    ) -> Result<Option<String>, AdapterError> {
        // Newest version that was not yanked.
        Ok(self
            .get_versions(fetcher)
            .await?
            .into_iter()
            .rev()
            .find(|v| self.artifacts.get(v).map(|a| !a.yanked).unwrap_or(false)))
    }

    async fn get_package_info(
        &self,
        _fetcher: &Fetcher,
        version: &str,
    ) -> Result<Vec<(String, PackageInfo)>, AdapterError> {
        let artifact = self.artifacts.get(version).ok_or_else(|| {
            AdapterError::Inconsistent(format!("version {} not listed for crate", version))
        })?;

        let url = Url::parse(&artifact.url)
            .map_err(|e| AdapterError::Metadata(format!("crate url: {}", e)))?;
        let extid = ExtIdClaim::from_manifest(
            "crates-manifest-sha256",
            &format!(
                "name {}\nshasum {}\nurl {}\nversion {}",
                self.name, artifact.sha256, url, version
            ),
        );

        let mut checksums = BTreeMap::new();
        checksums.insert("sha256".to_string(), artifact.sha256.to_ascii_lowercase());

        let info = PackageInfo {
            name: self.name.clone(),
            version: version.to_string(),
            filename: Some(artifact.filename.clone()),
            checksums,
            length: None,
            author: None,
            date: artifact.last_update,
            extid: Some(extid),
            url,
        };
        Ok(vec![(
            release_branch_for_file(version, &artifact.filename),
            info,
        )])
    }

    async fn build_release(
        &self,
        info: &PackageInfo,
        unpacked: &Path,
        directory: ObjectId,
    ) -> Result<Option<Release>, AdapterError> {
        // Crate archives unpack to `<name>-<version>/Cargo.toml`.
        let root = project_root(unpacked, "Cargo.toml").ok_or_else(|| {
            AdapterError::Metadata("crate archive without a Cargo.toml".into())
        })?;
        let raw = std::fs::read_to_string(root.join("Cargo.toml"))
            .map_err(|e| AdapterError::Metadata(format!("reading Cargo.toml: {}", e)))?;
        let manifest: toml::Value = toml::from_str(&raw)
            .map_err(|e| AdapterError::Metadata(format!("parsing Cargo.toml: {}", e)))?;

        let author = manifest
            .get("package")
            .and_then(|p| p.get("authors"))
            .and_then(toml::Value::as_array)
            .and_then(|authors| authors.first())
            .and_then(toml::Value::as_str)
            .map(|fullname| Person::from_fullname(fullname.to_string()))
            .unwrap_or_else(Person::empty);

        Ok(Some(Release {
            name: info.version.clone().into(),
            message: standard_message("Crate", &info.name, &info.version).into(),
            author: Some(author),
            date: info.date,
            target: directory,
        }))
    }
}
