use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use url::Url;

use hoard_model::{ObjectId, Person, Release, VisitType};

use crate::adapters::{
    message_with_description, project_root, release_branch, standard_message, ExtIdClaim,
    PackageAdapter, PackageInfo,
};
use crate::errors::AdapterError;
use crate::fetch::{url_basename, Fetcher};

/// One AUR snapshot tarball, as enumerated by the lister.
#[derive(Clone, Debug)]
pub struct AurArtifact {
    pub version: String,
    pub url: String,
    pub filename: Option<String>,
    pub last_update: Option<DateTime<FixedOffset>>,
}

/// Loader for Arch User Repository packages. AUR has no queryable version
/// index; the lister hands over the snapshot artifacts, and the package
/// metadata lives in the `.SRCINFO` file inside each snapshot.
pub struct AurAdapter {
    name: String,
    artifacts: Vec<AurArtifact>,
}

impl AurAdapter {
    pub fn new(origin: &Url, artifacts: Vec<AurArtifact>) -> Self {
        Self {
            name: url_basename(origin).to_string(),
            artifacts,
        }
    }
}

/// Parses `.SRCINFO`: `key = value` lines under pkgbase/pkgname sections.
/// Repeated keys (multi-valued pkgdesc, url, arch...) concatenate with a
/// newline, preserving order.
pub(crate) fn parse_srcinfo(raw: &str) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match out.get_mut(key) {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => {
                out.insert(key.to_string(), value.to_string());
            }
        }
    }
    out
}

#[async_trait]
impl PackageAdapter for AurAdapter {
    fn visit_type(&self) -> VisitType {
        VisitType::Aur
    }

    async fn get_versions(&self, _fetcher: &Fetcher) -> Result<Vec<String>, AdapterError> {
        // Lister order, stable across visits.
        Ok(self.artifacts.iter().map(|a| a.version.clone()).collect())
    }

    async fn get_default_version(
        &self,
        _fetcher: &Fetcher,
    ) -> Result<Option<String>, AdapterError> {
        Ok(self.artifacts.last().map(|a| a.version.clone()))
    }

    async fn get_package_info(
        &self,
        _fetcher: &Fetcher,
        version: &str,
    ) -> Result<Vec<(String, PackageInfo)>, AdapterError> {
        let artifact = self
            .artifacts
            .iter()
            .find(|a| a.version == version)
            .ok_or_else(|| {
                AdapterError::Inconsistent(format!("version {} not listed for aur", version))
            })?;

        let url = Url::parse(&artifact.url)
            .map_err(|e| AdapterError::Metadata(format!("snapshot url: {}", e)))?;
        let extid = ExtIdClaim::from_manifest(
            "aur-manifest-sha256",
            &format!("pkgname {}\nversion {}\nurl {}", self.name, version, url),
        );

        let info = PackageInfo {
            name: self.name.clone(),
            version: version.to_string(),
            filename: artifact.filename.clone(),
            checksums: BTreeMap::new(),
            length: None,
            author: None,
            date: artifact.last_update,
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
        let root = project_root(unpacked, ".SRCINFO").ok_or_else(|| {
            AdapterError::Metadata("aur snapshot without a .SRCINFO".into())
        })?;
        let raw = std::fs::read_to_string(root.join(".SRCINFO"))
            .map_err(|e| AdapterError::Metadata(format!("reading .SRCINFO: {}", e)))?;
        let fields = parse_srcinfo(&raw);

        let name = fields
            .get("pkgbase")
            .or_else(|| fields.get("pkgname"))
            .map(String::as_str)
            .unwrap_or(&info.name);

        let message = match fields.get("pkgdesc") {
            Some(description) => {
                message_with_description("aur", name, &info.version, description)
            }
            None => standard_message("aur", name, &info.version),
        };

        Ok(Some(Release {
            name: info.version.clone().into(),
            message: message.into(),
            // AUR snapshots carry no author identity.
            author: Some(Person::empty()),
            date: info.date,
            target: directory,
        }))
    }
}
