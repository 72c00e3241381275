use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use hoard_model::{ObjectId, Person, Release, VisitType};

use crate::adapters::{
    compare_versions, fetch_json, person_from_json, project_root, release_branch,
    standard_message, ExtIdClaim, PackageAdapter, PackageInfo,
};
use crate::errors::AdapterError;
use crate::fetch::{url_basename, Fetcher};

/// Loader for npm registry packages. The origin url is the package's
/// registry document (`https://registry.npmjs.org/<name>`), which lists
/// every version with its dist tarball and shasum.
pub struct NpmAdapter {
    origin: Url,
    index: OnceCell<NpmIndex>,
}

#[derive(Deserialize)]
struct NpmIndex {
    name: String,
    #[serde(default, rename = "dist-tags")]
    dist_tags: HashMap<String, String>,
    #[serde(default)]
    versions: HashMap<String, NpmVersionDoc>,
    /// Publication timestamps, keyed by version.
    #[serde(default)]
    time: HashMap<String, String>,
}

#[derive(Deserialize)]
struct NpmVersionDoc {
    dist: NpmDist,
    #[serde(default)]
    author: Option<Value>,
}

#[derive(Deserialize)]
struct NpmDist {
    tarball: String,
    #[serde(default)]
    shasum: Option<String>,
}

impl NpmAdapter {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            index: OnceCell::new(),
        }
    }

    async fn index(&self, fetcher: &Fetcher) -> Result<&NpmIndex, AdapterError> {
        self.index
            .get_or_try_init(|| async {
                let raw = fetch_json(fetcher, &self.origin).await?;
                serde_json::from_value(raw)
                    .map_err(|e| AdapterError::Metadata(format!("npm index: {}", e)))
            })
            .await
    }
}

#[async_trait]
impl PackageAdapter for NpmAdapter {
    fn visit_type(&self) -> VisitType {
        VisitType::Npm
    }

    async fn get_versions(&self, fetcher: &Fetcher) -> Result<Vec<String>, AdapterError> {
        let index = self.index(fetcher).await?;
        let mut versions: Vec<String> = index.versions.keys().cloned().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }

    async fn get_default_version(
        &self,
        fetcher: &Fetcher,
    ) -> Result<Option<String>, AdapterError> {
        let index = self.index(fetcher).await?;
        Ok(index.dist_tags.get("latest").cloned())
    }

    async fn get_package_info(
        &self,
        fetcher: &Fetcher,
        version: &str,
    ) -> Result<Vec<(String, PackageInfo)>, AdapterError> {
        let index = self.index(fetcher).await?;
        let doc = index.versions.get(version).ok_or_else(|| {
            AdapterError::Inconsistent(format!("version {} missing from npm index", version))
        })?;

        let url = Url::parse(&doc.dist.tarball)
            .map_err(|e| AdapterError::Metadata(format!("tarball url: {}", e)))?;

        let mut checksums = BTreeMap::new();
        if let Some(shasum) = &doc.dist.shasum {
            checksums.insert("sha1".to_string(), shasum.to_ascii_lowercase());
        }

        let extid = match &doc.dist.shasum {
            Some(shasum) => ExtIdClaim::from_checksum("npm-archive-sha1", shasum),
            None => None,
        }
        .or_else(|| {
            Some(ExtIdClaim::from_manifest(
                "npm-manifest-sha256",
                &format!("{} {} {}", index.name, version, url),
            ))
        });

        let info = PackageInfo {
            name: index.name.clone(),
            version: version.to_string(),
            filename: Some(url_basename(&url).to_string()),
            checksums,
            length: None,
            author: doc.author.as_ref().and_then(person_from_json),
            date: index.time.get(version).and_then(|raw| super::parse_date(raw)),
            extid,
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
        // npm tarballs wrap everything in a `package/` directory; older ones
        // occasionally do not.
        let intrinsic = match project_root(unpacked, "package.json") {
            Some(root) => tokio::fs::read(root.join("package.json"))
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok()),
            None => None,
        };

        let author = intrinsic
            .as_ref()
            .and_then(|doc| doc.get("author"))
            .and_then(person_from_json)
            .or_else(|| info.author.clone())
            .unwrap_or_else(Person::empty);

        let message = standard_message("NPM", &info.name, &info.version);
        Ok(Some(Release {
            name: info.version.clone().into(),
            message: message.into(),
            author: Some(author),
            date: info.date,
            target: directory,
        }))
    }
}
