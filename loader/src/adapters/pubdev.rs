use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use hoard_model::{ObjectId, Person, Release, VisitType};

use crate::adapters::{
    compare_versions, fetch_json, message_with_description, parse_date, person_from_json,
    project_root, release_branch, standard_message, ExtIdClaim, PackageAdapter, PackageInfo,
};
use crate::errors::AdapterError;
use crate::fetch::Fetcher;

/// Loader for pub.dev (Dart) packages. The origin url is the package's api
/// document, listing each version with its archive url, publication date and
/// embedded pubspec.
pub struct PubDevAdapter {
    origin: Url,
    index: OnceCell<PubDevIndex>,
}

struct PubDevIndex {
    name: String,
    latest: Option<String>,
    versions: HashMap<String, PubDevVersion>,
}

#[derive(Deserialize)]
struct PubDevVersion {
    version: String,
    archive_url: String,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    pubspec: Value,
}

#[derive(Deserialize)]
struct RawIndex {
    name: String,
    #[serde(default)]
    latest: Option<PubDevVersion>,
    #[serde(default)]
    versions: Vec<PubDevVersion>,
}

impl PubDevAdapter {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            index: OnceCell::new(),
        }
    }

    async fn index(&self, fetcher: &Fetcher) -> Result<&PubDevIndex, AdapterError> {
        self.index
            .get_or_try_init(|| async {
                let raw = fetch_json(fetcher, &self.origin).await?;
                let raw: RawIndex = serde_json::from_value(raw)
                    .map_err(|e| AdapterError::Metadata(format!("pub.dev index: {}", e)))?;
                Ok(PubDevIndex {
                    name: raw.name,
                    latest: raw.latest.map(|v| v.version),
                    versions: raw
                        .versions
                        .into_iter()
                        .map(|v| (v.version.clone(), v))
                        .collect(),
                })
            })
            .await
    }
}

/// The pubspec names authors under either an `authors` list or a single
/// `author` key.
fn pubspec_author(pubspec: &Value) -> Option<Person> {
    if let Some(first) = pubspec
        .get("authors")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    {
        return person_from_json(first);
    }
    pubspec.get("author").and_then(person_from_json)
}

#[async_trait]
impl PackageAdapter for PubDevAdapter {
    fn visit_type(&self) -> VisitType {
        VisitType::Pubdev
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
        Ok(index.latest.clone())
    }

    async fn get_package_info(
        &self,
        fetcher: &Fetcher,
        version: &str,
    ) -> Result<Vec<(String, PackageInfo)>, AdapterError> {
        let index = self.index(fetcher).await?;
        let doc = index.versions.get(version).ok_or_else(|| {
            AdapterError::Inconsistent(format!("version {} missing from pub.dev index", version))
        })?;

        let url = Url::parse(&doc.archive_url)
            .map_err(|e| AdapterError::Metadata(format!("archive url: {}", e)))?;
        let extid = ExtIdClaim::from_manifest(
            "pubdev-manifest-sha256",
            &format!("name {}\nversion {}\nurl {}", index.name, version, url),
        );

        let info = PackageInfo {
            name: index.name.clone(),
            version: version.to_string(),
            filename: Some(format!("{}-{}.tar.gz", index.name, version)),
            checksums: BTreeMap::new(),
            length: None,
            author: pubspec_author(&doc.pubspec),
            date: doc.published.as_deref().and_then(parse_date),
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
        // pub.dev archives put pubspec.yaml at the tree root.
        let root = project_root(unpacked, "pubspec.yaml").ok_or_else(|| {
            AdapterError::Metadata("unpacked pub.dev archive without pubspec.yaml".into())
        })?;
        let raw = std::fs::read(root.join("pubspec.yaml"))
            .map_err(|e| AdapterError::Metadata(format!("reading pubspec.yaml: {}", e)))?;
        let pubspec: serde_yaml::Value = serde_yaml::from_slice(&raw)
            .map_err(|e| AdapterError::Metadata(format!("parsing pubspec.yaml: {}", e)))?;

        let name = pubspec
            .get("name")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or(&info.name);
        let version = pubspec
            .get("version")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or(&info.version);
        if version != info.version {
            return Err(AdapterError::Inconsistent(format!(
                "pubspec version {} does not match listed version {}",
                version, info.version
            )));
        }

        // The api's author information wins over the pubspec's, which the
        // registry itself deprecates.
        let author = info.author.clone().unwrap_or_else(Person::empty);

        let message = match pubspec.get("description").and_then(serde_yaml::Value::as_str) {
            Some(description) => {
                message_with_description("pub.dev", name, version, description)
            }
            None => standard_message("pub.dev", name, version),
        };

        Ok(Some(Release {
            name: info.version.clone().into(),
            message: message.into(),
            author: Some(author),
            date: info.date,
            target: directory,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchConfig;

    const INDEX: &str = r#"{
        "name": "bezier",
        "latest": {"version": "1.1.5",
                   "archive_url": "https://pub.example/packages/bezier/versions/1.1.5.tar.gz",
                   "published": "2019-12-22T03:17:30.805225Z",
                   "pubspec": {"name": "bezier",
                               "description": "A 2D Bezier curve math library.",
                               "authors": ["Aaron Barrett <aaron@aaronbarrett.com>"]}},
        "versions": [
            {"version": "1.1.5",
             "archive_url": "https://pub.example/packages/bezier/versions/1.1.5.tar.gz",
             "published": "2019-12-22T03:17:30.805225Z",
             "pubspec": {"name": "bezier",
                         "description": "A 2D Bezier curve math library.",
                         "authors": ["Aaron Barrett <aaron@aaronbarrett.com>"]}}
        ]
    }"#;

    async fn adapter_with_fixture() -> (tempfile::TempDir, PubDevAdapter, Fetcher) {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("bezier.json");
        std::fs::write(&index_path, INDEX).unwrap();
        let adapter = PubDevAdapter::new(Url::from_file_path(&index_path).unwrap());
        let fetcher = Fetcher::new(dir.path(), FetchConfig::default());
        (dir, adapter, fetcher)
    }

    #[tokio::test]
    async fn single_version_listing() {
        let (_dir, adapter, fetcher) = adapter_with_fixture().await;
        assert_eq!(adapter.get_versions(&fetcher).await.unwrap(), vec!["1.1.5"]);
        assert_eq!(
            adapter.get_default_version(&fetcher).await.unwrap(),
            Some("1.1.5".to_string())
        );
    }

    #[tokio::test]
    async fn release_appends_the_pubspec_description() {
        let (_dir, adapter, fetcher) = adapter_with_fixture().await;
        let (branch, info) = adapter
            .get_package_info(&fetcher, "1.1.5")
            .await
            .unwrap()
            .remove(0);
        assert_eq!(branch, "releases/1.1.5");

        let tree = tempfile::tempdir().unwrap();
        std::fs::write(
            tree.path().join("pubspec.yaml"),
            b"name: bezier\nversion: 1.1.5\ndescription: A 2D Bezier curve math library.\n",
        )
        .unwrap();

        let release = adapter
            .build_release(&info, tree.path(), ObjectId::from([7; 20]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            release.message.as_ref(),
            b"Synthetic release for pub.dev source package bezier version 1.1.5\n\n\
A 2D Bezier curve math library.\n"
                .as_slice()
        );
        assert_eq!(
            release.author.as_ref().unwrap().fullname.as_ref(),
            b"Aaron Barrett <aaron@aaronbarrett.com>"
        );
        assert_eq!(
            release.date.unwrap().to_rfc3339(),
            "2019-12-22T03:17:30.805225+00:00"
        );
    }

    #[tokio::test]
    async fn release_without_a_description_keeps_the_standard_message() {
        let (_dir, adapter, fetcher) = adapter_with_fixture().await;
        let (_, info) = adapter
            .get_package_info(&fetcher, "1.1.5")
            .await
            .unwrap()
            .remove(0);

        let tree = tempfile::tempdir().unwrap();
        std::fs::write(
            tree.path().join("pubspec.yaml"),
            b"name: bezier\nversion: 1.1.5\n",
        )
        .unwrap();

        let release = adapter
            .build_release(&info, tree.path(), ObjectId::from([7; 20]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            release.message.as_ref(),
            b"Synthetic release for pub.dev source package bezier version 1.1.5\n"
        );
    }

    #[tokio::test]
    async fn version_mismatch_is_inconsistent() {
        let (_dir, adapter, fetcher) = adapter_with_fixture().await;
        let (_, info) = adapter
            .get_package_info(&fetcher, "1.1.5")
            .await
            .unwrap()
            .remove(0);

        let tree = tempfile::tempdir().unwrap();
        std::fs::write(
            tree.path().join("pubspec.yaml"),
            b"name: bezier\nversion: 9.9.9\n",
        )
        .unwrap();

        assert!(matches!(
            adapter
                .build_release(&info, tree.path(), ObjectId::from([7; 20]))
                .await,
            Err(AdapterError::Inconsistent(_))
        ));
    }
}
