use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::instrument;

use hoard_model::{
    Content, Directory, ExtId, ObjectId, Origin, OriginVisit, OriginVisitStatus, Release, Snapshot,
    VisitStatus, VisitType,
};

use crate::{Storage, StoreError};

/// In-memory [`Storage`] backend.
///
/// Holds everything behind `RwLock`ed maps keyed by object id; insertion is
/// insert-if-absent, which gives the idempotence the trait demands for free.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    contents: RwLock<HashMap<ObjectId, Content>>,
    directories: RwLock<HashMap<ObjectId, Directory>>,
    releases: RwLock<HashMap<ObjectId, Release>>,
    snapshots: RwLock<HashMap<ObjectId, Snapshot>>,
    extids: RwLock<HashMap<(String, Bytes), Vec<ExtId>>>,
    origins: RwLock<HashMap<String, Origin>>,
    visits: RwLock<HashMap<String, Vec<OriginVisit>>>,
    statuses: RwLock<Vec<OriginVisitStatus>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Default::default()
    }

    /// Total number of stored visit statuses, across all origins.
    pub async fn status_count(&self) -> usize {
        self.inner.statuses.read().await.len()
    }

    /// All statuses recorded for one visit, in write order.
    pub async fn visit_statuses(&self, origin: &str, visit: u64) -> Vec<OriginVisitStatus> {
        self.inner
            .statuses
            .read()
            .await
            .iter()
            .filter(|s| s.origin == origin && s.visit == visit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    #[instrument(skip_all, fields(n = contents.len()))]
    async fn content_add(&self, contents: Vec<Content>) -> Result<usize, StoreError> {
        let mut db = self.inner.contents.write().await;
        let mut added = 0;
        for content in contents {
            if db.insert(content.id(), content).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    #[instrument(skip_all, fields(n = directories.len()))]
    async fn directory_add(&self, directories: Vec<Directory>) -> Result<usize, StoreError> {
        let mut db = self.inner.directories.write().await;
        let mut added = 0;
        for directory in directories {
            if db.insert(directory.id(), directory).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    #[instrument(skip_all, fields(n = releases.len()))]
    async fn release_add(&self, releases: Vec<Release>) -> Result<usize, StoreError> {
        let mut db = self.inner.releases.write().await;
        let mut added = 0;
        for release in releases {
            if db.insert(release.id(), release).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    #[instrument(skip_all)]
    async fn snapshot_add(&self, snapshot: Snapshot) -> Result<usize, StoreError> {
        let mut db = self.inner.snapshots.write().await;
        Ok(match db.insert(snapshot.id(), snapshot) {
            None => 1,
            Some(_) => 0,
        })
    }

    #[instrument(skip_all, fields(n = extids.len()))]
    async fn extid_add(&self, extids: Vec<ExtId>) -> Result<usize, StoreError> {
        let mut db = self.inner.extids.write().await;
        let mut added = 0;
        for extid in extids {
            let key = (extid.extid_type.clone(), extid.extid.clone());
            let records = db.entry(key).or_default();
            if !records.contains(&extid) {
                records.push(extid);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn origin_add(&self, origin: Origin) -> Result<(), StoreError> {
        let mut db = self.inner.origins.write().await;
        db.entry(origin.url.clone()).or_insert(origin);
        Ok(())
    }

    async fn origin_visit_add(
        &self,
        origin: &str,
        visit_type: VisitType,
        date: DateTime<Utc>,
    ) -> Result<OriginVisit, StoreError> {
        if !self.inner.origins.read().await.contains_key(origin) {
            return Err(StoreError::InvalidRequest(format!(
                "unknown origin: {}",
                origin
            )));
        }
        let mut db = self.inner.visits.write().await;
        let visits = db.entry(origin.to_string()).or_default();
        let visit = OriginVisit {
            origin: origin.to_string(),
            visit: visits.len() as u64 + 1,
            visit_type,
            date,
        };
        visits.push(visit.clone());
        Ok(visit)
    }

    async fn origin_visit_status_add(&self, status: OriginVisitStatus) -> Result<(), StoreError> {
        self.inner.statuses.write().await.push(status);
        Ok(())
    }

    async fn snapshot_get(&self, id: ObjectId) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.inner.snapshots.read().await.get(&id).cloned())
    }

    async fn snapshot_get_latest(
        &self,
        origin: &str,
        allowed_statuses: &[VisitStatus],
    ) -> Result<Option<Snapshot>, StoreError> {
        let statuses = self.inner.statuses.read().await;
        let latest = statuses
            .iter()
            .filter(|s| {
                s.origin == origin
                    && allowed_statuses.contains(&s.status)
                    && s.snapshot.is_some()
            })
            .max_by_key(|s| (s.visit, s.date));

        match latest.and_then(|s| s.snapshot) {
            None => Ok(None),
            Some(id) => {
                let snapshot = self.inner.snapshots.read().await.get(&id).cloned();
                snapshot
                    .map(Some)
                    .ok_or_else(|| StoreError::InvalidRequest(format!("dangling snapshot {}", id)))
            }
        }
    }

    async fn extid_get_from_extid(
        &self,
        extid_type: &str,
        extids: &[Bytes],
    ) -> Result<Vec<ExtId>, StoreError> {
        let db = self.inner.extids.read().await;
        let mut out = Vec::new();
        for extid in extids {
            if let Some(records) = db.get(&(extid_type.to_string(), extid.clone())) {
                out.extend(records.iter().cloned());
            }
        }
        Ok(out)
    }

    async fn content_missing(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, StoreError> {
        let db = self.inner.contents.read().await;
        Ok(ids
            .iter()
            .filter(|id| !db.contains_key(id))
            .copied()
            .collect())
    }

    async fn directory_get(&self, id: ObjectId) -> Result<Option<Directory>, StoreError> {
        Ok(self.inner.directories.read().await.get(&id).cloned())
    }

    async fn release_get(&self, id: ObjectId) -> Result<Option<Release>, StoreError> {
        Ok(self.inner.releases.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hoard_model::{BranchTarget, EntryTarget, ExtIdTargetType};

    fn content(data: &'static [u8]) -> Content {
        Content::from_data(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn content_add_is_idempotent() {
        let storage = MemoryStorage::new();
        assert_eq!(
            storage
                .content_add(vec![content(b"a"), content(b"b")])
                .await
                .unwrap(),
            2
        );
        assert_eq!(storage.content_add(vec![content(b"a")]).await.unwrap(), 0);
        assert!(storage
            .content_missing(&[content(b"a").id(), content(b"c").id()])
            .await
            .unwrap()
            .contains(&content(b"c").id()));
    }

    #[tokio::test]
    async fn visit_ids_are_monotonic_per_origin() {
        let storage = MemoryStorage::new();
        storage.origin_add(Origin::new("https://x/pkg")).await.unwrap();
        storage.origin_add(Origin::new("https://x/other")).await.unwrap();

        let v1 = storage
            .origin_visit_add("https://x/pkg", VisitType::Npm, Utc::now())
            .await
            .unwrap();
        let v2 = storage
            .origin_visit_add("https://x/pkg", VisitType::Npm, Utc::now())
            .await
            .unwrap();
        let other = storage
            .origin_visit_add("https://x/other", VisitType::Npm, Utc::now())
            .await
            .unwrap();
        assert_eq!(v1.visit, 1);
        assert_eq!(v2.visit, 2);
        assert_eq!(other.visit, 1);
    }

    #[tokio::test]
    async fn visit_add_requires_known_origin() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage
                .origin_visit_add("https://nowhere", VisitType::Npm, Utc::now())
                .await,
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_get_latest_honours_allowed_statuses() {
        let storage = MemoryStorage::new();
        storage.origin_add(Origin::new("https://x/pkg")).await.unwrap();

        let mut snapshot = Snapshot::new();
        snapshot
            .add_branch(
                "releases/1.0".into(),
                BranchTarget::Release(ObjectId::from([9; 20])),
            )
            .unwrap();
        storage.snapshot_add(snapshot.clone()).await.unwrap();

        let visit = storage
            .origin_visit_add("https://x/pkg", VisitType::Npm, Utc::now())
            .await
            .unwrap();
        storage
            .origin_visit_status_add(OriginVisitStatus {
                origin: "https://x/pkg".into(),
                visit: visit.visit,
                date: Utc::now(),
                status: VisitStatus::Partial,
                snapshot: Some(snapshot.id()),
            })
            .await
            .unwrap();

        assert_eq!(
            storage
                .snapshot_get_latest("https://x/pkg", &[VisitStatus::Full])
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            storage
                .snapshot_get_latest("https://x/pkg", &[VisitStatus::Full, VisitStatus::Partial])
                .await
                .unwrap(),
            Some(snapshot)
        );
    }

    #[tokio::test]
    async fn extids_are_additive() {
        let storage = MemoryStorage::new();
        let record = ExtId {
            extid_type: "sha256".into(),
            extid_version: 0,
            extid: Bytes::from_static(b"fingerprint"),
            target_type: ExtIdTargetType::Directory,
            target: ObjectId::from([1; 20]),
        };
        assert_eq!(storage.extid_add(vec![record.clone()]).await.unwrap(), 1);
        assert_eq!(storage.extid_add(vec![record.clone()]).await.unwrap(), 0);

        let hits = storage
            .extid_get_from_extid("sha256", &[Bytes::from_static(b"fingerprint")])
            .await
            .unwrap();
        assert_eq!(hits, vec![record]);
    }

    #[tokio::test]
    async fn directory_roundtrip() {
        let storage = MemoryStorage::new();
        let mut d = Directory::new();
        d.add(
            "f".into(),
            EntryTarget::File {
                id: ObjectId::from([2; 20]),
                executable: false,
            },
        )
        .unwrap();
        storage.directory_add(vec![d.clone()]).await.unwrap();
        assert_eq!(storage.directory_get(d.id()).await.unwrap(), Some(d));
    }
}
