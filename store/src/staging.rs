use hoard_model::{Content, Directory, ExtId, Release, Snapshot};
use serde::Deserialize;
use tracing::instrument;

use crate::{Storage, StoreError};

/// Upper bounds on the per-kind staging buffers. A full buffer triggers a
/// partial flush of its dependency-ordered prefix, keeping memory bounded
/// regardless of package size.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    pub contents: usize,
    pub directories: usize,
    pub releases: usize,
    pub extids: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            contents: 1000,
            directories: 2500,
            releases: 1000,
            extids: 1000,
        }
    }
}

/// Counts of objects actually written (idempotent re-writes excluded).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub contents: usize,
    pub directories: usize,
    pub releases: usize,
    pub snapshots: usize,
    pub extids: usize,
}

impl WriteStats {
    /// Number of new objects of all kinds. Zero means the visit was
    /// uneventful.
    pub fn total(&self) -> usize {
        self.contents + self.directories + self.releases + self.snapshots + self.extids
    }
}

/// Write-through staging area for one visit.
///
/// Objects accumulate per kind and are emitted in dependency order:
/// Contents, then Directories (staged leaves-first by the ingester, order
/// preserved here), then Releases, then the Snapshot, then ExtIDs. Buffers
/// are only drained once the corresponding add succeeded, so a failed flush
/// can simply be retried.
pub struct Stager<'a, S: ?Sized> {
    storage: &'a S,
    limits: BatchLimits,
    contents: Vec<Content>,
    directories: Vec<Directory>,
    releases: Vec<Release>,
    extids: Vec<ExtId>,
    stats: WriteStats,
}

impl<'a, S: Storage + ?Sized> Stager<'a, S> {
    pub fn new(storage: &'a S, limits: BatchLimits) -> Self {
        Self {
            storage,
            limits,
            contents: Vec::new(),
            directories: Vec::new(),
            releases: Vec::new(),
            extids: Vec::new(),
            stats: WriteStats::default(),
        }
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    pub async fn stage_content(&mut self, content: Content) -> Result<(), StoreError> {
        self.contents.push(content);
        if self.contents.len() >= self.limits.contents {
            self.flush_contents().await?;
        }
        Ok(())
    }

    pub async fn stage_directory(&mut self, directory: Directory) -> Result<(), StoreError> {
        self.directories.push(directory);
        if self.directories.len() >= self.limits.directories {
            self.flush_contents().await?;
            self.flush_directories().await?;
        }
        Ok(())
    }

    pub async fn stage_release(&mut self, release: Release) -> Result<(), StoreError> {
        self.releases.push(release);
        if self.releases.len() >= self.limits.releases {
            self.flush_objects().await?;
        }
        Ok(())
    }

    pub async fn stage_extid(&mut self, extid: ExtId) -> Result<(), StoreError> {
        self.extids.push(extid);
        if self.extids.len() >= self.limits.extids {
            self.flush_objects().await?;
            self.flush_extids().await?;
        }
        Ok(())
    }

    /// Flushes Contents, Directories and Releases, in that order.
    pub async fn flush_objects(&mut self) -> Result<(), StoreError> {
        self.flush_contents().await?;
        self.flush_directories().await?;
        self.flush_releases().await
    }

    /// Final checkpoint: everything buffered, then the snapshot, then ExtIDs.
    /// Idempotent; on error the caller can invoke it again and only the
    /// not-yet-persisted tail is rewritten.
    #[instrument(skip_all, err)]
    pub async fn commit(&mut self, snapshot: Option<&Snapshot>) -> Result<WriteStats, StoreError> {
        self.flush_objects().await?;
        if let Some(snapshot) = snapshot {
            self.stats.snapshots += self.storage.snapshot_add(snapshot.clone()).await?;
        }
        self.flush_extids().await?;
        Ok(self.stats)
    }

    async fn flush_contents(&mut self) -> Result<(), StoreError> {
        if self.contents.is_empty() {
            return Ok(());
        }
        self.stats.contents += self.storage.content_add(self.contents.clone()).await?;
        self.contents.clear();
        Ok(())
    }

    async fn flush_directories(&mut self) -> Result<(), StoreError> {
        if self.directories.is_empty() {
            return Ok(());
        }
        self.stats.directories += self.storage.directory_add(self.directories.clone()).await?;
        self.directories.clear();
        Ok(())
    }

    async fn flush_releases(&mut self) -> Result<(), StoreError> {
        if self.releases.is_empty() {
            return Ok(());
        }
        self.stats.releases += self.storage.release_add(self.releases.clone()).await?;
        self.releases.clear();
        Ok(())
    }

    async fn flush_extids(&mut self) -> Result<(), StoreError> {
        if self.extids.is_empty() {
            return Ok(());
        }
        self.stats.extids += self.storage.extid_add(self.extids.clone()).await?;
        self.extids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use hoard_model::{
        BranchTarget, EntryTarget, ExtIdTargetType, ObjectId, Origin, OriginVisit,
        OriginVisitStatus, VisitStatus, VisitType,
    };
    use std::sync::Mutex;

    /// Wraps a MemoryStorage and records which add operations ran, in order.
    struct RecordingStorage {
        inner: MemoryStorage,
        ops: Mutex<Vec<&'static str>>,
    }

    impl RecordingStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                ops: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, op: &'static str) {
            self.ops.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl Storage for RecordingStorage {
        async fn content_add(&self, contents: Vec<Content>) -> Result<usize, StoreError> {
            self.record("content");
            self.inner.content_add(contents).await
        }
        async fn directory_add(&self, directories: Vec<Directory>) -> Result<usize, StoreError> {
            self.record("directory");
            self.inner.directory_add(directories).await
        }
        async fn release_add(&self, releases: Vec<Release>) -> Result<usize, StoreError> {
            self.record("release");
            self.inner.release_add(releases).await
        }
        async fn snapshot_add(&self, snapshot: Snapshot) -> Result<usize, StoreError> {
            self.record("snapshot");
            self.inner.snapshot_add(snapshot).await
        }
        async fn extid_add(&self, extids: Vec<ExtId>) -> Result<usize, StoreError> {
            self.record("extid");
            self.inner.extid_add(extids).await
        }
        async fn origin_add(&self, origin: Origin) -> Result<(), StoreError> {
            self.inner.origin_add(origin).await
        }
        async fn origin_visit_add(
            &self,
            origin: &str,
            visit_type: VisitType,
            date: DateTime<Utc>,
        ) -> Result<OriginVisit, StoreError> {
            self.inner.origin_visit_add(origin, visit_type, date).await
        }
        async fn origin_visit_status_add(
            &self,
            status: OriginVisitStatus,
        ) -> Result<(), StoreError> {
            self.inner.origin_visit_status_add(status).await
        }
        async fn snapshot_get(&self, id: ObjectId) -> Result<Option<Snapshot>, StoreError> {
            self.inner.snapshot_get(id).await
        }
        async fn snapshot_get_latest(
            &self,
            origin: &str,
            allowed_statuses: &[VisitStatus],
        ) -> Result<Option<Snapshot>, StoreError> {
            self.inner.snapshot_get_latest(origin, allowed_statuses).await
        }
        async fn extid_get_from_extid(
            &self,
            extid_type: &str,
            extids: &[Bytes],
        ) -> Result<Vec<ExtId>, StoreError> {
            self.inner.extid_get_from_extid(extid_type, extids).await
        }
        async fn content_missing(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, StoreError> {
            self.inner.content_missing(ids).await
        }
        async fn directory_get(&self, id: ObjectId) -> Result<Option<Directory>, StoreError> {
            self.inner.directory_get(id).await
        }
        async fn release_get(&self, id: ObjectId) -> Result<Option<Release>, StoreError> {
            self.inner.release_get(id).await
        }
    }

    fn content(data: &'static [u8]) -> Content {
        Content::from_data(Bytes::from_static(data))
    }

    fn directory_with(name: &'static str, content: &Content) -> Directory {
        let mut d = Directory::new();
        d.add(
            Bytes::from_static(name.as_bytes()),
            EntryTarget::File {
                id: content.id(),
                executable: false,
            },
        )
        .unwrap();
        d
    }

    #[tokio::test]
    async fn commit_emits_in_dependency_order() {
        let storage = RecordingStorage::new();
        let mut stager = Stager::new(&storage, BatchLimits::default());

        let c = content(b"payload");
        let d = directory_with("f", &c);
        let release = Release {
            name: "1.0".into(),
            message: "m".into(),
            author: None,
            date: None,
            target: d.id(),
        };
        let mut snapshot = Snapshot::new();
        snapshot
            .add_branch("releases/1.0".into(), BranchTarget::Release(release.id()))
            .unwrap();
        let extid = ExtId {
            extid_type: "sha256".into(),
            extid_version: 0,
            extid: Bytes::from_static(b"x"),
            target_type: ExtIdTargetType::Directory,
            target: d.id(),
        };

        // Stage out of dependency order on purpose.
        stager.stage_extid(extid).await.unwrap();
        stager.stage_release(release).await.unwrap();
        stager.stage_directory(d).await.unwrap();
        stager.stage_content(c).await.unwrap();

        let stats = stager.commit(Some(&snapshot)).await.unwrap();
        assert_eq!(
            *storage.ops.lock().unwrap(),
            vec!["content", "directory", "release", "snapshot", "extid"]
        );
        assert_eq!(stats.total(), 5);
    }

    #[tokio::test]
    async fn full_buffer_triggers_partial_flush() {
        let storage = RecordingStorage::new();
        let limits = BatchLimits {
            contents: 2,
            ..Default::default()
        };
        let mut stager = Stager::new(&storage, limits);

        stager.stage_content(content(b"one")).await.unwrap();
        assert!(storage.ops.lock().unwrap().is_empty());
        stager.stage_content(content(b"two")).await.unwrap();
        assert_eq!(*storage.ops.lock().unwrap(), vec!["content"]);

        let stats = stager.commit(None).await.unwrap();
        assert_eq!(stats.contents, 2);
        assert_eq!(stats.snapshots, 0);
    }

    #[tokio::test]
    async fn stats_count_only_new_objects() {
        let storage = MemoryStorage::new();
        let c = content(b"shared");
        storage.content_add(vec![c.clone()]).await.unwrap();

        let mut stager = Stager::new(&storage, BatchLimits::default());
        stager.stage_content(c).await.unwrap();
        stager.stage_content(content(b"fresh")).await.unwrap();
        let stats = stager.commit(None).await.unwrap();
        assert_eq!(stats.contents, 1);
        assert_eq!(stats.total(), 1);
    }
}
